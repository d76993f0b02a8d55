use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool for blocking application work. Jobs submitted with the
/// same key are funneled through a per-key FIFO so they never run
/// concurrently or out of order; jobs with distinct keys run in parallel.
/// A full pool blocks the submitter instead of dropping work.
pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<PoolState>,
    job_ready: Condvar,
    slot_free: Condvar,
    capacity: usize,
}

struct PoolState {
    ready: VecDeque<(Option<u64>, Job)>,
    funnels: HashMap<u64, VecDeque<Job>>,
    outstanding: usize,
    shutdown: bool,
}

impl WorkerPool {
    pub fn new(threads: usize, capacity: usize) -> WorkerPool {
        assert!(threads > 0, "worker pool needs at least one thread");
        assert!(capacity > 0, "worker pool needs a nonzero capacity");

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                ready: VecDeque::new(),
                funnels: HashMap::new(),
                outstanding: 0,
                shutdown: false,
            }),
            job_ready: Condvar::new(),
            slot_free: Condvar::new(),
            capacity,
        });

        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared = shared.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("worker-{}", index))
                    .spawn(move || worker_loop(shared))
                    .expect("worker thread must spawn"),
            );
        }

        WorkerPool {
            shared,
            threads: Mutex::new(handles),
        }
    }

    /// Submits a job. Blocks while the pool is at capacity. Jobs sharing a
    /// key are queued behind the key's in-flight job.
    pub fn submit(&self, key: Option<u64>, job: Job) {
        let mut state = self.shared.lock_state();
        while state.outstanding >= self.shared.capacity && !state.shutdown {
            state = self
                .shared
                .slot_free
                .wait(state)
                .expect("worker pool lock poisoned");
        }
        if state.shutdown {
            // Late submissions during teardown are dropped on the floor;
            // the reactor has already stopped consuming completions.
            return;
        }
        state.outstanding += 1;
        match key {
            Some(k) => {
                if let Some(funnel) = state.funnels.get_mut(&k) {
                    funnel.push_back(job);
                    return;
                }
                state.funnels.insert(k, VecDeque::new());
                state.ready.push_back((Some(k), job));
                self.shared.job_ready.notify_one();
            }
            None => {
                state.ready.push_back((None, job));
                self.shared.job_ready.notify_one();
            }
        }
    }

    /// Finishes queued work and joins the threads.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock_state();
            state.shutdown = true;
        }
        self.shared.job_ready.notify_all();
        self.shared.slot_free.notify_all();

        let mut threads = self.threads.lock().expect("worker pool lock poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let (key, job) = {
            let mut state = shared.lock_state();
            loop {
                if let Some(entry) = state.ready.pop_front() {
                    break entry;
                }
                if state.shutdown {
                    return;
                }
                state = shared
                    .job_ready
                    .wait(state)
                    .expect("worker pool lock poisoned");
            }
        };

        job();

        let mut state = shared.lock_state();
        state.outstanding -= 1;
        shared.slot_free.notify_one();
        if let Some(k) = key {
            // Promote the next queued job for this key, or retire the funnel.
            let next = state
                .funnels
                .get_mut(&k)
                .expect("funnel must exist while its job runs")
                .pop_front();
            match next {
                Some(job) => {
                    state.ready.push_back((Some(k), job));
                    shared.job_ready.notify_one();
                }
                None => {
                    state.funnels.remove(&k);
                }
            }
        }
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("worker pool lock poisoned")
    }
}

/// Where application callbacks run: inline on the reactor thread, or on a
/// worker pool when one is configured.
pub enum Executor {
    Inline,
    Pool(WorkerPool),
}

impl Executor {
    pub fn from_threads(threads: usize, capacity: usize) -> Executor {
        if threads == 0 {
            Executor::Inline
        } else {
            Executor::Pool(WorkerPool::new(threads, capacity))
        }
    }

    #[inline]
    pub fn submit(&self, key: Option<u64>, job: Job) {
        match self {
            Executor::Inline => job(),
            Executor::Pool(pool) => pool.submit(key, job),
        }
    }

    pub fn shutdown(&self) {
        if let Executor::Pool(pool) = self {
            pool.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_jobs() {
        let pool = WorkerPool::new(2, 16);
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.submit(None, Box::new(move || tx.send(i).unwrap()));
        }
        let mut seen: Vec<i32> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_same_key_preserves_order() {
        let pool = WorkerPool::new(4, 256);
        let (tx, rx) = mpsc::channel();
        for seq in 0..100u32 {
            let tx = tx.clone();
            pool.submit(Some(7), Box::new(move || tx.send(seq).unwrap()));
        }
        let seen: Vec<u32> = (0..100)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_distinct_keys_run_in_parallel() {
        let pool = WorkerPool::new(2, 16);
        let (tx, rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        // Key 1 blocks until key 2 completes, which only works if the two
        // keys really run on different threads.
        let gate = Mutex::new(gate_rx);
        pool.submit(
            Some(1),
            Box::new(move || {
                gate.lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5))
                    .expect("key 2 never ran");
            }),
        );
        pool.submit(
            Some(2),
            Box::new(move || {
                gate_tx.send(()).unwrap();
                tx.send(()).unwrap();
            }),
        );

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_admission_blocks_at_capacity() {
        let pool = Arc::new(WorkerPool::new(1, 2));
        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        let held = Mutex::new(hold_rx);

        // Occupy the single thread.
        pool.submit(
            None,
            Box::new(move || {
                held.lock().unwrap().recv().ok();
            }),
        );
        // Fill the remaining slot.
        pool.submit(None, Box::new(|| {}));

        let submitted = Arc::new(AtomicUsize::new(0));
        let submitted2 = submitted.clone();
        let pool2 = pool.clone();
        let blocker = thread::spawn(move || {
            pool2.submit(None, Box::new(|| {}));
            submitted2.store(1, Ordering::SeqCst);
        });

        // The third submission must be stuck in admission.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(submitted.load(Ordering::SeqCst), 0);

        hold_tx.send(()).unwrap();
        blocker.join().unwrap();
        assert_eq!(submitted.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn test_inline_executor_runs_immediately() {
        let executor = Executor::from_threads(0, 1);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        executor.submit(None, Box::new(move || ran2.store(1, Ordering::SeqCst)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
