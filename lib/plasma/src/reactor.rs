use crate::buffer::Buffer;
use crate::config::Config;
use crate::conn::{conn_key, Chunk, Conn, ConnId, ConnState, ConnTx, FlushStatus, Stream};
use crate::error::ServerError;
use crate::http::proto::Http1;
use crate::logging::{debug, error, info, o, trace, warn, Logger};
use crate::poll::Poller;
use crate::protocol::Protocol;
use crate::pubsub::{Bus, Subscription};
use crate::service::Service;
use crate::signals;
use crate::timer::Timers;
use crate::url::{self, BindAddr};
use crate::workers::Executor;
use indexmap::IndexSet;
use mio::event::Source;
use mio::net::{TcpListener, UnixListener};
use mio::{Token, Waker};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAKE_TOKEN: Token = Token(0);
const LISTENER_BASE: usize = 1;
const CONN_BASE: usize = 64;
const MAX_LISTENERS: usize = CONN_BASE - LISTENER_BASE;
const EVENTS_CAPACITY: usize = 1024;

// Drain window for a single closing connection's queued writes.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// The poll wait is capped so signals and shutdown deadlines are noticed
// promptly even with no IO traffic.
const MAX_POLL_WAIT: Duration = Duration::from_millis(1000);

/// A closure executed on the reactor thread during the deferred-task phase
/// of a tick.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

/// Cloneable cross-thread handle into the reactor: defers closures onto
/// the reactor thread and wakes it.
#[derive(Clone)]
pub struct Remote {
    tx: Sender<Task>,
    waker: Arc<Waker>,
}

impl Remote {
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        if self.tx.send(Box::new(task)).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Requests a graceful server shutdown.
    pub fn stop(&self) {
        self.defer(|reactor| reactor.begin_shutdown());
    }

    pub(crate) fn notify_write(&self, id: ConnId, gen: u32) {
        self.defer(move |reactor| reactor.flush_if_current(id, gen));
    }

    pub(crate) fn close_conn(&self, id: ConnId, gen: u32) {
        self.defer(move |reactor| {
            if reactor.gen_matches(id, gen) {
                reactor.request_close(id);
            }
        });
    }

    pub(crate) fn pump(&self, sub: Arc<Subscription>) {
        self.defer(move |reactor| reactor.pump_subscription(&sub));
    }
}

struct Slot {
    gen: u32,
    conn: Option<Conn>,
}

enum ListenSock {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenSock {
    fn source_mut(&mut self) -> &mut dyn Source {
        match self {
            ListenSock::Tcp(l) => l,
            ListenSock::Unix(l) => l,
        }
    }
}

struct Listener {
    sock: ListenSock,
    desc: String,
}

#[derive(Clone, Copy)]
struct Ev {
    token: usize,
    readable: bool,
    writable: bool,
}

/// The event loop: owns the poller, every connection, the timer heap and
/// the deferred-task queue. One instance runs on one dedicated thread;
/// everything else talks to it through [`Remote`] and the per-connection
/// write queues.
pub struct Reactor {
    cfg: Arc<Config>,
    poller: Poller,
    listeners: Vec<Listener>,
    slots: Vec<Slot>,
    free: Vec<ConnId>,
    live: IndexSet<ConnId>,
    timers: Timers,
    tasks_rx: Receiver<Task>,
    remote: Remote,
    service: Arc<dyn Service>,
    executor: Arc<Executor>,
    bus: Arc<Bus>,
    flush_again: Vec<ConnId>,
    shutdown: Option<Instant>,
    dispatching: Option<ConnId>,
    now: Instant,
    log: Logger,
}

impl Reactor {
    pub fn new(cfg: Config, service: Arc<dyn Service>, log: Logger) -> io::Result<Reactor> {
        let cfg = Arc::new(cfg);
        let poller = Poller::new(EVENTS_CAPACITY)?;
        let waker = Arc::new(Waker::new(poller.registry(), WAKE_TOKEN)?);
        let (tx, rx) = mpsc::channel();
        let remote = Remote { tx, waker };
        let bus = Bus::new(log.new(o!("component" => "pubsub")));
        let executor = Arc::new(Executor::from_threads(cfg.threads, cfg.worker_queue_limit));

        Ok(Reactor {
            cfg,
            poller,
            listeners: Vec::new(),
            slots: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            timers: Timers::new(),
            tasks_rx: rx,
            remote,
            service,
            executor,
            bus,
            flush_again: Vec::new(),
            shutdown: None,
            dispatching: None,
            now: Instant::now(),
            log,
        })
    }

    #[inline]
    pub fn remote(&self) -> Remote {
        self.remote.clone()
    }

    #[inline]
    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Binds a listener described by a listen URL (`tcp://host:port`,
    /// `host:port`, `unix:///path`, a bare path, or port 0 for a Unix
    /// socket at that path).
    pub fn listen(&mut self, raw: &str) -> Result<(), ServerError> {
        match url::parse(raw)? {
            BindAddr::Tcp(hostport) => {
                self.listen_tcp(&hostport)?;
                Ok(())
            }
            BindAddr::Unix(path) => {
                // A previous run may have left the socket file behind.
                let _ = std::fs::remove_file(&path);
                let sock = UnixListener::bind(&path).map_err(|e| ServerError::Bind {
                    addr: path.display().to_string(),
                    source: e,
                })?;
                self.add_listener(ListenSock::Unix(sock), raw)
            }
        }
    }

    /// Binds a TCP listener and returns the bound address (useful with
    /// ephemeral ports).
    pub fn listen_tcp(&mut self, hostport: &str) -> Result<SocketAddr, ServerError> {
        let addrs = hostport.to_socket_addrs().map_err(|e| ServerError::Bind {
            addr: hostport.to_string(),
            source: e,
        })?;
        let mut last_err = None;
        let mut bound = None;
        for addr in addrs {
            match TcpListener::bind(addr) {
                Ok(sock) => {
                    bound = Some(sock);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let sock = bound.ok_or_else(|| ServerError::Bind {
            addr: hostport.to_string(),
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address")),
        })?;
        let local = sock.local_addr().map_err(ServerError::Io)?;
        self.add_listener(ListenSock::Tcp(sock), hostport)?;
        Ok(local)
    }

    fn add_listener(&mut self, mut sock: ListenSock, desc: &str) -> Result<(), ServerError> {
        if self.listeners.len() >= MAX_LISTENERS {
            return Err(ServerError::InvalidUrl(format!(
                "listener limit ({}) reached at `{}`",
                MAX_LISTENERS, desc
            )));
        }
        let token = Token(LISTENER_BASE + self.listeners.len());
        self.poller
            .arm(sock.source_mut(), token, true, false)
            .map_err(ServerError::Io)?;
        info!(self.log, "listening"; "addr" => desc);
        self.listeners.push(Listener {
            sock,
            desc: desc.to_string(),
        });
        Ok(())
    }

    /// Takes ownership of a connected stream and drives it with the given
    /// protocol. This is the accept path, but applications may attach
    /// already-connected descriptors too.
    pub fn attach(
        &mut self,
        stream: Stream,
        proto: Box<dyn Protocol>,
        timeout: u8,
    ) -> io::Result<ConnId> {
        let now = Instant::now();
        self.now = now;

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(Slot { gen: 0, conn: None });
                self.slots.len() - 1
            }
        };

        let mut conn = Conn::new(stream, proto, self.conn_buf_limit(), timeout, now);
        let token = Token(CONN_BASE + id);
        if let Err(e) = self.poller.arm(&mut conn.stream, token, true, false) {
            self.free.push(id);
            return Err(e);
        }
        conn.registered = true;

        trace!(self.log, "connection attached";
               "conn" => id,
               "peer" => conn.stream.peer_desc(),
               "timeout" => timeout);

        self.slots[id].conn = Some(conn);
        self.live.insert(id);
        self.schedule_conn_timer(id);
        Ok(id)
    }

    /// Attaches a stream speaking HTTP/1.1, the default protocol for
    /// accepted connections.
    pub fn attach_http(&mut self, stream: Stream) -> io::Result<ConnId> {
        let proto = Box::new(Http1::new(
            self.cfg.clone(),
            self.service.clone(),
            self.executor.clone(),
            self.bus.clone(),
            self.log.new(o!("proto" => "http1")),
        ));
        self.attach(stream, proto, self.cfg.keep_alive_timeout)
    }

    /// The read accumulator must fit the largest single protocol element
    /// we ever wait for: a full header block or a full WebSocket frame.
    fn conn_buf_limit(&self) -> usize {
        self.cfg
            .read_buf_size
            .max(self.cfg.max_line_len + self.cfg.max_header_size + 64)
            .max(self.cfg.ws_max_msg_size + 64)
    }

    /// Runs the event loop until shutdown completes.
    pub fn run(&mut self) {
        info!(self.log, "reactor running";
              "listeners" => self.listeners.len(),
              "workers" => self.cfg.threads);
        loop {
            self.now = Instant::now();
            if signals::shutdown_requested() && self.shutdown.is_none() {
                self.begin_shutdown();
            }

            // Connections that ran out of write budget last tick.
            let again = std::mem::replace(&mut self.flush_again, Vec::new());
            for id in again {
                self.flush_conn(id);
            }

            let timeout = self.poll_timeout();
            if let Err(e) = self.poller.wait(Some(timeout)) {
                error!(self.log, "poll failed"; "error" => %e);
                break;
            }
            self.now = Instant::now();

            let events: Vec<Ev> = self
                .poller
                .events()
                .map(|e| Ev {
                    token: e.token().0,
                    readable: e.is_readable() || e.is_read_closed(),
                    writable: e.is_writable(),
                })
                .collect();
            for ev in events {
                if ev.token == WAKE_TOKEN.0 {
                    // Tasks are drained below.
                } else if ev.token < CONN_BASE {
                    self.accept_ready(ev.token - LISTENER_BASE);
                } else {
                    let id = ev.token - CONN_BASE;
                    if ev.readable {
                        self.conn_readable(id);
                    }
                    if ev.writable {
                        self.flush_conn(id);
                    }
                }
            }

            self.drain_tasks();
            self.expire_timers();

            if let Some(deadline) = self.shutdown {
                if self.live.is_empty() {
                    break;
                }
                if self.now >= deadline {
                    debug!(self.log, "drain window over, forcing remaining connections";
                           "count" => self.live.len());
                    self.force_close_all();
                    if self.live.is_empty() {
                        break;
                    }
                }
            }
        }
        self.executor.shutdown();
        self.service.on_finish();
        info!(self.log, "reactor stopped");
    }

    fn poll_timeout(&self) -> Duration {
        let mut timeout = MAX_POLL_WAIT;
        if let Some(deadline) = self.timers.next_deadline() {
            timeout = timeout.min(deadline.saturating_duration_since(self.now));
        }
        if let Some(deadline) = self.shutdown {
            timeout = timeout.min(deadline.saturating_duration_since(self.now));
        }
        timeout
    }

    fn drain_tasks(&mut self) {
        for _ in 0..self.cfg.task_budget {
            let task = match self.tasks_rx.try_recv() {
                Ok(task) => task,
                Err(_) => break,
            };
            task(self);
        }
    }

    fn accept_ready(&mut self, index: usize) {
        if self.shutdown.is_some() || index >= self.listeners.len() {
            return;
        }
        loop {
            let accepted = match &self.listeners[index].sock {
                ListenSock::Tcp(l) => match l.accept() {
                    Ok((stream, _)) => {
                        let _ = stream.set_nodelay(true);
                        Ok(Stream::Tcp(stream))
                    }
                    Err(e) => Err(e),
                },
                ListenSock::Unix(l) => match l.accept() {
                    Ok((stream, _)) => Ok(Stream::Unix(stream)),
                    Err(e) => Err(e),
                },
            };
            match accepted {
                Ok(stream) => {
                    if let Err(e) = self.attach_http(stream) {
                        warn!(self.log, "failed to attach accepted connection"; "error" => %e);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(self.log, "accept failed";
                          "listener" => &self.listeners[index].desc,
                          "error" => %e);
                    break;
                }
            }
        }
    }

    fn conn_readable(&mut self, id: ConnId) {
        let now = self.now;
        loop {
            let (received, hit_limit) = {
                let conn = match self.conn_mut(id) {
                    Some(conn) => conn,
                    None => return,
                };
                if conn.state != ConnState::Open || conn.suspended {
                    return;
                }
                let received = conn.receive(now);
                let hit_limit = conn.read_buf.is_full();
                (received, hit_limit)
            };

            match received {
                Ok((n, eof)) => {
                    if n > 0 || eof {
                        self.dispatch(id, |proto, io| proto.on_data(io));
                    }
                    if eof {
                        let still_open = self
                            .conn_mut(id)
                            .map_or(false, |conn| conn.state == ConnState::Open);
                        if still_open {
                            self.request_close(id);
                        }
                        return;
                    }
                    // The accumulator capping the read is the only case
                    // where the kernel may still hold bytes; go again if
                    // the protocol freed space, otherwise wait for it to.
                    if n == 0 || !hit_limit {
                        return;
                    }
                }
                Err(e) => {
                    debug!(self.log, "read failed, closing"; "conn" => id, "error" => %e);
                    self.close_now(id);
                    return;
                }
            }
        }
    }

    /// Flushes a connection's write queue within the per-tick byte budget
    /// and fires `on_ready` when it drains.
    fn flush_conn(&mut self, id: ConnId) {
        let now = self.now;
        let budget = self.cfg.write_budget;
        let outcome = {
            let conn = match self.conn_mut(id) {
                Some(conn) => conn,
                None => return,
            };
            if conn.state == ConnState::Closed {
                return;
            }
            conn.flush(now, budget)
        };

        match outcome {
            Ok(FlushStatus::Drained) => {
                let closing = {
                    let conn = self.conn_mut(id).expect("conn vanished during flush");
                    conn.want_write = false;
                    conn.state == ConnState::Closing
                };
                self.update_interest(id);
                if closing {
                    self.finalize_close(id);
                } else {
                    self.dispatch(id, |proto, io| proto.on_ready(io));
                }
            }
            Ok(FlushStatus::Blocked) => {
                if let Some(conn) = self.conn_mut(id) {
                    conn.want_write = true;
                }
                self.update_interest(id);
            }
            Ok(FlushStatus::Budget) => {
                if let Some(conn) = self.conn_mut(id) {
                    conn.want_write = true;
                }
                self.update_interest(id);
                self.flush_again.push(id);
            }
            Err(e) => {
                debug!(self.log, "write failed, closing"; "conn" => id, "error" => ?e);
                self.close_now(id);
            }
        }
    }

    fn flush_if_current(&mut self, id: ConnId, gen: u32) {
        if self.gen_matches(id, gen) {
            self.flush_conn(id);
        }
    }

    fn gen_matches(&self, id: ConnId, gen: u32) -> bool {
        self.slots
            .get(id)
            .map_or(false, |slot| slot.gen == gen && slot.conn.is_some())
    }

    fn conn_mut(&mut self, id: ConnId) -> Option<&mut Conn> {
        self.slots.get_mut(id).and_then(|slot| slot.conn.as_mut())
    }

    /// Runs one protocol callback with single-owner dispatch: the protocol
    /// is taken out of the connection for the duration of the call, and a
    /// staged upgrade is installed afterwards.
    fn dispatch<F>(&mut self, id: ConnId, f: F)
    where
        F: FnOnce(&mut Box<dyn Protocol>, &mut IoCtx<'_>),
    {
        let mut proto = match self.conn_mut(id).and_then(|conn| conn.proto.take()) {
            Some(proto) => proto,
            None => return,
        };
        let prev = self.dispatching;
        self.dispatching = Some(id);
        {
            let mut ctx = IoCtx { r: self, id };
            f(&mut proto, &mut ctx);
        }
        self.dispatching = prev;

        let mut swapped = false;
        let mut finalize = false;
        if let Some(conn) = self.conn_mut(id) {
            match conn.pending_proto.take() {
                // Upgrade point: the old protocol drops here.
                Some(next) => {
                    conn.proto = Some(next);
                    swapped = true;
                }
                None => conn.proto = Some(proto),
            }
            if conn.finalize_pending {
                conn.finalize_pending = false;
                finalize = true;
            }
        }
        if finalize {
            // The callback closed its own connection; finish the close now
            // that the protocol is back in place for `on_close`.
            self.finalize_close(id);
            return;
        }
        if swapped {
            // Bytes that arrived with (or right after) the upgrade request
            // belong to the new protocol.
            self.dispatch_buffered(id);
        }
    }

    /// Hands already-buffered bytes to the connection's protocol.
    fn dispatch_buffered(&mut self, id: ConnId) {
        let has_data = self.conn_mut(id).map_or(false, |conn| {
            conn.state == ConnState::Open && !conn.suspended && !conn.read_buf.is_empty()
        });
        if has_data {
            self.dispatch(id, |proto, io| proto.on_data(io));
        }
    }

    /// Direct protocol replacement from a deferred task (the app-initiated
    /// SSE upgrade). Returns false when the connection is gone.
    pub(crate) fn install_protocol(
        &mut self,
        id: ConnId,
        gen: u32,
        proto: Box<dyn Protocol>,
        timeout: u8,
    ) -> bool {
        if !self.gen_matches(id, gen) {
            return false;
        }
        let now = self.now;
        {
            let conn = self.conn_mut(id).expect("generation checked");
            if conn.state != ConnState::Open {
                return false;
            }
            conn.proto = Some(proto);
            conn.pending_proto = None;
            conn.timeout = timeout;
            conn.suspended = false;
            conn.touch(now);
        }
        self.update_interest(id);
        self.schedule_conn_timer(id);
        self.dispatch_buffered(id);
        true
    }

    fn set_suspended(&mut self, id: ConnId, suspended: bool) {
        if let Some(conn) = self.conn_mut(id) {
            if conn.suspended == suspended {
                return;
            }
            conn.suspended = suspended;
        } else {
            return;
        }
        self.update_interest(id);
    }

    /// Reconciles the poller registration with the connection's desired
    /// readiness directions.
    fn update_interest(&mut self, id: ConnId) {
        let token = Token(CONN_BASE + id);
        let poller = &self.poller;
        let conn = match self.slots.get_mut(id).and_then(|slot| slot.conn.as_mut()) {
            Some(conn) => conn,
            None => return,
        };
        let read = conn.state == ConnState::Open && !conn.suspended;
        let write = conn.want_write;
        let result = if read || write {
            if conn.registered {
                poller.rearm(&mut conn.stream, token, read, write)
            } else {
                conn.registered = true;
                poller.arm(&mut conn.stream, token, read, write)
            }
        } else if conn.registered {
            conn.registered = false;
            poller.disarm(&mut conn.stream)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            warn!(self.log, "poller registration failed"; "conn" => id, "error" => %e);
        }
    }

    fn schedule_conn_timer(&mut self, id: ConnId) {
        let gen = match self.slots.get(id) {
            Some(slot) => slot.gen,
            None => return,
        };
        let deadline = match self.slots[id].conn.as_ref().and_then(|c| c.deadline()) {
            Some(deadline) => deadline,
            None => return,
        };
        self.timers.schedule(deadline, id, gen);
    }

    fn expire_timers(&mut self) {
        enum Due {
            Timeout,
            ForceClose,
        }

        let now = self.now;
        for (id, gen) in self.timers.expired(now) {
            if !self.gen_matches(id, gen) {
                continue;
            }
            let (deadline, in_grace) = {
                let conn = self.conn_mut(id).expect("generation checked");
                (conn.deadline(), conn.close_grace.is_some())
            };
            let due = match deadline {
                None => continue,
                Some(deadline) if deadline > now => {
                    // Activity moved the deadline; track the new one.
                    self.timers.schedule(deadline, id, gen);
                    continue;
                }
                Some(_) if in_grace => Due::ForceClose,
                Some(_) => Due::Timeout,
            };
            match due {
                Due::ForceClose => {
                    debug!(self.log, "close grace expired"; "conn" => id);
                    self.close_now(id);
                }
                Due::Timeout => {
                    trace!(self.log, "idle deadline hit"; "conn" => id);
                    self.dispatch(id, |proto, io| proto.on_timeout(io));
                    self.schedule_conn_timer(id);
                }
            }
        }
    }

    /// Graceful close: no further writes are accepted, queued writes drain
    /// within the grace window, then the connection closes.
    pub(crate) fn request_close(&mut self, id: ConnId) {
        let now = self.now;
        let drained = {
            let conn = match self.conn_mut(id) {
                Some(conn) => conn,
                None => return,
            };
            if conn.state != ConnState::Open {
                return;
            }
            conn.state = ConnState::Closing;
            conn.queue.seal();
            if conn.queue.is_empty() {
                true
            } else {
                conn.close_grace = Some(now + CLOSE_GRACE);
                conn.want_write = true;
                false
            }
        };
        if drained {
            self.finalize_close(id);
        } else {
            self.update_interest(id);
            self.schedule_conn_timer(id);
            self.flush_conn(id);
        }
    }

    /// Immediate close: discards queued writes (their storage is released)
    /// and finalizes.
    fn close_now(&mut self, id: ConnId) {
        let dropped = {
            let conn = match self.conn_mut(id) {
                Some(conn) => conn,
                None => return,
            };
            if conn.state == ConnState::Closed {
                return;
            }
            conn.state = ConnState::Closing;
            conn.queue.close()
        };
        if dropped > 0 {
            trace!(self.log, "discarded queued writes"; "conn" => id, "chunks" => dropped);
        }
        self.finalize_close(id);
    }

    /// Terminal transition. Fires `on_close` exactly once, cancels the
    /// connection's subscriptions, and recycles the slot.
    fn finalize_close(&mut self, id: ConnId) {
        if self.dispatching == Some(id) {
            // A callback for this connection is on the stack and holds its
            // protocol; the dispatch wrapper finalizes once it returns.
            if let Some(conn) = self.conn_mut(id) {
                conn.finalize_pending = true;
            }
            return;
        }
        let gen = {
            let conn = match self.conn_mut(id) {
                Some(conn) => conn,
                None => return,
            };
            if conn.on_close_fired {
                return;
            }
            conn.on_close_fired = true;
            conn.state = ConnState::Closed;
            conn.queue.close();
            self.slots[id].gen
        };

        // Deregister before the callback so no further events arrive.
        {
            let poller = &self.poller;
            let conn = self.slots[id].conn.as_mut().expect("conn checked above");
            if conn.registered {
                conn.registered = false;
                let _ = poller.disarm(&mut conn.stream);
            }
        }

        self.dispatch(id, |proto, io| proto.on_close(io));
        self.bus.drop_conn(conn_key(id, gen));

        let slot = &mut self.slots[id];
        slot.conn = None;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id);
        self.live.swap_remove(&id);
        debug!(self.log, "connection closed"; "conn" => id);
    }

    fn force_close_all(&mut self) {
        let ids: Vec<ConnId> = self.live.iter().copied().collect();
        for id in ids {
            self.close_now(id);
        }
    }

    /// Starts the shutdown protocol: stop accepting, broadcast
    /// `on_shutdown`, then drain within the configured window.
    pub fn begin_shutdown(&mut self) {
        if self.shutdown.is_some() {
            return;
        }
        info!(self.log, "graceful shutdown";
              "open_connections" => self.live.len(),
              "grace_secs" => self.cfg.shutdown_grace_secs);
        for listener in &mut self.listeners {
            let _ = self.poller.disarm(listener.sock.source_mut());
        }
        self.listeners.clear();
        self.shutdown = Some(self.now + Duration::from_secs(self.cfg.shutdown_grace_secs));

        let ids: Vec<ConnId> = self.live.iter().copied().collect();
        for id in ids {
            self.dispatch(id, |proto, io| proto.on_shutdown(io));
        }
    }

    /// Drains one subscription's pending messages into its sink.
    pub(crate) fn pump_subscription(&mut self, sub: &Arc<Subscription>) {
        if sub.is_cancelled() {
            return;
        }
        let id = sub.tx().id();
        if !self.gen_matches(id, sub.tx().gen()) {
            // The sink died before delivery; the subscription goes with it.
            self.bus.unsubscribe(sub);
            return;
        }
        while let Some(message) = sub.pop() {
            if let Some(hook) = &sub.on_message {
                hook(sub.tx(), &message);
                continue;
            }
            let bytes = message.encoded(sub.encoder());
            let conn = self.conn_mut(id).expect("generation checked");
            if conn.queue.push(Chunk::Shared(bytes)).is_err() {
                self.bus.unsubscribe(sub);
                return;
            }
        }
        self.flush_conn(id);
    }
}

/// The per-dispatch window a protocol gets into its connection. Every
/// mutation of reactor-owned state goes through here, which keeps the
/// single-owner rule auditable.
pub struct IoCtx<'a> {
    r: &'a mut Reactor,
    id: ConnId,
}

impl<'a> IoCtx<'a> {
    #[inline]
    pub fn conn_id(&self) -> ConnId {
        self.id
    }

    /// Stable identity (slot + generation) of this connection.
    pub fn conn_key(&self) -> u64 {
        conn_key(self.id, self.r.slots[self.id].gen)
    }

    pub fn conn_age(&self) -> Duration {
        match self.conn() {
            Some(conn) => self.r.now.saturating_duration_since(conn.created),
            None => Duration::from_secs(0),
        }
    }

    /// The connection's read accumulator.
    pub fn read_buf(&mut self) -> &mut Buffer {
        &mut self
            .conn_expect()
            .read_buf
    }

    pub fn peer_eof(&self) -> bool {
        self.conn().map_or(true, |conn| conn.peer_eof)
    }

    pub fn is_closing(&self) -> bool {
        self.conn().map_or(true, |conn| conn.state != ConnState::Open)
    }

    /// Cross-thread write handle for this connection.
    pub fn tx(&self) -> ConnTx {
        let gen = self.r.slots[self.id].gen;
        let queue = self
            .conn()
            .expect("dispatch ran without a connection")
            .queue
            .clone();
        ConnTx::new(self.id, gen, queue, self.r.remote.clone())
    }

    /// Queues a chunk and flushes what the socket will take right now.
    /// Chunks written to a closing connection are dropped.
    pub fn write(&mut self, chunk: Chunk) {
        {
            let conn = match self.r.conn_mut(self.id) {
                Some(conn) => conn,
                None => return,
            };
            if conn.state != ConnState::Open {
                return;
            }
            if conn.queue.push(chunk).is_err() {
                return;
            }
        }
        self.r.flush_conn(self.id);
    }

    /// Graceful close (drain, then close).
    pub fn close(&mut self) {
        self.r.request_close(self.id);
    }

    /// Stages a protocol swap, installed when this dispatch returns.
    pub fn upgrade(&mut self, proto: Box<dyn Protocol>) {
        if let Some(conn) = self.r.conn_mut(self.id) {
            conn.pending_proto = Some(proto);
        }
    }

    /// Sets the idle timeout (seconds, 0 disables) and restarts it.
    pub fn set_timeout(&mut self, secs: u8) {
        let now = self.r.now;
        if let Some(conn) = self.r.conn_mut(self.id) {
            conn.timeout = secs;
            conn.touch(now);
        }
        self.r.schedule_conn_timer(self.id);
    }

    /// Marks activity, pushing the idle deadline out.
    pub fn touch(&mut self) {
        let now = self.r.now;
        if let Some(conn) = self.r.conn_mut(self.id) {
            conn.touch(now);
        }
    }

    /// Stops reading from the socket until `resume`.
    pub fn suspend(&mut self) {
        self.r.set_suspended(self.id, true);
    }

    pub fn resume(&mut self) {
        self.r.set_suspended(self.id, false);
    }

    fn conn(&self) -> Option<&Conn> {
        self.r.slots.get(self.id).and_then(|slot| slot.conn.as_ref())
    }

    fn conn_expect(&mut self) -> &mut Conn {
        self.r
            .conn_mut(self.id)
            .expect("dispatch ran without a connection")
    }
}

#[cfg(test)]
pub(crate) struct TestRemote {
    pub remote: Remote,
    pub tasks: Receiver<Task>,
    #[allow(dead_code)]
    poller: Poller,
}

#[cfg(test)]
pub(crate) fn test_remote() -> TestRemote {
    let poller = Poller::new(8).expect("test poller");
    let waker = Arc::new(Waker::new(poller.registry(), WAKE_TOKEN).expect("test waker"));
    let (tx, rx) = mpsc::channel();
    TestRemote {
        remote: Remote { tx, waker },
        tasks: rx,
        poller,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handle::Handle;
    use crate::logging;
    use crate::pubsub::ChannelKey;
    use crate::service::WsAccept;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    /// Serves `hello from plasma` on every request; allows WebSocket
    /// upgrades into a chat channel and mirrors messages onto it.
    struct TestSvc;

    impl Service for TestSvc {
        fn on_http(&self, h: &mut Handle) {
            h.set_status(200);
            h.header_set("x-test", "1");
            h.write(b"hello from plasma");
            h.finish();
        }

        fn authenticate_websocket(&self, _h: &mut Handle) -> WsAccept {
            WsAccept::Allow
        }

        fn on_open(&self, h: &mut Handle) {
            h.subscribe(ChannelKey::named(b"chat"));
        }

        fn on_message(&self, h: &mut Handle, data: &[u8], is_text: bool) {
            h.publish(ChannelKey::named(b"chat"), data, is_text);
        }
    }

    fn start_server(cfg: Config) -> (SocketAddr, Remote, thread::JoinHandle<()>) {
        let mut reactor =
            Reactor::new(cfg, Arc::new(TestSvc), logging::discard()).expect("reactor");
        let addr = reactor.listen_tcp("127.0.0.1:0").expect("bind");
        let remote = reactor.remote();
        let join = thread::spawn(move || reactor.run());
        (addr, remote, join)
    }

    fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out);
        out
    }

    /// Reads one response head plus a content-length body.
    fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
        let mut raw = Vec::new();
        let mut byte = [0u8; 1];
        while !raw.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).expect("response head");
            raw.push(byte[0]);
        }
        let head = String::from_utf8(raw).expect("ascii head");
        let length = head
            .lines()
            .find_map(|l| {
                let l = l.to_ascii_lowercase();
                l.strip_prefix("content-length:")
                    .map(|v| v.trim().parse::<usize>().expect("length"))
            })
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).expect("response body");
        (head, body)
    }

    #[test]
    fn test_serves_http_and_closes_on_request() {
        let (addr, remote, join) = start_server(Config::default());

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
            .unwrap();

        let raw = read_until_close(&mut client);
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", text);
        assert!(text.contains("x-test: 1\r\n"));
        assert!(text.contains("content-length: 17\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("hello from plasma"));

        remote.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_keep_alive_serves_sequential_requests() {
        let (addr, remote, join) = start_server(Config::default());

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        for _ in 0..3 {
            client
                .write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n")
                .unwrap();
            let (head, body) = read_response(&mut client);
            assert!(head.starts_with("HTTP/1.1 200 OK"));
            assert!(head.contains("connection: keep-alive"));
            assert_eq!(body, b"hello from plasma");
        }

        remote.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_oversize_headers_get_431_and_close() {
        let cfg = Config {
            max_header_size: 256,
            ..Config::default()
        };
        let (addr, remote, join) = start_server(cfg);

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut request = b"GET / HTTP/1.1\r\nHost: t\r\n".to_vec();
        for i in 0..40 {
            request.extend_from_slice(format!("x-pad-{}: {}\r\n", i, "y".repeat(16)).as_bytes());
        }
        request.extend_from_slice(b"\r\n");
        client.write_all(&request).unwrap();

        let raw = read_until_close(&mut client);
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 431 "), "got: {}", text);
        assert!(text.contains("connection: close"));

        remote.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_websocket_echo_through_pubsub() {
        let (addr, remote, join) = start_server(Config::default());

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: t\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .unwrap();

        // Read the 101 head.
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).expect("handshake head");
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols"), "got: {}", head);
        assert!(head
            .to_ascii_lowercase()
            .contains("sec-websocket-accept: s3pplmbitxaq9kygzzhzrbk+xoo="));

        // Masked text frame "hi".
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut frame = vec![0x81, 0x80 | 2];
        frame.extend_from_slice(&mask);
        frame.push(b'h' ^ mask[0]);
        frame.push(b'i' ^ mask[1]);
        client.write_all(&frame).unwrap();

        // The pub/sub fan-out delivers it back as an unmasked text frame.
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).expect("echoed frame");
        assert_eq!(reply, [0x81, 2, b'h', b'i']);

        remote.stop();

        // Shutdown sends a close frame before the connection drops.
        let mut close_head = [0u8; 2];
        client.read_exact(&mut close_head).expect("close frame");
        assert_eq!(close_head[0], 0x88);

        join.join().unwrap();
    }

    #[test]
    fn test_shutdown_closes_idle_keepalive_connections() {
        let cfg = Config {
            shutdown_grace_secs: 2,
            ..Config::default()
        };
        let (addr, remote, join) = start_server(cfg);

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n")
            .unwrap();
        let (head, _) = read_response(&mut client);
        assert!(head.contains("keep-alive"));

        remote.stop();
        join.join().unwrap();

        // The server side closed; the next read sees EOF.
        let mut rest = Vec::new();
        let got = client.read_to_end(&mut rest);
        assert!(got.is_ok());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_timeout_reaps_idle_connections() {
        let cfg = Config {
            keep_alive_timeout: 1,
            ..Config::default()
        };
        let (addr, remote, join) = start_server(cfg);

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        // Never send a request; the idle deadline must reap us.
        let mut out = Vec::new();
        let got = client.read_to_end(&mut out);
        assert!(got.is_ok(), "expected EOF, got {:?}", got);
        assert!(out.is_empty());

        remote.stop();
        join.join().unwrap();
    }
}
