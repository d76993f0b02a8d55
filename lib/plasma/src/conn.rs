use crate::buffer::Buffer;
use crate::error::{FatalKind, NetError, NetResult};
use crate::protocol::Protocol;
use crate::reactor::Remote;
use mio::event::Source;
use mio::net::{TcpStream, UnixStream};
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type ConnId = usize;

/// Packs a slot index and its reuse generation into one stable identifier.
/// Stale handles for a recycled slot fail the generation check instead of
/// touching the new occupant.
#[inline]
pub fn conn_key(id: ConnId, gen: u32) -> u64 {
    ((gen as u64) << 32) | (id as u64 & 0xffff_ffff)
}

/// The transport under a connection. TLS would slot in here as another
/// variant wrapping one of these.
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(how),
            Stream::Unix(s) => s.shutdown(how),
        }
    }

    pub fn peer_desc(&self) -> String {
        match self {
            Stream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            Stream::Unix(_) => "unix".to_string(),
        }
    }

    #[cfg(target_os = "linux")]
    fn raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Stream {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.register(registry, token, interests),
            Stream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.reregister(registry, token, interests),
            Stream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.deregister(registry),
            Stream::Unix(s) => s.deregister(registry),
        }
    }
}

/// One queued unit of outgoing data. Dropping a chunk releases its backing
/// storage, so deallocation happens exactly once no matter which path a
/// chunk leaves the queue by.
#[derive(Debug)]
pub enum Chunk {
    /// Owned bytes; ownership transfers to the queue.
    Bytes(Vec<u8>),
    /// Refcounted bytes shared across queues (pub/sub fan-out).
    Shared(Arc<[u8]>),
    /// Borrowed static bytes (canned responses, keep-alive comments).
    Static(&'static [u8]),
    /// A file range, served by `sendfile` where available.
    File {
        file: File,
        offset: u64,
        remaining: u64,
    },
}

impl Chunk {
    #[inline]
    pub fn len(&self) -> u64 {
        match self {
            Chunk::Bytes(b) => b.len() as u64,
            Chunk::Shared(b) => b.len() as u64,
            Chunk::Static(b) => b.len() as u64,
            Chunk::File { remaining, .. } => *remaining,
        }
    }
}

#[derive(Debug)]
struct Pending {
    chunk: Chunk,
    offset: usize,
}

impl Pending {
    #[inline]
    fn done(&self) -> bool {
        match &self.chunk {
            Chunk::Bytes(b) => self.offset >= b.len(),
            Chunk::Shared(b) => self.offset >= b.len(),
            Chunk::Static(b) => self.offset >= b.len(),
            Chunk::File { remaining, .. } => *remaining == 0,
        }
    }
}

/// The ordered outgoing queue of a connection. This is the only part of a
/// connection that other threads touch; everything else belongs to the
/// reactor thread.
pub struct WriteQueue {
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    chunks: VecDeque<Pending>,
    closed: bool,
}

impl WriteQueue {
    pub(crate) fn new() -> Arc<WriteQueue> {
        Arc::new(WriteQueue {
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::new(),
                closed: false,
            }),
        })
    }

    /// Appends a chunk. Fails once the queue stopped accepting writes; the
    /// rejected chunk is dropped (releasing its storage) on return.
    pub fn push(&self, chunk: Chunk) -> NetResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(NetError::Fatal(FatalKind::QueueClosed));
        }
        inner.chunks.push_back(Pending { chunk, offset: 0 });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn queued_bytes(&self) -> u64 {
        let inner = self.lock();
        inner
            .chunks
            .iter()
            .map(|p| p.chunk.len().saturating_sub(p.offset as u64))
            .sum()
    }

    /// Refuses further writes and discards whatever is still queued.
    /// Returns the number of chunks dropped.
    pub(crate) fn close(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let dropped = inner.chunks.len();
        inner.chunks.clear();
        dropped
    }

    /// Stops accepting new writes but keeps queued data for draining.
    pub(crate) fn seal(&self) {
        self.lock().closed = true;
    }

    fn pop(&self) -> Option<Pending> {
        self.lock().chunks.pop_front()
    }

    fn unpop(&self, pending: Pending) {
        self.lock().chunks.push_front(pending);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("write queue lock poisoned")
    }
}

/// Cross-thread write handle for one connection. Cheap to clone; carries
/// the generation so handles outliving the connection turn into no-ops.
#[derive(Clone)]
pub struct ConnTx {
    id: ConnId,
    gen: u32,
    queue: Arc<WriteQueue>,
    remote: Remote,
}

impl ConnTx {
    pub(crate) fn new(id: ConnId, gen: u32, queue: Arc<WriteQueue>, remote: Remote) -> ConnTx {
        ConnTx {
            id,
            gen,
            queue,
            remote,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn gen(&self) -> u32 {
        self.gen
    }

    #[inline]
    pub fn key(&self) -> u64 {
        conn_key(self.id, self.gen)
    }

    /// Queues a chunk and wakes the reactor to flush it. Safe from any
    /// thread; per-connection ordering follows enqueue order.
    pub fn write(&self, chunk: Chunk) -> NetResult<()> {
        self.queue.push(chunk)?;
        self.remote.notify_write(self.id, self.gen);
        Ok(())
    }

    /// Requests a graceful close: queued writes drain within the grace
    /// window, then the connection closes.
    pub fn close(&self) {
        self.remote.close_conn(self.id, self.gen);
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub(crate) fn queue(&self) -> &Arc<WriteQueue> {
        &self.queue
    }

    pub(crate) fn remote(&self) -> &Remote {
        &self.remote
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnState {
    Open,
    Closing,
    Closed,
}

pub(crate) enum FlushStatus {
    /// Queue fully drained.
    Drained,
    /// Kernel buffer full; write readiness will resume the flush.
    Blocked,
    /// Per-tick byte budget exhausted with data still queued.
    Budget,
}

/// Runtime state of one connection endpoint. Owned and mutated by the
/// reactor thread; the write queue inside is the one cross-thread door.
pub struct Conn {
    pub(crate) stream: Stream,
    pub(crate) read_buf: Buffer,
    pub(crate) queue: Arc<WriteQueue>,
    pub(crate) proto: Option<Box<dyn Protocol>>,
    pub(crate) pending_proto: Option<Box<dyn Protocol>>,
    pub(crate) state: ConnState,
    pub(crate) suspended: bool,
    pub(crate) peer_eof: bool,
    pub(crate) want_write: bool,
    pub(crate) registered: bool,
    pub(crate) timeout: u8,
    pub(crate) last_activity: Instant,
    pub(crate) created: Instant,
    pub(crate) close_grace: Option<Instant>,
    pub(crate) on_close_fired: bool,
    pub(crate) finalize_pending: bool,
}

impl Conn {
    pub(crate) fn new(stream: Stream, proto: Box<dyn Protocol>, read_limit: usize, timeout: u8, now: Instant) -> Conn {
        Conn {
            stream,
            read_buf: Buffer::with_limit(read_limit),
            queue: WriteQueue::new(),
            proto: Some(proto),
            pending_proto: None,
            state: ConnState::Open,
            suspended: false,
            peer_eof: false,
            want_write: false,
            registered: false,
            timeout,
            last_activity: now,
            created: now,
            close_grace: None,
            on_close_fired: false,
            finalize_pending: false,
        }
    }

    #[inline]
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// The moment this connection's timer fires, if it has one. The close
    /// grace deadline takes over once the connection is draining.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        if let Some(grace) = self.close_grace {
            return Some(grace);
        }
        if self.timeout == 0 {
            return None;
        }
        Some(self.last_activity + Duration::from_secs(self.timeout as u64))
    }

    /// Drains the kernel receive buffer into the read accumulator.
    /// Returns `(bytes, eof)`.
    pub(crate) fn receive(&mut self, now: Instant) -> io::Result<(usize, bool)> {
        let (received, eof) = self.read_buf.ingress(&mut self.stream)?;
        if received > 0 {
            self.touch(now);
        }
        if eof {
            self.peer_eof = true;
        }
        Ok((received, eof))
    }

    /// Writes queued chunks to the kernel, bounded by `budget` bytes.
    pub(crate) fn flush(&mut self, now: Instant, budget: usize) -> NetResult<FlushStatus> {
        let mut spent = 0usize;
        loop {
            if spent >= budget {
                return Ok(FlushStatus::Budget);
            }
            let mut pending = match self.queue.pop() {
                Some(p) => p,
                None => return Ok(FlushStatus::Drained),
            };
            match write_pending(&mut self.stream, &mut pending, budget - spent) {
                Ok(n) => {
                    if n > 0 {
                        spent += n;
                        self.touch(now);
                    }
                    if pending.done() {
                        continue;
                    }
                    if n == 0 {
                        return Err(NetError::Fatal(FatalKind::WriteZero));
                    }
                    self.queue.unpop(pending);
                }
                Err(e) => {
                    let err = NetError::from(e);
                    if err.is_wait() {
                        self.queue.unpop(pending);
                        return Ok(FlushStatus::Blocked);
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn write_pending(stream: &mut Stream, pending: &mut Pending, max: usize) -> io::Result<usize> {
    match &mut pending.chunk {
        Chunk::Bytes(b) => write_slice(stream, b, &mut pending.offset, max),
        Chunk::Shared(b) => write_slice(stream, b, &mut pending.offset, max),
        Chunk::Static(b) => write_slice(stream, b, &mut pending.offset, max),
        Chunk::File {
            file,
            offset,
            remaining,
        } => write_file(stream, file, offset, remaining, max),
    }
}

fn write_slice(stream: &mut Stream, data: &[u8], offset: &mut usize, max: usize) -> io::Result<usize> {
    let window = &data[*offset..];
    let take = window.len().min(max);
    let written = stream.write(&window[..take])?;
    *offset += written;
    Ok(written)
}

#[cfg(target_os = "linux")]
fn write_file(
    stream: &mut Stream,
    file: &File,
    offset: &mut u64,
    remaining: &mut u64,
    max: usize,
) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let count = (*remaining).min(max as u64) as usize;
    let mut off = *offset as libc::off_t;
    let sent = unsafe { libc::sendfile(stream.raw_fd(), file.as_raw_fd(), &mut off, count) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    if sent == 0 {
        // File shorter than advertised; nothing more will come.
        *remaining = 0;
        return Ok(0);
    }
    *offset += sent as u64;
    *remaining -= sent as u64;
    Ok(sent as usize)
}

#[cfg(not(target_os = "linux"))]
fn write_file(
    stream: &mut Stream,
    file: &File,
    offset: &mut u64,
    remaining: &mut u64,
    max: usize,
) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let mut buf = [0u8; 16 * 1024];
    let take = (*remaining).min(max as u64).min(buf.len() as u64) as usize;
    let read = file.read_at(&mut buf[..take], *offset)?;
    if read == 0 {
        *remaining = 0;
        return Ok(0);
    }
    let written = stream.write(&buf[..read])?;
    *offset += written as u64;
    *remaining -= written as u64;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::IoCtx;
    use std::thread;

    struct Noop;

    impl Protocol for Noop {
        fn on_data(&mut self, _io: &mut IoCtx<'_>) {}
    }

    fn unix_pair() -> (Stream, std::os::unix::net::UnixStream) {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mio_side = UnixStream::from_std(a);
        (Stream::Unix(mio_side), b)
    }

    fn read_all(sock: &mut std::os::unix::net::UnixStream, expected: usize) -> Vec<u8> {
        use std::io::Read;
        let mut out = vec![0u8; expected];
        sock.read_exact(&mut out).unwrap();
        out
    }

    #[test]
    fn test_queue_rejects_after_close() {
        let queue = WriteQueue::new();
        queue.push(Chunk::Static(b"a")).unwrap();
        let dropped = queue.close();
        assert_eq!(dropped, 1);
        assert!(queue.is_closed());
        assert_eq!(
            queue.push(Chunk::Static(b"b")).unwrap_err(),
            NetError::Fatal(FatalKind::QueueClosed)
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_close_releases_shared_chunks() {
        let payload: Arc<[u8]> = Arc::from(&b"shared payload"[..]);
        let queue = WriteQueue::new();
        queue.push(Chunk::Shared(payload.clone())).unwrap();
        queue.push(Chunk::Shared(payload.clone())).unwrap();
        assert_eq!(Arc::strong_count(&payload), 3);

        queue.close();

        // Both queued references released exactly once each.
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_flush_writes_in_enqueue_order() {
        let (stream, mut peer) = unix_pair();
        let now = Instant::now();
        let mut conn = Conn::new(stream, Box::new(Noop), 1024, 0, now);

        conn.queue.push(Chunk::Bytes(b"one ".to_vec())).unwrap();
        conn.queue.push(Chunk::Static(b"two ")).unwrap();
        conn.queue
            .push(Chunk::Shared(Arc::from(&b"three"[..])))
            .unwrap();

        match conn.flush(now, 1024 * 1024).unwrap() {
            FlushStatus::Drained => {}
            _ => panic!("expected a full drain"),
        }

        assert_eq!(read_all(&mut peer, 13), b"one two three".to_vec());
    }

    #[test]
    fn test_flush_respects_budget() {
        let (stream, _peer) = unix_pair();
        let now = Instant::now();
        let mut conn = Conn::new(stream, Box::new(Noop), 1024, 0, now);

        conn.queue.push(Chunk::Bytes(vec![1u8; 4096])).unwrap();

        match conn.flush(now, 100).unwrap() {
            FlushStatus::Budget => {}
            _ => panic!("expected budget exhaustion"),
        }
        assert!(conn.queue.queued_bytes() > 0);
    }

    #[test]
    fn test_flush_serves_file_ranges() {
        use std::io::{Seek, SeekFrom, Write as _};

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let (stream, mut peer) = unix_pair();
        let now = Instant::now();
        let mut conn = Conn::new(stream, Box::new(Noop), 1024, 0, now);

        conn.queue
            .push(Chunk::File {
                file,
                offset: 2,
                remaining: 5,
            })
            .unwrap();

        match conn.flush(now, 1024).unwrap() {
            FlushStatus::Drained => {}
            _ => panic!("expected a full drain"),
        }
        assert_eq!(read_all(&mut peer, 5), b"23456".to_vec());
    }

    #[test]
    fn test_concurrent_writers_keep_per_thread_order() {
        const WRITERS: u8 = 4;
        const PER_THREAD: u8 = 50;

        let queue = WriteQueue::new();
        let mut handles = Vec::new();
        for writer in 0..WRITERS {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for seq in 0..PER_THREAD {
                    queue.push(Chunk::Bytes(vec![writer, seq])).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Drain the queue in flush order and check each writer's sequence
        // numbers come out strictly increasing.
        let mut next_seq = [0u8; WRITERS as usize];
        let mut total = 0;
        while let Some(pending) = queue.pop() {
            match pending.chunk {
                Chunk::Bytes(b) => {
                    let (writer, seq) = (b[0], b[1]);
                    assert_eq!(seq, next_seq[writer as usize]);
                    next_seq[writer as usize] += 1;
                    total += 1;
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(total, WRITERS as usize * PER_THREAD as usize);
    }

    #[test]
    fn test_receive_sees_eof() {
        let (stream, peer) = unix_pair();
        let now = Instant::now();
        let mut conn = Conn::new(stream, Box::new(Noop), 1024, 0, now);

        {
            use std::io::Write;
            let mut peer = peer;
            peer.write_all(b"bye").unwrap();
            // peer drops here, closing its end
        }

        // Poll until both the payload and the EOF surface.
        let mut got = Vec::new();
        let mut eof = false;
        for _ in 0..100 {
            let (n, e) = conn.receive(now).unwrap();
            if n > 0 {
                got.extend_from_slice(conn.read_buf.read_slice());
                let len = conn.read_buf.len();
                conn.read_buf.consume(len);
            }
            if e {
                eof = true;
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(got, b"bye");
        assert!(eof);
        assert!(conn.peer_eof);
    }

    #[test]
    fn test_deadline_tracks_activity_and_grace() {
        let (stream, _peer) = unix_pair();
        let now = Instant::now();
        let mut conn = Conn::new(stream, Box::new(Noop), 1024, 10, now);

        assert_eq!(conn.deadline(), Some(now + Duration::from_secs(10)));

        let later = now + Duration::from_secs(3);
        conn.touch(later);
        assert_eq!(conn.deadline(), Some(later + Duration::from_secs(10)));

        conn.close_grace = Some(later + Duration::from_secs(1));
        assert_eq!(conn.deadline(), Some(later + Duration::from_secs(1)));

        conn.close_grace = None;
        conn.timeout = 0;
        assert_eq!(conn.deadline(), None);
    }
}
