use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::time::Duration;

/// Thin wrapper over the OS readiness primitive. Owns the poll instance and
/// its event buffer; callers arm and disarm descriptors through it and pull
/// ready-sets with a bounded wait.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new(capacity: usize) -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Registers a descriptor for the given readiness directions. At least
    /// one direction must be armed; fully disarming means `disarm`.
    #[inline]
    pub fn arm<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        read: bool,
        write: bool,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest(read, write))
    }

    /// Changes the armed directions of an already registered descriptor.
    #[inline]
    pub fn rearm<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        read: bool,
        write: bool,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(source, token, interest(read, write))
    }

    #[inline]
    pub fn disarm<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Waits for readiness up to `timeout`. An interrupted wait yields an
    /// empty ready-set instead of an error.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                self.events.clear();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[inline]
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

fn interest(read: bool, write: bool) -> Interest {
    match (read, write) {
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
        (false, true) => Interest::WRITABLE,
        // Arming nothing is a caller bug; fall back to read so the
        // descriptor at least reports closure.
        _ => Interest::READABLE,
    }
}
