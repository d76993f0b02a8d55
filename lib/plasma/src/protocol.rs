use crate::reactor::IoCtx;

/// How the bytes on one connection are interpreted. Exactly one callback
/// runs at a time for a given connection, always on the reactor thread.
/// Swapping the protocol (an upgrade) is staged through
/// [`IoCtx::upgrade`] and installed between dispatches.
pub trait Protocol: Send {
    /// New bytes are available in the read accumulator.
    fn on_data(&mut self, io: &mut IoCtx<'_>);

    /// The write queue just drained.
    fn on_ready(&mut self, _io: &mut IoCtx<'_>) {}

    /// The idle deadline expired. The default tears the connection down.
    fn on_timeout(&mut self, io: &mut IoCtx<'_>) {
        io.close();
    }

    /// The server is shutting down; say goodbye and start closing.
    fn on_shutdown(&mut self, _io: &mut IoCtx<'_>) {}

    /// Final callback for the connection. Runs exactly once.
    fn on_close(&mut self, _io: &mut IoCtx<'_>) {}
}
