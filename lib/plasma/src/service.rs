use crate::http::handle::Handle;

/// Answer to a WebSocket handshake.
pub enum WsAccept {
    Allow,
    Deny,
    /// Accept and pick one of the offered subprotocols.
    Subprotocol(String),
}

/// The application seam. One implementation serves every connection; state
/// lives behind `&self`. `on_http` runs on the worker pool when one is
/// configured, as do the WebSocket/SSE callbacks; the authenticate
/// predicates run inline on the reactor thread and must not block.
pub trait Service: Send + Sync + 'static {
    /// A complete request is ready for a response.
    fn on_http(&self, h: &mut Handle) {
        h.set_status(404);
        h.finish();
    }

    /// `Expect: 100-continue` arrived. Return true to accept (the server
    /// sends `100 Continue` and reads the body), false to reject after
    /// setting the final response on the handle.
    fn on_expect(&self, _h: &mut Handle) -> bool {
        true
    }

    /// Decide a WebSocket handshake. The default refuses upgrades.
    fn authenticate_websocket(&self, _h: &mut Handle) -> WsAccept {
        WsAccept::Deny
    }

    /// Decide an SSE request (`Accept: text/event-stream`).
    fn authenticate_sse(&self, _h: &mut Handle) -> bool {
        false
    }

    /// An upgraded connection (WebSocket or SSE) is established.
    fn on_open(&self, _h: &mut Handle) {}

    /// A complete WebSocket message arrived.
    fn on_message(&self, _h: &mut Handle, _data: &[u8], _is_text: bool) {}

    /// Graceful shutdown began; last chance to send a goodbye.
    fn on_shutdown(&self, _h: &mut Handle) {}

    /// The upgraded connection is gone.
    fn on_close(&self, _h: &mut Handle) {}

    /// The reactor finished its run.
    fn on_finish(&self) {}
}
