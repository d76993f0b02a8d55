use crate::conn::Chunk;
use crate::http::handle::HandleRef;
use crate::logging::{debug, trace, Logger};
use crate::protocol::Protocol;
use crate::pubsub::Message;
use crate::reactor::IoCtx;
use crate::service::Service;
use crate::workers::Executor;
use std::sync::Arc;

/// Comment line sent on idle so proxies and clients keep the stream open.
pub const KEEPALIVE_COMMENT: &[u8] = b":\n\n";

/// Serializes a message as one event-stream block: optional `event:`,
/// `id:` and `retry:` lines, the payload split across `data:` lines, and
/// the terminating blank line.
pub fn encode_event(message: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.data.len() + 32);
    if let Some(event) = &message.event {
        out.extend_from_slice(b"event: ");
        out.extend_from_slice(event.as_bytes());
        out.push(b'\n');
    }
    if let Some(id) = &message.id {
        out.extend_from_slice(b"id: ");
        out.extend_from_slice(id.as_bytes());
        out.push(b'\n');
    }
    if let Some(retry) = message.retry {
        out.extend_from_slice(format!("retry: {}\n", retry).as_bytes());
    }
    if !message.data.is_empty() {
        for line in message.data.split(|&b| b == b'\n') {
            let line = match line.last() {
                Some(b'\r') => &line[..line.len() - 1],
                _ => line,
            };
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(line);
            out.push(b'\n');
        }
    }
    out.push(b'\n');
    out
}

/// Protocol for an upgraded event-stream connection. The stream is one
/// way: published messages flow out through the subscription pump, and a
/// keep-alive comment goes out when the connection idles.
pub struct SseProto {
    handle: HandleRef,
    service: Arc<dyn Service>,
    executor: Arc<Executor>,
    log: Logger,
}

impl SseProto {
    pub fn new(
        handle: HandleRef,
        service: Arc<dyn Service>,
        executor: Arc<Executor>,
        log: Logger,
    ) -> SseProto {
        SseProto {
            handle,
            service,
            executor,
            log,
        }
    }
}

impl Protocol for SseProto {
    fn on_data(&mut self, io: &mut IoCtx<'_>) {
        // Clients have nothing to say on an event stream; discard it.
        let len = io.read_buf().len();
        if len > 0 {
            trace!(self.log, "discarding inbound bytes on event stream"; "bytes" => len);
            io.read_buf().consume(len);
        }
        if io.peer_eof() {
            io.close();
        }
    }

    fn on_timeout(&mut self, io: &mut IoCtx<'_>) {
        trace!(self.log, "event stream idle, sending keep-alive"; "conn" => io.conn_id());
        io.write(Chunk::Static(KEEPALIVE_COMMENT));
    }

    fn on_shutdown(&mut self, io: &mut IoCtx<'_>) {
        debug!(self.log, "event stream shutting down"; "conn" => io.conn_id());
        let handle = self.handle.clone();
        let service = self.service.clone();
        let tx = io.tx();
        self.executor.submit(
            Some(io.conn_key()),
            Box::new(move || {
                let mut h = handle.lock().expect("handle lock poisoned");
                service.on_shutdown(&mut h);
                drop(h);
                tx.close();
            }),
        );
    }

    fn on_close(&mut self, io: &mut IoCtx<'_>) {
        let handle = self.handle.clone();
        let service = self.service.clone();
        self.executor.submit(
            Some(io.conn_key()),
            Box::new(move || {
                let mut h = handle.lock().expect("handle lock poisoned");
                service.on_close(&mut h);
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::ChannelKey;

    fn message(data: &[u8]) -> Message {
        Message::new(ChannelKey::named(b"t"), data.to_vec(), true)
    }

    #[test]
    fn test_plain_data_event() {
        assert_eq!(encode_event(&message(b"hello")), b"data: hello\n\n");
    }

    #[test]
    fn test_multiline_data_split() {
        assert_eq!(
            encode_event(&message(b"one\ntwo\nthree")),
            b"data: one\ndata: two\ndata: three\n\n"
        );
        // CRLF payloads do not leak carriage returns.
        assert_eq!(
            encode_event(&message(b"one\r\ntwo")),
            b"data: one\ndata: two\n\n"
        );
    }

    #[test]
    fn test_event_id_retry_fields() {
        let mut msg = message(b"payload").with_event("update").with_id("42");
        msg.retry = Some(3000);
        assert_eq!(
            encode_event(&msg),
            b"event: update\nid: 42\nretry: 3000\ndata: payload\n\n"
        );
    }

    #[test]
    fn test_empty_data_still_terminates() {
        let msg = message(b"").with_event("ping");
        assert_eq!(encode_event(&msg), b"event: ping\n\n");
    }

    #[test]
    fn test_keepalive_is_a_comment() {
        assert_eq!(KEEPALIVE_COMMENT, b":\n\n");
    }
}
