use crate::conn::{Chunk, ConnTx};
use crate::http::handle::{Controller, HandleRef, ResponseMeta};
use crate::logging::{debug, trace, Logger};
use crate::protocol::Protocol;
use crate::reactor::IoCtx;
use crate::service::Service;
use crate::workers::Executor;
use crate::ws::close_code;
use crate::ws::frame::{self, Frame, FrameError, Opcode};
use std::sync::Arc;

/// What one parsed frame asks the protocol to do, with payload copied out
/// of the read buffer.
enum Action {
    None,
    Deliver(Vec<u8>, bool),
    Pong(Vec<u8>),
    PongReceived,
    CloseReply(u16),
    Violation(u16, &'static str),
}

/// RFC 6455 connection state after the handshake: frame reassembly,
/// control handling, idle pings, and message delivery to the service.
pub struct WsProto {
    handle: HandleRef,
    service: Arc<dyn Service>,
    executor: Arc<Executor>,
    log: Logger,
    max_msg: usize,
    assembling: Option<(bool, Vec<u8>)>,
    close_sent: bool,
    ping_outstanding: bool,
}

impl WsProto {
    pub fn new(
        handle: HandleRef,
        service: Arc<dyn Service>,
        executor: Arc<Executor>,
        log: Logger,
        max_msg: usize,
    ) -> WsProto {
        WsProto {
            handle,
            service,
            executor,
            log,
            max_msg,
            assembling: None,
            close_sent: false,
            ping_outstanding: false,
        }
    }

    /// Digests one frame into an owned action. Runs while the frame still
    /// borrows the read buffer, so it only copies.
    fn absorb(&mut self, frame: Frame<'_>) -> Action {
        match frame.opcode {
            Opcode::Ping => Action::Pong(frame.payload.to_vec()),
            Opcode::Pong => Action::PongReceived,
            Opcode::Close => match frame::parse_close(frame.payload) {
                Ok((code, _reason)) => Action::CloseReply(code),
                Err(_) => Action::Violation(close_code::INVALID_PAYLOAD, "bad close payload"),
            },
            Opcode::Text | Opcode::Binary => {
                if self.assembling.is_some() {
                    return Action::Violation(
                        close_code::PROTOCOL_ERROR,
                        "data frame inside fragmented message",
                    );
                }
                let is_text = frame.opcode == Opcode::Text;
                if frame.fin {
                    self.finish_message(is_text, frame.payload.to_vec())
                } else {
                    self.assembling = Some((is_text, frame.payload.to_vec()));
                    Action::None
                }
            }
            Opcode::Continuation => {
                let (is_text, mut data) = match self.assembling.take() {
                    Some(state) => state,
                    None => {
                        return Action::Violation(
                            close_code::PROTOCOL_ERROR,
                            "continuation without a message",
                        )
                    }
                };
                if data.len() + frame.payload.len() > self.max_msg {
                    return Action::Violation(close_code::TOO_LARGE, "message too large");
                }
                data.extend_from_slice(frame.payload);
                if frame.fin {
                    self.finish_message(is_text, data)
                } else {
                    self.assembling = Some((is_text, data));
                    Action::None
                }
            }
        }
    }

    fn finish_message(&mut self, is_text: bool, data: Vec<u8>) -> Action {
        if is_text && std::str::from_utf8(&data).is_err() {
            return Action::Violation(close_code::INVALID_PAYLOAD, "invalid utf-8 in text message");
        }
        Action::Deliver(data, is_text)
    }

    fn act(&mut self, io: &mut IoCtx<'_>, action: Action) -> bool {
        match action {
            Action::None => true,
            Action::Pong(payload) => {
                if !self.close_sent {
                    io.write(Chunk::Bytes(frame::encode_frame(Opcode::Pong, &payload, true)));
                }
                true
            }
            Action::PongReceived => {
                self.ping_outstanding = false;
                true
            }
            Action::Deliver(data, is_text) => {
                self.ping_outstanding = false;
                trace!(self.log, "websocket message";
                       "conn" => io.conn_id(),
                       "bytes" => data.len(),
                       "text" => is_text);
                let handle = self.handle.clone();
                let service = self.service.clone();
                self.executor.submit(
                    Some(io.conn_key()),
                    Box::new(move || {
                        let mut h = handle.lock().expect("handle lock poisoned");
                        service.on_message(&mut h, &data, is_text);
                    }),
                );
                true
            }
            Action::CloseReply(code) => {
                if !self.close_sent {
                    let reply = if code == 1005 { close_code::NORMAL } else { code };
                    io.write(Chunk::Bytes(frame::encode_close(reply, "")));
                    self.close_sent = true;
                }
                io.close();
                false
            }
            Action::Violation(code, reason) => {
                self.close_with(io, code, reason);
                false
            }
        }
    }

    fn close_with(&mut self, io: &mut IoCtx<'_>, code: u16, reason: &str) {
        debug!(self.log, "closing websocket";
               "conn" => io.conn_id(),
               "code" => code,
               "reason" => reason);
        if !self.close_sent {
            io.write(Chunk::Bytes(frame::encode_close(code, reason)));
            self.close_sent = true;
        }
        io.close();
    }
}

impl Protocol for WsProto {
    fn on_data(&mut self, io: &mut IoCtx<'_>) {
        loop {
            if io.is_closing() {
                return;
            }
            let (action, consumed) = match frame::parse_frame(io.read_buf(), self.max_msg, true) {
                Ok(None) => break,
                Ok(Some((frame, consumed))) => (self.absorb(frame), consumed),
                Err(FrameError::Protocol) => {
                    self.close_with(io, close_code::PROTOCOL_ERROR, "protocol violation");
                    return;
                }
                Err(FrameError::TooLarge) => {
                    self.close_with(io, close_code::TOO_LARGE, "frame too large");
                    return;
                }
            };
            io.read_buf().consume(consumed);
            if !self.act(io, action) {
                return;
            }
        }
        if io.peer_eof() {
            io.close();
        }
    }

    fn on_timeout(&mut self, io: &mut IoCtx<'_>) {
        if self.close_sent || self.ping_outstanding {
            // The peer went quiet past its grace; drop it.
            io.close();
            return;
        }
        trace!(self.log, "idle websocket, pinging"; "conn" => io.conn_id());
        io.write(Chunk::Bytes(frame::encode_frame(Opcode::Ping, b"", true)));
        self.ping_outstanding = true;
    }

    fn on_shutdown(&mut self, io: &mut IoCtx<'_>) {
        debug!(self.log, "websocket shutting down"; "conn" => io.conn_id());
        self.close_sent = true;
        let handle = self.handle.clone();
        let service = self.service.clone();
        let tx = io.tx();
        self.executor.submit(
            Some(io.conn_key()),
            Box::new(move || {
                {
                    let mut h = handle.lock().expect("handle lock poisoned");
                    service.on_shutdown(&mut h);
                }
                let _ = tx.write(Chunk::Bytes(frame::encode_close(
                    close_code::GOING_AWAY,
                    "server shutting down",
                )));
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

/// Controller installed on the handle after the upgrade: the response API
/// is dead, messages frame as RFC 6455 data frames.
pub(crate) struct WsController {
    tx: ConnTx,
    max_msg: usize,
}

impl WsController {
    pub(crate) fn new(tx: ConnTx, max_msg: usize) -> WsController {
        WsController { tx, max_msg }
    }
}

impl Controller for WsController {
    fn send_continue(&mut self) {}
    fn send_headers(&mut self, _meta: &ResponseMeta<'_>) {}
    fn write_body(&mut self, _chunk: Chunk) {}
    fn finish(&mut self) {}

    fn write_message(&mut self, data: &[u8], is_text: bool) -> bool {
        if data.len() > self.max_msg {
            // Oversize writes bounce back to the application.
            return false;
        }
        let opcode = if is_text { Opcode::Text } else { Opcode::Binary };
        self.tx
            .write(Chunk::Bytes(frame::encode_frame(opcode, data, true)))
            .is_ok()
    }

    fn on_unlinked(&mut self) {}
}
