use crate::config::Config;
use crate::conn::{Chunk, ConnTx};
use crate::error::HttpError;
use crate::http::handle::{Controller, Handle, HandleRef, ResponseMeta};
use crate::http::parser::{Events, Limits, Parser, Progress};
use crate::http::{reason_phrase, Version};
use crate::logging::{debug, info, warn, Logger};
use crate::protocol::Protocol;
use crate::pubsub::Bus;
use crate::reactor::IoCtx;
use crate::service::{Service, WsAccept};
use crate::sse::SseProto;
use crate::workers::Executor;
use crate::ws::handshake;
use crate::ws::proto::{WsController, WsProto};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Completion flags shared between the controller (written from whatever
/// thread runs the application) and the protocol (read on the reactor
/// thread when the write queue drains).
pub(crate) struct RequestDone {
    finished: AtomicBool,
    keep_alive: AtomicBool,
    upgraded: AtomicBool,
}

impl RequestDone {
    fn new() -> Arc<RequestDone> {
        Arc::new(RequestDone {
            finished: AtomicBool::new(false),
            keep_alive: AtomicBool::new(false),
            upgraded: AtomicBool::new(false),
        })
    }
}

/// Builds a [`Handle`] from parser events.
struct RequestBuilder {
    handle: Option<Handle>,
    spill_threshold: usize,
}

impl RequestBuilder {
    fn new(spill_threshold: usize) -> RequestBuilder {
        RequestBuilder {
            handle: None,
            spill_threshold,
        }
    }

    fn reset(&mut self) {
        self.handle = None;
    }

    fn handle_mut(&mut self) -> &mut Handle {
        self.handle.get_or_insert_with(Handle::new)
    }

    fn take(&mut self) -> Handle {
        self.handle.take().expect("request builder must hold a handle")
    }
}

impl Events for RequestBuilder {
    fn on_method(&mut self, method: &str) -> Result<(), HttpError> {
        self.handle_mut().method = method.to_string();
        Ok(())
    }

    fn on_path(&mut self, path: &str) -> Result<(), HttpError> {
        self.handle_mut().path = path.to_string();
        Ok(())
    }

    fn on_query(&mut self, query: &str) -> Result<(), HttpError> {
        self.handle_mut().query = query.to_string();
        Ok(())
    }

    fn on_version(&mut self, version: Version) -> Result<(), HttpError> {
        self.handle_mut().version = version;
        Ok(())
    }

    fn on_header(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        self.handle_mut().headers.add(name, value);
        Ok(())
    }

    fn on_headers_end(&mut self) -> Result<(), HttpError> {
        Ok(())
    }

    fn on_body_chunk(&mut self, data: &[u8]) -> Result<(), HttpError> {
        let threshold = self.spill_threshold;
        self.handle_mut()
            .body
            .push(data, threshold)
            .map_err(|_| HttpError::Internal)
    }

    fn on_request(&mut self) -> Result<(), HttpError> {
        Ok(())
    }
}

/// The HTTP/1.1 protocol bound to one connection: drives the parser,
/// dispatches complete requests to the service, and recycles the
/// connection for keep-alive.
pub struct Http1 {
    cfg: Arc<Config>,
    service: Arc<dyn Service>,
    executor: Arc<Executor>,
    bus: Arc<Bus>,
    log: Logger,
    parser: Parser,
    builder: RequestBuilder,
    current: Option<(HandleRef, Arc<RequestDone>)>,
    requests: u64,
    shutting_down: bool,
}

impl Http1 {
    pub fn new(
        cfg: Arc<Config>,
        service: Arc<dyn Service>,
        executor: Arc<Executor>,
        bus: Arc<Bus>,
        log: Logger,
    ) -> Http1 {
        let limits = Limits::from_config(&cfg);
        let spill = cfg.body_spill_threshold;
        Http1 {
            cfg,
            service,
            executor,
            bus,
            log,
            parser: Parser::new(limits),
            builder: RequestBuilder::new(spill),
            current: None,
            requests: 0,
            shutting_down: false,
        }
    }

    /// Writes a bare error response and tears the connection down. Parse
    /// failures never keep the connection alive.
    fn respond_error(&mut self, io: &mut IoCtx<'_>, err: HttpError) {
        let status = err.status();
        warn!(self.log, "request failed"; "conn" => io.conn_id(), "status" => status);
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nserver: {}\r\ndate: {}\r\ncontent-length: 0\r\nconnection: close\r\n",
            status,
            reason_phrase(status),
            self.cfg.server_name,
            http_date(),
        );
        if err == HttpError::UpgradeRequired {
            head.push_str("sec-websocket-version: 13\r\n");
        }
        head.push_str("\r\n");
        io.write(Chunk::Bytes(head.into_bytes()));
        io.close();
    }

    fn keep_alive_for(&self, io: &IoCtx<'_>) -> bool {
        !self.parser.connection_close()
            && self.parser.version() == Version::Http11
            && self.cfg.keep_alive_timeout > 0
            && !self.shutting_down
            && io.conn_age() < Duration::from_secs(self.cfg.max_conn_age_secs)
    }

    fn make_controller(
        &self,
        io: &IoCtx<'_>,
        handle: &Handle,
        keep_alive: bool,
        done: &Arc<RequestDone>,
    ) -> Http1Controller {
        Http1Controller {
            tx: io.tx(),
            weak: Weak::new(),
            service: self.service.clone(),
            executor: self.executor.clone(),
            cfg: self.cfg.clone(),
            log: self.log.clone(),
            version: handle.version(),
            head: handle.method().eq_ignore_ascii_case("HEAD"),
            keep_alive,
            done: done.clone(),
            chunked: false,
            headers_sent: false,
            finished: false,
            method: handle.method().to_string(),
            path: handle.path().to_string(),
            status: 0,
            start: Instant::now(),
        }
    }

    /// Wraps a finished-parsing handle and hands it to the application,
    /// or answers the upgrade paths directly.
    fn dispatch(&mut self, io: &mut IoCtx<'_>) {
        let mut handle = self.builder.take();
        self.requests += 1;

        handle.bus = Some(self.bus.clone());
        handle.tx = Some(io.tx());
        handle.sub_queue_limit = self.cfg.sub_queue_limit;

        let keep_alive = self.keep_alive_for(io);

        // WebSocket handshake?
        if handshake::is_upgrade_request(&handle.headers) {
            match handshake::validate(&handle.headers, handle.body_len() > 0) {
                Err(err) => {
                    self.respond_error(io, err);
                    return;
                }
                Ok(shake) => {
                    let decision = self.service.authenticate_websocket(&mut handle);
                    match decision {
                        WsAccept::Deny => {
                            debug!(self.log, "websocket upgrade denied"; "conn" => io.conn_id());
                            if handle.status() == 200 {
                                handle.set_status(403);
                            }
                            self.respond_with_handle(io, handle, keep_alive);
                        }
                        WsAccept::Allow => self.upgrade_websocket(io, handle, shake.accept, None),
                        WsAccept::Subprotocol(proto) => {
                            self.upgrade_websocket(io, handle, shake.accept, Some(proto))
                        }
                    }
                    return;
                }
            }
        }

        // Pre-authorized SSE?
        let wants_sse = handle
            .headers
            .get("accept")
            .map_or(false, |v| v.contains("text/event-stream"));
        if wants_sse && self.service.authenticate_sse(&mut handle) {
            self.upgrade_sse_now(io, handle);
            return;
        }

        // Plain request: off to the application.
        let done = RequestDone::new();
        let mut controller = self.make_controller(io, &handle, keep_alive, &done);
        let href = Arc::new(Mutex::new(handle));
        controller.weak = Arc::downgrade(&href);
        href.lock()
            .expect("handle lock poisoned")
            .set_controller(Box::new(controller));

        self.current = Some((href.clone(), done));
        io.suspend();

        let service = self.service.clone();
        self.executor.submit(
            Some(io.conn_key()),
            Box::new(move || {
                let mut h = href.lock().expect("handle lock poisoned");
                service.on_http(&mut h);
            }),
        );
    }

    /// Renders a response the reactor itself decided on (denied upgrade,
    /// rejected expectation) through the normal controller path.
    fn respond_with_handle(&mut self, io: &mut IoCtx<'_>, handle: Handle, keep_alive: bool) {
        let done = RequestDone::new();
        let mut controller = self.make_controller(io, &handle, keep_alive, &done);
        let href = Arc::new(Mutex::new(handle));
        controller.weak = Arc::downgrade(&href);
        let mut h = href.lock().expect("handle lock poisoned");
        h.set_controller(Box::new(controller));
        self.current = Some((href.clone(), done));
        io.suspend();
        h.finish();
    }

    fn upgrade_websocket(
        &mut self,
        io: &mut IoCtx<'_>,
        mut handle: Handle,
        accept: String,
        protocol: Option<String>,
    ) {
        debug!(self.log, "switching protocols to websocket"; "conn" => io.conn_id());
        let mut head = format!(
            "HTTP/1.1 101 Switching Protocols\r\nconnection: Upgrade\r\nupgrade: websocket\r\nsec-websocket-accept: {}\r\ndate: {}\r\nserver: {}\r\n",
            accept,
            http_date(),
            self.cfg.server_name,
        );
        if let Some(proto) = protocol {
            head.push_str(&format!("sec-websocket-protocol: {}\r\n", proto));
        }
        head.push_str("\r\n");
        io.write(Chunk::Bytes(head.into_bytes()));

        handle.mark_websocket();
        handle.set_controller(Box::new(WsController::new(
            io.tx(),
            self.cfg.ws_max_msg_size,
        )));
        let href = Arc::new(Mutex::new(handle));

        io.upgrade(Box::new(WsProto::new(
            href.clone(),
            self.service.clone(),
            self.executor.clone(),
            self.log.clone(),
            self.cfg.ws_max_msg_size,
        )));
        io.set_timeout(self.cfg.ws_timeout);

        let service = self.service.clone();
        self.executor.submit(
            Some(io.conn_key()),
            Box::new(move || {
                let mut h = href.lock().expect("handle lock poisoned");
                service.on_open(&mut h);
            }),
        );
    }

    fn upgrade_sse_now(&mut self, io: &mut IoCtx<'_>, mut handle: Handle) {
        debug!(self.log, "upgrading connection to event stream"; "conn" => io.conn_id());
        let head = {
            let meta = ResponseMeta {
                status: 200,
                headers: handle.response_headers(),
                content_length: None,
                streaming: true,
            };
            sse_response_head(&self.cfg.server_name, &meta)
        };
        io.write(Chunk::Bytes(head));

        handle.mark_sse();
        handle.set_controller(Box::new(SseController::new(io.tx())));
        let href = Arc::new(Mutex::new(handle));

        io.upgrade(Box::new(SseProto::new(
            href.clone(),
            self.service.clone(),
            self.executor.clone(),
            self.log.clone(),
        )));
        io.set_timeout(sse_keepalive_secs(self.cfg.ws_timeout));

        let service = self.service.clone();
        self.executor.submit(
            Some(io.conn_key()),
            Box::new(move || {
                let mut h = href.lock().expect("handle lock poisoned");
                service.on_open(&mut h);
            }),
        );
    }

    fn handle_expectation(&mut self, io: &mut IoCtx<'_>) -> bool {
        let accepted = {
            let handle = self.builder.handle_mut();
            self.service.on_expect(handle)
        };
        if accepted {
            io.write(Chunk::Static(b"HTTP/1.1 100 Continue\r\n\r\n"));
            self.parser.ack_continue();
            return true;
        }
        // The rest of the body is never read; the connection closes after
        // the rejection response drains.
        let handle = self.builder.take();
        self.parser.reset();
        if handle.status() == 200 {
            self.respond_error(io, HttpError::ExpectationFailed);
        } else {
            self.respond_with_handle(io, handle, false);
        }
        false
    }
}

impl Protocol for Http1 {
    fn on_data(&mut self, io: &mut IoCtx<'_>) {
        loop {
            if self.current.is_some() || io.is_closing() {
                return;
            }
            match self.parser.advance(io.read_buf(), &mut self.builder) {
                Err(err) => {
                    self.respond_error(io, err);
                    return;
                }
                Ok(Progress::Partial) => break,
                Ok(Progress::ExpectContinue) => {
                    if !self.handle_expectation(io) {
                        return;
                    }
                }
                Ok(Progress::Complete) => {
                    // Dispatch suspends reads, upgrades, or answers inline;
                    // in every case parsing resumes only after completion.
                    self.dispatch(io);
                    return;
                }
            }
        }
        if io.peer_eof() {
            io.close();
        }
    }

    fn on_ready(&mut self, io: &mut IoCtx<'_>) {
        let (reset, keep) = match &self.current {
            Some((_, done)) => {
                if done.upgraded.load(Ordering::SeqCst) {
                    // The swap task will replace this protocol shortly.
                    return;
                }
                if done.finished.load(Ordering::SeqCst) {
                    (true, done.keep_alive.load(Ordering::SeqCst))
                } else {
                    return;
                }
            }
            None => return,
        };
        if reset {
            self.current = None;
            if !keep || self.shutting_down {
                io.close();
                return;
            }
            self.parser.reset();
            self.builder.reset();
            io.set_timeout(self.cfg.keep_alive_timeout);
            io.touch();
            io.resume();
            // Pipelined bytes may already be waiting.
            self.on_data(io);
        }
    }

    fn on_shutdown(&mut self, io: &mut IoCtx<'_>) {
        self.shutting_down = true;
        if self.current.is_none() {
            io.close();
        }
    }

    fn on_close(&mut self, io: &mut IoCtx<'_>) {
        debug!(self.log, "http connection closed";
               "conn" => io.conn_id(),
               "requests" => self.requests);
    }
}

/// HTTP/1 implementation of the controller vtable. Lives inside the
/// handle; every method funnels bytes into the connection's write queue
/// through the thread-safe `ConnTx`.
pub(crate) struct Http1Controller {
    tx: ConnTx,
    weak: Weak<Mutex<Handle>>,
    service: Arc<dyn Service>,
    executor: Arc<Executor>,
    cfg: Arc<Config>,
    log: Logger,
    version: Version,
    head: bool,
    keep_alive: bool,
    done: Arc<RequestDone>,
    chunked: bool,
    headers_sent: bool,
    finished: bool,
    method: String,
    path: String,
    status: u16,
    start: Instant,
}

impl Controller for Http1Controller {
    fn send_continue(&mut self) {
        let _ = self.tx.write(Chunk::Static(b"HTTP/1.1 100 Continue\r\n\r\n"));
    }

    fn send_headers(&mut self, meta: &ResponseMeta<'_>) {
        if self.headers_sent {
            return;
        }
        self.headers_sent = true;

        let mut head = String::with_capacity(256);
        head.push_str(&format!(
            "{} {} {}\r\n",
            self.version.as_str(),
            meta.status,
            reason_phrase(meta.status)
        ));
        for (name, value) in meta.headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if !meta.headers.contains("server") {
            head.push_str(&format!("server: {}\r\n", self.cfg.server_name));
        }
        if !meta.headers.contains("date") {
            head.push_str(&format!("date: {}\r\n", http_date()));
        }

        match meta.content_length {
            Some(length) => head.push_str(&format!("content-length: {}\r\n", length)),
            None if meta.streaming => {
                if self.version == Version::Http11 {
                    self.chunked = true;
                    head.push_str("transfer-encoding: chunked\r\n");
                } else {
                    // HTTP/1.0 streams are delimited by the close.
                    self.keep_alive = false;
                }
            }
            None => head.push_str("content-length: 0\r\n"),
        }
        if self.keep_alive {
            head.push_str("connection: keep-alive\r\n");
        } else {
            head.push_str("connection: close\r\n");
        }
        head.push_str("\r\n");

        self.status = meta.status;
        let _ = self.tx.write(Chunk::Bytes(head.into_bytes()));
    }

    fn write_body(&mut self, chunk: Chunk) {
        if self.head || self.finished {
            return;
        }
        if self.chunked {
            if chunk.len() == 0 {
                return;
            }
            let _ = self
                .tx
                .write(Chunk::Bytes(format!("{:x}\r\n", chunk.len()).into_bytes()));
            let _ = self.tx.write(chunk);
            let _ = self.tx.write(Chunk::Static(b"\r\n"));
        } else {
            let _ = self.tx.write(chunk);
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.chunked && !self.head {
            let _ = self.tx.write(Chunk::Static(b"0\r\n\r\n"));
        }
        self.done.keep_alive.store(self.keep_alive, Ordering::SeqCst);
        self.done.finished.store(true, Ordering::SeqCst);
        if self.cfg.log_http {
            info!(self.log, "request complete";
                  "method" => %self.method,
                  "path" => %self.path,
                  "status" => self.status,
                  "elapsed_ms" => self.start.elapsed().as_millis() as u64);
        }
        // Make sure the drain notification fires even when everything was
        // already flushed.
        self.tx
            .remote()
            .notify_write(self.tx.id(), self.tx.gen());
    }

    fn upgrade_sse(&mut self, meta: &ResponseMeta<'_>) -> bool {
        if self.headers_sent || self.finished {
            return false;
        }
        self.headers_sent = true;
        self.finished = true;
        self.done.upgraded.store(true, Ordering::SeqCst);

        let head = sse_response_head(&self.cfg.server_name, meta);
        if self.tx.write(Chunk::Bytes(head)).is_err() {
            return false;
        }

        // The protocol swap must happen on the reactor thread, between
        // dispatches.
        let weak = self.weak.clone();
        let service = self.service.clone();
        let executor = self.executor.clone();
        let log = self.log.clone();
        let keepalive = sse_keepalive_secs(self.cfg.ws_timeout);
        let (id, gen) = (self.tx.id(), self.tx.gen());
        let service_open = service.clone();
        let executor_open = executor.clone();
        self.tx.remote().defer(move |reactor| {
            let href = match weak.upgrade() {
                Some(href) => href,
                None => return,
            };
            let proto = Box::new(SseProto::new(href.clone(), service, executor, log));
            if reactor.install_protocol(id, gen, proto, keepalive) {
                executor_open.submit(
                    Some(crate::conn::conn_key(id, gen)),
                    Box::new(move || {
                        let mut h = href.lock().expect("handle lock poisoned");
                        service_open.on_open(&mut h);
                    }),
                );
            }
        });
        true
    }

    fn on_unlinked(&mut self) {
        if !self.finished && !self.done.upgraded.load(Ordering::SeqCst) {
            // The handle died without committing a response; the peer must
            // not be left waiting on a half-open exchange.
            warn!(self.log, "handle dropped without a response";
                  "method" => %self.method,
                  "path" => %self.path);
            self.tx.close();
        }
    }
}

/// SSE response head: the application's extra headers are preserved, the
/// event-stream essentials are enforced.
fn sse_response_head(server_name: &str, meta: &ResponseMeta<'_>) -> Vec<u8> {
    let mut head = String::with_capacity(192);
    head.push_str("HTTP/1.1 200 OK\r\n");
    let mut saw_type = false;
    let mut saw_cache = false;
    for (name, value) in meta.headers.iter() {
        match name {
            "content-type" => saw_type = true,
            "cache-control" => saw_cache = true,
            _ => {}
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !saw_type {
        head.push_str("content-type: text/event-stream\r\n");
    }
    if !saw_cache {
        head.push_str("cache-control: no-cache\r\n");
    }
    head.push_str(&format!("server: {}\r\n", server_name));
    head.push_str(&format!("date: {}\r\n", http_date()));
    head.push_str("connection: keep-alive\r\n\r\n");
    head.into_bytes()
}

/// Keep-alive comments go out on idle halves of the configured interval.
fn sse_keepalive_secs(timeout: u8) -> u8 {
    (timeout / 2).max(1)
}

/// Transport controller for event-stream connections.
pub(crate) struct SseController {
    tx: ConnTx,
}

impl SseController {
    pub(crate) fn new(tx: ConnTx) -> SseController {
        SseController { tx }
    }
}

impl Controller for SseController {
    fn send_continue(&mut self) {}
    fn send_headers(&mut self, _meta: &ResponseMeta<'_>) {}
    fn write_body(&mut self, _chunk: Chunk) {}
    fn finish(&mut self) {}

    fn write_message(&mut self, data: &[u8], _is_text: bool) -> bool {
        let message = crate::pubsub::Message::new(
            crate::pubsub::ChannelKey::filter(0),
            data.to_vec(),
            true,
        );
        self.tx
            .write(Chunk::Bytes(crate::sse::encode_event(&message)))
            .is_ok()
    }

    fn on_unlinked(&mut self) {}
}

pub(crate) fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
