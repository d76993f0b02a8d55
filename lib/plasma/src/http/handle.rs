use crate::conn::{Chunk, ConnTx};
use crate::http::headers::{valid_cookie_name, valid_cookie_value, HeaderMap};
use crate::http::Version;
use crate::pubsub::{Bus, ChannelKey, Encoder, Message, Overflow, SubscribeOpts};
use hashbrown::HashMap;
use std::any::Any;
use std::fs::File;
use std::io;
use std::sync::{Arc, Mutex};

/// Handles are shared between the reactor thread and worker threads, but
/// callbacks for one connection are serialized so the lock is never
/// contended.
pub type HandleRef = Arc<Mutex<Handle>>;

/// Everything the transport needs to emit a response head.
pub struct ResponseMeta<'a> {
    pub status: u16,
    pub headers: &'a HeaderMap,
    pub content_length: Option<u64>,
    pub streaming: bool,
}

/// Transport-side vtable the handle writes through. HTTP/1 implements the
/// full set; the WebSocket and SSE controllers installed after an upgrade
/// implement `write_message` and ignore the response-building calls.
pub trait Controller: Send {
    fn send_continue(&mut self);
    fn send_headers(&mut self, meta: &ResponseMeta<'_>);
    fn write_body(&mut self, chunk: Chunk);
    fn finish(&mut self);

    /// Switches the connection to an SSE stream. False when the transport
    /// cannot upgrade any more.
    fn upgrade_sse(&mut self, meta: &ResponseMeta<'_>) -> bool {
        let _ = meta;
        false
    }

    /// Sends one message on an upgraded connection.
    fn write_message(&mut self, data: &[u8], is_text: bool) -> bool {
        let _ = (data, is_text);
        false
    }

    /// The handle released its reference to this controller.
    fn on_unlinked(&mut self);
}

/// Request body storage. Small bodies stay in memory; past the spill
/// threshold the bytes move to an unlinked temp file.
pub enum Body {
    Empty,
    Mem { data: Vec<u8>, pos: usize },
    Spilled { file: File, len: u64, pos: u64 },
}

impl Body {
    #[inline]
    pub fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Mem { data, .. } => data.len() as u64,
            Body::Spilled { len, .. } => *len,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends incoming body bytes, spilling to disk past `threshold`.
    pub fn push(&mut self, bytes: &[u8], threshold: usize) -> io::Result<()> {
        match self {
            Body::Empty => {
                if bytes.len() > threshold {
                    let file = spill_file(&[bytes])?;
                    *self = Body::Spilled {
                        file,
                        len: bytes.len() as u64,
                        pos: 0,
                    };
                } else {
                    *self = Body::Mem {
                        data: bytes.to_vec(),
                        pos: 0,
                    };
                }
            }
            Body::Mem { data, .. } => {
                if data.len() + bytes.len() > threshold {
                    let file = spill_file(&[data.as_slice(), bytes])?;
                    let len = (data.len() + bytes.len()) as u64;
                    *self = Body::Spilled { file, len, pos: 0 };
                } else {
                    data.extend_from_slice(bytes);
                }
            }
            Body::Spilled { file, len, .. } => {
                use std::os::unix::fs::FileExt;
                file.write_all_at(bytes, *len)?;
                *len += bytes.len() as u64;
            }
        }
        Ok(())
    }

    /// Moves the read cursor. Positions past the end clamp to the end.
    pub fn seek(&mut self, to: u64) {
        match self {
            Body::Empty => {}
            Body::Mem { data, pos } => *pos = (to as usize).min(data.len()),
            Body::Spilled { len, pos, .. } => *pos = to.min(*len),
        }
    }

    /// Reads up to `count` bytes from the cursor, advancing it.
    pub fn read(&mut self, count: usize) -> io::Result<Vec<u8>> {
        match self {
            Body::Empty => Ok(Vec::new()),
            Body::Mem { data, pos } => {
                let end = (*pos + count).min(data.len());
                let out = data[*pos..end].to_vec();
                *pos = end;
                Ok(out)
            }
            Body::Spilled { file, len, pos } => {
                use std::os::unix::fs::FileExt;
                let take = (count as u64).min(*len - *pos) as usize;
                let mut out = vec![0u8; take];
                file.read_exact_at(&mut out, *pos)?;
                *pos += take as u64;
                Ok(out)
            }
        }
    }

    /// Reads everything from the cursor to the end.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let remaining = match self {
            Body::Empty => 0,
            Body::Mem { data, pos } => data.len() - *pos,
            Body::Spilled { len, pos, .. } => (*len - *pos) as usize,
        };
        self.read(remaining)
    }
}

fn spill_file(parts: &[&[u8]]) -> io::Result<File> {
    use std::os::unix::fs::FileExt;
    // tempfile() unlinks the path before handing the file over.
    let file = tempfile::tempfile()?;
    let mut at = 0u64;
    for part in parts {
        file.write_all_at(part, at)?;
        at += part.len() as u64;
    }
    Ok(file)
}

pub type EnvDtor = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

struct EnvEntry {
    value: Box<dyn Any + Send>,
    on_close: Option<EnvDtor>,
}

/// Response cookie parameters. `Default` gives a session cookie scoped to
/// the request path.
#[derive(Default)]
pub struct Cookie<'a> {
    pub name: &'a str,
    pub value: &'a str,
    pub max_age: Option<i64>,
    pub path: Option<&'a str>,
    pub domain: Option<&'a str>,
    pub secure: bool,
    pub http_only: bool,
}

/// Per-request state: the parsed request, the response under construction,
/// and the transport controller that turns it into wire bytes. After a
/// WebSocket/SSE upgrade the same handle stays alive for the connection's
/// callbacks.
pub struct Handle {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,

    status: u16,
    response_headers: HeaderMap,
    response_body: Vec<u8>,
    explicit_length: Option<u64>,

    streaming: bool,
    headers_sent: bool,
    finished: bool,
    upgraded_ws: bool,
    upgraded_sse: bool,

    controller: Option<Box<dyn Controller>>,
    env: HashMap<String, EnvEntry>,

    pub(crate) bus: Option<Arc<Bus>>,
    pub(crate) tx: Option<ConnTx>,
    pub(crate) sub_queue_limit: usize,
}

impl Handle {
    /// A detached handle: request fields empty, no transport attached.
    pub fn new() -> Handle {
        Handle {
            method: String::new(),
            path: String::new(),
            query: String::new(),
            version: Version::Http11,
            headers: HeaderMap::new(),
            body: Body::Empty,
            status: 200,
            response_headers: HeaderMap::new(),
            response_body: Vec::new(),
            explicit_length: None,
            streaming: false,
            headers_sent: false,
            finished: false,
            upgraded_ws: false,
            upgraded_sse: false,
            controller: None,
            env: HashMap::new(),
            bus: None,
            tx: None,
            sub_queue_limit: 64,
        }
    }

    /// Binds the transport controller this handle writes through. The
    /// previous controller, if any, is unlinked first.
    pub fn set_controller(&mut self, controller: Box<dyn Controller>) {
        if let Some(mut old) = self.controller.take() {
            old.on_unlinked();
        }
        self.controller = Some(controller);
    }

    // ---- request side -----------------------------------------------------

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    // Request mutators, for middleware-style rewriting and for driving a
    // handle outside a live connection.

    pub fn set_method(&mut self, method: &str) {
        self.method = method.to_string();
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    pub fn set_query(&mut self, query: &str) {
        self.query = query.to_string();
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Value of a cookie sent by the client.
    pub fn request_cookie(&self, name: &str) -> Option<String> {
        for header in self.headers.get_all("cookie") {
            for pair in header.split(';') {
                let mut parts = pair.trim().splitn(2, '=');
                let n = parts.next().unwrap_or("");
                if n == name {
                    return Some(parts.next().unwrap_or("").to_string());
                }
            }
        }
        None
    }

    /// The `Last-Event-ID` an SSE client resumes from.
    pub fn last_event_id(&self) -> Option<&str> {
        self.headers.get("last-event-id")
    }

    #[inline]
    pub fn body_len(&self) -> u64 {
        self.body.len()
    }

    pub fn body_seek(&mut self, to: u64) {
        self.body.seek(to)
    }

    pub fn body_read(&mut self, count: usize) -> io::Result<Vec<u8>> {
        self.body.read(count)
    }

    pub fn body_read_all(&mut self) -> io::Result<Vec<u8>> {
        self.body.read_all()
    }

    /// Parses the body as a JSON value tree.
    pub fn body_json(&mut self) -> io::Result<serde_json::Value> {
        let bytes = self.body.read_all()?;
        serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    // ---- response side ----------------------------------------------------

    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Sets the response status. Rejected once headers are on the wire.
    pub fn set_status(&mut self, status: u16) -> bool {
        if self.headers_sent || self.finished {
            return false;
        }
        self.status = status;
        true
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers.get(name)
    }

    /// Response headers accumulated so far, in insertion order.
    pub fn response_headers_iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.response_headers.iter()
    }

    pub(crate) fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    /// Appends a response header. Rejected once headers are on the wire.
    pub fn header_add(&mut self, name: &str, value: &str) -> bool {
        if self.headers_sent || self.finished {
            return false;
        }
        if name.eq_ignore_ascii_case("content-length") {
            match value.parse::<u64>() {
                Ok(length) => self.explicit_length = Some(length),
                Err(_) => return false,
            }
            return true;
        }
        self.response_headers.add(name, value);
        true
    }

    /// Replaces a response header. Rejected once headers are on the wire.
    pub fn header_set(&mut self, name: &str, value: &str) -> bool {
        if self.headers_sent || self.finished {
            return false;
        }
        if name.eq_ignore_ascii_case("content-length") {
            match value.parse::<u64>() {
                Ok(length) => self.explicit_length = Some(length),
                Err(_) => return false,
            }
            return true;
        }
        self.response_headers.set(name, value);
        true
    }

    /// Adds a `set-cookie` header. Invalid names or values are rejected.
    pub fn set_cookie(&mut self, cookie: Cookie<'_>) -> bool {
        if self.headers_sent || self.finished {
            return false;
        }
        if !valid_cookie_name(cookie.name) || !valid_cookie_value(cookie.value) {
            return false;
        }
        let mut rendered = format!("{}={}", cookie.name, cookie.value);
        if let Some(age) = cookie.max_age {
            rendered.push_str(&format!("; Max-Age={}", age));
        }
        if let Some(path) = cookie.path {
            rendered.push_str(&format!("; Path={}", path));
        }
        if let Some(domain) = cookie.domain {
            rendered.push_str(&format!("; Domain={}", domain));
        }
        if cookie.secure {
            rendered.push_str("; Secure");
        }
        if cookie.http_only {
            rendered.push_str("; HttpOnly");
        }
        self.response_headers.add("set-cookie", &rendered);
        true
    }

    /// Switches the response to streaming mode: headers go out on the
    /// first `write`, the body uses chunked framing unless a length was
    /// set explicitly.
    pub fn set_streaming(&mut self) -> bool {
        if self.headers_sent || self.finished {
            return false;
        }
        self.streaming = true;
        true
    }

    /// Writes response body bytes. In accumulating mode the bytes are
    /// buffered until `finish`; in streaming mode they go to the wire.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if self.finished || self.upgraded_ws || self.upgraded_sse {
            return false;
        }
        if self.streaming {
            if !self.headers_sent {
                self.flush_headers();
            }
            if let Some(controller) = self.controller.as_mut() {
                controller.write_body(Chunk::Bytes(data.to_vec()));
                return true;
            }
            return false;
        }
        self.response_body.extend_from_slice(data);
        true
    }

    /// Queues a file range as response body. Streaming mode only sends it
    /// immediately; otherwise the range is sent at `finish` time after the
    /// accumulated bytes.
    pub fn write_file(&mut self, file: File, offset: u64, len: u64) -> bool {
        if self.finished || self.upgraded_ws || self.upgraded_sse {
            return false;
        }
        if !self.streaming {
            // File ranges require streaming or an explicit length; pick
            // streaming with a computed length when nothing accumulated.
            if !self.response_body.is_empty() {
                return false;
            }
            self.explicit_length = Some(self.explicit_length.unwrap_or(0) + len);
            self.streaming = true;
        }
        if !self.headers_sent {
            self.flush_headers();
        }
        match self.controller.as_mut() {
            Some(controller) => {
                controller.write_body(Chunk::File {
                    file,
                    offset,
                    remaining: len,
                });
                true
            }
            None => false,
        }
    }

    /// Commits the response and flushes it to the wire.
    pub fn finish(&mut self) -> bool {
        if self.finished || self.upgraded_ws || self.upgraded_sse {
            return false;
        }
        if !self.streaming {
            if self.explicit_length.is_none() {
                self.explicit_length = Some(self.response_body.len() as u64);
            }
            self.flush_headers();
            if !self.response_body.is_empty() {
                let body = std::mem::replace(&mut self.response_body, Vec::new());
                if let Some(controller) = self.controller.as_mut() {
                    controller.write_body(Chunk::Bytes(body));
                }
            }
        } else if !self.headers_sent {
            self.flush_headers();
        }
        self.finished = true;
        if let Some(controller) = self.controller.as_mut() {
            controller.finish();
        }
        true
    }

    fn flush_headers(&mut self) {
        if self.headers_sent {
            return;
        }
        let meta = ResponseMeta {
            status: self.status,
            headers: &self.response_headers,
            content_length: self.explicit_length,
            streaming: self.streaming,
        };
        if let Some(controller) = self.controller.as_mut() {
            controller.send_headers(&meta);
        }
        self.headers_sent = true;
    }

    /// Sends `100 Continue`. The transport decides the framing.
    pub fn send_continue(&mut self) {
        if let Some(controller) = self.controller.as_mut() {
            controller.send_continue();
        }
    }

    // ---- upgrades and messaging -------------------------------------------

    #[inline]
    pub fn is_websocket(&self) -> bool {
        self.upgraded_ws
    }

    #[inline]
    pub fn is_sse(&self) -> bool {
        self.upgraded_sse
    }

    pub(crate) fn mark_websocket(&mut self) {
        self.upgraded_ws = true;
        self.headers_sent = true;
        self.finished = true;
    }

    pub(crate) fn mark_sse(&mut self) {
        self.upgraded_sse = true;
        self.headers_sent = true;
        self.finished = true;
    }

    /// Upgrades this request to a Server-Sent-Events stream. The response
    /// status and extra headers set so far are preserved.
    pub fn upgrade_sse(&mut self) -> bool {
        if self.headers_sent || self.finished || self.upgraded_ws || self.upgraded_sse {
            return false;
        }
        let upgraded = {
            let meta = ResponseMeta {
                status: 200,
                headers: &self.response_headers,
                content_length: None,
                streaming: true,
            };
            match self.controller.as_mut() {
                Some(controller) => controller.upgrade_sse(&meta),
                None => false,
            }
        };
        if upgraded {
            self.mark_sse();
        }
        upgraded
    }

    /// Sends one message on an upgraded WebSocket/SSE connection.
    pub fn write_message(&mut self, data: &[u8], is_text: bool) -> bool {
        if !self.upgraded_ws && !self.upgraded_sse {
            return false;
        }
        match self.controller.as_mut() {
            Some(controller) => controller.write_message(data, is_text),
            None => false,
        }
    }

    /// Subscribes this connection to a pub/sub channel with the transport's
    /// natural encoder and default overflow policy.
    pub fn subscribe(&mut self, key: ChannelKey) -> bool {
        let encoder = if self.upgraded_ws {
            Encoder::WsText
        } else if self.upgraded_sse {
            Encoder::Sse
        } else {
            Encoder::Raw
        };
        self.subscribe_opts(key, encoder, Overflow::DropOldest)
    }

    pub fn subscribe_opts(&mut self, key: ChannelKey, encoder: Encoder, overflow: Overflow) -> bool {
        let (bus, tx) = match (self.bus.as_ref(), self.tx.as_ref()) {
            (Some(bus), Some(tx)) => (bus.clone(), tx.clone()),
            _ => return false,
        };
        bus.subscribe(SubscribeOpts {
            key,
            encoder,
            overflow,
            queue_limit: self.sub_queue_limit,
            tx,
            on_message: None,
            on_close: None,
        });
        true
    }

    /// Publishes raw bytes to a channel.
    pub fn publish(&self, key: ChannelKey, data: &[u8], is_text: bool) -> bool {
        match self.bus.as_ref() {
            Some(bus) => {
                bus.publish(Message::new(key, data.to_vec(), is_text));
                true
            }
            None => false,
        }
    }

    /// Publishes a prepared message (SSE event name / id / retry fields).
    pub fn publish_message(&self, message: Message) -> bool {
        match self.bus.as_ref() {
            Some(bus) => {
                bus.publish(message);
                true
            }
            None => false,
        }
    }

    // ---- per-request environment ------------------------------------------

    /// Stores a named value on the request. The destructor, if given, runs
    /// when the entry is removed or the handle is destroyed.
    pub fn env_set(
        &mut self,
        key: &str,
        value: Box<dyn Any + Send>,
        on_close: Option<EnvDtor>,
    ) {
        if let Some(old) = self.env.insert(
            key.to_string(),
            EnvEntry { value, on_close },
        ) {
            run_env_dtor(old);
        }
    }

    pub fn env_get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.env.get(key).and_then(|e| e.value.downcast_ref::<T>())
    }

    /// Removes an entry, running its destructor.
    pub fn env_remove(&mut self, key: &str) -> bool {
        match self.env.remove(key) {
            Some(entry) => {
                run_env_dtor(entry);
                true
            }
            None => false,
        }
    }
}

fn run_env_dtor(entry: EnvEntry) {
    if let Some(dtor) = entry.on_close {
        dtor(entry.value);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        for (_, entry) in self.env.drain() {
            run_env_dtor(entry);
        }
        if let Some(mut controller) = self.controller.take() {
            controller.on_unlinked();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CallLog {
        continues: usize,
        heads: Vec<(u16, Option<u64>, bool)>,
        body: Vec<u8>,
        finishes: usize,
        unlinked: usize,
        sse_upgrades: usize,
        messages: Vec<(Vec<u8>, bool)>,
    }

    struct MockController(Arc<Mutex<CallLog>>);

    impl Controller for MockController {
        fn send_continue(&mut self) {
            self.0.lock().unwrap().continues += 1;
        }
        fn send_headers(&mut self, meta: &ResponseMeta<'_>) {
            self.0
                .lock()
                .unwrap()
                .heads
                .push((meta.status, meta.content_length, meta.streaming));
        }
        fn write_body(&mut self, chunk: Chunk) {
            match chunk {
                Chunk::Bytes(b) => self.0.lock().unwrap().body.extend_from_slice(&b),
                Chunk::Static(b) => self.0.lock().unwrap().body.extend_from_slice(b),
                Chunk::Shared(b) => self.0.lock().unwrap().body.extend_from_slice(&b),
                Chunk::File { remaining, .. } => {
                    let marker = format!("<file:{}>", remaining);
                    self.0.lock().unwrap().body.extend_from_slice(marker.as_bytes());
                }
            }
        }
        fn finish(&mut self) {
            self.0.lock().unwrap().finishes += 1;
        }
        fn upgrade_sse(&mut self, _meta: &ResponseMeta<'_>) -> bool {
            self.0.lock().unwrap().sse_upgrades += 1;
            true
        }
        fn write_message(&mut self, data: &[u8], is_text: bool) -> bool {
            self.0
                .lock()
                .unwrap()
                .messages
                .push((data.to_vec(), is_text));
            true
        }
        fn on_unlinked(&mut self) {
            self.0.lock().unwrap().unlinked += 1;
        }
    }

    fn handle_with_mock() -> (Handle, Arc<Mutex<CallLog>>) {
        let log = Arc::new(Mutex::new(CallLog::default()));
        let mut handle = Handle::new();
        handle.set_controller(Box::new(MockController(log.clone())));
        (handle, log)
    }

    #[test]
    fn test_accumulating_response() {
        let (mut handle, log) = handle_with_mock();
        assert!(handle.set_status(201));
        assert!(handle.header_set("x-kind", "test"));
        assert!(handle.write(b"hello "));
        assert!(handle.write(b"world"));
        assert!(handle.finish());

        let log = log.lock().unwrap();
        assert_eq!(log.heads, vec![(201, Some(11), false)]);
        assert_eq!(log.body, b"hello world");
        assert_eq!(log.finishes, 1);
    }

    #[test]
    fn test_headers_frozen_after_send() {
        let (mut handle, _log) = handle_with_mock();
        assert!(handle.set_streaming());
        assert!(handle.write(b"x"));
        // Headers are on the wire now.
        assert!(!handle.set_status(500));
        assert!(!handle.header_set("late", "no"));
        assert!(!handle.set_cookie(Cookie {
            name: "a",
            value: "b",
            ..Cookie::default()
        }));
        assert!(handle.finish());
        assert!(!handle.finish(), "finish must commit only once");
        assert!(!handle.write(b"y"));
    }

    #[test]
    fn test_streaming_uses_no_buffer() {
        let (mut handle, log) = handle_with_mock();
        handle.set_streaming();
        handle.write(b"a");
        handle.write(b"b");
        handle.finish();

        let log = log.lock().unwrap();
        // Streaming without an explicit length leaves content_length unset.
        assert_eq!(log.heads, vec![(200, None, true)]);
        assert_eq!(log.body, b"ab");
    }

    #[test]
    fn test_explicit_content_length_header() {
        let (mut handle, log) = handle_with_mock();
        assert!(handle.header_set("Content-Length", "5"));
        handle.write(b"12345");
        handle.finish();
        assert_eq!(log.lock().unwrap().heads, vec![(200, Some(5), false)]);
        // Bogus values are rejected.
        let (mut handle, _) = handle_with_mock();
        assert!(!handle.header_set("content-length", "nope"));
    }

    #[test]
    fn test_cookie_rendering_and_validation() {
        let (mut handle, _log) = handle_with_mock();
        assert!(handle.set_cookie(Cookie {
            name: "sid",
            value: "abc123",
            max_age: Some(60),
            path: Some("/"),
            http_only: true,
            ..Cookie::default()
        }));
        assert_eq!(
            handle.response_header("set-cookie"),
            Some("sid=abc123; Max-Age=60; Path=/; HttpOnly")
        );
        assert!(!handle.set_cookie(Cookie {
            name: "bad name",
            value: "v",
            ..Cookie::default()
        }));
        assert!(!handle.set_cookie(Cookie {
            name: "n",
            value: "bad value",
            ..Cookie::default()
        }));
    }

    #[test]
    fn test_request_cookie_lookup() {
        let mut handle = Handle::new();
        handle.headers.add("cookie", "a=1; session=xyz; b=2");
        assert_eq!(handle.request_cookie("session"), Some("xyz".to_string()));
        assert_eq!(handle.request_cookie("missing"), None);
    }

    #[test]
    fn test_body_spills_to_disk() {
        let mut body = Body::Empty;
        body.push(b"0123456789", 16).unwrap();
        match body {
            Body::Mem { .. } => {}
            _ => panic!("small body must stay in memory"),
        }
        // Crossing the threshold moves everything to disk.
        body.push(b"abcdefghij", 16).unwrap();
        match body {
            Body::Spilled { len, .. } => assert_eq!(len, 20),
            _ => panic!("body must have spilled"),
        }
        body.push(b"!!", 16).unwrap();
        assert_eq!(body.len(), 22);

        body.seek(0);
        assert_eq!(body.read(10).unwrap(), b"0123456789");
        assert_eq!(body.read_all().unwrap(), b"abcdefghij!!");

        body.seek(18);
        assert_eq!(body.read_all().unwrap(), b"ij!!");
    }

    #[test]
    fn test_body_json() {
        let mut handle = Handle::new();
        handle.body.push(br#"{"k": [1, 2]}"#, 1024).unwrap();
        let value = handle.body_json().unwrap();
        assert_eq!(value["k"][1], serde_json::json!(2));
    }

    #[test]
    fn test_env_destructors_run_once_on_drop() {
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let mut handle = Handle::new();
            let hits = hits.clone();
            handle.env_set(
                "token",
                Box::new(41u32),
                Some(Box::new(move |value| {
                    let n = value.downcast_ref::<u32>().copied().unwrap_or(0);
                    hits.fetch_add(n as usize + 1, Ordering::SeqCst);
                })),
            );
            assert_eq!(handle.env_get::<u32>("token"), Some(&41));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_env_remove_runs_destructor() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut handle = Handle::new();
        let hits2 = hits.clone();
        handle.env_set(
            "k",
            Box::new(()),
            Some(Box::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert!(handle.env_remove("k"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!handle.env_remove("k"));
        drop(handle);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upgrade_sse_marks_handle() {
        let (mut handle, log) = handle_with_mock();
        assert!(handle.upgrade_sse());
        assert!(handle.is_sse());
        assert_eq!(log.lock().unwrap().sse_upgrades, 1);
        // No normal response activity after the upgrade.
        assert!(!handle.write(b"plain"));
        assert!(!handle.finish());
        // Messages flow through the controller instead.
        assert!(handle.write_message(b"evt", true));
        assert_eq!(log.lock().unwrap().messages.len(), 1);
    }

    #[test]
    fn test_unlink_fires_once_on_drop() {
        let (handle, log) = handle_with_mock();
        drop(handle);
        assert_eq!(log.lock().unwrap().unlinked, 1);
    }
}
