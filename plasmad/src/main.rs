use clap::{App, Arg};
use plasma::logging::{self, info, warn};
use plasma::{ChannelKey, Config, Handle, Reactor, Service, WsAccept};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::process;
use std::sync::Arc;

const CHAT_CHANNEL: &[u8] = b"chat";

/// The demo application: echoes HTTP requests back at the sender, runs a
/// WebSocket chat room over one pub/sub channel, and streams the same
/// channel to SSE clients.
struct EchoService {
    log: logging::Logger,
}

impl EchoService {
    fn new(log: logging::Logger) -> EchoService {
        EchoService { log }
    }
}

impl Service for EchoService {
    fn on_http(&self, h: &mut Handle) {
        let mut body = Vec::with_capacity(256);
        body.extend_from_slice(h.method().as_bytes());
        body.push(b' ');
        body.extend_from_slice(h.path().as_bytes());
        if !h.query().is_empty() {
            body.push(b'?');
            body.extend_from_slice(h.query().as_bytes());
        }
        body.push(b' ');
        body.extend_from_slice(h.version().as_str().as_bytes());
        body.extend_from_slice(b"\r\n");
        for (name, value) in h.headers().iter() {
            body.extend_from_slice(name.as_bytes());
            body.extend_from_slice(b": ");
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        if h.body_len() > 0 {
            body.extend_from_slice(b"\r\n");
            match h.body_read_all() {
                Ok(bytes) => body.extend_from_slice(&bytes),
                Err(_) => {
                    h.set_status(500);
                    h.finish();
                    return;
                }
            }
        }

        h.set_status(200);
        h.header_set("etag", &format!("\"{:016x}\"", hash64(&body)));
        h.header_set("content-type", "text/plain; charset=utf-8");
        h.write(&body);
        h.finish();
    }

    fn authenticate_websocket(&self, _h: &mut Handle) -> WsAccept {
        WsAccept::Allow
    }

    fn authenticate_sse(&self, _h: &mut Handle) -> bool {
        true
    }

    fn on_open(&self, h: &mut Handle) {
        h.subscribe(ChannelKey::named(CHAT_CHANNEL));
    }

    fn on_message(&self, h: &mut Handle, data: &[u8], is_text: bool) {
        h.publish(ChannelKey::named(CHAT_CHANNEL), data, is_text);
    }

    fn on_shutdown(&self, h: &mut Handle) {
        h.write_message(b"goodbye", true);
    }

    fn on_finish(&self) {
        info!(self.log, "server finished");
    }
}

fn hash64(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

fn main() {
    let matches = App::new("plasmad")
        .version("0.1.0")
        .about("HTTP echo / WebSocket chat / SSE demo server.")
        .arg(
            Arg::with_name("threads")
                .long("threads")
                .short("t")
                .takes_value(true)
                .help("Worker threads for application callbacks (0 = inline)"),
        )
        .arg(
            Arg::with_name("workers")
                .long("workers")
                .short("w")
                .takes_value(true)
                .help("Worker processes (accepted for compatibility; single process only)"),
        )
        .arg(
            Arg::with_name("public")
                .long("public")
                .takes_value(true)
                .value_name("PATH")
                .help("Public folder for static files (not supported)"),
        )
        .arg(
            Arg::with_name("max-line")
                .long("max-line")
                .takes_value(true)
                .help("Per-header-line limit, in KiB"),
        )
        .arg(
            Arg::with_name("max-header")
                .long("max-header")
                .takes_value(true)
                .help("Total header limit per request, in KiB"),
        )
        .arg(
            Arg::with_name("max-body")
                .long("max-body")
                .takes_value(true)
                .help("Total payload limit per request, in MiB"),
        )
        .arg(
            Arg::with_name("keep-alive")
                .long("keep-alive")
                .short("k")
                .takes_value(true)
                .help("HTTP keep-alive timeout in seconds (0..255)"),
        )
        .arg(
            Arg::with_name("log")
                .long("log")
                .short("v")
                .help("Log HTTP requests"),
        )
        .arg(
            Arg::with_name("ws-max-msg")
                .long("ws-max-msg")
                .takes_value(true)
                .help("Incoming WebSocket message limit, in KiB"),
        )
        .arg(
            Arg::with_name("timeout")
                .long("timeout")
                .takes_value(true)
                .help("WebSocket / SSE idle interval, in seconds"),
        )
        .arg(
            Arg::with_name("tls-cert")
                .long("tls-cert")
                .takes_value(true)
                .value_name("FILE")
                .help("TLS certificate .pem file (not supported)"),
        )
        .arg(
            Arg::with_name("tls-key")
                .long("tls-key")
                .takes_value(true)
                .value_name("FILE")
                .help("TLS private key .pem file (not supported)"),
        )
        .arg(
            Arg::with_name("tls-name")
                .long("tls-name")
                .takes_value(true)
                .help("TLS host name (not supported)"),
        )
        .arg(
            Arg::with_name("tls-password")
                .long("tls-password")
                .takes_value(true)
                .help("TLS key password (not supported)"),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("V")
                .help("Print debugging messages"),
        )
        .arg(
            Arg::with_name("URL")
                .help("Listen URL: tcp://host:port, host:port, unix:///path, or a path")
                .index(1),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        "debug"
    } else {
        "info"
    };
    let log = logging::init(level);

    let mut cfg = Config::default();
    if let Some(threads) = matches.value_of("threads") {
        cfg.threads = parse_arg(threads, "--threads");
    }
    if let Some(kib) = matches.value_of("max-line") {
        cfg.max_line_len = parse_arg::<usize>(kib, "--max-line") * 1024;
    }
    if let Some(kib) = matches.value_of("max-header") {
        cfg.max_header_size = parse_arg::<usize>(kib, "--max-header") * 1024;
    }
    if let Some(mib) = matches.value_of("max-body") {
        cfg.max_body_size = parse_arg::<usize>(mib, "--max-body") * 1024 * 1024;
    }
    if let Some(secs) = matches.value_of("keep-alive") {
        cfg.keep_alive_timeout = parse_arg(secs, "--keep-alive");
    }
    if let Some(kib) = matches.value_of("ws-max-msg") {
        cfg.ws_max_msg_size = parse_arg::<usize>(kib, "--ws-max-msg") * 1024;
    }
    if let Some(secs) = matches.value_of("timeout") {
        cfg.ws_timeout = parse_arg(secs, "--timeout");
    }
    cfg.log_http = matches.is_present("log");

    if let Some(workers) = matches.value_of("workers") {
        if parse_arg::<usize>(workers, "--workers") > 1 {
            warn!(log, "worker processes are not supported; running a single process");
        }
    }
    if matches.is_present("public") {
        warn!(log, "static file service is not supported; ignoring --public");
    }
    if matches.is_present("tls-cert")
        || matches.is_present("tls-key")
        || matches.is_present("tls-name")
        || matches.is_present("tls-password")
    {
        warn!(log, "TLS termination is not supported; ignoring --tls options");
    }

    let url = matches.value_of("URL").unwrap_or("localhost:3000");

    let service = Arc::new(EchoService::new(log.new(logging::o!("component" => "echo"))));
    let mut reactor = match Reactor::new(cfg, service, log.clone()) {
        Ok(reactor) => reactor,
        Err(e) => {
            logging::error!(log, "failed to initialize reactor"; "error" => %e);
            process::exit(1);
        }
    };

    if let Err(e) = reactor.listen(url) {
        logging::error!(log, "bind failed"; "url" => url, "error" => %e);
        process::exit(1);
    }

    plasma::signals::install();
    info!(log, "plasmad started"; "url" => url);
    reactor.run();
}

fn parse_arg<T: std::str::FromStr>(value: &str, flag: &str) -> T {
    match value.parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            eprintln!("invalid value `{}` for {}", value, flag);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plasma::http::handle::{Controller, ResponseMeta};
    use plasma::http::Version;
    use plasma::Chunk;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured {
        status: u16,
        length: Option<u64>,
        body: Vec<u8>,
    }

    struct Capture(Arc<Mutex<Captured>>);

    impl Controller for Capture {
        fn send_continue(&mut self) {}
        fn send_headers(&mut self, meta: &ResponseMeta<'_>) {
            let mut c = self.0.lock().unwrap();
            c.status = meta.status;
            c.length = meta.content_length;
        }
        fn write_body(&mut self, chunk: Chunk) {
            if let Chunk::Bytes(bytes) = chunk {
                self.0.lock().unwrap().body.extend_from_slice(&bytes);
            }
        }
        fn finish(&mut self) {}
        fn on_unlinked(&mut self) {}
    }

    fn echo(path: &str, query: &str) -> (Captured, String) {
        let service = EchoService::new(plasma::logging::discard());
        let captured = Arc::new(Mutex::new(Captured::default()));

        let mut h = Handle::new();
        h.set_method("GET");
        h.set_path(path);
        h.set_query(query);
        h.set_version(Version::Http11);
        h.headers_mut().add("Host", "a");
        h.set_controller(Box::new(Capture(captured.clone())));

        service.on_http(&mut h);
        let etag = h.response_header("etag").expect("etag set").to_string();
        drop(h);

        let captured = Arc::try_unwrap(captured)
            .ok()
            .expect("controller gone")
            .into_inner()
            .unwrap();
        (captured, etag)
    }

    #[test]
    fn test_echo_reflects_request_line_and_headers() {
        let (captured, _etag) = echo("/hi", "x=1");
        assert_eq!(captured.status, 200);
        let body = String::from_utf8(captured.body).unwrap();
        assert!(body.starts_with("GET /hi?x=1 HTTP/1.1\r\nhost: a\r\n"), "got: {}", body);
        assert_eq!(captured.length, Some(body.len() as u64));
    }

    #[test]
    fn test_etag_stable_across_identical_requests() {
        let (_, etag_a) = echo("/same", "q=1");
        let (_, etag_b) = echo("/same", "q=1");
        let (_, etag_c) = echo("/other", "");
        assert_eq!(etag_a, etag_b);
        assert_ne!(etag_a, etag_c);
    }

    #[test]
    fn test_hash64_is_deterministic() {
        assert_eq!(hash64(b"payload"), hash64(b"payload"));
        assert_ne!(hash64(b"payload"), hash64(b"payloae"));
    }
}
