use crate::buffer::Buffer;
use crate::error::HttpError;
use crate::http::headers::{has_list_token, is_tchar, is_token};
use crate::http::Version;

/// Parser limits, lifted from [`crate::config::Config`] at construction.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_line_len: usize,
    pub max_header_size: usize,
    pub max_headers: usize,
    pub max_body_size: u64,
}

impl Limits {
    pub fn from_config(cfg: &crate::config::Config) -> Limits {
        Limits {
            max_line_len: cfg.max_line_len,
            max_header_size: cfg.max_header_size,
            max_headers: cfg.max_headers,
            max_body_size: cfg.max_body_size as u64,
        }
    }
}

/// Receiver for parse events. Values are borrowed straight out of the read
/// buffer; implementations copy what they keep.
pub trait Events {
    fn on_method(&mut self, method: &str) -> Result<(), HttpError>;
    fn on_path(&mut self, path: &str) -> Result<(), HttpError>;
    fn on_query(&mut self, query: &str) -> Result<(), HttpError>;
    fn on_version(&mut self, version: Version) -> Result<(), HttpError>;
    fn on_header(&mut self, name: &str, value: &str) -> Result<(), HttpError>;
    fn on_headers_end(&mut self) -> Result<(), HttpError>;
    fn on_body_chunk(&mut self, data: &[u8]) -> Result<(), HttpError>;
    fn on_request(&mut self) -> Result<(), HttpError>;
}

/// What a call to [`Parser::advance`] achieved.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Progress {
    /// More bytes are needed.
    Partial,
    /// Headers are complete and the client expects `100 Continue` before
    /// it sends the body. Call [`Parser::ack_continue`] to proceed.
    ExpectContinue,
    /// A full request was delivered.
    Complete,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    Method,
    Path,
    Query,
    Version,
    VersionEol,
    HeaderLine,
    BodyIdentity,
    ChunkSize,
    ChunkData,
    ChunkDataEol,
    Trailers,
    Done,
    Failed,
}

/// Incremental, restartable HTTP/1.1 request parser. It consumes bytes
/// from the connection's read accumulator and emits callbacks; when the
/// buffer runs dry mid-element it returns `Partial` and picks up exactly
/// where it stopped once more bytes arrive. Splitting the input at any
/// byte boundary produces identical events.
#[derive(Debug)]
pub struct Parser {
    limits: Limits,
    state: State,
    line_consumed: usize,
    header_bytes: usize,
    header_count: usize,
    version: Version,
    content_length: Option<u64>,
    chunked: bool,
    connection_close: bool,
    expect_continue: bool,
    continue_acked: bool,
    seen_host: bool,
    body_remaining: u64,
    body_total: u64,
}

impl Parser {
    pub fn new(limits: Limits) -> Parser {
        Parser {
            limits,
            state: State::Method,
            line_consumed: 0,
            header_bytes: 0,
            header_count: 0,
            version: Version::Http11,
            content_length: None,
            chunked: false,
            connection_close: false,
            expect_continue: false,
            continue_acked: false,
            seen_host: false,
            body_remaining: 0,
            body_total: 0,
        }
    }

    /// Rewinds for the next request on a kept-alive connection.
    pub fn reset(&mut self) {
        let limits = self.limits;
        *self = Parser::new(limits);
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// True once the request carried `Connection: close`.
    #[inline]
    pub fn connection_close(&self) -> bool {
        self.connection_close
    }

    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Accepts the `100-continue` expectation so body parsing proceeds.
    pub fn ack_continue(&mut self) {
        self.continue_acked = true;
    }

    /// Consumes as much of `buf` as possible, emitting events into `ev`.
    pub fn advance<E: Events>(&mut self, buf: &mut Buffer, ev: &mut E) -> Result<Progress, HttpError> {
        loop {
            match self.state {
                State::Method => {
                    // Tolerate stray CRLF ahead of the request line.
                    while buf.read_slice().first().map_or(false, |&b| b == b'\r' || b == b'\n') {
                        buf.consume(1);
                    }
                    match self.take_until(buf, b' ')? {
                        None => return Ok(Progress::Partial),
                        Some(end) => {
                            {
                                let token = &buf.read_slice()[..end];
                                if !is_token(token) {
                                    return self.fail(HttpError::BadRequest);
                                }
                                let method = std::str::from_utf8(token)
                                    .map_err(|_| HttpError::BadRequest)?;
                                ev.on_method(method)?;
                            }
                            self.commit_line(buf, end + 1);
                            self.state = State::Path;
                        }
                    }
                }
                State::Path => {
                    match self.take_until_any(buf, &[b' ', b'?'])? {
                        None => return Ok(Progress::Partial),
                        Some((end, delim)) => {
                            {
                                let raw = &buf.read_slice()[..end];
                                if raw.is_empty() || raw.iter().any(|&b| b <= 0x20 || b == 0x7f) {
                                    return self.fail(HttpError::BadRequest);
                                }
                                let path = std::str::from_utf8(raw)
                                    .map_err(|_| HttpError::BadRequest)?;
                                ev.on_path(path)?;
                            }
                            self.commit_line(buf, end + 1);
                            self.state = if delim == b'?' {
                                State::Query
                            } else {
                                State::Version
                            };
                        }
                    }
                }
                State::Query => {
                    match self.take_until(buf, b' ')? {
                        None => return Ok(Progress::Partial),
                        Some(end) => {
                            {
                                let raw = &buf.read_slice()[..end];
                                if raw.iter().any(|&b| b < 0x20 || b == 0x7f) {
                                    return self.fail(HttpError::BadRequest);
                                }
                                let query = std::str::from_utf8(raw)
                                    .map_err(|_| HttpError::BadRequest)?;
                                ev.on_query(query)?;
                            }
                            self.commit_line(buf, end + 1);
                            self.state = State::Version;
                        }
                    }
                }
                State::Version => {
                    match self.take_until(buf, b'\r')? {
                        None => return Ok(Progress::Partial),
                        Some(end) => {
                            let version = {
                                let raw = &buf.read_slice()[..end];
                                match raw {
                                    b"HTTP/1.1" => Version::Http11,
                                    b"HTTP/1.0" => Version::Http10,
                                    _ if raw.starts_with(b"HTTP/") => {
                                        return self.fail(HttpError::VersionNotSupported)
                                    }
                                    _ => return self.fail(HttpError::BadRequest),
                                }
                            };
                            self.version = version;
                            if version == Version::Http10 {
                                // Keep-alive is opt-in under 1.0; this server
                                // does not opt in.
                                self.connection_close = true;
                            }
                            ev.on_version(version)?;
                            self.commit_line(buf, end + 1);
                            self.state = State::VersionEol;
                        }
                    }
                }
                State::VersionEol => {
                    match buf.read_slice().first() {
                        None => return Ok(Progress::Partial),
                        Some(b'\n') => {
                            buf.consume(1);
                            self.line_consumed = 0;
                            self.state = State::HeaderLine;
                        }
                        Some(_) => return self.fail(HttpError::BadRequest),
                    }
                }
                State::HeaderLine => {
                    match self.header_line(buf, ev)? {
                        LineOutcome::Partial => return Ok(Progress::Partial),
                        LineOutcome::More => {}
                        LineOutcome::End => {
                            match self.finish_headers(ev)? {
                                Progress::Complete => return Ok(Progress::Complete),
                                Progress::ExpectContinue => return Ok(Progress::ExpectContinue),
                                Progress::Partial => {}
                            }
                        }
                    }
                }
                State::BodyIdentity => {
                    if self.expect_continue && !self.continue_acked {
                        return Ok(Progress::ExpectContinue);
                    }
                    if self.body_remaining == 0 {
                        return self.complete(ev);
                    }
                    let available = buf.len() as u64;
                    if available == 0 {
                        return Ok(Progress::Partial);
                    }
                    let take = available.min(self.body_remaining) as usize;
                    ev.on_body_chunk(&buf.read_slice()[..take])?;
                    buf.consume(take);
                    self.body_remaining -= take as u64;
                    if self.body_remaining == 0 {
                        return self.complete(ev);
                    }
                }
                State::ChunkSize => {
                    if self.expect_continue && !self.continue_acked {
                        return Ok(Progress::ExpectContinue);
                    }
                    match find_crlf(buf.read_slice()) {
                        None => {
                            if buf.len() > self.limits.max_line_len {
                                return self.fail(HttpError::BadRequest);
                            }
                            return Ok(Progress::Partial);
                        }
                        Some(eol) => {
                            let size = {
                                let line = &buf.read_slice()[..eol];
                                parse_chunk_size(line)
                                    .ok_or(HttpError::BadRequest)
                                    .map_err(|e| self.fail_err(e))?
                            };
                            buf.consume(eol + 2);
                            self.body_total = self
                                .body_total
                                .checked_add(size)
                                .ok_or_else(|| self.fail_err(HttpError::PayloadTooLarge))?;
                            if self.body_total > self.limits.max_body_size {
                                return self.fail(HttpError::PayloadTooLarge);
                            }
                            if size == 0 {
                                self.state = State::Trailers;
                                self.header_bytes = 0;
                            } else {
                                self.body_remaining = size;
                                self.state = State::ChunkData;
                            }
                        }
                    }
                }
                State::ChunkData => {
                    let available = buf.len() as u64;
                    if available == 0 {
                        return Ok(Progress::Partial);
                    }
                    let take = available.min(self.body_remaining) as usize;
                    ev.on_body_chunk(&buf.read_slice()[..take])?;
                    buf.consume(take);
                    self.body_remaining -= take as u64;
                    if self.body_remaining == 0 {
                        self.state = State::ChunkDataEol;
                    }
                }
                State::ChunkDataEol => {
                    let slice = buf.read_slice();
                    if slice.len() < 2 {
                        return Ok(Progress::Partial);
                    }
                    if &slice[..2] != b"\r\n" {
                        return self.fail(HttpError::BadRequest);
                    }
                    buf.consume(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    // Trailer fields are consumed and discarded.
                    match find_crlf(buf.read_slice()) {
                        None => {
                            if buf.len() > self.limits.max_header_size {
                                return self.fail(HttpError::HeadersTooLarge);
                            }
                            return Ok(Progress::Partial);
                        }
                        Some(eol) => {
                            buf.consume(eol + 2);
                            if eol == 0 {
                                return self.complete(ev);
                            }
                            self.header_bytes += eol + 2;
                            if self.header_bytes > self.limits.max_header_size {
                                return self.fail(HttpError::HeadersTooLarge);
                            }
                        }
                    }
                }
                State::Done => {
                    return Ok(Progress::Complete);
                }
                State::Failed => {
                    return Err(HttpError::BadRequest);
                }
            }
        }
    }

    /// Finds `delim` in the unconsumed request line, enforcing the line
    /// length limit while the element is still incomplete.
    fn take_until(&mut self, buf: &Buffer, delim: u8) -> Result<Option<usize>, HttpError> {
        match buf.read_slice().iter().position(|&b| b == delim) {
            Some(idx) => {
                self.check_line(idx)?;
                Ok(Some(idx))
            }
            None => {
                self.check_line(buf.len())?;
                Ok(None)
            }
        }
    }

    fn take_until_any(&mut self, buf: &Buffer, delims: &[u8]) -> Result<Option<(usize, u8)>, HttpError> {
        let slice = buf.read_slice();
        match slice.iter().position(|b| delims.contains(b)) {
            Some(idx) => {
                self.check_line(idx)?;
                Ok(Some((idx, slice[idx])))
            }
            None => {
                self.check_line(buf.len())?;
                Ok(None)
            }
        }
    }

    fn check_line(&mut self, pending: usize) -> Result<(), HttpError> {
        if self.line_consumed + pending > self.limits.max_line_len {
            return Err(self.fail_err(HttpError::UriTooLong));
        }
        Ok(())
    }

    fn commit_line(&mut self, buf: &mut Buffer, count: usize) {
        self.line_consumed += count;
        buf.consume(count);
    }

    /// Parses one header line, or the blank line ending the block.
    fn header_line<E: Events>(&mut self, buf: &mut Buffer, ev: &mut E) -> Result<LineOutcome, HttpError> {
        let eol = match find_crlf(buf.read_slice()) {
            Some(eol) => eol,
            None => {
                if self.header_bytes + buf.len() > self.limits.max_header_size {
                    return Err(self.fail_err(HttpError::HeadersTooLarge));
                }
                return Ok(LineOutcome::Partial);
            }
        };

        if eol == 0 {
            buf.consume(2);
            return Ok(LineOutcome::End);
        }

        self.header_bytes += eol + 2;
        if self.header_bytes > self.limits.max_header_size {
            return Err(self.fail_err(HttpError::HeadersTooLarge));
        }
        self.header_count += 1;
        if self.header_count > self.limits.max_headers {
            return Err(self.fail_err(HttpError::HeadersTooLarge));
        }

        {
            let line = &buf.read_slice()[..eol];

            // Continuation lines (obs-fold) are rejected outright.
            if line[0] == b' ' || line[0] == b'\t' {
                return Err(self.fail_err(HttpError::BadRequest));
            }

            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| self.fail_err(HttpError::BadRequest))?;
            let name = &line[..colon];
            if !is_token(name) {
                return Err(self.fail_err(HttpError::BadRequest));
            }
            let value = trim_ows(&line[colon + 1..]);
            if value.iter().any(|&b| (b < 0x20 && b != b'\t') || b == 0x7f) {
                return Err(self.fail_err(HttpError::BadRequest));
            }

            let name = std::str::from_utf8(name).expect("token bytes are ascii");
            let value =
                std::str::from_utf8(value).map_err(|_| self.fail_err(HttpError::BadRequest))?;

            self.scan_header(name, value)?;
            ev.on_header(name, value)?;
        }

        buf.consume(eol + 2);
        Ok(LineOutcome::More)
    }

    /// Framing-relevant headers get validated as they stream past.
    fn scan_header(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        if name.eq_ignore_ascii_case("host") {
            if self.seen_host {
                return Err(self.fail_err(HttpError::BadRequest));
            }
            self.seen_host = true;
        } else if name.eq_ignore_ascii_case("content-length") {
            if self.content_length.is_some() {
                return Err(self.fail_err(HttpError::BadRequest));
            }
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(self.fail_err(HttpError::BadRequest));
            }
            let length: u64 = value
                .parse()
                .map_err(|_| self.fail_err(HttpError::BadRequest))?;
            self.content_length = Some(length);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            for token in value.split(',').map(str::trim) {
                if self.chunked {
                    // chunked must be the final encoding
                    return Err(self.fail_err(HttpError::BadRequest));
                }
                if token.eq_ignore_ascii_case("chunked") {
                    self.chunked = true;
                } else if token.eq_ignore_ascii_case("identity") || token.is_empty() {
                    // no-op encoding
                } else {
                    return Err(self.fail_err(HttpError::NotImplemented));
                }
            }
        } else if name.eq_ignore_ascii_case("connection") {
            if has_list_token(value, "close") {
                self.connection_close = true;
            }
        } else if name.eq_ignore_ascii_case("expect") {
            if value.eq_ignore_ascii_case("100-continue") {
                self.expect_continue = true;
            } else {
                return Err(self.fail_err(HttpError::ExpectationFailed));
            }
        }
        Ok(())
    }

    fn finish_headers<E: Events>(&mut self, ev: &mut E) -> Result<Progress, HttpError> {
        // Conflicting body framings are rejected rather than reconciled.
        if self.chunked && self.content_length.is_some() {
            return Err(self.fail_err(HttpError::BadRequest));
        }
        if let Some(length) = self.content_length {
            if length > self.limits.max_body_size {
                return Err(self.fail_err(HttpError::PayloadTooLarge));
            }
        }

        ev.on_headers_end()?;

        if self.chunked {
            self.state = State::ChunkSize;
        } else {
            match self.content_length.unwrap_or(0) {
                0 => return self.complete(ev).map(|_| Progress::Complete),
                length => {
                    self.body_remaining = length;
                    self.state = State::BodyIdentity;
                }
            }
        }

        if self.expect_continue && !self.continue_acked {
            return Ok(Progress::ExpectContinue);
        }
        Ok(Progress::Partial)
    }

    fn complete<E: Events>(&mut self, ev: &mut E) -> Result<Progress, HttpError> {
        self.state = State::Done;
        ev.on_request()?;
        Ok(Progress::Complete)
    }

    fn fail(&mut self, err: HttpError) -> Result<Progress, HttpError> {
        self.state = State::Failed;
        Err(err)
    }

    fn fail_err(&mut self, err: HttpError) -> HttpError {
        self.state = State::Failed;
        err
    }
}

enum LineOutcome {
    Partial,
    More,
    End,
}

#[inline]
fn find_crlf(slice: &[u8]) -> Option<usize> {
    slice.windows(2).position(|w| w == b"\r\n")
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while value.first().map_or(false, |&b| b == b' ' || b == b'\t') {
        value = &value[1..];
    }
    while value.last().map_or(false, |&b| b == b' ' || b == b'\t') {
        value = &value[..value.len() - 1];
    }
    value
}

/// Parses a chunk-size line: hex digits, optionally followed by
/// extensions which are discarded.
fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let hex_end = line
        .iter()
        .position(|&b| b == b';')
        .unwrap_or_else(|| line.len());
    let hex = &line[..hex_end];
    if hex.is_empty() || hex.len() > 16 || !hex.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let mut size: u64 = 0;
    for &b in hex {
        let digit = (b as char).to_digit(16).expect("hex digit validated") as u64;
        size = size.checked_mul(16)?.checked_add(digit)?;
    }
    Some(size)
}
