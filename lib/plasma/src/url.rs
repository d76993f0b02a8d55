use crate::error::ServerError;
use std::path::PathBuf;

/// Where a listener should bind. `Tcp` keeps the unresolved `host:port`
/// string; resolution happens at bind time.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BindAddr {
    Tcp(String),
    Unix(PathBuf),
}

const DEFAULT_PORT: u16 = 3000;

/// Parses a listen URL. Accepted forms:
///
/// - `tcp://host:port` (trailing slash tolerated)
/// - `host:port`
/// - `unix:///path/to.sock`, `unix://./rel.sock`
/// - a bare filesystem path
/// - `host:0`, which designates a Unix socket at path `host`
pub fn parse(url: &str) -> Result<BindAddr, ServerError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ServerError::InvalidUrl(url.to_string()));
    }

    if let Some(rest) = strip_scheme(url, "unix://") {
        if rest.is_empty() {
            return Err(ServerError::InvalidUrl(url.to_string()));
        }
        return Ok(BindAddr::Unix(PathBuf::from(rest)));
    }

    if let Some(rest) = strip_scheme(url, "tcp://") {
        let rest = rest.trim_end_matches('/');
        return tcp_addr(url, rest);
    }

    // No scheme. Paths win over host:port.
    if url.starts_with('/') || url.starts_with('.') {
        return Ok(BindAddr::Unix(PathBuf::from(url)));
    }

    if has_port(url) {
        return tcp_addr(url, url);
    }

    if url.contains('/') {
        return Ok(BindAddr::Unix(PathBuf::from(url)));
    }

    if url.contains(':') {
        // A colon without a numeric port is neither a path nor an address.
        return Err(ServerError::InvalidUrl(url.to_string()));
    }

    Ok(BindAddr::Tcp(format!("{}:{}", url, DEFAULT_PORT)))
}

fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Option<&'a str> {
    if url.len() >= scheme.len() && url[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(&url[scheme.len()..])
    } else {
        None
    }
}

fn tcp_addr(original: &str, hostport: &str) -> Result<BindAddr, ServerError> {
    let (host, port) = split_port(hostport).ok_or_else(|| ServerError::InvalidUrl(original.to_string()))?;
    match port {
        Some(0) => Ok(BindAddr::Unix(PathBuf::from(host))),
        Some(p) => Ok(BindAddr::Tcp(format!("{}:{}", host, p))),
        None => Ok(BindAddr::Tcp(format!("{}:{}", host, DEFAULT_PORT))),
    }
}

/// Splits `host[:port]`, handling the `[v6]:port` bracket form. Returns
/// `None` when the port is present but not a number.
fn split_port(s: &str) -> Option<(&str, Option<u16>)> {
    if s.starts_with('[') {
        let end = s.find(']')?;
        let host = &s[..=end];
        let rest = &s[end + 1..];
        if rest.is_empty() {
            return Some((host, None));
        }
        let port = rest.strip_prefix(':')?.parse::<u16>().ok()?;
        return Some((host, Some(port)));
    }
    match s.rfind(':') {
        Some(idx) => {
            let port = s[idx + 1..].parse::<u16>().ok()?;
            Some((&s[..idx], Some(port)))
        }
        None => Some((s, None)),
    }
}

fn has_port(s: &str) -> bool {
    match split_port(s) {
        Some((_, Some(_))) => true,
        _ => false,
    }
}
