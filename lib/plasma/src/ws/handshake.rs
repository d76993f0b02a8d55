use crate::error::HttpError;
use crate::http::headers::{has_list_token, HeaderMap};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Everything the transport needs to answer a valid handshake.
#[derive(Debug)]
pub struct Handshake {
    /// The `Sec-WebSocket-Accept` value for the 101 response.
    pub accept: String,
    /// Subprotocols offered by the client, in offer order.
    pub protocols: Vec<String>,
}

/// Quick routing check: does this request ask for a WebSocket upgrade?
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get("connection")
        .map_or(false, |v| has_list_token(v, "upgrade"));
    let upgrade_websocket = headers
        .get("upgrade")
        .map_or(false, |v| v.eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

/// Validates the handshake headers of an upgrade request and computes the
/// accept key. `has_body` rejects upgrade requests that carry a payload.
pub fn validate(headers: &HeaderMap, has_body: bool) -> Result<Handshake, HttpError> {
    if has_body {
        return Err(HttpError::BadRequest);
    }

    match headers.get("sec-websocket-version") {
        Some(version) if version.trim() == "13" => {}
        // The RFC answer for a version we do not speak.
        _ => return Err(HttpError::UpgradeRequired),
    }

    if headers.count("sec-websocket-key") != 1 {
        return Err(HttpError::BadRequest);
    }
    let key = headers.get("sec-websocket-key").expect("count checked").trim();
    match BASE64.decode(key) {
        Ok(raw) if raw.len() == 16 => {}
        _ => return Err(HttpError::BadRequest),
    }

    let mut protocols = Vec::new();
    for value in headers.get_all("sec-websocket-protocol") {
        protocols.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string),
        );
    }

    Ok(Handshake {
        accept: accept_key(key),
        protocols,
    })
}

/// `base64( SHA1( key || GUID ) )` per RFC 6455 §4.2.2.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.trim().as_bytes());
    sha.update(GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.add("connection", "Upgrade");
        headers.add("upgrade", "websocket");
        headers.add("sec-websocket-version", "13");
        headers.add("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==");
        headers
    }

    #[test]
    fn test_rfc_sample_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_detects_upgrade_requests() {
        let headers = upgrade_headers();
        assert!(is_upgrade_request(&headers));

        let mut plain = HeaderMap::new();
        plain.add("connection", "keep-alive");
        assert!(!is_upgrade_request(&plain));

        let mut wrong_target = upgrade_headers();
        wrong_target.set("upgrade", "h2c");
        assert!(!is_upgrade_request(&wrong_target));

        // The Connection header is a token list.
        let mut listed = upgrade_headers();
        listed.set("connection", "keep-alive, Upgrade");
        assert!(is_upgrade_request(&listed));
    }

    #[test]
    fn test_valid_handshake() {
        let shake = validate(&upgrade_headers(), false).unwrap();
        assert_eq!(shake.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert!(shake.protocols.is_empty());
    }

    #[test]
    fn test_subprotocols_collected() {
        let mut headers = upgrade_headers();
        headers.add("sec-websocket-protocol", "chat, superchat");
        headers.add("sec-websocket-protocol", "v2.chat");
        let shake = validate(&headers, false).unwrap();
        assert_eq!(shake.protocols, vec!["chat", "superchat", "v2.chat"]);
    }

    #[test]
    fn test_wrong_version_gets_upgrade_required() {
        let mut headers = upgrade_headers();
        headers.set("sec-websocket-version", "8");
        assert_eq!(
            validate(&headers, false).unwrap_err(),
            HttpError::UpgradeRequired
        );

        let mut missing = upgrade_headers();
        missing.remove("sec-websocket-version");
        assert_eq!(
            validate(&missing, false).unwrap_err(),
            HttpError::UpgradeRequired
        );
    }

    #[test]
    fn test_bad_keys_rejected() {
        let mut missing = upgrade_headers();
        missing.remove("sec-websocket-key");
        assert_eq!(validate(&missing, false).unwrap_err(), HttpError::BadRequest);

        let mut duplicate = upgrade_headers();
        duplicate.add("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(
            validate(&duplicate, false).unwrap_err(),
            HttpError::BadRequest
        );

        let mut short = upgrade_headers();
        short.set("sec-websocket-key", "c2hvcnQ=");
        assert_eq!(validate(&short, false).unwrap_err(), HttpError::BadRequest);

        let mut garbage = upgrade_headers();
        garbage.set("sec-websocket-key", "not base64!!!");
        assert_eq!(validate(&garbage, false).unwrap_err(), HttpError::BadRequest);
    }

    #[test]
    fn test_body_rejected() {
        assert_eq!(
            validate(&upgrade_headers(), true).unwrap_err(),
            HttpError::BadRequest
        );
    }
}
