//! WebSocket HTTP upgrade handshake (RFC 6455 Section 4.2).
//!
//! - [`compute_accept_key`]: SHA-1 + Base64 computation per RFC 6455 Section 4.2.2
//! - [`negotiate`]: Validate an upgrade request and produce the accept value
//! - [`upgrade_response`]: The `101 Switching Protocols` response
//! - [`BAD_REQUEST_RESPONSE`]: The `400 Bad Request` rejection
//! - [`read_request`]: Parse an HTTP/1.1 request head off a buffered stream

use std::io::{BufRead, Read};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Written verbatim when an upgrade is rejected.
pub const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// Upper bound on the request line plus headers.
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// An inbound HTTP upgrade request as delivered by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        UpgradeRequest {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Find a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Compute the `Sec-WebSocket-Accept` value per RFC 6455 Section 4.2.2.
///
/// Concatenates `client_key` + [`WS_GUID`], SHA-1 hashes, then Base64 encodes.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Validate an upgrade request and return the `Sec-WebSocket-Accept` value.
///
/// Only `Sec-WebSocket-Key` is required. A blank key counts as missing.
pub fn negotiate(request: &UpgradeRequest) -> Result<String, HandshakeError> {
    let key = request
        .header("Sec-WebSocket-Key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    if request.header("Sec-WebSocket-Version") != Some("13") {
        tracing::debug!(
            version = request.header("Sec-WebSocket-Version").unwrap_or("<none>"),
            "upgrade without Sec-WebSocket-Version 13"
        );
    }

    Ok(compute_accept_key(key))
}

/// The `101 Switching Protocols` response carrying `accept_key`.
pub fn upgrade_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key
    )
}

/// Read an HTTP/1.1 request head (request line and headers up to the blank
/// line) from `reader`.
///
/// Bytes after the blank line stay in the reader's buffer. Header lines
/// without a colon are skipped.
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<UpgradeRequest, HandshakeError> {
    let mut budget = MAX_REQUEST_HEAD;

    let request_line = read_head_line(reader, &mut budget)?;
    let mut parts = request_line.splitn(3, ' ');
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) if !method.is_empty() => (method, path),
        _ => {
            return Err(HandshakeError::MalformedRequest(format!(
                "bad request line: {}",
                request_line
            )))
        }
    };
    let mut request = UpgradeRequest::new(method, path);

    loop {
        let line = read_head_line(reader, &mut budget)?;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            request
                .headers
                .push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(request)
}

/// Read one CRLF (or LF) terminated line, charging it against `budget`.
fn read_head_line<R: BufRead>(reader: &mut R, budget: &mut usize) -> Result<String, HandshakeError> {
    let mut line = String::new();
    let read = (&mut *reader).take(*budget as u64 + 1).read_line(&mut line)?;
    if read > *budget {
        return Err(HandshakeError::RequestTooLarge {
            limit: MAX_REQUEST_HEAD,
        });
    }
    if !line.ends_with('\n') {
        return Err(HandshakeError::MalformedRequest(
            "connection closed before end of headers".to_string(),
        ));
    }
    *budget -= read;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn valid_request() -> UpgradeRequest {
        UpgradeRequest::new("GET", "/chat")
            .with_header("Host", "server.example.com")
            .with_header("Upgrade", "websocket")
            .with_header("Connection", "Upgrade")
            .with_header("Sec-WebSocket-Key", RFC_KEY)
            .with_header("Sec-WebSocket-Version", "13")
    }

    #[test]
    fn test_accept_key_rfc_example() {
        // RFC 6455 Section 4.2.2 test vector
        assert_eq!(compute_accept_key(RFC_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_negotiate_valid_upgrade() {
        assert_eq!(negotiate(&valid_request()).unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_negotiate_header_names_are_case_insensitive() {
        let request = UpgradeRequest::new("GET", "/").with_header("sec-websocket-key", RFC_KEY);
        assert_eq!(negotiate(&request).unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_negotiate_missing_key() {
        let request = UpgradeRequest::new("GET", "/")
            .with_header("Upgrade", "websocket")
            .with_header("Connection", "Upgrade");
        assert!(matches!(negotiate(&request), Err(HandshakeError::MissingKey)));
    }

    #[test]
    fn test_negotiate_blank_key() {
        let request = UpgradeRequest::new("GET", "/").with_header("Sec-WebSocket-Key", "   ");
        assert!(matches!(negotiate(&request), Err(HandshakeError::MissingKey)));
    }

    #[test]
    fn test_upgrade_response_lines() {
        let response = upgrade_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let lines: Vec<&str> = response.split("\r\n").collect();
        assert_eq!(
            lines,
            vec![
                "HTTP/1.1 101 Switching Protocols",
                "Upgrade: websocket",
                "Connection: Upgrade",
                "Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
                "",
                "",
            ]
        );
    }

    #[test]
    fn test_read_request() {
        let raw = "GET /ws HTTP/1.1\r\n\
                   Host: localhost:8008\r\n\
                   Upgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 13\r\n\
                   \r\n";
        let mut bytes = raw.as_bytes().to_vec();
        bytes.extend_from_slice(&[0x81, 0x80]);
        let mut reader = BufReader::new(Cursor::new(bytes));
        let request = read_request(&mut reader).unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/ws");
        assert_eq!(request.headers.len(), 5);
        assert_eq!(request.header("sec-websocket-key"), Some(RFC_KEY));

        // Bytes after the head are left for the frame reader.
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![0x81, 0x80]);
    }

    #[test]
    fn test_read_request_eof_before_blank_line() {
        let mut reader = Cursor::new(b"GET / HTTP/1.1\r\nHost: x\r\n".to_vec());
        let err = read_request(&mut reader).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"malformed request: connection closed before end of headers");
    }

    #[test]
    fn test_read_request_bad_request_line() {
        let mut reader = Cursor::new(b"garbage\r\n\r\n".to_vec());
        assert!(matches!(
            read_request(&mut reader),
            Err(HandshakeError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_read_request_too_large() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_REQUEST_HEAD));
        raw.extend_from_slice(b"\r\n\r\n");
        let mut reader = Cursor::new(raw);
        assert!(matches!(
            read_request(&mut reader),
            Err(HandshakeError::RequestTooLarge { .. })
        ));
    }
}
