//! A minimal HTTP header-block reader/writer — just enough to drive the
//! WebSocket handshakes in [`crate::websocket`] end to end. §6.
//!
//! Deliberately not a general request/response parser or router: no
//! chunked-transfer decoding, no persistent-connection keep-alive state
//! machine, no header folding. Those remain an external collaborator's
//! responsibility, per the scope note in §1.

use crate::error::{EvdError, ErrorKind, Result};

/// A parsed request line plus headers, in arrival order. Lookups are
/// case-insensitive on the header name, per RFC 7230.
#[derive(Debug, Clone)]
pub struct HttpRequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponseHead {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

/// Scans `buf` for a complete `\r\n\r\n`-terminated request-line-plus-headers
/// block. Returns `Ok(None)` if the block isn't complete yet (caller should
/// read more and retry); `Ok(Some((head, consumed)))` on success, where
/// `consumed` is the number of bytes of `buf` the header block occupied
/// (the body, if any, starts at that offset).
pub fn read_request_headers(buf: &[u8]) -> Result<Option<(HttpRequestHead, usize)>> {
    let end = match find_subslice(buf, b"\r\n\r\n") {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let block = &buf[..end];
    let text = std::str::from_utf8(block).map_err(|_| EvdError::new(ErrorKind::InvalidData, "request headers are not valid utf-8"))?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| EvdError::new(ErrorKind::InvalidData, "empty request"))?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next().ok_or_else(|| EvdError::new(ErrorKind::InvalidData, "missing method"))?.to_string();
    let target = parts.next().ok_or_else(|| EvdError::new(ErrorKind::InvalidData, "missing request target"))?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| EvdError::new(ErrorKind::InvalidData, "malformed header line"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some((HttpRequestHead { method, target, version, headers }, end + 4)))
}

/// Serializes a status line, headers, and body — in that order, with a
/// blank line separating headers from body, per RFC 7230.
pub fn write_response_headers(resp: &HttpResponseHead) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", resp.status, resp.reason).as_bytes());
    for (name, value) in &resp.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&resp.body);
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_block_returns_none() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n";
        assert!(read_request_headers(buf).unwrap().is_none());
    }

    #[test]
    fn parses_request_line_and_headers() {
        let buf = b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\r\n";
        let (head, consumed) = read_request_headers(buf).unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/chat");
        assert_eq!(head.header("upgrade"), Some("websocket"));
        assert_eq!(head.header("Sec-WebSocket-Version"), Some("8"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn writes_status_line_headers_and_body() {
        let resp = HttpResponseHead::new(101, "Switching Protocols").with_header("Upgrade", "websocket").with_header("Connection", "Upgrade").with_body(vec![1, 2, 3]);
        let bytes = write_response_headers(&resp);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(bytes.ends_with(&[1, 2, 3]));
    }
}
