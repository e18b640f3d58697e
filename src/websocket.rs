//! WebSocket handshake negotiation and frame codecs, v0 (hybi-00/draft-76)
//! and v8/≥13 (RFC 6455). §4.9.
//!
//! # Why
//! `evd-websocket-common.c`, `evd-websocket00.c` and `evd-websocket08.c`
//! share one `EvdWebsocketData` struct and dispatch on a `version` field set
//! once at handshake time; the two framers otherwise share nothing (not even
//! a comparable byte layout). That shape survives as one enum-tagged
//! [`WebSocketSession`] carrying version-specific state, rather than a
//! trait-object pair — the session's own state machine is the contract,
//! and a trait would only hide which frame format is in play without buying
//! any polymorphism callers need.
//!
//! # How
//! [`WebSocketSession::feed`] is a byte-driven incremental parser in the same
//! spirit as [`crate::json_filter::JsonFilter::feed`]: consume as much of the
//! buffer as forms complete frames, stash the remainder, and return what was
//! decoded. Outbound framing (`send_text`, `send_binary`, `send_close`) is
//! pure: it returns bytes for the caller to hand to [`crate::connection::Connection::write`].

use md5::{Digest as _, Md5};
use rand::RngCore;
use sha1::Sha1;

use crate::error::{EvdError, ErrorKind, Result};
use crate::http::{HttpRequestHead, HttpResponseHead};

const MAGIC_UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// `EVD_WEBSOCKET_MAX_FRAGMENT_SIZE` — outbound v8 frames above this are
/// split into continuation fragments.
const MAX_FRAGMENT_SIZE: u64 = 0x1000_0000;
/// `EVD_WEBSOCKET_MAX_PAYLOAD_SIZE`.
const MAX_PAYLOAD_SIZE: u64 = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsVersion {
    V0,
    V8,
}

/// `Sec-WebSocket-Version` dispatch: absent or `0` ⇒ v0, `8` ⇒ v8 (the
/// original's "≥13" framing is wire-compatible with the v8 opcode/masking
/// layout this crate implements), anything else is unsupported.
pub fn negotiate_version(request: &HttpRequestHead) -> Result<WsVersion> {
    match request.header("sec-websocket-version") {
        None => Ok(WsVersion::V0),
        Some("0") => Ok(WsVersion::V0),
        Some(v) => match v.parse::<u32>() {
            Ok(0) => Ok(WsVersion::V0),
            Ok(8) | Ok(13) => Ok(WsVersion::V8),
            _ => Err(EvdError::new(ErrorKind::NotSupported, "unsupported websocket version")),
        },
    }
}

/// A fully decoded data frame handed to the caller's `frame_cb`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub is_binary: bool,
}

/// What a call to [`WebSocketSession::feed`] produced.
#[derive(Default)]
pub struct FeedResult {
    pub frames: Vec<Frame>,
    /// Bytes the caller must write back immediately (auto-pong replies, the
    /// close-frame echo) — produced internally by `feed` rather than left to
    /// the caller to notice and react to separately.
    pub outgoing: Vec<u8>,
    pub peer_closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum V8State {
    Header,
    PayloadLen,
    MaskingKey,
    Payload,
}

struct V8 {
    state: V8State,
    fin: bool,
    opcode: u8,
    masked: bool,
    masking_key: [u8; 4],
    payload_len: u64,
}

impl V8 {
    fn new() -> Self {
        Self {
            state: V8State::Header,
            fin: false,
            opcode: 0,
            masked: false,
            masking_key: [0; 4],
            payload_len: 0,
        }
    }
}

/// Owns the decode buffer and per-version parse state for one WebSocket
/// connection; the handshake itself (request/response construction) is
/// free functions below, since it runs once and needs no ongoing state.
pub struct WebSocketSession {
    version: WsVersion,
    is_server: bool,
    buf: Vec<u8>,
    offset: usize,
    v8: V8,
    close_frame_sent: bool,
    closed: bool,
}

impl WebSocketSession {
    pub fn new(version: WsVersion, is_server: bool) -> Self {
        Self {
            version,
            is_server,
            buf: Vec::new(),
            offset: 0,
            v8: V8::new(),
            close_frame_sent: false,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Appends `bytes` to the internal buffer and decodes as many complete
    /// frames as possible. Starved (incomplete) frames stay buffered for the
    /// next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<FeedResult> {
        self.buf.extend_from_slice(bytes);
        let mut result = FeedResult::default();
        match self.version {
            WsVersion::V8 => self.feed_v8(&mut result)?,
            WsVersion::V0 => self.feed_v0(&mut result)?,
        }
        if self.offset > 0 {
            self.buf.drain(..self.offset);
            self.offset = 0;
        }
        Ok(result)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    // ---- v8 / RFC 6455 ----

    fn feed_v8(&mut self, result: &mut FeedResult) -> Result<()> {
        loop {
            if self.closed {
                return Ok(());
            }
            match self.v8.state {
                V8State::Header => {
                    if self.remaining() < 2 {
                        return Ok(());
                    }
                    let b0 = self.buf[self.offset];
                    let b1 = self.buf[self.offset + 1];
                    self.offset += 2;
                    self.v8.fin = b0 & 0x80 != 0;
                    self.v8.opcode = b0 & 0x0F;
                    self.v8.masked = b1 & 0x80 != 0;
                    let len7 = b1 & 0x7F;
                    self.v8.state = if len7 == 126 || len7 == 127 {
                        self.v8.payload_len = len7 as u64;
                        V8State::PayloadLen
                    } else {
                        self.v8.payload_len = len7 as u64;
                        if self.v8.masked {
                            V8State::MaskingKey
                        } else {
                            V8State::Payload
                        }
                    };
                }
                V8State::PayloadLen => {
                    if self.v8.payload_len == 126 {
                        if self.remaining() < 2 {
                            return Ok(());
                        }
                        let mut b = [0u8; 2];
                        b.copy_from_slice(&self.buf[self.offset..self.offset + 2]);
                        self.offset += 2;
                        self.v8.payload_len = u16::from_be_bytes(b) as u64;
                    } else {
                        if self.remaining() < 8 {
                            return Ok(());
                        }
                        let mut b = [0u8; 8];
                        b.copy_from_slice(&self.buf[self.offset..self.offset + 8]);
                        self.offset += 8;
                        self.v8.payload_len = u64::from_be_bytes(b);
                    }
                    if self.v8.payload_len > MAX_PAYLOAD_SIZE {
                        self.closed = true;
                        return Err(EvdError::new(ErrorKind::ProtocolViolation, "websocket payload exceeds maximum size"));
                    }
                    self.v8.state = if self.v8.masked { V8State::MaskingKey } else { V8State::Payload };
                }
                V8State::MaskingKey => {
                    if self.remaining() < 4 {
                        return Ok(());
                    }
                    self.v8.masking_key.copy_from_slice(&self.buf[self.offset..self.offset + 4]);
                    self.offset += 4;
                    self.v8.state = V8State::Payload;
                }
                V8State::Payload => {
                    let len = self.v8.payload_len as usize;
                    if self.remaining() < len {
                        return Ok(());
                    }
                    let start = self.offset;
                    let mut payload = self.buf[start..start + len].to_vec();
                    self.offset += len;
                    if self.v8.masked {
                        for (i, b) in payload.iter_mut().enumerate() {
                            *b ^= self.v8.masking_key[i % 4];
                        }
                    }
                    self.handle_v8_frame(self.v8.fin, self.v8.opcode, payload.drain(..).collect::<Vec<u8>>(), result)?;
                    self.v8.state = V8State::Header;
                }
            }
        }
    }

    fn handle_v8_frame(&mut self, fin: bool, opcode: u8, payload: Vec<u8>, result: &mut FeedResult) -> Result<()> {
        const OPCODE_TEXT: u8 = 0x1;
        const OPCODE_BINARY: u8 = 0x2;
        const OPCODE_CLOSE: u8 = 0x8;
        const OPCODE_PING: u8 = 0x9;
        const OPCODE_PONG: u8 = 0xA;

        match opcode {
            OPCODE_CLOSE => {
                if !self.close_frame_sent {
                    result.outgoing.extend(self.build_close_frame());
                    self.close_frame_sent = true;
                }
                self.closed = true;
                result.peer_closed = true;
            }
            OPCODE_PING => {
                // Auto-reply with a pong carrying the same payload; never
                // surfaced to the caller. Restores RFC 6455's conventional
                // behavior that the source left unimplemented — see §4.9.
                result.outgoing.extend(self.build_frame(true, OPCODE_PONG, !self.is_server, &payload));
            }
            OPCODE_PONG => {}
            OPCODE_TEXT | OPCODE_BINARY => {
                if !fin {
                    self.closed = true;
                    return Err(EvdError::new(ErrorKind::ProtocolViolation, "fragmented websocket frames are not supported"));
                }
                result.frames.push(Frame { data: payload, is_binary: opcode == OPCODE_BINARY });
            }
            _ => {
                self.closed = true;
                return Err(EvdError::new(ErrorKind::ProtocolViolation, "unsupported websocket opcode"));
            }
        }
        Ok(())
    }

    fn build_frame(&self, fin: bool, opcode: u8, masked: bool, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 14);
        let mut b0 = opcode & 0x0F;
        if fin {
            b0 |= 0x80;
        }
        out.push(b0);

        let len = payload.len() as u64;
        let mut b1 = if masked { 0x80 } else { 0x00 };
        if len <= 125 {
            b1 |= len as u8;
            out.push(b1);
        } else if len <= u16::MAX as u64 {
            b1 |= 126;
            out.push(b1);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            b1 |= 127;
            out.push(b1);
            out.extend_from_slice(&len.to_be_bytes());
        }

        if masked {
            let mut key = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut key);
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            for (i, b) in out[start..].iter_mut().enumerate() {
                *b ^= key[i % 4];
            }
        } else {
            out.extend_from_slice(payload);
        }
        out
    }

    fn build_close_frame(&self) -> Vec<u8> {
        self.build_frame(true, 0x8, !self.is_server, &[])
    }

    // ---- v0 / hybi-00 ----

    fn feed_v0(&mut self, result: &mut FeedResult) -> Result<()> {
        loop {
            if self.closed || self.remaining() == 0 {
                return Ok(());
            }
            let frame_type = self.buf[self.offset];
            if frame_type == 0x00 {
                let search_from = self.offset + 1;
                match self.buf[search_from..].iter().position(|&b| b == 0xFF) {
                    Some(rel) => {
                        let text_end = search_from + rel;
                        let payload = self.buf[search_from..text_end].to_vec();
                        self.offset = text_end + 1;
                        result.frames.push(Frame { data: payload, is_binary: false });
                    }
                    None => return Ok(()),
                }
            } else {
                // 0x80..0xFF: length-prefixed frame via 7-bit continuations;
                // zero length on 0xFF is the close handshake.
                let mut len: u64 = 0;
                let mut cursor = self.offset + 1;
                loop {
                    if cursor >= self.buf.len() {
                        return Ok(());
                    }
                    let b = self.buf[cursor];
                    cursor += 1;
                    len = len * 128 + (b & 0x7F) as u64;
                    if b & 0x80 == 0 {
                        break;
                    }
                }
                if self.buf.len() - cursor < len as usize {
                    return Ok(());
                }
                let payload = self.buf[cursor..cursor + len as usize].to_vec();
                self.offset = cursor + len as usize;
                if frame_type == 0xFF && len == 0 {
                    if !self.close_frame_sent {
                        result.outgoing.extend_from_slice(&[0xFF, 0x00]);
                        self.close_frame_sent = true;
                    }
                    self.closed = true;
                    result.peer_closed = true;
                } else {
                    result.frames.push(Frame { data: payload, is_binary: true });
                }
            }
        }
    }

    /// Text frames only; the source's binary-send path for v0 was never
    /// implemented and stays that way here — see §9.
    pub fn send_text(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.version {
            WsVersion::V0 => {
                let mut out = Vec::with_capacity(payload.len() + 2);
                out.push(0x00);
                out.extend_from_slice(payload);
                out.push(0xFF);
                Ok(out)
            }
            WsVersion::V8 => Ok(self.send_fragmented(0x1, payload)),
        }
    }

    pub fn send_binary(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.version {
            WsVersion::V0 => Err(EvdError::new(ErrorKind::NotSupported, "websocket v0 binary send is not supported")),
            WsVersion::V8 => Ok(self.send_fragmented(0x2, payload)),
        }
    }

    fn send_fragmented(&self, first_opcode: u8, payload: &[u8]) -> Vec<u8> {
        if payload.is_empty() {
            return self.build_frame(true, first_opcode, !self.is_server, payload);
        }
        let mut out = Vec::new();
        let mut sent = 0usize;
        let total = payload.len() as u64;
        while (sent as u64) < total {
            let remaining = total - sent as u64;
            let frag_len = remaining.min(MAX_FRAGMENT_SIZE) as usize;
            let fin = (sent + frag_len) as u64 >= total;
            let opcode = if sent == 0 { first_opcode } else { 0x0 };
            out.extend(self.build_frame(fin, opcode, !self.is_server, &payload[sent..sent + frag_len]));
            sent += frag_len;
        }
        out
    }

    /// Sends the close frame if not already sent; idempotent.
    pub fn send_close(&mut self) -> Vec<u8> {
        if self.close_frame_sent {
            return Vec::new();
        }
        self.close_frame_sent = true;
        match self.version {
            WsVersion::V0 => vec![0xFF, 0x00],
            WsVersion::V8 => self.build_close_frame(),
        }
    }
}

// ---- handshake ----

fn v8_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(MAGIC_UUID.as_bytes());
    let digest = hasher.finalize();
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, digest)
}

/// Validates the request and builds the `101 Switching Protocols` response.
pub fn build_v8_handshake_response(request: &HttpRequestHead) -> Result<HttpResponseHead> {
    if request.header("Upgrade") != Some("websocket") || request.header("Connection") != Some("Upgrade") {
        return Err(EvdError::new(ErrorKind::ProtocolViolation, "missing or invalid Upgrade/Connection headers"));
    }
    let key = request.header("Sec-WebSocket-Key").ok_or_else(|| EvdError::new(ErrorKind::InvalidData, "missing Sec-WebSocket-Key"))?;
    let accept = v8_accept_key(key);
    Ok(HttpResponseHead::new(101, "Switching Protocols").with_header("Upgrade", "websocket").with_header("Connection", "Upgrade").with_header("Sec-WebSocket-Accept", accept))
}

/// Interprets a hybi-00 `Sec-WebSocket-Key{1,2}` value as "the digits,
/// concatenated, divided by the number of spaces" — `get_value_from_key` in
/// the source.
fn v0_key_value(key: &str) -> Result<u32> {
    let digits: String = key.chars().filter(char::is_ascii_digit).collect();
    let spaces = key.chars().filter(|c| *c == ' ').count();
    if spaces == 0 || digits.is_empty() {
        return Err(EvdError::new(ErrorKind::InvalidData, "malformed Sec-WebSocket-Key"));
    }
    let number: u64 = digits.parse().map_err(|_| EvdError::new(ErrorKind::InvalidData, "malformed Sec-WebSocket-Key"))?;
    Ok((number / spaces as u64) as u32)
}

fn v0_digest(key1: &str, key2: &str, body: &[u8; 8]) -> Result<[u8; 16]> {
    let value1 = v0_key_value(key1)?;
    let value2 = v0_key_value(key2)?;
    let mut hasher = Md5::new();
    hasher.update(value1.to_be_bytes());
    hasher.update(value2.to_be_bytes());
    hasher.update(body);
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Validates the request and builds the `101 WebSocket Upgrade` response
/// with its 16-byte MD5 body. `body` is the 8 bytes read from the request
/// body (after the header block, per the v0 handshake's ad hoc framing);
/// `secure` selects the `ws`/`wss` scheme for `Sec-WebSocket-Location`.
pub fn build_v0_handshake_response(request: &HttpRequestHead, body: &[u8; 8], secure: bool) -> Result<HttpResponseHead> {
    if request.header("Upgrade") != Some("WebSocket") || request.header("Connection") != Some("Upgrade") {
        return Err(EvdError::new(ErrorKind::ProtocolViolation, "missing or invalid Upgrade/Connection headers"));
    }
    let key1 = request.header("Sec-WebSocket-Key1").ok_or_else(|| EvdError::new(ErrorKind::InvalidData, "missing Sec-WebSocket-Key1"))?;
    let key2 = request.header("Sec-WebSocket-Key2").ok_or_else(|| EvdError::new(ErrorKind::InvalidData, "missing Sec-WebSocket-Key2"))?;
    let digest = v0_digest(key1, key2, body)?;

    let host = request.header("Host").unwrap_or("");
    let scheme = if secure { "wss" } else { "ws" };
    let location = format!("{scheme}://{host}{}", request.target);
    let origin = request.header("Origin").unwrap_or("").to_string();

    Ok(HttpResponseHead::new(101, "WebSocket Upgrade")
        .with_header("Upgrade", "WebSocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Origin", origin)
        .with_header("Sec-WebSocket-Location", location)
        .with_body(digest.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(headers: &[(&str, &str)]) -> HttpRequestHead {
        HttpRequestHead {
            method: "GET".into(),
            target: "/ws".into(),
            version: "HTTP/1.1".into(),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn v8_handshake_computes_known_accept_key() {
        // RFC 6455 §1.3 worked example.
        let request = req(&[("Upgrade", "websocket"), ("Connection", "Upgrade"), ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")]);
        let resp = build_v8_handshake_response(&request).unwrap();
        assert_eq!(resp.headers.iter().find(|(k, _)| k == "Sec-WebSocket-Accept").map(|(_, v)| v.as_str()), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn v8_round_trip_text_frame_client_to_server() {
        let mut client = WebSocketSession::new(WsVersion::V8, false);
        let mut server = WebSocketSession::new(WsVersion::V8, true);

        let frame_bytes = client.send_text(b"Hello").unwrap();
        // Client frames are masked: the raw bytes must not contain the
        // plaintext payload verbatim.
        assert!(!frame_bytes.windows(5).any(|w| w == b"Hello"));

        let result = server.feed(&frame_bytes).unwrap();
        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.frames[0].data, b"Hello");
        assert!(!result.frames[0].is_binary);
    }

    #[test]
    fn v8_ping_gets_auto_pong_without_surfacing_a_frame() {
        let mut client = WebSocketSession::new(WsVersion::V8, false);
        let mut server = WebSocketSession::new(WsVersion::V8, true);
        let ping = client.build_frame(true, 0x9, true, b"abc");
        let result = server.feed(&ping).unwrap();
        assert!(result.frames.is_empty());
        assert_eq!(result.outgoing[0] & 0x0F, 0xA);
    }

    #[test]
    fn v8_close_frame_triggers_peer_closed_and_echo() {
        let mut client = WebSocketSession::new(WsVersion::V8, false);
        let mut server = WebSocketSession::new(WsVersion::V8, true);
        let close = client.send_close();
        let result = server.feed(&close).unwrap();
        assert!(result.peer_closed);
        assert!(!result.outgoing.is_empty());
        assert!(server.is_closed());
    }

    #[test]
    fn v8_payload_over_fragment_size_splits_into_continuations() {
        let mut client = WebSocketSession::new(WsVersion::V8, false);
        let payload = vec![0xABu8; (MAX_FRAGMENT_SIZE as usize) + 10];
        let frames = client.send_fragmented(0x2, &payload);
        // First byte's opcode nibble is 0x2 and FIN unset (more fragments follow).
        assert_eq!(frames[0] & 0x0F, 0x2);
        assert_eq!(frames[0] & 0x80, 0);
    }

    #[test]
    fn v0_handshake_computes_md5_digest() {
        let request = req(&[("Upgrade", "WebSocket"), ("Connection", "Upgrade"), ("Sec-WebSocket-Key1", "4 @1  46546xW%0l 1 5"), ("Sec-WebSocket-Key2", "12998 5 Y3 1  .P00"), ("Host", "example.com"), ("Origin", "http://example.com")]);
        let body = *b"^n:ds[4U";
        let resp = build_v0_handshake_response(&request, &body, false).unwrap();
        assert_eq!(resp.status, 101);
        assert_eq!(resp.body.len(), 16);
        assert_eq!(resp.headers.iter().find(|(k, _)| k == "Sec-WebSocket-Location").map(|(_, v)| v.as_str()), Some("ws://example.com/ws"));
    }

    #[test]
    fn v0_text_frame_round_trips() {
        let mut client = WebSocketSession::new(WsVersion::V0, false);
        let mut server = WebSocketSession::new(WsVersion::V0, true);
        let frame = client.send_text(b"hi").unwrap();
        let result = server.feed(&frame).unwrap();
        assert_eq!(result.frames[0].data, b"hi");
    }

    #[test]
    fn v0_binary_send_is_not_supported() {
        let mut client = WebSocketSession::new(WsVersion::V0, false);
        assert_eq!(client.send_binary(b"x").unwrap_err().kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn v0_close_frame_sets_peer_closed() {
        let mut client = WebSocketSession::new(WsVersion::V0, false);
        let mut server = WebSocketSession::new(WsVersion::V0, true);
        let close = client.send_close();
        let result = server.feed(&close).unwrap();
        assert!(result.peer_closed);
    }

    #[test]
    fn feed_handles_frame_split_across_calls() {
        let mut client = WebSocketSession::new(WsVersion::V8, false);
        let mut server = WebSocketSession::new(WsVersion::V8, true);
        let frame = client.send_text(b"split-me").unwrap();
        let mid = frame.len() / 2;
        let r1 = server.feed(&frame[..mid]).unwrap();
        assert!(r1.frames.is_empty());
        let r2 = server.feed(&frame[mid..]).unwrap();
        assert_eq!(r2.frames[0].data, b"split-me");
    }
}
