//! Cross-cutting error type.
//!
//! # Why
//! Every fallible operation in this crate — poller registration, socket I/O,
//! JSON/WebSocket framing, pool exhaustion — needs to surface through the
//! same `Promise<T, EvdError>` shape so callers can match on a stable code
//! rather than downcast a grab-bag of library error types.
//!
//! # How
//! One struct, not an enum-per-kind: a `&'static str` code in a `domain.reason`
//! convention, a display message, and an optional boxed cause. Leaf modules
//! that need their own small local error enum (the JSON filter, address
//! parsing) keep one and convert it into an `EvdError` at the module boundary.

use std::fmt;
use std::net::SocketAddr;

/// Boxed source error, type-erased so `EvdError` doesn't need a generic parameter.
pub type ErrorCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The abstract error kinds this crate's fallible operations surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Cancelled,
    WouldBlock,
    Closed,
    NotConnected,
    ConnectionRefused,
    InvalidArgument,
    InvalidData,
    NotSupported,
    Busy,
    PollerFull,
    TlsHandshake,
    ProtocolViolation,
    Unknown,
}

impl ErrorKind {
    /// Stable `domain.reason`-style code for this kind, used as the default
    /// code when a module doesn't supply a more specific one.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Cancelled => codes::CANCELLED,
            ErrorKind::WouldBlock => codes::WOULD_BLOCK,
            ErrorKind::Closed => codes::CLOSED,
            ErrorKind::NotConnected => codes::NOT_CONNECTED,
            ErrorKind::ConnectionRefused => codes::CONNECTION_REFUSED,
            ErrorKind::InvalidArgument => codes::INVALID_ARGUMENT,
            ErrorKind::InvalidData => codes::INVALID_DATA,
            ErrorKind::NotSupported => codes::NOT_SUPPORTED,
            ErrorKind::Busy => codes::BUSY,
            ErrorKind::PollerFull => codes::POLLER_FULL,
            ErrorKind::TlsHandshake => codes::TLS_HANDSHAKE,
            ErrorKind::ProtocolViolation => codes::PROTOCOL_VIOLATION,
            ErrorKind::Unknown => codes::UNKNOWN,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Stable error codes, `domain.reason` convention.
pub mod codes {
    pub const CANCELLED: &str = "async.cancelled";
    pub const WOULD_BLOCK: &str = "io.would_block";
    pub const CLOSED: &str = "io.closed";
    pub const NOT_CONNECTED: &str = "socket.not_connected";
    pub const CONNECTION_REFUSED: &str = "socket.connection_refused";
    pub const INVALID_ARGUMENT: &str = "arg.invalid";
    pub const INVALID_DATA: &str = "data.invalid";
    pub const NOT_SUPPORTED: &str = "protocol.not_supported";
    pub const BUSY: &str = "resource.busy";
    pub const POLLER_FULL: &str = "poller.full";
    pub const TLS_HANDSHAKE: &str = "tls.handshake_failed";
    pub const PROTOCOL_VIOLATION: &str = "protocol.violation";
    pub const UNKNOWN: &str = "unknown";
}

/// The crate's error type.
pub struct EvdError {
    kind: ErrorKind,
    code: &'static str,
    message: String,
    cause: Option<ErrorCause>,
    peer_addr: Option<SocketAddr>,
}

impl EvdError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            kind,
            message: message.into(),
            cause: None,
            peer_addr: None,
        }
    }

    /// Override the default per-kind code with a more specific one, e.g.
    /// `"websocket.bad_opcode"` instead of the generic `protocol.violation`.
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = code;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<ErrorCause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn would_block() -> Self {
        Self::new(ErrorKind::WouldBlock, "operation would block")
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn closed() -> Self {
        Self::new(ErrorKind::Closed, "already closed")
    }

    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match err.kind() {
            IoKind::WouldBlock => ErrorKind::WouldBlock,
            IoKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            IoKind::NotConnected => ErrorKind::NotConnected,
            IoKind::InvalidInput | IoKind::InvalidData => ErrorKind::InvalidArgument,
            _ => ErrorKind::Unknown,
        };
        let message = err.to_string();
        Self::new(kind, message).with_cause(err)
    }
}

impl fmt::Debug for EvdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvdError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl fmt::Display for EvdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(addr) = self.peer_addr {
            write!(f, " (peer {addr})")?;
        }
        Ok(())
    }
}

impl std::error::Error for EvdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for EvdError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err)
    }
}

pub type Result<T> = std::result::Result<T, EvdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_code_matches_kind() {
        let e = EvdError::would_block();
        assert_eq!(e.code(), codes::WOULD_BLOCK);
        assert_eq!(e.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn with_code_overrides_default() {
        let e = EvdError::new(ErrorKind::ProtocolViolation, "bad opcode").with_code("websocket.bad_opcode");
        assert_eq!(e.code(), "websocket.bad_opcode");
        assert_eq!(e.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn display_includes_peer_addr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let e = EvdError::new(ErrorKind::ConnectionRefused, "refused").with_peer_addr(addr);
        let s = e.to_string();
        assert!(s.contains("127.0.0.1:9000"));
    }

    #[test]
    fn io_error_maps_would_block() {
        let io_err = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        let e: EvdError = io_err.into();
        assert_eq!(e.kind(), ErrorKind::WouldBlock);
    }
}
