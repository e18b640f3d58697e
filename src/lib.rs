//! A peer-to-peer IPC framework built around an edge-triggered reactor: a
//! single-threaded [`Context`](context::Context) event loop driven by a
//! `poller`, non-blocking [`Socket`](socket::Socket)s promoted into
//! [`Connection`](connection::Connection)s wrapping a composable
//! [`stream`] filter chain, [`pool`]ed and [`group`]ed collections of
//! connections, and [`json_filter`]/[`websocket`] framing on top.
//!
//! # Layout
//! - [`poller`] — `epoll` wrapper with a self-pipe to interrupt a blocked wait.
//! - [`context`] — the cooperative event loop and its cross-thread handle.
//! - [`promise`] — the `Deferred`/`Promise` async result pair every
//!   asynchronous operation in this crate resolves through.
//! - [`address`] — parsed/resolved peer addresses.
//! - [`socket`] — the non-blocking socket state machine.
//! - [`stream`] — the `Readable`/`Writable` filter chain (throttle, TLS, buffering).
//! - [`connection`] — a socket promoted to a stream-backed, throttled peer.
//! - [`pool`] — a grow/shrink pool of pre-connected connections to one address.
//! - [`group`] — a throttle-sharing, broadcastable collection of connections.
//! - [`throttle`] — token-bucket rate/latency limiting shared by streams and groups.
//! - [`json_filter`] — incremental JSON value tokenization over a byte stream.
//! - [`http`] — the minimal header-block reader/writer the WebSocket handshakes ride on.
//! - [`websocket`] — hybi-00 and RFC 6455 framing and handshake negotiation.
//! - [`error`] — the crate-wide `EvdError`/`ErrorKind`/`codes` error model.

pub mod address;
pub mod connection;
pub mod context;
pub mod error;
pub mod group;
pub mod http;
pub mod json_filter;
pub mod poller;
pub mod pool;
pub mod promise;
pub mod socket;
pub mod stream;
pub mod throttle;
pub mod websocket;

pub use connection::{Connection, ConnectionConfig};
pub use context::{Context, ContextHandle};
pub use error::{EvdError, ErrorKind, Result};
pub use group::ConnectionGroup;
pub use poller::{Poller, PollerHandle};
pub use pool::{ConnectionPool, PoolConfig};
pub use promise::{Deferred, Promise};
pub use socket::{Socket, SocketConfig, SocketState};
