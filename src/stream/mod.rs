//! Composable input/output stream filters.
//!
//! # Why
//! Every connection in this crate reads and writes through the same layered
//! pipeline — raw socket, then throttle, then (optionally) TLS, then a
//! buffering tail — and each layer only needs to know how to pull from or
//! push to the layer directly beneath it. Two small traits let `Connection`
//! assemble the chain as a stack of boxed trait objects instead of hooking
//! each concrete pair together by hand, while keeping the fixed
//! "base-first" shape the source assembles rather than reintroducing a
//! general composable-middleware abstraction this crate doesn't need.
//!
//! # What
//! [`Readable::read`]/[`Writable::write`] return `Err` with
//! [`ErrorKind::WouldBlock`](crate::error::ErrorKind::WouldBlock) instead of
//! `0`/spin — suspension is always explicit, per §5. Layers that need to
//! tell their owner "re-arm me" (drained/filled/delay-read/delay-write) take
//! a callback at construction rather than returning it out-of-band, mirroring
//! the source's single-owner signal convention (§9).

pub mod buffered;
pub mod socket_stream;
pub mod throttled;
#[cfg(feature = "tls")]
pub mod tls;

use crate::error::Result;

/// One direction of a stream filter: pull bytes from whatever is beneath it.
pub trait Readable: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// One direction of a stream filter: push bytes to whatever is beneath it.
pub trait Writable: Send {
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
}
