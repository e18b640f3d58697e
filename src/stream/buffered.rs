//! Buffering tail of the outbound chain, and a thin freeze-capable wrapper
//! for the inbound side. §3/§4.5.

use std::collections::VecDeque;

use crate::context::ContextHandle;
use crate::error::{EvdError, ErrorKind, Result};
use crate::promise::{Deferred, Promise};
use crate::stream::{Readable, Writable};

/// Outbound tail buffer. In auto-flush mode a write against an empty buffer
/// passes straight through to the base stream; everything that doesn't fit
/// is queued and drained FIFO by [`BufferedOutputStream::flush`].
pub struct BufferedOutputStream<W> {
    base: W,
    tail: VecDeque<u8>,
    target_size: usize,
    auto_grow: bool,
    auto_flush: bool,
    pending_flush: Option<Deferred<()>>,
}

impl<W: Writable> BufferedOutputStream<W> {
    pub fn new(base: W, target_size: usize, auto_grow: bool) -> Self {
        Self {
            base,
            tail: VecDeque::new(),
            target_size,
            auto_grow,
            auto_flush: false,
            pending_flush: None,
        }
    }

    pub fn set_auto_flush(&mut self, auto_flush: bool) {
        self.auto_flush = auto_flush;
    }

    pub fn buffered_len(&self) -> usize {
        self.tail.len()
    }

    /// Synchronous write: in auto-flush mode with an empty buffer, pass
    /// through to the base and buffer only the unwritten remainder; in
    /// non-auto-flush mode, always append to the buffer.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.auto_flush && self.tail.is_empty() {
            match self.base.write(buf) {
                Ok(n) if n == buf.len() => Ok(n),
                Ok(n) => {
                    self.tail.extend(&buf[n..]);
                    Ok(buf.len())
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.tail.extend(buf);
                    Ok(buf.len())
                }
                Err(e) => Err(e),
            }
        } else {
            self.tail.extend(buf);
            Ok(buf.len())
        }
    }

    /// Async write: rejects with `WouldBlock` rather than silently dropping
    /// the unwritten tail when the buffer is at `target_size` with
    /// auto-grow disabled — the resolution of the source's open TODO, §9.
    pub fn write_async(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.auto_grow && self.tail.len() + buf.len() > self.target_size && !(self.auto_flush && self.tail.is_empty()) {
            return Err(EvdError::would_block());
        }
        self.write(buf)
    }

    /// Drains the buffer head-first into the base stream. On a short write
    /// the remainder stays head-aligned and `WouldBlock` is returned so the
    /// caller knows to retry on the next write edge.
    pub fn flush(&mut self) -> Result<()> {
        while !self.tail.is_empty() {
            let (slice_a, slice_b) = self.tail.as_slices();
            let contiguous: Vec<u8> = if slice_b.is_empty() {
                slice_a.to_vec()
            } else {
                let mut v = Vec::with_capacity(self.tail.len());
                v.extend_from_slice(slice_a);
                v.extend_from_slice(slice_b);
                v
            };
            match self.base.write(&contiguous) {
                Ok(n) if n == contiguous.len() => {
                    self.tail.clear();
                }
                Ok(n) => {
                    self.tail.drain(..n);
                    return Err(EvdError::would_block());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Asynchronous flush; completes immediately if the buffer drains right
    /// away, otherwise completes on a later [`BufferedOutputStream::on_writable`].
    pub fn flush_async(&mut self, context: ContextHandle) -> Promise<()> {
        let (deferred, promise) = Deferred::new(context);
        match self.flush() {
            Ok(()) => deferred.resolve(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => self.pending_flush = Some(deferred),
            Err(e) => deferred.reject(e),
        }
        promise
    }

    /// Retry a pending async flush on a writable edge from the base stream.
    pub fn on_writable(&mut self) {
        if self.pending_flush.is_none() {
            return;
        }
        match self.flush() {
            Ok(()) => {
                if let Some(d) = self.pending_flush.take() {
                    d.resolve(());
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                if let Some(d) = self.pending_flush.take() {
                    d.reject(e);
                }
            }
        }
    }

    pub fn into_base(self) -> W {
        self.base
    }
}

/// Inbound freeze-capable passthrough, used to stall reads while a TLS
/// handshake overlay is being spliced in.
pub struct BufferedInputStream<R> {
    base: R,
    frozen: bool,
}

impl<R: Readable> BufferedInputStream<R> {
    pub fn new(base: R) -> Self {
        Self { base, frozen: false }
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn into_base(self) -> R {
        self.base
    }
}

impl<R: Readable> Readable for BufferedInputStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.frozen {
            return Err(EvdError::would_block());
        }
        self.base.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Vec<u8>, usize);
    impl Writable for Recorder {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            let n = buf.len().min(self.1);
            self.0.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    #[test]
    fn auto_flush_passthrough_on_empty_buffer() {
        let mut out = BufferedOutputStream::new(Recorder(Vec::new(), usize::MAX), 4096, true);
        out.set_auto_flush(true);
        let n = out.write(b"hello").unwrap();
        assert_eq!(n, 5);
        assert_eq!(out.buffered_len(), 0);
    }

    #[test]
    fn non_auto_flush_always_buffers() {
        let mut out = BufferedOutputStream::new(Recorder(Vec::new(), usize::MAX), 4096, true);
        out.write(b"hello").unwrap();
        assert_eq!(out.buffered_len(), 5);
    }

    #[test]
    fn flush_keeps_short_write_remainder_head_aligned() {
        let mut out = BufferedOutputStream::new(Recorder(Vec::new(), 3), 4096, true);
        out.write(b"hello").unwrap();
        let err = out.flush().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert_eq!(out.buffered_len(), 2);
    }

    #[test]
    fn write_async_rejects_when_buffer_full_and_not_auto_grow() {
        let mut out = BufferedOutputStream::new(Recorder(Vec::new(), 0), 4, false);
        out.write(&[0u8; 4]).unwrap();
        let err = out.write_async(&[0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn frozen_input_would_block() {
        struct Always5;
        impl Readable for Always5 {
            fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
                buf[0] = 5;
                Ok(1)
            }
        }
        let mut input = BufferedInputStream::new(Always5);
        input.freeze();
        assert_eq!(input.read(&mut [0u8; 1]).unwrap_err().kind(), ErrorKind::WouldBlock);
        input.unfreeze();
        assert_eq!(input.read(&mut [0u8; 1]).unwrap(), 1);
    }
}
