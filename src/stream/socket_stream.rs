//! The base layer of the chain: reads and writes straight against the fd.
//!
//! # How
//! `SocketInputStream` keeps one stashed look-ahead byte so it can detect
//! EOF (or a short read) without an extra syscall on the *next* call: each
//! read asks the socket for one more byte than the caller wants, and if that
//! extra byte actually arrives it is stashed rather than handed back early.
//! `SocketOutputStream` turns `EAGAIN` into a successful zero-length write,
//! per §4.5 — backpressure is signalled through the `filled` callback, not
//! through an error.

use crate::error::{EvdError, ErrorKind, Result};
use crate::socket::Socket;
use crate::stream::{Readable, Writable};

type VoidCb = Box<dyn FnMut() + Send>;

pub struct SocketInputStream {
    socket: Socket,
    stash: Option<u8>,
    drained_cb: Option<VoidCb>,
}

impl SocketInputStream {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            stash: None,
            drained_cb: None,
        }
    }

    /// Fired when the last read came back short of what was asked (EOF or
    /// `WouldBlock`) — the owner's cue to clear the Read bit and wait for
    /// the next readable edge.
    pub fn on_drained<F: FnMut() + Send + 'static>(&mut self, f: F) {
        self.drained_cb = Some(Box::new(f));
    }
}

impl Readable for SocketInputStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut out = 0;
        if let Some(b) = self.stash.take() {
            buf[0] = b;
            out = 1;
            if buf.len() == 1 {
                return Ok(1);
            }
        }

        let remaining = buf.len() - out;
        let want = remaining + 1;
        let mut lookahead = vec![0u8; want];
        match self.socket.read(&mut lookahead) {
            Ok(n) if n == want => {
                buf[out..out + remaining].copy_from_slice(&lookahead[..remaining]);
                self.stash = Some(lookahead[remaining]);
                Ok(out + remaining)
            }
            Ok(n) => {
                buf[out..out + n].copy_from_slice(&lookahead[..n]);
                if let Some(cb) = &mut self.drained_cb {
                    cb();
                }
                Ok(out + n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if out > 0 {
                    Ok(out)
                } else {
                    if let Some(cb) = &mut self.drained_cb {
                        cb();
                    }
                    Err(EvdError::would_block())
                }
            }
            Err(e) => Err(EvdError::from_io(e)),
        }
    }
}

pub struct SocketOutputStream {
    socket: Socket,
    filled_cb: Option<VoidCb>,
}

impl SocketOutputStream {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            filled_cb: None,
        }
    }

    /// Fired when the underlying write would have blocked — the owner's cue
    /// to clear the Write bit and wait for the next writable edge.
    pub fn on_filled<F: FnMut() + Send + 'static>(&mut self, f: F) {
        self.filled_cb = Some(Box::new(f));
    }
}

impl Writable for SocketOutputStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.socket.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if let Some(cb) = &mut self.filled_cb {
                    cb();
                }
                Ok(0)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Err(EvdError::new(ErrorKind::NotConnected, "socket not connected")),
            Err(e) => Err(EvdError::from_io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn write_translates_eagain_to_zero_and_fires_filled() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let raw = socket2::Socket::from(a);
        let socket = Socket::from_connected(raw, crate::socket::SocketConfig::default());
        let mut out = SocketOutputStream::new(socket);
        let filled = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f2 = filled.clone();
        out.on_filled(move || f2.store(true, std::sync::atomic::Ordering::SeqCst));

        // Fill the send buffer by writing until it would block.
        let big = vec![0xAAu8; 1 << 20];
        loop {
            match out.write(&big) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(filled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn read_stashes_lookahead_byte_across_calls() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut writer = b;
        writer.write_all(b"hello").unwrap();

        let raw = socket2::Socket::from(a);
        let socket = Socket::from_connected(raw, crate::socket::SocketConfig::default());
        let mut input = SocketInputStream::new(socket);

        let mut buf = [0u8; 2];
        let n = input.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"he");
        let mut buf2 = [0u8; 10];
        let n2 = input.read(&mut buf2).unwrap();
        assert_eq!(&buf2[..n2], b"llo");
        let _ = writer.flush();
    }
}
