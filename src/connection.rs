//! Owns a [`Socket`], the stream filter chain sitting on top of it, close
//! locking, and the `starttls`/`flush_and_shutdown` choreography.
//!
//! # Why
//! `Socket`, `Connection` and the stream chain would naturally form a
//! reference cycle (the streams need to call back into the connection to
//! re-arm the poller; the connection owns the streams). Resolved the way the
//! reactor already resolves `Poller`↔`Registration`↔`Context`: the
//! connection is the sole *owner* of its socket and streams, and the streams
//! only ever hold a weak handle back, built with `Arc::new_cyclic` so the
//! callbacks can be wired at construction time instead of in a second pass.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::{ContextHandle, Priority};
use crate::error::{EvdError, ErrorKind, Result};
use crate::poller::{Condition, Poller};
use crate::promise::{Cancellable, Deferred, Promise};
use crate::socket::{Socket, SocketState};
use crate::stream::buffered::{BufferedInputStream, BufferedOutputStream};
use crate::stream::socket_stream::{SocketInputStream, SocketOutputStream};
use crate::stream::throttled::{ThrottledInputStream, ThrottledOutputStream};
#[cfg(feature = "tls")]
use crate::stream::tls::{Direction as TlsDirection, HandshakeStatus, TlsOverlay, TlsSession};
use crate::stream::{Readable, Writable};
use crate::throttle::ThrottleSet;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub buffer_target_size: usize,
    pub buffer_auto_grow: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_target_size: 64 * 1024,
            buffer_auto_grow: true,
        }
    }
}

#[cfg(feature = "tls")]
pub enum TlsMode {
    Client { config: Arc<rustls::ClientConfig>, server_name: rustls_pki_types::ServerName<'static> },
    Server { config: Arc<rustls::ServerConfig> },
}

type ConditionCb = Box<dyn FnMut(Condition) + Send>;
type CloseCb = Box<dyn FnMut() + Send>;

struct Inner {
    socket: Socket,
    poller: Poller,
    context: ContextHandle,
    priority: Priority,
    input: Option<BufferedInputStream<Box<dyn Readable>>>,
    output: Option<BufferedOutputStream<Box<dyn Writable>>>,
    condition: Condition,
    close_lock: u32,
    delayed_close: bool,
    closed: bool,
    tls_active: bool,
    config: ConnectionConfig,
    on_condition: Option<ConditionCb>,
    on_close: Option<CloseCb>,
    #[cfg(feature = "tls")]
    pending_starttls: Option<PendingStartTls>,
}

#[cfg(feature = "tls")]
struct PendingStartTls {
    overlay: TlsOverlay<Box<dyn Readable>, Box<dyn Writable>>,
    deferred: Deferred<()>,
}

/// A connection handle. Cheap to clone; clones share the same underlying
/// socket, chain and close-lock state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<Inner>>,
}

impl Connection {
    /// Takes ownership of `socket`, which must already be `Connected` (e.g.
    /// fresh from `Socket::connect`'s resolved promise, or handed to a
    /// listener's new-connection callback), and assembles the filter chain
    /// on top of it.
    pub fn new(socket: Socket, poller: Poller, context: ContextHandle, throttles: ThrottleSet, config: ConnectionConfig) -> Result<Self> {
        if socket.state() != SocketState::Connected {
            return Err(EvdError::new(ErrorKind::InvalidArgument, "connection requires an already-connected socket"));
        }
        socket.start_watching(&poller, context.clone())?;

        let arc: Arc<Mutex<Inner>> = Arc::new_cyclic(|weak: &Weak<Mutex<Inner>>| {
            let socket_in = SocketInputStream::new(socket.clone());
            let socket_out = SocketOutputStream::new(socket.clone());

            let throttled_in = ThrottledInputStream::new(socket_in, throttles.clone());
            let throttled_out = ThrottledOutputStream::new(socket_out, throttles);

            let boxed_in: Box<dyn Readable> = Box::new(throttled_in);
            let boxed_out: Box<dyn Writable> = Box::new(throttled_out);

            let mut input = BufferedInputStream::new(boxed_in);
            let mut output = BufferedOutputStream::new(boxed_out, config.buffer_target_size, config.buffer_auto_grow);
            output.set_auto_flush(true);
            input.unfreeze();

            let w = weak.clone();
            socket.set_notify_condition_callback(move |cond| {
                if let Some(inner) = w.upgrade() {
                    Connection::handle_condition(&inner, cond);
                }
            });
            let w = weak.clone();
            socket.set_close_callback(move || {
                if let Some(inner) = w.upgrade() {
                    Connection::handle_socket_closed(&inner);
                }
            });

            Mutex::new(Inner {
                socket,
                poller,
                context,
                priority: Priority::DEFAULT,
                input: Some(input),
                output: Some(output),
                condition: Condition::NONE,
                close_lock: 0,
                delayed_close: false,
                closed: false,
                tls_active: false,
                config,
                on_condition: None,
                on_close: None,
                #[cfg(feature = "tls")]
                pending_starttls: None,
            })
        });

        Ok(Self { inner: arc })
    }

    pub fn set_on_condition<F: FnMut(Condition) + Send + 'static>(&self, f: F) {
        self.inner.lock().on_condition = Some(Box::new(f));
    }

    pub fn set_on_close<F: FnMut() + Send + 'static>(&self, f: F) {
        self.inner.lock().on_close = Some(Box::new(f));
    }

    pub fn condition(&self) -> Condition {
        self.inner.lock().condition
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// A stable identifier for this connection's shared state, stable across
    /// clones of the same handle. Used by the connection pool to find a
    /// specific connection in its `ready` queue without requiring `Eq`.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Read through the full inbound chain. `WouldBlock` means "no data
    /// right now," not an error; the caller learns about the next readable
    /// edge through [`Connection::set_on_condition`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.inner.lock();
        let input = guard.input.as_mut().ok_or_else(EvdError::closed)?;
        input.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut guard = self.inner.lock();
        let output = guard.output.as_mut().ok_or_else(EvdError::closed)?;
        output.write(buf)
    }

    pub fn flush(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let output = guard.output.as_mut().ok_or_else(EvdError::closed)?;
        output.flush()
    }

    /// Increments the close-lock counter. While locked, a HUP edge only sets
    /// `delayed_close` instead of tearing the connection down immediately.
    pub fn lock_close(&self) {
        self.inner.lock().close_lock += 1;
    }

    /// Decrements the close-lock counter; if it drops to zero and a close
    /// was deferred while locked, performs it now.
    pub fn unlock_close(&self) {
        let should_close = {
            let mut guard = self.inner.lock();
            guard.close_lock = guard.close_lock.saturating_sub(1);
            guard.close_lock == 0 && guard.delayed_close
        };
        if should_close {
            self.close();
        }
    }

    /// Idempotent; the underlying socket's own idempotence guarantees the
    /// close callback fires at most once per open/close cycle.
    pub fn close(&self) {
        let (poller, socket, already_closed) = {
            let mut guard = self.inner.lock();
            let already = guard.closed;
            guard.closed = true;
            guard.delayed_close = false;
            (guard.poller.clone(), guard.socket.clone(), already)
        };
        if already_closed {
            return;
        }
        socket.close(&poller);
    }

    /// Flushes the outermost output stream; on completion, closes the TLS
    /// session if one is active, then shuts down both socket halves. §4.6.
    pub fn flush_and_shutdown(&self) -> Promise<()> {
        let context = self.inner.lock().context.clone();
        let (deferred, promise) = Deferred::new(context.clone());
        let this = self.clone();
        match self.flush() {
            Ok(()) => this.finish_shutdown(deferred),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                // Re-poll on every condition edge until the buffer drains.
                let pending = Arc::new(Mutex::new(Some(deferred)));
                let p2 = pending.clone();
                let inner_for_retry = this.clone();
                self.set_on_condition(move |_cond| {
                    if p2.lock().is_none() {
                        return;
                    }
                    match inner_for_retry.flush() {
                        Ok(()) => {
                            if let Some(d) = p2.lock().take() {
                                inner_for_retry.finish_shutdown(d);
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                        Err(e) => {
                            if let Some(d) = p2.lock().take() {
                                d.reject(e);
                            }
                        }
                    }
                });
            }
            Err(e) => deferred.reject(e),
        }
        promise
    }

    fn finish_shutdown(&self, deferred: Deferred<()>) {
        #[cfg(feature = "tls")]
        {
            let mut guard = self.inner.lock();
            if guard.tls_active {
                if let Some(output) = guard.output.as_mut() {
                    let _ = output.flush();
                }
                guard.tls_active = false;
            }
        }
        let socket = self.inner.lock().socket.clone();
        let _ = socket.shutdown(std::net::Shutdown::Both);
        deferred.resolve(());
    }

    fn handle_condition(inner: &Arc<Mutex<Inner>>, cond: Condition) {
        let (cb, hup_while_locked, should_close) = {
            let mut guard = inner.lock();
            guard.condition = guard.condition | cond;
            let hup_while_locked = cond.contains(Condition::HUP) && guard.close_lock > 0;
            if hup_while_locked {
                guard.delayed_close = true;
            }
            let should_close = cond.contains(Condition::HUP) && guard.close_lock == 0;
            if let Some(output) = guard.output.as_mut() {
                output.on_writable();
            }
            (guard.on_condition.take(), hup_while_locked, should_close)
        };
        if let Some(mut cb) = cb {
            cb(cond);
            inner.lock().on_condition = Some(cb);
        }
        if should_close {
            let context = inner.lock().context.clone();
            let w = Arc::downgrade(inner);
            context.post_idle(move || {
                if let Some(inner) = w.upgrade() {
                    let conn = Connection { inner };
                    conn.close();
                }
            });
        }
    }

    fn handle_socket_closed(inner: &Arc<Mutex<Inner>>) {
        let cb = {
            let mut guard = inner.lock();
            guard.closed = true;
            guard.on_close.take()
        };
        if let Some(mut cb) = cb {
            cb();
            inner.lock().on_close = Some(cb);
        }
    }

    /// Splices a TLS session between the throttled and buffered layers:
    /// freezes the current buffered input, rebuilds the buffered pair on
    /// top of the TLS streams with auto-flush disabled, and drives the
    /// handshake on every subsequent condition edge until it completes.
    #[cfg(feature = "tls")]
    pub fn starttls(&self, mode: TlsMode) -> Result<Promise<()>> {
        let session = match mode {
            TlsMode::Client { config, server_name } => TlsSession::new_client(config, server_name)?,
            TlsMode::Server { config } => TlsSession::new_server(config)?,
        };

        let promise = {
            let mut guard = self.inner.lock();
            if let Some(input) = guard.input.as_mut() {
                input.freeze();
            }
            let old_in = guard.input.take().ok_or_else(EvdError::closed)?.into_base();
            let old_out = guard.output.take().ok_or_else(EvdError::closed)?.into_base();
            let overlay = TlsOverlay::new(session, old_in, old_out);
            let (deferred, promise) = Deferred::new(guard.context.clone());
            guard.pending_starttls = Some(PendingStartTls { overlay, deferred });
            promise
        };

        self.drive_starttls();
        // Re-drive on every condition edge until the handshake converges.
        let this = self.clone();
        self.set_on_condition(move |_cond| this.drive_starttls());

        Ok(promise)
    }

    #[cfg(feature = "tls")]
    fn drive_starttls(&self) {
        let mut guard = self.inner.lock();
        let done = {
            let pending = match guard.pending_starttls.as_mut() {
                Some(p) => p,
                None => return,
            };
            match pending.overlay.drive_handshake() {
                Ok(HandshakeStatus::Done) => true,
                Ok(HandshakeStatus::InProgress) => false,
                Err(e) => {
                    let pending = guard.pending_starttls.take().unwrap();
                    pending.deferred.reject(e);
                    return;
                }
            }
        };
        if !done {
            return;
        }
        let pending = guard.pending_starttls.take().unwrap();
        let (tls_in, tls_out) = pending.overlay.into_streams();
        let boxed_in: Box<dyn Readable> = Box::new(tls_in);
        let boxed_out: Box<dyn Writable> = Box::new(tls_out);

        let mut input = BufferedInputStream::new(boxed_in);
        let mut output = BufferedOutputStream::new(boxed_out, guard.config.buffer_target_size, guard.config.buffer_auto_grow);
        output.set_auto_flush(true);
        input.unfreeze();

        guard.input = Some(input);
        guard.output = Some(output);
        guard.tls_active = true;
        pending.deferred.resolve(());
    }

    #[cfg(feature = "tls")]
    fn socket_set_tls_handshaking(&self) {
        // The socket's own state machine is driven by connect/listen/accept;
        // TLS handshaking state is tracked at the connection level only, so
        // there is deliberately nothing to mutate on `socket` here beyond
        // what `starttls` already does through the stream chain.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    fn connected_pair() -> (Socket, Socket) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (
            Socket::from_connected(socket2::Socket::from(a), crate::socket::SocketConfig::default()),
            Socket::from_connected(socket2::Socket::from(b), crate::socket::SocketConfig::default()),
        )
    }

    #[test]
    fn write_then_read_round_trips_through_the_full_chain() {
        let poller = Poller::new().unwrap();
        let poller_handle = poller.start();
        let mut ctx = Context::new();

        let (sa, sb) = connected_pair();
        let conn_a = Connection::new(sa, poller.clone(), ctx.handle(), ThrottleSet::new(), ConnectionConfig::default()).unwrap();
        let conn_b = Connection::new(sb, poller.clone(), ctx.handle(), ThrottleSet::new(), ConnectionConfig::default()).unwrap();

        conn_a.write(b"ping").unwrap();
        conn_a.flush().unwrap();

        let mut buf = [0u8; 16];
        let mut n = 0;
        for _ in 0..50 {
            ctx.run_once();
            match conn_b.read(&mut buf) {
                Ok(read) if read > 0 => {
                    n = read;
                    break;
                }
                _ => std::thread::sleep(std::time::Duration::from_millis(5)),
            }
        }
        assert_eq!(&buf[..n], b"ping");
        poller_handle.stop();
    }

    #[test]
    fn close_lock_defers_hup_until_unlocked() {
        let poller = Poller::new().unwrap();
        let poller_handle = poller.start();
        let ctx = Context::new();

        let (sa, sb) = connected_pair();
        let conn_a = Connection::new(sa, poller.clone(), ctx.handle(), ThrottleSet::new(), ConnectionConfig::default()).unwrap();
        let _conn_b = Connection::new(sb, poller.clone(), ctx.handle(), ThrottleSet::new(), ConnectionConfig::default()).unwrap();

        conn_a.lock_close();
        let closed = StdArc::new(AtomicBool::new(false));
        let c2 = closed.clone();
        conn_a.set_on_close(move || c2.store(true, Ordering::SeqCst));

        Connection::handle_condition(&conn_a.inner, Condition::HUP);
        assert!(!closed.load(Ordering::SeqCst));
        assert!(conn_a.inner.lock().delayed_close);

        conn_a.unlock_close();
        assert!(conn_a.inner.lock().closed);
        poller_handle.stop();
    }
}
