//! Non-blocking stream/datagram socket with an explicit state machine.
//!
//! # Why
//! Every transport in this crate — the raw echo test, the connection pool,
//! the WebSocket server — ultimately drives one of these. The source's
//! `EvdSocket` hides epoll registration, nonblocking connect/accept, and
//! listen behind a single object with a `status` field; this module keeps
//! that shape because the state machine *is* the contract callers rely on
//! (§3's "fd is non-null iff state ∉ {Closed, Resolving}" and friends).
//!
//! # How
//! `Socket` is a cheap handle around `Arc<Mutex<Inner>>` — cheap because the
//! poller's dispatch closure must be `Send + 'static` even though, in
//! practice, it only ever runs on the owning [`Context`](crate::context::Context)'s
//! thread. One poller registration lives for the socket's whole active
//! lifetime; the single dispatch callback looks at `state` to decide whether
//! an edge means "finish accepting," "finish connecting," or "notify the
//! owner," mirroring the source's single `evd_socket_on_condition` handler.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, SockAddr, Type};

use crate::address::{resolve_async, Address};
use crate::context::{ContextHandle, Priority};
use crate::error::{EvdError, ErrorKind};
use crate::poller::{Condition, Poller, Session};
use crate::promise::{Cancellable, Deferred, Promise};

/// Socket-level tunables, a plain `Default`-implementing struct rather than
/// a layered config source — this crate is a library, not a daemon.
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    pub backlog: i32,
    pub linger: Option<Duration>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            backlog: 1024,
            linger: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Resolving,
    Connecting,
    Bound,
    Listening,
    Connected,
    TlsHandshaking,
    Closing,
}

type NewConnectionCb = Box<dyn FnMut(Socket) + Send>;
type NotifyConditionCb = Box<dyn FnMut(Condition) + Send>;
type ErrorCb = Box<dyn FnMut(EvdError) + Send>;
type CloseCb = Box<dyn FnMut() + Send>;

struct Inner {
    state: SocketState,
    raw: Option<socket2::Socket>,
    priority: Priority,
    config: SocketConfig,
    session: Option<Session>,
    connect_deferred: Option<Deferred<()>>,
    listen_deferred: Option<Deferred<()>>,
    new_connection_cb: Option<NewConnectionCb>,
    notify_condition_cb: Option<NotifyConditionCb>,
    error_cb: Option<ErrorCb>,
    close_cb: Option<CloseCb>,
    closed_once: bool,
}

/// A non-blocking socket. Cheap to clone; clones share the same underlying
/// fd and state — callers are expected to keep exactly one logical owner,
/// typically a [`Connection`](crate::connection::Connection).
#[derive(Clone)]
pub struct Socket {
    inner: Arc<Mutex<Inner>>,
}

impl Socket {
    fn new_closed(config: SocketConfig) -> Self {
        Socket {
            inner: Arc::new(Mutex::new(Inner {
                state: SocketState::Closed,
                raw: None,
                priority: Priority::DEFAULT,
                config,
                session: None,
                connect_deferred: None,
                listen_deferred: None,
                new_connection_cb: None,
                notify_condition_cb: None,
                error_cb: None,
                close_cb: None,
                closed_once: false,
            })),
        }
    }

    pub fn new() -> Self {
        Self::new_closed(SocketConfig::default())
    }

    pub fn with_config(config: SocketConfig) -> Self {
        Self::new_closed(config)
    }

    /// Wrap an already-connected raw socket, e.g. one just handed back by
    /// `accept()`. Used internally and by tests that want to drive a
    /// pre-connected pair through the rest of the pipeline.
    pub(crate) fn from_connected(raw: socket2::Socket, config: SocketConfig) -> Self {
        let _ = raw.set_nonblocking(true);
        Socket {
            inner: Arc::new(Mutex::new(Inner {
                state: SocketState::Connected,
                raw: Some(raw),
                priority: Priority::DEFAULT,
                config,
                session: None,
                connect_deferred: None,
                listen_deferred: None,
                new_connection_cb: None,
                notify_condition_cb: None,
                error_cb: None,
                close_cb: None,
                closed_once: false,
            })),
        }
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.lock().raw.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn set_priority(&self, priority: Priority) {
        self.inner.lock().priority = priority;
    }

    pub fn set_notify_condition_callback<F>(&self, f: F)
    where
        F: FnMut(Condition) + Send + 'static,
    {
        self.inner.lock().notify_condition_cb = Some(Box::new(f));
    }

    pub fn set_new_connection_callback<F>(&self, f: F)
    where
        F: FnMut(Socket) + Send + 'static,
    {
        self.inner.lock().new_connection_cb = Some(Box::new(f));
    }

    pub fn set_error_callback<F>(&self, f: F)
    where
        F: FnMut(EvdError) + Send + 'static,
    {
        self.inner.lock().error_cb = Some(Box::new(f));
    }

    /// "close" fires exactly once per open/close cycle even across repeated
    /// calls to [`Socket::close`].
    pub fn set_close_callback<F>(&self, f: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.lock().close_cb = Some(Box::new(f));
    }

    /// Register this already-`Connected` socket for ongoing readiness
    /// notifications. Used both for accepted peers (which start life
    /// `Connected` with no registration of their own) and is a no-op if
    /// already watching.
    pub fn start_watching(&self, poller: &Poller, context: ContextHandle) -> crate::error::Result<()> {
        let mut guard = self.inner.lock();
        if guard.session.is_some() {
            return Ok(());
        }
        let fd = guard.raw.as_ref().ok_or_else(|| EvdError::new(ErrorKind::NotConnected, "socket has no fd"))?.as_raw_fd();
        let priority = guard.priority;
        let handle = self.clone();
        let session = poller.register(fd, Condition::READ | Condition::WRITE, priority, context, move |cond| {
            handle.handle_condition(cond);
        })?;
        guard.session = Some(session);
        Ok(())
    }

    /// `connect(address, cancellable) → Promise<()>` — §4.4. The source
    /// returns `Promise<IoStream>`; here the same `Socket` handle that drove
    /// the connect doubles as the stream once `Connected`, so a unit promise
    /// is the idiomatic equivalent (see `DESIGN.md`).
    pub fn connect(&self, address: &str, poller: Poller, context: ContextHandle, cancellable: Option<Cancellable>) -> crate::error::Result<Promise<()>> {
        let parsed = Address::parse(address)?;
        let (deferred, promise) = Deferred::with_cancellable(context.clone(), cancellable);
        {
            let mut guard = self.inner.lock();
            guard.state = SocketState::Resolving;
            guard.connect_deferred = Some(deferred);
        }

        let handle = self.clone();
        let ctx = context.clone();
        resolve_async(parsed, context, move |resolved| match resolved {
            Ok(addr) => handle.begin_connect(addr, &poller, ctx),
            Err(e) => handle.fail_connect(e),
        });
        Ok(promise)
    }

    fn begin_connect(&self, addr: SocketAddr, poller: &Poller, context: ContextHandle) {
        let domain = Domain::for_address(addr);
        let raw = match socket2::Socket::new(domain, Type::STREAM, None) {
            Ok(s) => s,
            Err(e) => return self.fail_connect(EvdError::from_io(e)),
        };
        if let Err(e) = raw.set_nonblocking(true) {
            return self.fail_connect(EvdError::from_io(e));
        }

        let sock_addr = SockAddr::from(addr);
        match raw.connect(&sock_addr) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.raw_os_error() == Some(libc::ECONNREFUSED) => {
                return self.fail_connect(EvdError::new(ErrorKind::ConnectionRefused, "connection refused").with_peer_addr(addr));
            }
            Err(e) => return self.fail_connect(EvdError::from_io(e)),
        }

        let fd = raw.as_raw_fd();
        {
            let mut guard = self.inner.lock();
            guard.state = SocketState::Connecting;
            guard.raw = Some(raw);
        }

        let priority = self.inner.lock().priority;
        let handle = self.clone();
        let session = match poller.register(fd, Condition::READ | Condition::WRITE, priority, context, move |cond| {
            handle.handle_condition(cond);
        }) {
            Ok(s) => s,
            Err(e) => return self.fail_connect(e),
        };
        self.inner.lock().session = Some(session);
    }

    fn fail_connect(&self, err: EvdError) {
        let deferred = {
            let mut guard = self.inner.lock();
            guard.state = SocketState::Closed;
            guard.connect_deferred.take()
        };
        if let Some(d) = deferred {
            d.reject(err);
        }
    }

    /// `listen(address, cancellable) → Promise<()>` — §4.4.
    pub fn listen(&self, address: &str, poller: Poller, context: ContextHandle, cancellable: Option<Cancellable>) -> crate::error::Result<Promise<()>> {
        let parsed = Address::parse(address)?;
        let (deferred, promise) = Deferred::with_cancellable(context.clone(), cancellable);
        {
            let mut guard = self.inner.lock();
            guard.state = SocketState::Resolving;
            guard.listen_deferred = Some(deferred);
        }

        let handle = self.clone();
        let ctx = context.clone();
        resolve_async(parsed, context, move |resolved| match resolved {
            Ok(addr) => handle.begin_listen(addr, &poller, ctx),
            Err(e) => handle.fail_listen(e),
        });
        Ok(promise)
    }

    fn begin_listen(&self, addr: SocketAddr, poller: &Poller, context: ContextHandle) {
        let domain = Domain::for_address(addr);
        let raw = match socket2::Socket::new(domain, Type::STREAM, None) {
            Ok(s) => s,
            Err(e) => return self.fail_listen(EvdError::from_io(e)),
        };
        if let Err(e) = raw.set_reuse_address(true) {
            return self.fail_listen(EvdError::from_io(e));
        }
        if let Err(e) = raw.set_nonblocking(true) {
            return self.fail_listen(EvdError::from_io(e));
        }
        if let Err(e) = raw.bind(&SockAddr::from(addr)) {
            return self.fail_listen(EvdError::from_io(e));
        }

        let backlog = self.inner.lock().config.backlog;
        if let Err(e) = raw.listen(backlog) {
            return self.fail_listen(EvdError::from_io(e));
        }

        let fd = raw.as_raw_fd();
        {
            let mut guard = self.inner.lock();
            guard.state = SocketState::Listening;
            guard.raw = Some(raw);
        }

        let priority = self.inner.lock().priority;
        let handle = self.clone();
        let session = match poller.register(fd, Condition::READ, priority, context, move |cond| {
            handle.handle_condition(cond);
        }) {
            Ok(s) => s,
            Err(e) => return self.fail_listen(e),
        };
        self.inner.lock().session = Some(session);

        let deferred = self.inner.lock().listen_deferred.take();
        if let Some(d) = deferred {
            d.resolve(());
        }
    }

    fn fail_listen(&self, err: EvdError) {
        let deferred = {
            let mut guard = self.inner.lock();
            guard.state = SocketState::Closed;
            guard.listen_deferred.take()
        };
        if let Some(d) = deferred {
            d.reject(err);
        }
    }

    /// The actual TCP/UDS local port the socket is bound to, useful after
    /// `listen("*:0", ...)` to discover the ephemeral port chosen.
    pub fn local_addr(&self) -> crate::error::Result<SocketAddr> {
        let guard = self.inner.lock();
        let raw = guard.raw.as_ref().ok_or_else(|| EvdError::new(ErrorKind::NotConnected, "no local address"))?;
        raw.local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .ok_or_else(|| EvdError::new(ErrorKind::Unknown, "local address unavailable"))
    }

    fn handle_condition(&self, cond: Condition) {
        let state = self.inner.lock().state;
        match state {
            SocketState::Listening => self.drain_accept(),
            SocketState::Connecting => self.handle_connecting_edge(cond),
            SocketState::Connected | SocketState::TlsHandshaking => {
                let mut guard = self.inner.lock();
                if let Some(cb) = guard.notify_condition_cb.as_mut() {
                    cb(cond);
                }
            }
            SocketState::Closed | SocketState::Closing | SocketState::Bound | SocketState::Resolving => {}
        }
    }

    fn handle_connecting_edge(&self, cond: Condition) {
        if cond.contains(Condition::ERR) {
            return self.fail_connect(EvdError::new(ErrorKind::ConnectionRefused, "connect failed"));
        }
        if !cond.contains(Condition::WRITE) {
            return;
        }
        let err = {
            let guard = self.inner.lock();
            guard.raw.as_ref().and_then(|r| r.take_error().ok().flatten())
        };
        if let Some(e) = err {
            return self.fail_connect(EvdError::from_io(e));
        }
        self.inner.lock().state = SocketState::Connected;
        let deferred = self.inner.lock().connect_deferred.take();
        if let Some(d) = deferred {
            d.resolve(());
        }
    }

    /// Accept in a loop while not would-block; each accepted fd becomes a
    /// `Connected` socket handed to the "new connection" callback. Only
    /// `WouldBlock` is treated as non-fatal; anything else is surfaced on
    /// the error channel rather than silently dropped (§9's last bullet).
    fn drain_accept(&self) {
        loop {
            let (accepted, config) = {
                let guard = self.inner.lock();
                let raw = match guard.raw.as_ref() {
                    Some(r) => r,
                    None => return,
                };
                (raw.accept(), guard.config)
            };
            match accepted {
                Ok((raw, _addr)) => {
                    let _ = raw.set_nonblocking(true);
                    let peer = Socket::from_connected(raw, config);
                    let mut guard = self.inner.lock();
                    if let Some(cb) = guard.new_connection_cb.as_mut() {
                        cb(peer);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let mut guard = self.inner.lock();
                    if let Some(cb) = guard.error_cb.as_mut() {
                        cb(EvdError::from_io(e));
                    } else {
                        tracing::warn!(error = %e, "accept error ignored (no error callback installed)");
                    }
                    break;
                }
            }
        }
    }

    /// Read up to `buf.len()` bytes. `WouldBlock` surfaces as `Err` with
    /// `ErrorKind::WouldBlock`, matching the underlying nonblocking fd.
    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::io::Read;
        let mut guard = self.inner.lock();
        let raw = guard.raw.as_mut().ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        raw.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        use std::io::Write;
        let mut guard = self.inner.lock();
        let raw = guard.raw.as_mut().ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        raw.write(buf)
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> std::io::Result<()> {
        let guard = self.inner.lock();
        match guard.raw.as_ref() {
            Some(raw) => raw.shutdown(how),
            None => Ok(()),
        }
    }

    /// Idempotent; emits "close" exactly once per open/close cycle and
    /// flushes any outstanding async result with `Closed`.
    pub fn close(&self, poller: &Poller) {
        let (session, connect_deferred, listen_deferred, should_emit) = {
            let mut guard = self.inner.lock();
            if guard.state == SocketState::Closed {
                return;
            }
            guard.state = SocketState::Closed;
            let emit = !guard.closed_once;
            guard.closed_once = true;
            (guard.session.take(), guard.connect_deferred.take(), guard.listen_deferred.take(), emit)
        };
        if let Some(session) = session {
            poller.unregister(session);
        }
        if let Some(d) = connect_deferred {
            d.reject(EvdError::closed());
        }
        if let Some(d) = listen_deferred {
            d.reject(EvdError::closed());
        }
        self.inner.lock().raw = None;
        if should_emit {
            let mut guard = self.inner.lock();
            if let Some(cb) = guard.close_cb.as_mut() {
                cb();
            }
        }
    }
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    fn setup() -> (Poller, crate::poller::PollerHandle, Context) {
        let poller = Poller::new().unwrap();
        let handle = poller.start();
        let ctx = Context::new();
        (poller, handle, ctx)
    }

    #[test]
    fn connect_to_closed_port_is_refused() {
        let (poller, poller_handle, mut ctx) = setup();

        let listener = Socket::new();
        let listen_promise = listener.listen("127.0.0.1:0", poller.clone(), ctx.handle(), None).unwrap();
        ctx.run_once();
        std::thread::sleep(StdDuration::from_millis(20));
        ctx.run_once();
        assert!(listen_promise.is_completed());
        let port = listener.local_addr().unwrap().port();
        listener.close(&poller);

        let client = Socket::new();
        let connect_promise = client.connect(&format!("127.0.0.1:{port}"), poller.clone(), ctx.handle(), None).unwrap();

        let result = Arc::new(StdMutex::new(None));
        let result2 = result.clone();
        connect_promise.then(move |outcome| {
            *result2.lock().unwrap() = Some(outcome.is_err());
        });

        for _ in 0..50 {
            ctx.run_once();
            std::thread::sleep(StdDuration::from_millis(10));
            if result.lock().unwrap().is_some() {
                break;
            }
        }
        assert_eq!(*result.lock().unwrap(), Some(true));
        poller_handle.stop();
    }

    #[test]
    fn listen_then_connect_succeeds() {
        let (poller, poller_handle, mut ctx) = setup();

        let listener = Socket::new();
        let accepted = Arc::new(AtomicBool::new(false));
        let accepted2 = accepted.clone();
        listener.set_new_connection_callback(move |_peer| {
            accepted2.store(true, Ordering::SeqCst);
        });
        let listen_promise = listener.listen("127.0.0.1:0", poller.clone(), ctx.handle(), None).unwrap();
        for _ in 0..20 {
            ctx.run_once();
            if listen_promise.is_completed() {
                break;
            }
            std::thread::sleep(StdDuration::from_millis(5));
        }
        listener.start_watching(&poller, ctx.handle()).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = Socket::new();
        let connect_promise = client.connect(&format!("127.0.0.1:{port}"), poller.clone(), ctx.handle(), None).unwrap();

        for _ in 0..100 {
            ctx.run_once();
            std::thread::sleep(StdDuration::from_millis(10));
            if connect_promise.is_completed() && accepted.load(Ordering::SeqCst) {
                break;
            }
        }
        assert!(connect_promise.is_completed());
        assert!(accepted.load(Ordering::SeqCst));
        poller_handle.stop();
    }
}
