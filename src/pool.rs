//! A pool of pre-connected `Connection`s to one address, grown and shrunk to
//! keep `min ≤ |ready|+|inflight| ≤ max`. §4.7.
//!
//! # Why
//! `evd-connection-pool.c` keeps three queues (idle sockets still connecting,
//! ready connections, pending requests) and a single `TOTAL_SOCKETS` count
//! that governs whether a finished or closed socket gets reconnected or
//! dropped. That shape survives unchanged here; what collapses is the
//! reference-counted `GQueue`/`GAsyncQueue` bookkeeping, replaced by a
//! `Mutex`-guarded struct and `Connection`'s own close callback.
//!
//! # How
//! A connection handed out to a caller (via `get_connection` or as the
//! immediate fulfillment of a waiting request) leaves every pool-owned queue;
//! it is not "inflight" or "ready" anymore; it only comes back under the
//! pool's management again if the caller calls `recycle`. This matches the
//! source's `evd_connection_pool_new_connection`, which disconnects the
//! `close` signal it had wired on ready connections once one is handed to a
//! request, and never wires one at all for a connection handed out directly
//! from `socket_on_connect`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionConfig};
use crate::context::ContextHandle;
use crate::error::EvdError;
use crate::poller::Poller;
use crate::promise::{Cancellable, Deferred, Promise};
use crate::socket::Socket;
use crate::throttle::ThrottleSet;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 5,
        }
    }
}

struct Inner {
    address: String,
    poller: Poller,
    context: ContextHandle,
    config: PoolConfig,
    connection_config: ConnectionConfig,
    throttles: ThrottleSet,
    ready: VecDeque<Connection>,
    inflight: usize,
    requests: VecDeque<Deferred<Connection>>,
    torn_down: bool,
}

impl Inner {
    fn total(&self) -> usize {
        self.ready.len() + self.inflight
    }
}

/// A connection pool targeting one address. Cheap to clone; clones share the
/// same queues.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionPool {
    /// Starts sockets immediately until `|inflight|+|ready| ≥ min`.
    pub fn new(address: impl Into<String>, poller: Poller, context: ContextHandle, config: PoolConfig, connection_config: ConnectionConfig, throttles: ThrottleSet) -> Self {
        let pool = Self {
            inner: Arc::new(Mutex::new(Inner {
                address: address.into(),
                poller,
                context,
                config,
                connection_config,
                throttles,
                ready: VecDeque::new(),
                inflight: 0,
                requests: VecDeque::new(),
                torn_down: false,
            })),
        };
        let to_start = pool.inner.lock().config.min_connections;
        for _ in 0..to_start {
            pool.start_new_socket();
        }
        pool
    }

    pub fn has_free(&self) -> bool {
        !self.inner.lock().ready.is_empty()
    }

    /// `get_connection(cancellable) → Promise<Connection>` — §4.7.
    pub fn get_connection(&self, cancellable: Option<Cancellable>) -> Promise<Connection> {
        let context = self.inner.lock().context.clone();
        let (deferred, promise) = Deferred::with_cancellable(context, cancellable);

        let mut guard = self.inner.lock();
        if guard.torn_down {
            drop(guard);
            deferred.reject(EvdError::closed());
            return promise;
        }

        if let Some(conn) = guard.ready.pop_front() {
            let start = guard.total() < guard.config.min_connections;
            drop(guard);
            deferred.resolve(conn);
            if start {
                self.start_new_socket();
            }
        } else {
            let start = guard.total() < guard.config.max_connections;
            guard.requests.push_back(deferred);
            drop(guard);
            if start {
                self.start_new_socket();
            }
        }

        promise
    }

    /// Hands `conn` back to the pool if it is still open and the pool has
    /// room; returns whether it was accepted.
    pub fn recycle(&self, conn: Connection) -> bool {
        if conn.is_closed() {
            return false;
        }
        let accepted = {
            let guard = self.inner.lock();
            guard.total() < guard.config.max_connections || !guard.requests.is_empty()
        };
        if accepted {
            self.handle_new_connection(conn);
        }
        accepted
    }

    /// Rejects every pending request with `Closed`; subsequent calls to
    /// `get_connection` also reject immediately.
    pub fn teardown(&self) {
        let requests = {
            let mut guard = self.inner.lock();
            guard.torn_down = true;
            std::mem::take(&mut guard.requests)
        };
        for req in requests {
            req.reject(EvdError::closed());
        }
    }

    fn start_new_socket(&self) {
        let (address, poller, context, cancellable_none) = {
            let guard = self.inner.lock();
            (guard.address.clone(), guard.poller.clone(), guard.context.clone(), None::<Cancellable>)
        };
        self.inner.lock().inflight += 1;

        let socket = Socket::new();
        let connect = socket.connect(&address, poller, context, cancellable_none);
        let promise = match connect {
            Ok(p) => p,
            Err(_e) => {
                self.inner.lock().inflight -= 1;
                self.handle_socket_gone();
                return;
            }
        };

        let this = self.clone();
        let socket_for_then = socket.clone();
        promise.then(move |outcome| {
            this.inner.lock().inflight -= 1;
            match &*outcome {
                Ok(()) => this.on_socket_connected(socket_for_then),
                Err(_) => this.handle_socket_gone(),
            }
        });
    }

    fn on_socket_connected(&self, socket: Socket) {
        let (poller, context, throttles, config) = {
            let guard = self.inner.lock();
            (guard.poller.clone(), guard.context.clone(), guard.throttles.clone(), guard.connection_config)
        };
        match Connection::new(socket, poller, context, throttles, config) {
            Ok(conn) => self.handle_new_connection(conn),
            Err(_e) => self.handle_socket_gone(),
        }
    }

    /// Fulfills a waiting request with `conn`, or parks it in `ready` and
    /// arms a close hook; tops the pool back up to `min` either way.
    fn handle_new_connection(&self, conn: Connection) {
        let request = self.inner.lock().requests.pop_front();
        match request {
            Some(deferred) => {
                deferred.resolve(conn);
                let start = {
                    let guard = self.inner.lock();
                    guard.total() < guard.config.min_connections
                };
                if start {
                    self.start_new_socket();
                }
            }
            None => {
                let this = self.clone();
                let identity = conn.identity();
                conn.set_on_close(move || {
                    this.remove_from_ready(identity);
                    this.handle_socket_gone();
                });
                self.inner.lock().ready.push_back(conn);
            }
        }
    }

    fn remove_from_ready(&self, identity: usize) {
        let mut guard = self.inner.lock();
        if let Some(pos) = guard.ready.iter().position(|c| c.identity() == identity) {
            guard.ready.remove(pos);
        }
    }

    /// Called after a connect failure or a ready/owned connection closing:
    /// reconnect to top back up, unless the pool is already saturated or at
    /// `min` with nothing waiting.
    fn handle_socket_gone(&self) {
        let should_reconnect = {
            let guard = self.inner.lock();
            if guard.torn_down {
                false
            } else {
                let total = guard.total();
                !(total >= guard.config.max_connections || (total >= guard.config.min_connections && guard.requests.is_empty()))
            }
        };
        if should_reconnect {
            self.start_new_socket();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn teardown_rejects_pending_requests() {
        let poller = Poller::new().unwrap();
        let poller_handle = poller.start();
        let ctx = Context::new();

        let pool = ConnectionPool::new("127.0.0.1:1", poller, ctx.handle(), PoolConfig { min_connections: 0, max_connections: 1 }, ConnectionConfig::default(), ThrottleSet::new());

        let promise = pool.get_connection(None);

        let got = Arc::new(Mutex::new(None));
        let g2 = got.clone();
        promise.then(move |outcome| {
            *g2.lock() = Some(outcome.is_err());
        });

        pool.teardown();
        assert_eq!(*got.lock(), Some(true));
        poller_handle.stop();
    }

    #[test]
    fn has_free_reflects_ready_queue_emptiness() {
        let poller = Poller::new().unwrap();
        let poller_handle = poller.start();
        let ctx = Context::new();
        let pool = ConnectionPool::new("127.0.0.1:1", poller, ctx.handle(), PoolConfig { min_connections: 0, max_connections: 1 }, ConnectionConfig::default(), ThrottleSet::new());
        assert!(!pool.has_free());
        poller_handle.stop();
    }
}
