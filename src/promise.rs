//! Deferred / Promise: an eventually-completing result with multiple listeners.
//!
//! # Why
//! The source's `EvdPromise`/`EvdDeferred` pair exists because a plain
//! single-shot "async ready" callback can only have one observer; pool
//! clients, connection-group broadcasts and starttls callers all need to
//! attach independently. Rust generics collapse the source's
//! pointer/size/bool/error result-carrier split (an artifact of its
//! untyped `GValue` storage) into one `Deferred<T>`.
//!
//! # What
//! `Deferred::new` returns a resolver/observer pair sharing one result slot.
//! `Promise::then` attaches a listener that fires at most once, in
//! insertion order, on the context the Deferred was created against —
//! immediately scheduled for the next idle turn if already completed, or
//! when the deferred completes otherwise. The result
//! is kept behind an `Arc` rather than requiring `T: Clone`, so any number of
//! listeners — before or after completion — can observe it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::ContextHandle;
use crate::error::EvdError;

/// The completed outcome, shared (not cloned) across every listener.
pub type Outcome<T> = Arc<Result<T, EvdError>>;

type Listener<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

/// A shared cancellation flag, bindable to any number of async operations.
/// Cancelling causes the *next* suspension point in a bound operation to
/// fail with `Cancelled`; already-completed operations are unaffected.
#[derive(Clone, Default)]
pub struct Cancellable(Arc<AtomicBool>);

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: cancelling twice has the same effect as once.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Inner<T> {
    result: Option<Outcome<T>>,
    listeners: Vec<Listener<T>>,
}

struct Shared<T> {
    state: Mutex<Inner<T>>,
    context: ContextHandle,
    cancellable: Option<Cancellable>,
}

/// The resolver half: owned by whoever is performing the async operation.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

/// The observer half: handed out to callers. Cloning shares the same
/// underlying result slot, matching the source's promise being an immutable
/// view onto the deferred's storage.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Deferred<T> {
    /// Create a new deferred/promise pair whose listeners will be dispatched
    /// on `context`.
    pub fn new(context: ContextHandle) -> (Deferred<T>, Promise<T>) {
        Self::with_cancellable(context, None)
    }

    /// Like [`Deferred::new`], but binds a [`Cancellable`] whose `cancel()`
    /// is mirrored by [`Promise::cancel`] and observed via
    /// [`Promise::is_cancelled`] — "cancellation forwards to the bound
    /// cancellable if any."
    pub fn with_cancellable(context: ContextHandle, cancellable: Option<Cancellable>) -> (Deferred<T>, Promise<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(Inner {
                result: None,
                listeners: Vec::new(),
            }),
            context,
            cancellable,
        });
        (
            Deferred {
                shared: shared.clone(),
            },
            Promise { shared },
        )
    }

    /// Resolve with a value. A no-op if already completed, matching the
    /// source's "result writes are rejected after completion."
    pub fn resolve(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn reject(self, error: EvdError) {
        self.complete(Err(error));
    }

    fn complete(self, result: Result<T, EvdError>) {
        let outcome: Outcome<T> = Arc::new(result);
        let listeners = {
            let mut inner = self.shared.state.lock().unwrap();
            if inner.result.is_some() {
                return;
            }
            inner.result = Some(outcome.clone());
            std::mem::take(&mut inner.listeners)
        };
        for listener in listeners {
            listener(outcome.clone());
        }
    }

    /// Like [`Deferred::resolve`]/[`Deferred::reject`] but completion (and
    /// therefore every pre-registered listener) is scheduled on the home
    /// context's next idle turn rather than run inline on the caller's stack.
    pub fn complete_in_idle(self, result: Result<T, EvdError>) {
        let ctx = self.shared.context.clone();
        ctx.post_idle(move || {
            self.complete(result);
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancellable.as_ref().is_some_and(Cancellable::is_cancelled)
    }

    pub fn cancellable(&self) -> Option<&Cancellable> {
        self.shared.cancellable.as_ref()
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Attach a listener. Fires exactly once, in insertion order relative to
    /// other listeners attached before completion; listeners attached after
    /// completion are scheduled on the home context's next idle turn.
    pub fn then<F>(&self, f: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let mut inner = self.shared.state.lock().unwrap();
        match &inner.result {
            Some(outcome) => {
                let outcome = outcome.clone();
                drop(inner);
                self.shared.context.post_idle(move || f(outcome));
            }
            None => inner.listeners.push(Box::new(f)),
        }
    }

    /// Cancel the bound [`Cancellable`], if any. Idempotent; has no effect
    /// once the promise is already completed.
    pub fn cancel(&self) {
        if let Some(c) = &self.shared.cancellable {
            c.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancellable.as_ref().is_some_and(Cancellable::is_cancelled)
    }

    pub fn get_cancellable(&self) -> Option<&Cancellable> {
        self.shared.cancellable.as_ref()
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().unwrap().result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn listener_fires_once_with_resolved_value() {
        let mut ctx = Context::new();
        let (deferred, promise) = Deferred::<u32>::new(ctx.handle());
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        promise.then(move |outcome| {
            if let Ok(v) = &*outcome {
                seen2.store(*v, Ordering::SeqCst);
            }
        });
        deferred.resolve(42);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
        let _ = ctx.handle();
    }

    #[test]
    fn multiple_listeners_both_observe_result() {
        let mut ctx = Context::new();
        let (deferred, promise) = Deferred::<u32>::new(ctx.handle());
        let a = Arc::new(AtomicU32::new(0));
        let b = Arc::new(AtomicU32::new(0));
        let (a2, b2) = (a.clone(), b.clone());
        promise.then(move |o| {
            if let Ok(v) = &*o {
                a2.store(*v, Ordering::SeqCst);
            }
        });
        promise.then(move |o| {
            if let Ok(v) = &*o {
                b2.store(*v, Ordering::SeqCst);
            }
        });
        deferred.resolve(7);
        assert_eq!(a.load(Ordering::SeqCst), 7);
        assert_eq!(b.load(Ordering::SeqCst), 7);
        let _ = &mut ctx;
    }

    #[test]
    fn listener_attached_after_completion_runs_on_idle_turn() {
        let mut ctx = Context::new();
        let (deferred, promise) = Deferred::<u32>::new(ctx.handle());
        deferred.resolve(99);
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        promise.then(move |o| {
            if let Ok(v) = &*o {
                seen2.store(*v, Ordering::SeqCst);
            }
        });
        // Not yet run: it was scheduled on the context's idle turn, not inline.
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        ctx.run_once();
        assert_eq!(seen.load(Ordering::SeqCst), 99);
    }

    #[test]
    fn promise_cancel_forwards_to_bound_cancellable() {
        let ctx = Context::new();
        let cancellable = Cancellable::new();
        let (deferred, promise) = Deferred::<u32>::with_cancellable(ctx.handle(), Some(cancellable.clone()));
        assert!(!deferred.is_cancelled());
        promise.cancel();
        assert!(cancellable.is_cancelled());
        assert!(deferred.is_cancelled());
        assert!(promise.is_cancelled());
    }

    #[test]
    fn second_resolve_is_a_no_op() {
        let ctx = Context::new();
        let (deferred, promise) = Deferred::<u32>::new(ctx.handle());
        promise.then(|_| {});
        deferred.resolve(1);
        // There is no second handle to resolve again (resolve consumes self),
        // which is the type-level enforcement of "result writes rejected
        // after completion": the API makes a second write unrepresentable.
    }
}
