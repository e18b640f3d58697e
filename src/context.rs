//! Cooperative single-threaded event loop.
//!
//! # Why
//! This crate's concurrency model is "cooperative single-threaded per
//! context, plus one dedicated polling thread" (the poller never runs user
//! callbacks itself — it posts one task per registration into the
//! registration's chosen context). `Context` is that home for user code:
//! sockets, connections, the JSON filter and the WebSocket state machine all
//! run their callbacks here, never on the poller thread's stack.
//!
//! # How
//! A `Context` owns an `mpsc` task queue and a min-heap of timers keyed by
//! deadline. `run`/`run_once` drain ready tasks, fire due timers, and block
//! on the channel (with a timeout bounded by the next timer) when idle.
//! `ContextHandle` is the `Send + Sync` handle other threads (the poller) use
//! to post a task without touching the loop's internals.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Priority, lower runs first within the same tick. Mirrors the source's use
/// of GLib priorities without replicating its numeric scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Priority(pub i32);

impl Priority {
    pub const DEFAULT: Priority = Priority(0);
    pub const HIGH: Priority = Priority(-100);
    pub const LOW: Priority = Priority(100);
}

struct TimerEntry {
    deadline: Instant,
    priority: Priority,
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.id.cmp(&self.id))
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Opaque handle to a scheduled task, used to cancel it before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct Shared {
    timers: Mutex<BinaryHeap<TimerEntry>>,
    callbacks: Mutex<HashMap<u64, Task>>,
    next_id: AtomicU64,
    sender: Sender<Task>,
}

/// A `Send + Sync` reference to a [`Context`], usable from any thread to post
/// a task or schedule a timer that will run on the context's own thread.
#[derive(Clone)]
pub struct ContextHandle {
    shared: Arc<Shared>,
}

impl ContextHandle {
    /// Post a task to run on the context's loop as soon as it is next idle.
    pub fn post(&self, task: Task) {
        // The channel never has a missing receiver while the owning Context
        // is alive; a send error here means the loop was torn down, in which
        // case dropping the task is the correct (and only) outcome.
        let _ = self.shared.sender.send(task);
    }

    /// Schedule `f` to run after `delay_ms` (0 becomes an idle task, run on
    /// the next loop iteration rather than immediately inline).
    pub fn schedule<F>(&self, delay_ms: u64, priority: Priority, f: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let deadline = Instant::now() + Duration::from_millis(delay_ms);
        self.shared.callbacks.lock().unwrap().insert(id, Box::new(f));
        self.shared.timers.lock().unwrap().push(TimerEntry {
            deadline,
            priority,
            id,
        });
        // Wake the loop in case it is blocked on a longer-lived timer.
        let _ = self.shared.sender.send(Box::new(|| {}));
        TaskId(id)
    }

    /// Cancel a previously scheduled task. No-op if it already fired.
    pub fn cancel(&self, id: TaskId) {
        self.shared.callbacks.lock().unwrap().remove(&id.0);
    }

    /// Convenience used throughout the crate for Promise/Deferred's
    /// "complete in idle" semantics.
    pub fn post_idle<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(0, Priority::DEFAULT, f);
    }
}

/// The event loop itself. Not `Sync`; only the thread that calls [`Context::run`]
/// (or repeatedly [`Context::run_once`]) may drive it. Other threads interact
/// through a cloned [`ContextHandle`].
pub struct Context {
    shared: Arc<Shared>,
    receiver: Receiver<Task>,
    running: bool,
}

impl Context {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            timers: Mutex::new(BinaryHeap::new()),
            callbacks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sender,
        });
        Self {
            shared,
            receiver,
            running: false,
        }
    }

    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            shared: self.shared.clone(),
        }
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        self.shared.timers.lock().unwrap().peek().map(|t| t.deadline)
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut timers = self.shared.timers.lock().unwrap();
                match timers.peek() {
                    Some(t) if t.deadline <= now => timers.pop(),
                    _ => None,
                }
            };
            let Some(entry) = due else { break };
            let cb = self.shared.callbacks.lock().unwrap().remove(&entry.id);
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    /// Run one iteration: drain queued tasks, fire due timers, then block
    /// until either the next timer deadline or a new task arrives.
    pub fn run_once(&mut self) {
        while let Ok(task) = self.receiver.try_recv() {
            task();
        }
        self.fire_due_timers();

        let timeout = match self.next_timer_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_millis(50),
        };
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => task(),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => self.running = false,
        }
        self.fire_due_timers();
    }

    /// Run until [`Context::stop`] is requested from within a scheduled task.
    pub fn run(&mut self) {
        self.running = true;
        while self.running {
            self.run_once();
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn post_runs_on_next_iteration() {
        let mut ctx = Context::new();
        let handle = ctx.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        handle.post(Box::new(move || ran2.store(true, AtomicOrdering::SeqCst)));
        ctx.run_once();
        assert!(ran.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn cancel_prevents_execution() {
        let mut ctx = Context::new();
        let handle = ctx.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let id = handle.schedule(50, Priority::DEFAULT, move || ran2.store(true, AtomicOrdering::SeqCst));
        handle.cancel(id);
        std::thread::sleep(Duration::from_millis(80));
        ctx.run_once();
        assert!(!ran.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut ctx = Context::new();
        let handle = ctx.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        handle.schedule(20, Priority::DEFAULT, move || o1.lock().unwrap().push(2));
        handle.schedule(5, Priority::DEFAULT, move || o2.lock().unwrap().push(1));
        std::thread::sleep(Duration::from_millis(40));
        ctx.run_once();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
