//! Edge-triggered fd readiness multiplexer.
//!
//! # Why
//! One dedicated thread owns the kernel's readiness notification machinery so
//! every other context in the process can register interest in a fd without
//! taking on its own polling loop. The thread never runs user code directly —
//! it posts coalesced dispatch tasks into the registration's chosen
//! [`Context`](crate::context::Context).
//!
//! # How
//! Linux `epoll` in edge-triggered mode (`EPOLLET`), one self-pipe fd
//! registered alongside user fds purely to interrupt a blocked `epoll_wait`
//! when the registry changes. Each registration is an `Arc<Registration>`
//! whose `epoll_data.u64` *is* its id, so a ready event maps straight back to
//! the registration without a secondary fd→id table. Coalescing: an edge
//! ORs bits into `Registration::pending`; a dispatch task is posted only on
//! the 0→nonzero transition, so at most one task per registration is ever in
//! flight, matching the "exactly one dispatch task queued" invariant.

mod condition;
mod self_pipe;

pub use condition::Condition;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::context::{ContextHandle, Priority};
use crate::error::{EvdError, ErrorKind};

use self_pipe::SelfPipe;

type Callback = Box<dyn FnMut(Condition) + Send + 'static>;

struct Registration {
    id: u64,
    fd: RawFd,
    pending: AtomicU32,
    context: ContextHandle,
    priority: Mutex<Priority>,
    callback: Mutex<Option<Callback>>,
}

impl Registration {
    /// Called from the poller thread when an edge arrives. Coalesces into
    /// `pending` and posts a dispatch task on the 0→nonzero transition only.
    fn on_edge(self: &Arc<Self>, cond: Condition) {
        let prev = self.pending.fetch_or(cond.bits(), Ordering::AcqRel);
        if prev == 0 {
            let reg = self.clone();
            self.context.post(Box::new(move || reg.dispatch()));
        }
    }

    fn dispatch(self: Arc<Self>) {
        let cond = Condition::from_bits(self.pending.swap(0, Ordering::AcqRel));
        if cond.is_empty() {
            return;
        }
        if let Some(cb) = self.callback.lock().unwrap().as_mut() {
            cb(cond);
        }
    }
}

/// Handle returned by [`Poller::register`]; pass to `modify`/`unregister`.
pub struct Session {
    id: u64,
    fd: RawFd,
}

impl Session {
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

struct Inner {
    epoll_fd: RawFd,
    registrations: Mutex<HashMap<u64, Arc<Registration>>>,
    next_id: AtomicU64,
    self_pipe: SelfPipe,
    max_fds: usize,
}

/// The poller itself. Cheap to clone (an `Arc` internally); register from any
/// thread, the dedicated polling thread is spawned once by [`Poller::start`].
#[derive(Clone)]
pub struct Poller {
    inner: Arc<Inner>,
}

pub struct PollerHandle {
    #[allow(dead_code)]
    thread: JoinHandle<()>,
    stop_pipe_write: RawFd,
}

impl PollerHandle {
    /// Interrupt the polling thread and join it.
    pub fn stop(self) {
        // Writing to our own self-pipe's write end wakes epoll_wait; the
        // thread observes `stopping` and exits its loop.
        unsafe {
            let byte: u8 = 1;
            libc::write(self.stop_pipe_write, &byte as *const u8 as *const _, 1);
        }
        let _ = self.thread.join();
    }
}

const DEFAULT_MAX_FDS: usize = 1000;

impl Poller {
    /// Create the epoll instance and its self-pipe, but do not yet spawn the
    /// dedicated thread (see [`Poller::start`]).
    pub fn new() -> crate::error::Result<Self> {
        Self::with_max_fds(DEFAULT_MAX_FDS)
    }

    pub fn with_max_fds(max_fds: usize) -> crate::error::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(EvdError::from_io(std::io::Error::last_os_error()));
        }
        let self_pipe = SelfPipe::new().map_err(EvdError::from_io)?;
        let inner = Inner {
            epoll_fd,
            registrations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            self_pipe,
            max_fds,
        };
        let poller = Poller { inner: Arc::new(inner) };
        poller.epoll_add_raw(poller.inner.self_pipe.read_fd(), libc::EPOLLIN as u32, u64::MAX)?;
        Ok(poller)
    }

    /// Spawn the dedicated polling thread.
    pub fn start(&self) -> PollerHandle {
        let poller = self.clone();
        let stop_pipe_write = self.inner.self_pipe.write_fd();
        let thread = std::thread::Builder::new()
            .name("eventdance-poller".into())
            .spawn(move || poller.run_loop())
            .expect("failed to spawn poller thread");
        PollerHandle {
            thread,
            stop_pipe_write,
        }
    }

    fn epoll_add_raw(&self, fd: RawFd, events: u32, data: u64) -> crate::error::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: data,
        };
        let rc = unsafe { libc::epoll_ctl(self.inner.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOSPC) {
                return Err(EvdError::new(ErrorKind::PollerFull, "epoll instance is full"));
            }
            return Err(EvdError::from_io(err));
        }
        Ok(())
    }

    fn events_for(cond: Condition) -> u32 {
        let mut events = libc::EPOLLET as u32 | libc::EPOLLRDHUP as u32;
        if cond.contains(Condition::READ) {
            events |= libc::EPOLLIN as u32 | libc::EPOLLPRI as u32;
        }
        if cond.contains(Condition::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    /// Register `fd` for `cond` readiness, dispatching coalesced callbacks
    /// onto `context` at `priority`.
    pub fn register<F>(
        &self,
        fd: RawFd,
        cond: Condition,
        priority: Priority,
        context: ContextHandle,
        callback: F,
    ) -> crate::error::Result<Session>
    where
        F: FnMut(Condition) + Send + 'static,
    {
        let mut registrations = self.inner.registrations.lock().unwrap();
        if registrations.len() >= self.inner.max_fds {
            return Err(EvdError::new(ErrorKind::PollerFull, "maximum registered fds reached"));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(Registration {
            id,
            fd,
            pending: AtomicU32::new(0),
            context,
            priority: Mutex::new(priority),
            callback: Mutex::new(Some(Box::new(callback))),
        });

        let mut ev = libc::epoll_event {
            events: Self::events_for(cond),
            u64: id,
        };
        let rc = unsafe { libc::epoll_ctl(self.inner.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::ENOSPC) {
                EvdError::new(ErrorKind::PollerFull, "epoll instance is full")
            } else {
                EvdError::from_io(err)
            });
        }
        registrations.insert(id, registration);
        Ok(Session { id, fd })
    }

    /// Update the watched condition/priority without an intermediate unregister.
    pub fn modify(&self, session: &Session, cond: Condition, priority: Priority) -> crate::error::Result<()> {
        let registrations = self.inner.registrations.lock().unwrap();
        let registration = registrations
            .get(&session.id)
            .ok_or_else(|| EvdError::new(ErrorKind::InvalidArgument, "unknown poller session"))?;
        *registration.priority.lock().unwrap() = priority;
        let mut ev = libc::epoll_event {
            events: Self::events_for(cond),
            u64: session.id,
        };
        let rc = unsafe { libc::epoll_ctl(self.inner.epoll_fd, libc::EPOLL_CTL_MOD, session.fd, &mut ev) };
        if rc < 0 {
            return Err(EvdError::from_io(std::io::Error::last_os_error()));
        }
        self.interrupt();
        Ok(())
    }

    /// Remove `session` from the readiness set. Once this returns, the
    /// registration's callback is guaranteed never to run again, even if a
    /// dispatch task for it was already queued on its context.
    pub fn unregister(&self, session: Session) {
        let registration = {
            let mut registrations = self.inner.registrations.lock().unwrap();
            registrations.remove(&session.id)
        };
        if let Some(registration) = registration {
            // Clearing the callback under the same lock the dispatch task
            // reads it through is what makes a racing in-flight task a no-op.
            *registration.callback.lock().unwrap() = None;
            unsafe {
                libc::epoll_ctl(
                    self.inner.epoll_fd,
                    libc::EPOLL_CTL_DEL,
                    session.fd,
                    std::ptr::null_mut(),
                );
            }
        }
        self.interrupt();
    }

    fn interrupt(&self) {
        self.inner.self_pipe.interrupt();
    }

    fn run_loop(&self) {
        const MAX_EVENTS: usize = 256;
        let mut events: Vec<libc::epoll_event> = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.inner.epoll_fd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    -1,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::warn!(error = %err, "epoll_wait failed, continuing");
                continue;
            }
            let registrations = self.inner.registrations.lock().unwrap();
            for ev in &events[..n as usize] {
                if ev.u64 == u64::MAX {
                    // Self-pipe wakeup: drain and loop back to epoll_wait so
                    // newly applied epoll_ctl changes (or a stop request)
                    // take effect before we block again.
                    if self.inner.self_pipe.drain_and_check_stop() {
                        return;
                    }
                    continue;
                }
                if let Some(registration) = registrations.get(&ev.u64) {
                    registration.on_edge(Condition::from_raw_epoll(ev.events));
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn self_pipe_wakeup_does_not_crash_loop() {
        let poller = Poller::new().unwrap();
        let handle = poller.start();
        std::thread::sleep(Duration::from_millis(20));
        handle.stop();
    }

    #[test]
    fn register_and_observe_readable_edge() {
        let poller = Poller::new().unwrap();
        let handle = poller.start();
        let mut ctx = Context::new();
        let ctx_handle = ctx.handle();

        let (mut rx, mut tx) = std::os::unix::net::UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        use std::os::unix::io::AsRawFd;
        let fd = rx.as_raw_fd();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let _session = poller
            .register(fd, Condition::READ, Priority::DEFAULT, ctx_handle, move |cond| {
                if cond.contains(Condition::READ) {
                    fired2.store(true, Ordering::SeqCst);
                }
            })
            .unwrap();

        use std::io::Write;
        tx.write_all(b"x").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        ctx.run_once();
        assert!(fired.load(Ordering::SeqCst));
        let _ = rx;
        handle.stop();
    }
}
