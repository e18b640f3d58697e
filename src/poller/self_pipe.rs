//! The self-pipe trick: mandatory for interrupting a blocked `epoll_wait`.
//!
//! `del` must be ordered with respect to an in-flight `wait()` — relying on
//! `epoll_wait`'s timeout alone would leave a window where a registry change
//! (unregister, modify, shutdown) isn't observed until the next spurious
//! wakeup. A pipe registered alongside user fds, written to on every registry
//! change, forces an immediate return from `epoll_wait`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SelfPipe {
    read_fd: RawFd,
    write_fd: RawFd,
    stopping: AtomicBool,
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl SelfPipe {
    pub fn new() -> std::io::Result<Self> {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        set_nonblocking(fds[0])?;
        set_nonblocking(fds[1])?;
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
            stopping: AtomicBool::new(false),
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Wake a blocked `epoll_wait` without requesting shutdown.
    pub fn interrupt(&self) {
        unsafe {
            let byte: u8 = 0;
            libc::write(self.write_fd, &byte as *const u8 as *const _, 1);
        }
    }

    /// Drain all pending bytes. Returns `true` if a stop byte (value `1`,
    /// as written by [`super::PollerHandle::stop`]) was observed.
    pub fn drain_and_check_stop(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut saw_stop = false;
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
            if buf[..n as usize].iter().any(|&b| b == 1) {
                saw_stop = true;
            }
        }
        if saw_stop {
            self.stopping.store(true, Ordering::SeqCst);
        }
        self.stopping.load(Ordering::SeqCst)
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
