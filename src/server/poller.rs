//! Thin wrapper over epoll.
//!
//! [`Poller`] owns the epoll instance and the ready-event array and is driven
//! only by the reactor thread. [`Registry`] is a cheap cloneable handle for
//! `add`/`modify`/`delete`; `epoll_ctl` is safe to call from any thread for
//! distinct fds, which lets worker tasks re-arm their own connection without
//! going back through the reactor.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Default capacity of the ready-event array.
pub const MAX_EVENTS: usize = 1024;

pub struct Poller {
    registry: Registry,
    events: Vec<libc::epoll_event>,
}

#[derive(Clone)]
pub struct Registry {
    epoll_fd: Arc<OwnedFd>,
}

impl Poller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            registry: Registry {
                epoll_fd: Arc::new(epoll_fd),
            },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    /// Handle for registering interest from other threads.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.registry.add(fd, events)
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.registry.modify(fd, events)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.registry.delete(fd)
    }

    /// Waits up to `timeout_ms` (`-1` blocks indefinitely) and returns the
    /// number of ready events. Interruption by a signal surfaces as
    /// `ErrorKind::Interrupted`.
    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.registry.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// The fd of the i-th ready event from the last [`wait`](Self::wait).
    pub fn event_fd(&self, i: usize) -> RawFd {
        self.events[i].u64 as RawFd
    }

    /// The event mask of the i-th ready event from the last [`wait`](Self::wait).
    pub fn event_mask(&self, i: usize) -> u32 {
        self.events[i].events
    }
}

impl Registry {
    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Eventfd-backed wakeup for the reactor: worker threads queue work for the
/// reactor (pending closes) and kick it out of `epoll_wait`.
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    /// Clears the counter so the next wake re-triggers readiness.
    pub fn drain(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut buf as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }
}
