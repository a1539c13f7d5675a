//! Thin wrapper over epoll.
//!
//! Registration (`add`/`modify`/`remove`) takes `&self`; `epoll_ctl` is
//! safe to call from worker threads while the reactor sits in `wait`. The
//! ready-event storage lives in a caller-owned `EventBuf` so only the
//! reactor thread ever touches it.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use libc::c_int;

pub const READABLE: u32 = libc::EPOLLIN as u32;
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;
pub const PEER_CLOSED: u32 = libc::EPOLLRDHUP as u32;
pub const HANGUP: u32 = libc::EPOLLHUP as u32;
pub const ERROR: u32 = libc::EPOLLERR as u32;
pub const ONE_SHOT: u32 = libc::EPOLLONESHOT as u32;
pub const EDGE_TRIGGERED: u32 = libc::EPOLLET as u32;

pub struct Epoll {
    fd: RawFd,
}

/// Ready-event slots filled by `Epoll::wait`; valid until the next wait.
pub struct EventBuf {
    events: Vec<libc::epoll_event>,
}

impl EventBuf {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events],
        }
    }

    pub fn fd(&self, i: usize) -> RawFd {
        self.events[i].u64 as RawFd
    }

    pub fn mask(&self, i: usize) -> u32 {
        self.events[i].events
    }
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let res = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            // A closed fd left epoll already.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` (-1 blocks indefinitely). Returns the number
    /// of ready slots in `events`; an interrupted wait counts as zero.
    pub fn wait(&self, events: &mut EventBuf, timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.events.as_mut_ptr(),
                events.events.len() as c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(res as usize)
    }

    fn ctl(&self, op: c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let res = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        crate::syscalls::close_fd(self.fd);
    }
}
