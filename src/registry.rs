use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use crate::errors::IdleClockError;

/// Owned epoll instance shared by the registration helper and the expiry callback.
///
/// Only the `epoll_ctl` side lives here; dispatching on `wait` results is the
/// server loop's business.
#[derive(Debug)]
pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> Result<Self, IdleClockError> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(IdleClockError::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let r = unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Returns how many entries of `events` were filled.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let max = i32::try_from(events.len()).unwrap_or(i32::MAX);
        let r = unsafe {
            libc::epoll_wait(self.fd.as_raw_fd(), events.as_mut_ptr(), max, timeout_ms)
        };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(r as usize)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let r = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Read readiness plus peer hangup, with the requested trigger mode.
pub fn readiness_mask(one_shot: bool, edge_triggered: bool) -> u32 {
    let mut events = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    if edge_triggered {
        events |= libc::EPOLLET as u32;
    }
    if one_shot {
        events |= libc::EPOLLONESHOT as u32;
    }
    events
}

/// Sets `O_NONBLOCK` and hands back the flags the descriptor had before.
pub fn make_non_blocking(fd: RawFd) -> Result<i32, IdleClockError> {
    let old_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if old_flags < 0 {
        return Err(IdleClockError::NonBlocking {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, old_flags | libc::O_NONBLOCK) } < 0 {
        return Err(IdleClockError::NonBlocking {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    Ok(old_flags)
}

/// Adds `fd` to `registry` and marks it non-blocking.
///
/// The non-blocking switch is applied even when the add fails;
/// the add error wins when both fail.
pub fn register_for_readiness(
    registry: &Epoll,
    fd: RawFd,
    one_shot: bool,
    edge_triggered: bool,
) -> Result<(), IdleClockError> {
    let added = registry
        .add(fd, readiness_mask(one_shot, edge_triggered))
        .map_err(|source| IdleClockError::Registration { fd, source });
    let non_blocking = make_non_blocking(fd);

    if let Err(e) = &added {
        log::warn!("{}", e);
    }
    if let Err(e) = &non_blocking {
        log::warn!("{}", e);
    }
    added?;
    non_blocking.map(|_| ())
}

/// Re-enables a one-shot registration after its notification has been handled.
pub fn rearm(
    registry: &Epoll,
    fd: RawFd,
    one_shot: bool,
    edge_triggered: bool,
) -> Result<(), IdleClockError> {
    registry
        .modify(fd, readiness_mask(one_shot, edge_triggered))
        .map_err(|source| {
            let e = IdleClockError::Registration { fd, source };
            log::warn!("{}", e);
            e
        })
}

/// Removes `fd` from the registry. Must run before the descriptor is closed.
pub fn deregister(registry: &Epoll, fd: RawFd) -> Result<(), IdleClockError> {
    registry.delete(fd).map_err(|source| {
        let e = IdleClockError::Registration { fd, source };
        log::warn!("{}", e);
        e
    })
}
