/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A thin epoll wrapper. Unlike the usual callback-table designs this one
//! hands readiness back to the caller, which dispatches on the fd itself;
//! every component that polls owns its [EventLoop] explicitly instead of
//! sharing a process-wide loop.

use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;

use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;

use crate::Result;

pub struct EventLoop {
    epoll: Epoll,
}

/// One readiness report: which fd and which events fired.
#[derive(Debug, Copy, Clone)]
pub struct Ready {
    pub fd: RawFd,
    pub events: EpollFlags,
}

impl Ready {
    pub fn readable(&self) -> bool {
        self.events.contains(EpollFlags::EPOLLIN)
    }

    pub fn writable(&self) -> bool {
        self.events.contains(EpollFlags::EPOLLOUT)
    }

    pub fn closed(&self) -> bool {
        self.events
            .intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
    }
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epoll })
    }

    pub fn add(&self, fd: BorrowedFd, events: EpollFlags) -> Result<()> {
        let ev = EpollEvent::new(events, fd.as_raw_fd() as u64);
        self.epoll.add(fd, ev)?;
        Ok(())
    }

    pub fn modify(&self, fd: BorrowedFd, events: EpollFlags) -> Result<()> {
        let mut ev = EpollEvent::new(events, fd.as_raw_fd() as u64);
        self.epoll.modify(fd, &mut ev)?;
        Ok(())
    }

    /// Remove fd from the poll. Always do this before closing the fd; the
    /// kernel reuses fd numbers and a stale registration would fire for
    /// the wrong object.
    pub fn remove(&self, fd: BorrowedFd) -> Result<()> {
        self.epoll.delete(fd)?;
        Ok(())
    }

    /// Wait for readiness. `timeout_ms` of `None` blocks indefinitely.
    /// EINTR restarts the wait.
    pub fn wait(&self, timeout_ms: Option<u16>) -> Result<Vec<Ready>> {
        let timeout = match timeout_ms {
            Some(ms) => EpollTimeout::from(ms),
            None => EpollTimeout::NONE,
        };
        let mut events = [EpollEvent::empty(); 16];
        loop {
            match self.epoll.wait(&mut events, timeout) {
                Ok(n) => {
                    return Ok(events[..n]
                        .iter()
                        .map(|ev| Ready {
                            fd: ev.data() as RawFd,
                            events: ev.events(),
                        })
                        .collect());
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn reports_readable_fd() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let ev = EventLoop::new().unwrap();
        ev.add(b.as_fd(), EpollFlags::EPOLLIN).unwrap();

        assert!(ev.wait(Some(0)).unwrap().is_empty());

        a.write_all(b"x").unwrap();
        let ready = ev.wait(Some(1000)).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, b.as_raw_fd());
        assert!(ready[0].readable());
    }

    #[test]
    fn hup_reported_when_peer_drops() {
        let (a, b) = UnixStream::pair().unwrap();
        let ev = EventLoop::new().unwrap();
        ev.add(b.as_fd(), EpollFlags::EPOLLIN).unwrap();
        drop(a);
        let ready = ev.wait(Some(1000)).unwrap();
        assert!(ready[0].closed() || ready[0].readable());
    }
}
