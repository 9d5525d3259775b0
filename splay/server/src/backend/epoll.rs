//! Linux epoll backend.
//!
//! Level-triggered. Writable interest is added for an fd only while it has
//! unflushed output and the reactor drops it again after the first
//! writability event, which gives the one-shot semantics the write path
//! relies on.

use super::{Event, Interest, pack_token, unpack_token};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use splay_common::{Fd, FdKind, MAX_EVENTS};
use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

pub struct Backend {
    epoll: Epoll,
    wait_buf: RefCell<Vec<EpollEvent>>,
}

impl Backend {
    pub fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll,
            wait_buf: RefCell::new(vec![EpollEvent::empty(); MAX_EVENTS]),
        })
    }

    /// The epoll fd itself; opaque outside this module.
    pub fn raw(&self) -> Fd {
        self.epoll.0.as_raw_fd()
    }

    fn flags(interest: Interest) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if interest.readable {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    pub fn register(&self, fd: Fd, kind: FdKind, interest: Interest) -> io::Result<()> {
        let event = EpollEvent::new(Self::flags(interest), pack_token(fd, kind));
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(fd, event)?;
        Ok(())
    }

    pub fn modify(&self, fd: Fd, kind: FdKind, interest: Interest) -> io::Result<()> {
        let mut event = EpollEvent::new(Self::flags(interest), pack_token(fd, kind));
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.modify(fd, &mut event)?;
        Ok(())
    }

    pub fn deregister(&self, fd: Fd, _kind: FdKind) -> io::Result<()> {
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(fd)?;
        Ok(())
    }

    /// Blocks until events arrive and appends them to `events`. EINTR is
    /// not an error; it surfaces as zero events.
    pub fn wait(&self, events: &mut Vec<Event>, timeout_ms: Option<u16>) -> io::Result<usize> {
        let mut buf = self.wait_buf.borrow_mut();
        let timeout = match timeout_ms {
            Some(ms) => EpollTimeout::from(ms),
            None => EpollTimeout::NONE,
        };
        let n = match self.epoll.wait(buf.as_mut_slice(), timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };
        for raw in buf.iter().take(n) {
            let (fd, kind) = unpack_token(raw.data());
            let flags = raw.events();
            events.push(Event {
                fd,
                kind,
                readable: flags.contains(EpollFlags::EPOLLIN),
                writable: flags.contains(EpollFlags::EPOLLOUT),
                error: flags.contains(EpollFlags::EPOLLERR),
                hangup: flags.contains(EpollFlags::EPOLLHUP),
            });
        }
        Ok(n)
    }

    /// Reads once into `buf`. Ok(0) is end of stream; EAGAIN surfaces as
    /// `WouldBlock`.
    pub fn recv(&self, fd: Fd, _kind: FdKind, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Writes once from `data`. EAGAIN surfaces as `WouldBlock`.
    pub fn send(&self, fd: Fd, _kind: FdKind, data: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Deregisters and closes. The close itself cannot be meaningfully
    /// handled beyond logging at the caller.
    pub fn close(&self, fd: Fd, kind: FdKind) -> io::Result<()> {
        let _ = self.deregister(fd, kind);
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
