//! BSD and macOS kqueue backend.
//!
//! Read filters are persistent; write filters are one-shot for sockets and
//! clear-on-read for pipes, mirroring how the write path re-arms interest
//! only while output is pending.

use super::{Event, Interest, pack_token, unpack_token};
use nix::errno::Errno;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use nix::sys::time::TimeSpec;
use splay_common::{Fd, FdKind, MAX_EVENTS};
use std::cell::RefCell;
use std::io;
use std::time::Duration;

pub struct Backend {
    kqueue: Kqueue,
    wait_buf: RefCell<Vec<KEvent>>,
}

fn kevent(fd: Fd, kind: FdKind, filter: EventFilter, flags: EventFlag) -> KEvent {
    KEvent::new(
        fd as usize,
        filter,
        flags,
        FilterFlag::empty(),
        0,
        pack_token(fd, kind) as isize,
    )
}

impl Backend {
    pub fn new() -> io::Result<Self> {
        let kqueue = Kqueue::new()?;
        let empty = KEvent::new(
            0,
            EventFilter::EVFILT_READ,
            EventFlag::empty(),
            FilterFlag::empty(),
            0,
            0,
        );
        Ok(Self {
            kqueue,
            wait_buf: RefCell::new(vec![empty; MAX_EVENTS]),
        })
    }

    pub fn raw(&self) -> Fd {
        use std::os::fd::AsRawFd;
        self.kqueue.as_raw_fd()
    }

    fn write_flags(kind: FdKind) -> EventFlag {
        if kind == FdKind::Pipe {
            EventFlag::EV_ADD | EventFlag::EV_CLEAR
        } else {
            EventFlag::EV_ADD | EventFlag::EV_ONESHOT
        }
    }

    fn apply(&self, changes: &[KEvent]) -> io::Result<()> {
        match self.kqueue.kevent(changes, &mut [], None) {
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn register(&self, fd: Fd, kind: FdKind, interest: Interest) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        if interest.readable {
            changes.push(kevent(fd, kind, EventFilter::EVFILT_READ, EventFlag::EV_ADD));
        }
        if interest.writable {
            changes.push(kevent(
                fd,
                kind,
                EventFilter::EVFILT_WRITE,
                Self::write_flags(kind),
            ));
        }
        self.apply(&changes)
    }

    pub fn modify(&self, fd: Fd, kind: FdKind, interest: Interest) -> io::Result<()> {
        if interest.writable {
            self.apply(&[kevent(
                fd,
                kind,
                EventFilter::EVFILT_WRITE,
                Self::write_flags(kind),
            )])?;
        } else {
            // One-shot filters may already be gone; ENOENT is expected.
            match self.apply(&[kevent(
                fd,
                kind,
                EventFilter::EVFILT_WRITE,
                EventFlag::EV_DELETE,
            )]) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(Errno::ENOENT as i32) => {}
                Err(e) => return Err(e),
            }
        }
        if interest.readable {
            self.apply(&[kevent(fd, kind, EventFilter::EVFILT_READ, EventFlag::EV_ADD)])?;
        }
        Ok(())
    }

    pub fn deregister(&self, fd: Fd, kind: FdKind) -> io::Result<()> {
        for filter in [EventFilter::EVFILT_READ, EventFilter::EVFILT_WRITE] {
            let _ = self.apply(&[kevent(fd, kind, filter, EventFlag::EV_DELETE)]);
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut Vec<Event>, timeout_ms: Option<u16>) -> io::Result<usize> {
        let mut buf = self.wait_buf.borrow_mut();
        let timeout = timeout_ms.map(|ms| TimeSpec::from_duration(Duration::from_millis(ms.into())));
        let n = match self.kqueue.kevent(&[], &mut buf, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };
        for raw in buf.iter().take(n) {
            let (fd, kind) = unpack_token(raw.udata() as u64);
            let flags = raw.flags();
            let filter = raw.filter();
            events.push(Event {
                fd,
                kind,
                readable: filter == Ok(EventFilter::EVFILT_READ),
                writable: filter == Ok(EventFilter::EVFILT_WRITE),
                error: flags.contains(EventFlag::EV_ERROR),
                hangup: flags.contains(EventFlag::EV_EOF),
            });
        }
        Ok(n)
    }

    pub fn recv(&self, fd: Fd, _kind: FdKind, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn send(&self, fd: Fd, _kind: FdKind, data: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn close(&self, fd: Fd, kind: FdKind) -> io::Result<()> {
        let _ = self.deregister(fd, kind);
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
