//! Uniform surface over the OS event notification primitive.
//!
//! One `Backend` per worker. The surface is the reactor contract: register
//! interest, wait, then perform the I/O through [`Backend::recv`] and
//! [`Backend::send`]. The epoll and kqueue implementations are plain
//! readiness; the IOCP implementation is a proactor adapted to the same
//! surface by synthesizing readable events from completed receives.
//!
//! Each registration packs the fd kind next to the fd into the event token,
//! so a reported event carries the kind back out without a table lookup.

use splay_common::{Fd, FdKind};

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::Backend;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::Backend;

#[cfg(windows)]
mod iocp;
#[cfg(windows)]
pub use iocp::{Backend, close_handle, wake_pipe, wake_write};

/// Which readiness a registration asks for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// One reported readiness event.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub fd: Fd,
    pub kind: FdKind,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Packs (kind, fd) into the 64-bit token a registration carries.
pub(crate) fn pack_token(fd: Fd, kind: FdKind) -> u64 {
    (u64::from(kind.as_u32()) << 32) | u64::from(fd as u32)
}

/// Recovers (fd, kind) from an event token. Unknown kind bits fall back to
/// [`FdKind::Other`] rather than dropping the event.
pub(crate) fn unpack_token(token: u64) -> (Fd, FdKind) {
    let fd = token as u32 as Fd;
    let kind = FdKind::from_u32((token >> 32) as u32).unwrap_or(FdKind::Other);
    (fd, kind)
}
