//! Shared ABI between the splay runtime and loadable handler modules.
//!
//! Everything a handler module needs to compile against lives here: the fd
//! kind tags, the control bytes spoken over the worker self-pipes, the
//! callback parameter structures, the mailbox envelope and the `Handler`,
//! `Runtime` and `Extension` traits. The runtime crate (`splayd`) implements
//! `Runtime`; modules implement `Handler` or `Extension` and export the
//! entry symbols defined at the bottom.

use std::fmt;
use std::io;
use std::rc::Rc;
use strum::IntoStaticStr;

/// Platform file descriptor type.
#[cfg(unix)]
pub type Fd = std::os::fd::RawFd;
/// Platform file descriptor type (socket or handle value on Windows).
#[cfg(windows)]
pub type Fd = usize;

/// Read chunk size used by the worker reactors.
#[cfg(windows)]
pub const BUF_SIZE: usize = 16384;
/// Read chunk size used by the worker reactors.
#[cfg(not(windows))]
pub const BUF_SIZE: usize = 1 << 20;

/// Maximum events fetched per backend wait.
pub const MAX_EVENTS: usize = 100;

/// What a registered file descriptor is, which decides its shutdown path
/// and its edge/level semantics on the backend.
#[derive(Clone, Copy, Debug, Eq, Hash, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum FdKind {
    /// Connected stream socket.
    Stream,
    /// Datagram socket.
    Dgram,
    /// Stream socket upgraded to kernel TLS.
    Ktls,
    /// Pipe end.
    Pipe,
    /// Anything else (signal fds, timers).
    Other,
    /// The listening socket.
    Server,
}

impl FdKind {
    pub fn as_u32(self) -> u32 {
        match self {
            FdKind::Stream => 1,
            FdKind::Ktls => 2,
            FdKind::Pipe => 3,
            FdKind::Other => 4,
            FdKind::Server => 5,
            FdKind::Dgram => 6,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => FdKind::Stream,
            2 => FdKind::Ktls,
            3 => FdKind::Pipe,
            4 => FdKind::Other,
            5 => FdKind::Server,
            6 => FdKind::Dgram,
            _ => return None,
        })
    }
}

/// Control bytes written into a worker's self-pipe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Control {
    /// Leave the loop and quiesce for a module reload.
    Stop,
    /// Leave the loop for good.
    Quit,
    /// Mailbox content is waiting; drain it.
    Mail,
}

impl Control {
    pub const fn as_byte(self) -> u8 {
        match self {
            Control::Stop => 1,
            Control::Quit => 2,
            Control::Mail => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Control::Stop,
            2 => Control::Quit,
            3 => Control::Mail,
            _ => return None,
        })
    }
}

/// Identity of the node a worker serves for, handed to handlers at init.
#[derive(Clone, Debug)]
pub struct NodeId {
    pub id: u32,
    pub port: u16,
    pub name: String,
}

/// Parameters for [`Handler::on_init`].
#[derive(Clone, Copy, Debug)]
pub struct InitParams {
    /// The listening socket, absent in CLI mode.
    pub listener: Option<Fd>,
}

/// Parameters for [`Handler::on_accept`].
#[derive(Clone, Debug)]
pub struct AcceptParams {
    pub listener: Fd,
    pub fd: Fd,
    pub kind: FdKind,
    pub peer: Option<std::net::SocketAddr>,
}

/// Parameters for [`Handler::on_receive`]. The buffer is only valid for the
/// duration of the callback.
#[derive(Clone, Copy, Debug)]
pub struct ReadParams<'a> {
    pub fd: Fd,
    pub kind: FdKind,
    pub data: &'a [u8],
}

/// Parameters for [`Handler::on_write`]. `written == 0` means "the fd is
/// writable again, flush whatever you have queued".
#[derive(Clone, Copy, Debug)]
pub struct WriteParams {
    pub fd: Fd,
    pub written: usize,
}

/// Parameters for [`Handler::on_close`].
#[derive(Clone, Copy, Debug)]
pub struct CloseParams {
    pub fd: Fd,
}

/// Payload of a cross-worker mailbox message. The variants mirror the
/// callback parameter tuples so a forwarded event replays on the receiving
/// worker exactly as it would have fired locally.
#[derive(Clone, Debug)]
pub enum MailPayload {
    Accept(AcceptParams),
    Read { fd: Fd, kind: FdKind, data: Vec<u8> },
    Write { fd: Fd, written: usize },
    Close { fd: Fd },
    User(Vec<u8>),
}

impl MailPayload {
    /// Wire-style type code, kept stable for per-type FIFO accounting.
    pub fn type_code(&self) -> u8 {
        match self {
            MailPayload::Accept(_) => 1,
            MailPayload::Read { .. } => 2,
            MailPayload::Write { .. } => 3,
            MailPayload::Close { .. } => 4,
            MailPayload::User(_) => 5,
        }
    }
}

/// A message travelling between workers. Payload ownership transfers to the
/// receiving mailbox on send.
#[derive(Clone, Debug)]
pub struct MailboxMessage {
    pub sender: u32,
    /// The sender's event loop fd; opaque to receivers.
    pub sender_loop: Fd,
    pub sender_fd: Fd,
    pub receiver_fd: Fd,
    pub payload: MailPayload,
}

/// Services the runtime exposes to handlers. One instance per worker; the
/// handle is valid for the worker's whole lifetime and is not `Send`.
pub trait Runtime {
    fn worker_id(&self) -> u32;
    fn workers(&self) -> u32;
    fn node(&self) -> &NodeId;

    /// Non-blocking write of `data[offset..]` to `fd`. Returns the number of
    /// bytes the backend accepted (writable interest is re-armed when that
    /// is short), or -1 on a fatal error.
    fn write(&self, fd: Fd, kind: FdKind, data: &[u8], offset: usize) -> isize;

    /// Deregister and close `fd`. With `callback` the close event is
    /// delivered back to the handler synchronously.
    fn close(&self, fd: Fd, kind: FdKind, callback: bool) -> bool;

    /// Open a non-blocking outbound connection. The target string accepts a
    /// `v6:` or `unix:` prefix; see the connect-target syntax in the docs.
    fn connect(&self, target: &str, port: u16, datagram: bool) -> io::Result<Fd>;

    /// Deliver a message into another worker's mailbox.
    fn mail(&self, target: u32, msg: MailboxMessage) -> io::Result<()>;

    /// Arm a receive timeout on a connected socket; expiry surfaces as a
    /// read error followed by the close path.
    fn set_recv_timeout(&self, fd: Fd, secs: u32) -> bool;

    /// Peer address of a connected socket.
    fn peername(&self, fd: Fd) -> Option<(String, u16)>;
}

impl fmt::Debug for dyn Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("worker_id", &self.worker_id())
            .finish()
    }
}

/// The per-worker event handler. One boxed instance per worker thread,
/// created once and kept across module reloads.
pub trait Handler {
    fn on_init(&mut self, params: InitParams);
    fn on_accept(&mut self, params: AcceptParams);
    fn on_receive(&mut self, params: ReadParams<'_>);
    fn on_write(&mut self, params: WriteParams);
    fn on_close(&mut self, params: CloseParams);
    fn on_message(&mut self, msg: &MailboxMessage);

    /// Gate for inbound data; a `false` return skips the read for this
    /// event without closing the fd.
    fn is_fd_ready(&mut self, _fd: Fd, _kind: FdKind) -> bool {
        true
    }

    /// Called when the worker quiesces ahead of a module swap.
    fn pre_refresh(&mut self) {}

    /// Called after the module swap, before the loop is re-entered.
    fn refresh(&mut self) {}

    /// Called when the worker leaves its loop for the last time.
    fn unload(&mut self, _quit: bool) {}
}

/// Optional extension hooks loaded from `-m` module paths.
pub trait Extension {
    fn on_load(&mut self, _worker: u32, _reloaded: bool) {}
    fn on_unload(&mut self, _worker: u32, _quitting: bool) {}
}

/// Constructor signature a loadable handler module exports.
pub type HandlerEntry = fn(runtime: Rc<dyn Runtime>, node: &NodeId) -> Box<dyn Handler>;

/// Constructor signature a loadable extension module exports.
pub type ExtensionEntry = fn() -> Box<dyn Extension>;

/// Symbol name resolved from handler modules.
pub const HANDLER_ENTRY_SYMBOL: &[u8] = b"splay_handler_entry";

/// Symbol name resolved from extension modules.
pub const EXTENSION_ENTRY_SYMBOL: &[u8] = b"splay_extension_entry";
