//! Windows IOCP backend.
//!
//! A proactor adapted to the reactor surface: every registered fd keeps a
//! pair of overlapped contexts, one per direction. A receive is always
//! pre-posted; its completion is delivered as a readable event and the
//! completed bytes are handed out through [`Backend::recv`], which
//! immediately pre-posts the next receive. Send completions surface as
//! writable events. Accept handling pre-posts `AcceptEx` sockets sharded
//! round-robin across the workers' ports so no single worker serializes
//! accepts.

#![allow(clippy::missing_safety_doc)]

use super::{Event, Interest};
use splay_common::{BUF_SIZE, Fd, FdKind, MAX_EVENTS};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::ptr;
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_IO_PENDING, GetLastError, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Networking::WinSock::{
    AF_INET, INVALID_SOCKET, IPPROTO_TCP, SOCK_STREAM, SOCKET, SOCKET_ERROR, WSABUF,
    WSAGetLastError, WSARecv, WSASend, WSASocketW, WSA_FLAG_OVERLAPPED, closesocket,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
};

const OP_READ: u8 = 1;
const OP_ACCEPT: u8 = 2;
const OP_WRITE: u8 = 3;

#[repr(C)]
struct OverlappedCtx {
    // Must stay the first field: a completion hands back the OVERLAPPED
    // pointer and we recover the context from it.
    ol: OVERLAPPED,
    op: u8,
    kind: FdKind,
    fd: Fd,
    buf: Vec<u8>,
}

impl OverlappedCtx {
    fn new(fd: Fd, kind: FdKind, op: u8) -> Box<Self> {
        Box::new(Self {
            ol: unsafe { std::mem::zeroed() },
            op,
            kind,
            fd,
            buf: vec![0u8; BUF_SIZE],
        })
    }
}

struct FdCtx {
    recv: Box<OverlappedCtx>,
    send: Box<OverlappedCtx>,
    /// Completed receives not yet consumed through `recv`.
    completed: VecDeque<Vec<u8>>,
    /// End of stream or failed receive observed.
    eof: bool,
}

pub struct Backend {
    port: HANDLE,
    contexts: RefCell<HashMap<Fd, FdCtx>>,
}

impl Backend {
    pub fn new() -> io::Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 1, 1) };
        if port == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            port,
            contexts: RefCell::new(HashMap::new()),
        })
    }

    pub fn raw(&self) -> Fd {
        self.port as Fd
    }

    fn associate(&self, fd: Fd) -> io::Result<()> {
        let res = unsafe { CreateIoCompletionPort(fd as HANDLE, self.port, fd as usize, 0) };
        if res == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn post_recv(ctx: &mut OverlappedCtx) -> io::Result<()> {
        ctx.op = OP_READ;
        ctx.ol = unsafe { std::mem::zeroed() };
        if ctx.kind == FdKind::Pipe || ctx.kind == FdKind::Other {
            let ok = unsafe {
                ReadFile(
                    ctx.fd as HANDLE,
                    ctx.buf.as_mut_ptr(),
                    ctx.buf.len() as u32,
                    ptr::null_mut(),
                    &mut ctx.ol,
                )
            };
            if ok == 0 && unsafe { GetLastError() } != ERROR_IO_PENDING {
                return Err(io::Error::last_os_error());
            }
        } else {
            let mut wsabuf = WSABUF {
                len: ctx.buf.len() as u32,
                buf: ctx.buf.as_mut_ptr(),
            };
            let mut flags = 0u32;
            let res = unsafe {
                WSARecv(
                    ctx.fd as SOCKET,
                    &mut wsabuf,
                    1,
                    ptr::null_mut(),
                    &mut flags,
                    &mut ctx.ol,
                    None,
                )
            };
            if res == SOCKET_ERROR && unsafe { WSAGetLastError() } != ERROR_IO_PENDING as i32 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn register(&self, fd: Fd, kind: FdKind, _interest: Interest) -> io::Result<()> {
        self.associate(fd)?;
        let mut recv = OverlappedCtx::new(fd, kind, OP_READ);
        let send = OverlappedCtx::new(fd, kind, OP_WRITE);
        unsafe { Self::post_recv(&mut recv)? };
        self.contexts.borrow_mut().insert(
            fd,
            FdCtx {
                recv,
                send,
                completed: VecDeque::new(),
                eof: false,
            },
        );
        Ok(())
    }

    /// Interest changes are implicit under a proactor; completions arrive
    /// for whatever was posted.
    pub fn modify(&self, _fd: Fd, _kind: FdKind, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    pub fn deregister(&self, fd: Fd, _kind: FdKind) -> io::Result<()> {
        self.contexts.borrow_mut().remove(&fd);
        Ok(())
    }

    pub fn wait(&self, events: &mut Vec<Event>, timeout_ms: Option<u16>) -> io::Result<usize> {
        let mut entries: [OVERLAPPED_ENTRY; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let mut count = 0u32;
        let timeout = timeout_ms.map(u32::from).unwrap_or(u32::MAX);
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                MAX_EVENTS as u32,
                &mut count,
                timeout,
                0,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if timeout_ms.is_some() {
                return Ok(0);
            }
            return Err(err);
        }
        let mut contexts = self.contexts.borrow_mut();
        for entry in entries.iter().take(count as usize) {
            let (op, fd, kind) = {
                let ctx = unsafe { &*(entry.lpOverlapped as *const OverlappedCtx) };
                (ctx.op, ctx.fd, ctx.kind)
            };
            let transferred = entry.dwNumberOfBytesTransferred as usize;
            match op {
                OP_READ => {
                    if let Some(holder) = contexts.get_mut(&fd) {
                        if transferred == 0 {
                            holder.eof = true;
                        } else {
                            let data = holder.recv.buf[..transferred].to_vec();
                            holder.completed.push_back(data);
                            let _ = unsafe { Self::post_recv(&mut holder.recv) };
                        }
                    }
                    events.push(Event {
                        fd,
                        kind,
                        readable: true,
                        writable: false,
                        error: false,
                        hangup: transferred == 0,
                    });
                }
                OP_WRITE => {
                    events.push(Event {
                        fd,
                        kind,
                        readable: false,
                        writable: true,
                        error: false,
                        hangup: false,
                    });
                }
                OP_ACCEPT => {
                    // Ownership of the pre-posted context returns to us
                    // with the completion.
                    drop(unsafe { Box::from_raw(entry.lpOverlapped as *mut OverlappedCtx) });
                    events.push(Event {
                        fd,
                        kind: FdKind::Server,
                        readable: true,
                        writable: false,
                        error: false,
                        hangup: false,
                    });
                }
                _ => {}
            }
        }
        Ok(count as usize)
    }

    /// Takes over a socket whose accept completed here: the handle is
    /// already associated with this port, so only the context pair and the
    /// first receive are set up.
    pub fn adopt_accepted(&self, fd: Fd) -> io::Result<()> {
        let mut recv = OverlappedCtx::new(fd, FdKind::Stream, OP_READ);
        let send = OverlappedCtx::new(fd, FdKind::Stream, OP_WRITE);
        unsafe { Self::post_recv(&mut recv)? };
        self.contexts.borrow_mut().insert(
            fd,
            FdCtx {
                recv,
                send,
                completed: VecDeque::new(),
                eof: false,
            },
        );
        Ok(())
    }

    /// Pre-posts `per_worker` accepts per registered worker loop, each
    /// accepted socket already associated with its target worker's port so
    /// no single worker serializes the accept stream.
    pub fn prepost_accepts(
        &self,
        listener: Fd,
        loops: &[Option<Fd>],
        per_worker: u32,
    ) -> io::Result<()> {
        use windows_sys::Win32::Networking::WinSock::AcceptEx;

        const ADDR_SPACE: u32 = (std::mem::size_of::<windows_sys::Win32::Networking::WinSock::SOCKADDR_STORAGE>() + 16) as u32;

        for target in loops.iter().flatten() {
            for _ in 0..per_worker {
                let child = Self::overlapped_socket()?;
                let mut ctx = OverlappedCtx::new(child, FdKind::Stream, OP_ACCEPT);
                let mut received = 0u32;
                let ok = unsafe {
                    AcceptEx(
                        listener as SOCKET,
                        child as SOCKET,
                        ctx.buf.as_mut_ptr().cast(),
                        0,
                        ADDR_SPACE,
                        ADDR_SPACE,
                        &mut received,
                        &mut ctx.ol,
                    )
                };
                if ok == 0 && unsafe { WSAGetLastError() } != ERROR_IO_PENDING as i32 {
                    unsafe { closesocket(child as SOCKET) };
                    return Err(io::Error::last_os_error());
                }
                let res =
                    unsafe { CreateIoCompletionPort(child as HANDLE, *target as HANDLE, child as usize, 0) };
                if res == 0 {
                    unsafe { closesocket(child as SOCKET) };
                    return Err(io::Error::last_os_error());
                }
                // The kernel owns the context until the completion fires.
                std::mem::forget(ctx);
            }
        }
        Ok(())
    }

    /// Hands out one completed receive; `WouldBlock` when nothing has
    /// completed yet, 0 at end of stream.
    pub fn recv(&self, fd: Fd, _kind: FdKind, buf: &mut [u8]) -> io::Result<usize> {
        let mut contexts = self.contexts.borrow_mut();
        let holder = contexts
            .get_mut(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        match holder.completed.pop_front() {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None if holder.eof => Ok(0),
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    /// Posts an overlapped send of the whole buffer; the completion is
    /// reported later as a writable event.
    pub fn send(&self, fd: Fd, kind: FdKind, data: &[u8]) -> io::Result<usize> {
        let mut contexts = self.contexts.borrow_mut();
        let holder = contexts
            .get_mut(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let ctx = &mut holder.send;
        ctx.op = OP_WRITE;
        ctx.ol = unsafe { std::mem::zeroed() };
        ctx.buf.clear();
        ctx.buf.extend_from_slice(data);
        if kind == FdKind::Pipe || kind == FdKind::Other {
            let ok = unsafe {
                WriteFile(
                    fd as HANDLE,
                    ctx.buf.as_ptr(),
                    ctx.buf.len() as u32,
                    ptr::null_mut(),
                    &mut ctx.ol,
                )
            };
            if ok == 0 && unsafe { GetLastError() } != ERROR_IO_PENDING {
                return Err(io::Error::last_os_error());
            }
        } else {
            let mut wsabuf = WSABUF {
                len: ctx.buf.len() as u32,
                buf: ctx.buf.as_mut_ptr(),
            };
            let res = unsafe {
                WSASend(
                    fd as SOCKET,
                    &mut wsabuf,
                    1,
                    ptr::null_mut(),
                    0,
                    &mut ctx.ol,
                    None,
                )
            };
            if res == SOCKET_ERROR && unsafe { WSAGetLastError() } != ERROR_IO_PENDING as i32 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(data.len())
    }

    pub fn close(&self, fd: Fd, kind: FdKind) -> io::Result<()> {
        self.contexts.borrow_mut().remove(&fd);
        match kind {
            FdKind::Stream | FdKind::Dgram | FdKind::Ktls | FdKind::Server => unsafe {
                closesocket(fd as SOCKET);
            },
            _ => unsafe {
                CloseHandle(fd as HANDLE);
            },
        }
        Ok(())
    }

    /// Pre-creates an overlapped socket so accepts can be pre-posted.
    pub fn overlapped_socket() -> io::Result<Fd> {
        let socket = unsafe {
            WSASocketW(
                AF_INET as i32,
                SOCK_STREAM as i32,
                IPPROTO_TCP as i32,
                ptr::null(),
                0,
                WSA_FLAG_OVERLAPPED,
            )
        };
        if socket == INVALID_SOCKET {
            return Err(io::Error::last_os_error());
        }
        Ok(socket as Fd)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.port);
        }
    }
}

/// Named pipe pair used as a mailbox wakeup channel; byte semantics match
/// the POSIX self-pipe.
pub fn wake_pipe(worker: u32) -> io::Result<(Fd, Fd)> {
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_OVERLAPPED, OPEN_EXISTING,
    };
    use windows_sys::Win32::System::Pipes::CreateNamedPipeW;

    let name: Vec<u16> = format!(
        "\\\\.\\pipe\\splay_{}_{}",
        std::process::id(),
        worker
    )
    .encode_utf16()
    .chain(std::iter::once(0))
    .collect();

    let read_end = unsafe {
        CreateNamedPipeW(
            name.as_ptr(),
            0x00000001 | FILE_FLAG_OVERLAPPED, // PIPE_ACCESS_INBOUND
            0,
            1,
            4096,
            4096,
            1000,
            ptr::null(),
        )
    };
    if read_end == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    let write_end = unsafe {
        CreateFileW(
            name.as_ptr(),
            0x40000000, // GENERIC_WRITE
            0,
            ptr::null(),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            0,
        )
    };
    if write_end == INVALID_HANDLE_VALUE {
        unsafe { CloseHandle(read_end) };
        return Err(io::Error::last_os_error());
    }
    Ok((read_end as Fd, write_end as Fd))
}

pub fn wake_write(handle: Fd, byte: u8) -> io::Result<()> {
    let data = [byte];
    let mut written = 0u32;
    let ok = unsafe {
        WriteFile(
            handle as HANDLE,
            data.as_ptr(),
            1,
            &mut written,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn close_handle(handle: Fd) {
    unsafe {
        CloseHandle(handle as HANDLE);
    }
}
