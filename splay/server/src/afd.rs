//! The per-connection asynchronous fd.
//!
//! An [`Afd`] owns a read side (buffer, offset, delimiter scan state and a
//! FIFO queue of read requests) and a write side (buffer, flushed offset
//! and a FIFO queue of write promises). The worker feeds it raw events —
//! inbound chunks, writability, close — and the state machines resolve the
//! queued promises strictly in order.
//!
//! Handles are worker-local clones of one shared cell. Promise resolution
//! runs user continuations, which are free to enqueue further reads and
//! writes on the same fd; resolutions are therefore collected during a walk
//! and delivered after the cell borrow is released.

use crate::kmp::{KmpState, kmp};
use crate::promise::Promise;
use splay_common::{Fd, FdKind};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// The slice of backend the fd needs: one-shot writes and the close path.
/// Implementations must not re-enter the [`Afd`] they serve.
pub trait AfdIo {
    /// Writes `data[offset..]` once without blocking. Returns the bytes the
    /// backend accepted (re-arming writable interest itself when short), or
    /// a negative value when the connection failed.
    fn raw_write(&self, fd: Fd, kind: FdKind, data: &[u8], offset: usize) -> isize;

    /// Deregisters and closes the fd.
    fn raw_close(&self, fd: Fd, kind: FdKind);
}

/// Result of a read request. `error` is set when the fd closed (or failed)
/// before the request could be satisfied; `data` is empty in that case.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadArg {
    pub error: bool,
    pub data: Vec<u8>,
}

enum ReadKind {
    Any,
    Exactly(usize),
    Until(Vec<u8>),
}

struct ReadCommand {
    promise: Promise<ReadArg>,
    kind: ReadKind,
}

struct WriteSlot {
    promise: Promise<bool>,
    length: usize,
    sent: usize,
}

struct Inner {
    io: Rc<dyn AfdIo>,
    fd: Fd,
    kind: FdKind,
    closed: bool,
    has_error: bool,
    buffering: bool,

    read_offset: usize,
    delim_state: KmpState,
    read_buffer: Vec<u8>,
    read_commands: VecDeque<ReadCommand>,
    on_empty: Option<Box<dyn FnMut()>>,

    write_offset: usize,
    write_buffer: Vec<u8>,
    write_queue: VecDeque<WriteSlot>,
}

/// Cloneable handle to one connection's async state.
pub struct Afd {
    inner: Rc<RefCell<Inner>>,
}

impl Clone for Afd {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Afd {
    pub fn new(io: Rc<dyn AfdIo>, fd: Fd, kind: FdKind) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                io,
                fd,
                kind,
                closed: false,
                has_error: false,
                buffering: true,
                read_offset: 0,
                delim_state: KmpState::default(),
                read_buffer: Vec::new(),
                read_commands: VecDeque::new(),
                on_empty: None,
                write_offset: 0,
                write_buffer: Vec::new(),
                write_queue: VecDeque::new(),
            })),
        }
    }

    pub fn fd(&self) -> Fd {
        self.inner.borrow().fd
    }

    pub fn kind(&self) -> FdKind {
        self.inner.borrow().kind
    }

    /// Switches the kind tag, e.g. after a KTLS upgrade re-registered the
    /// fd. The caller is responsible for the backend side of the swap.
    pub fn set_kind(&self, kind: FdKind) {
        self.inner.borrow_mut().kind = kind;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub fn is_error(&self) -> bool {
        self.inner.borrow().has_error
    }

    /// With buffering off, inbound bytes that arrive while the read queue
    /// is empty are discarded after the empty-queue hook had its chance to
    /// re-arm.
    pub fn set_buffering(&self, buffering: bool) {
        self.inner.borrow_mut().buffering = buffering;
    }

    /// Installs the hook invoked whenever a chunk arrives and the read
    /// queue is empty, before any byte is appended or discarded.
    pub fn set_on_empty_queue<F>(&self, hook: F)
    where
        F: FnMut() + 'static,
    {
        self.inner.borrow_mut().on_empty = Some(Box::new(hook));
    }

    /// Resolves with whatever the read window holds on the next chunk.
    pub fn read_any(&self) -> Promise<ReadArg> {
        self.push_read(ReadKind::Any)
    }

    /// Resolves with exactly `n` bytes once they are available.
    pub fn read_n(&self, n: usize) -> Promise<ReadArg> {
        self.push_read(ReadKind::Exactly(n))
    }

    /// Resolves with the bytes up to (not including) `delim`, consuming the
    /// delimiter. A delimiter split across chunks matches exactly once.
    pub fn read_until(&self, delim: impl Into<Vec<u8>>) -> Promise<ReadArg> {
        self.push_read(ReadKind::Until(delim.into()))
    }

    fn push_read(&self, kind: ReadKind) -> Promise<ReadArg> {
        let promise = Promise::new();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                drop(inner);
                promise.resolve(ReadArg {
                    error: true,
                    data: Vec::new(),
                });
                return promise;
            }
            inner.read_commands.push_back(ReadCommand {
                promise: promise.clone(),
                kind,
            });
        }
        promise
    }

    /// Queues `data` and resolves the returned promise once the backend has
    /// acknowledged its last byte. Promises resolve in write order.
    pub fn write(&self, data: &[u8]) -> Promise<bool> {
        let promise = Promise::new();
        if data.is_empty() {
            promise.resolve(!self.is_closed());
            return promise;
        }
        let first = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed || inner.has_error {
                drop(inner);
                promise.resolve(false);
                return promise;
            }
            inner.write_buffer.extend_from_slice(data);
            inner.write_queue.push_back(WriteSlot {
                promise: promise.clone(),
                length: data.len(),
                sent: 0,
            });
            inner.write_queue.len() == 1
        };
        if first {
            let written = {
                let inner = self.inner.borrow();
                inner
                    .io
                    .raw_write(inner.fd, inner.kind, &inner.write_buffer, inner.write_offset)
            };
            if written < 0 {
                self.fail_writes();
            } else if written > 0 {
                self.on_write(written as usize);
            }
        }
        promise
    }

    /// Closes the fd and resolves everything outstanding. Idempotent.
    pub fn close(&self) {
        let target = {
            let inner = self.inner.borrow();
            if inner.closed {
                None
            } else {
                Some((Rc::clone(&inner.io), inner.fd, inner.kind))
            }
        };
        if let Some((io, fd, kind)) = target {
            io.raw_close(fd, kind);
            self.on_close();
        }
    }

    /// Close event from the backend: every pending read resolves with the
    /// error marker, every pending write with failure, buffers are freed.
    pub fn on_close(&self) {
        let (reads, writes) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let reads: Vec<_> = inner.read_commands.drain(..).map(|c| c.promise).collect();
            let writes: Vec<_> = inner.write_queue.drain(..).map(|w| w.promise).collect();
            inner.read_buffer = Vec::new();
            inner.write_buffer = Vec::new();
            inner.read_offset = 0;
            inner.write_offset = 0;
            inner.delim_state = KmpState::default();
            (reads, writes)
        };
        for promise in reads {
            promise.resolve(ReadArg {
                error: true,
                data: Vec::new(),
            });
        }
        for promise in writes {
            promise.resolve(false);
        }
    }

    /// Inbound chunk from the backend. Drives the read queue until no
    /// request can make further progress.
    pub fn on_data(&self, chunk: &[u8]) {
        let mut chunk = chunk;
        loop {
            {
                let inner = self.inner.borrow();
                if inner.closed {
                    return;
                }
                let window = inner.read_buffer.len() - inner.read_offset;
                if window + chunk.len() == 0 && inner.read_commands.is_empty() {
                    // A zero length chunk on an idle fd is a no-op.
                    return;
                }
            }
            let fire = {
                let inner = self.inner.borrow();
                inner.read_commands.is_empty() && inner.on_empty.is_some()
            };
            if fire {
                self.fire_empty_hook();
            }
            let resolutions = {
                let mut inner = self.inner.borrow_mut();
                if inner.closed {
                    return;
                }
                if !inner.buffering && inner.read_commands.is_empty() {
                    // Nothing will consume these bytes; drop them.
                    inner.read_buffer = Vec::new();
                    inner.read_offset = 0;
                    inner.delim_state = KmpState::default();
                    return;
                }
                if !chunk.is_empty() {
                    inner.read_buffer.extend_from_slice(chunk);
                    chunk = &[];
                }
                inner.drain_reads()
            };
            let progressed = !resolutions.is_empty();
            for (promise, arg) in resolutions {
                promise.resolve(arg);
            }
            if !progressed {
                break;
            }
            let drained = {
                let inner = self.inner.borrow();
                inner.closed || inner.read_buffer.is_empty()
            };
            if drained {
                break;
            }
        }
    }

    /// Backend reported `written` flushed bytes; `written == 0` is the
    /// writability notification asking us to flush.
    pub fn on_write(&self, written: usize) {
        let mut written = written;
        loop {
            let do_write = written == 0;
            let (resolutions, attempt) = {
                let mut inner = self.inner.borrow_mut();
                if inner.closed {
                    return;
                }
                inner.write_offset += written;
                let mut n = written;
                let mut resolutions = Vec::new();
                loop {
                    let due = match inner.write_queue.front() {
                        Some(front) => front.sent + n >= front.length,
                        None => break,
                    };
                    if due {
                        let slot = inner.write_queue.pop_front().expect("front was just read");
                        n -= slot.length - slot.sent;
                        resolutions.push(slot.promise);
                    } else {
                        if let Some(front) = inner.write_queue.front_mut() {
                            front.sent += n;
                        }
                        n = 0;
                        break;
                    }
                }
                let attempt = do_write && inner.write_offset < inner.write_buffer.len();
                (resolutions, attempt)
            };
            for promise in resolutions {
                promise.resolve(true);
            }
            if !attempt {
                break;
            }
            let result = {
                let inner = self.inner.borrow();
                if inner.closed {
                    return;
                }
                inner
                    .io
                    .raw_write(inner.fd, inner.kind, &inner.write_buffer, inner.write_offset)
            };
            if result < 0 {
                self.fail_writes();
                return;
            }
            written = result as usize;
            if written == 0 {
                // Backend is full; writable interest is armed, wait for it.
                break;
            }
        }
        let mut inner = self.inner.borrow_mut();
        if !inner.closed && inner.write_queue.is_empty() {
            inner.write_buffer = Vec::new();
            inner.write_offset = 0;
        }
    }

    fn fail_writes(&self) {
        let writes = {
            let mut inner = self.inner.borrow_mut();
            inner.has_error = true;
            let writes: Vec<_> = inner.write_queue.drain(..).map(|w| w.promise).collect();
            inner.write_buffer = Vec::new();
            inner.write_offset = 0;
            writes
        };
        for promise in writes {
            promise.resolve(false);
        }
    }

    fn fire_empty_hook(&self) {
        let hook = self.inner.borrow_mut().on_empty.take();
        if let Some(mut hook) = hook {
            hook();
            let mut inner = self.inner.borrow_mut();
            if inner.on_empty.is_none() {
                inner.on_empty = Some(hook);
            }
        }
    }
}

impl Inner {
    /// One pass over the read queue head, consuming from the window.
    /// Promises are handed back for resolution outside the borrow.
    fn drain_reads(&mut self) -> Vec<(Promise<ReadArg>, ReadArg)> {
        let mut out = Vec::new();
        let mut iterate = true;
        while iterate {
            let start = self.read_offset;
            let window_len = self.read_buffer.len() - start;
            if window_len == 0 {
                break;
            }
            // The head is taken out for the walk and put back when it could
            // not be satisfied, keeping FIFO order intact.
            let Some(command) = self.read_commands.pop_front() else {
                break;
            };
            match &command.kind {
                ReadKind::Any => {
                    let data = self.read_buffer[start..].to_vec();
                    self.read_offset = self.read_buffer.len();
                    out.push((command.promise, ReadArg { error: false, data }));
                    iterate = false;
                }
                ReadKind::Exactly(n) => {
                    let n = *n;
                    if window_len < n {
                        self.read_commands.push_front(command);
                        iterate = false;
                    } else {
                        let data = self.read_buffer[start..start + n].to_vec();
                        self.read_offset += n;
                        out.push((command.promise, ReadArg { error: false, data }));
                    }
                }
                ReadKind::Until(delim) => {
                    let window = &self.read_buffer[start..];
                    let part = kmp(window, delim, self.delim_state.offset, self.delim_state.matched);
                    if part.length == delim.len() {
                        let end = part.offset + part.length;
                        let data = window[..part.offset].to_vec();
                        self.read_offset += end;
                        self.delim_state = KmpState::default();
                        out.push((command.promise, ReadArg { error: false, data }));
                    } else if part.length > 0 {
                        self.delim_state.matched = part.length;
                        self.delim_state.offset = part.offset + part.length;
                        self.read_commands.push_front(command);
                        iterate = false;
                    } else {
                        self.delim_state.matched = 0;
                        self.delim_state.offset = part.offset;
                        self.read_commands.push_front(command);
                        iterate = false;
                    }
                }
            }
        }
        if self.read_offset >= self.read_buffer.len()
            || (!self.buffering && self.read_commands.is_empty())
        {
            self.read_offset = 0;
            self.read_buffer = Vec::new();
            self.delim_state = KmpState::default();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct MockIo {
        /// Bytes accepted per raw_write call.
        accept: Cell<usize>,
        fail: Cell<bool>,
        sent: RefCell<Vec<u8>>,
        closes: Cell<u32>,
    }

    impl MockIo {
        fn unlimited() -> Rc<Self> {
            Rc::new(Self {
                accept: Cell::new(usize::MAX),
                fail: Cell::new(false),
                sent: RefCell::new(Vec::new()),
                closes: Cell::new(0),
            })
        }

        fn throttled(per_call: usize) -> Rc<Self> {
            let io = Self::unlimited();
            io.accept.set(per_call);
            io
        }
    }

    impl AfdIo for MockIo {
        fn raw_write(&self, _fd: Fd, _kind: FdKind, data: &[u8], offset: usize) -> isize {
            if self.fail.get() {
                return -1;
            }
            let avail = &data[offset..];
            let n = avail.len().min(self.accept.get());
            self.sent.borrow_mut().extend_from_slice(&avail[..n]);
            n as isize
        }

        fn raw_close(&self, _fd: Fd, _kind: FdKind) {
            self.closes.set(self.closes.get() + 1);
        }
    }

    fn capture(promise: &Promise<ReadArg>) -> Rc<RefCell<Option<ReadArg>>> {
        let out = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&out);
        promise.then(move |arg| *sink.borrow_mut() = Some(arg));
        out
    }

    fn capture_write(promise: &Promise<bool>, log: &Rc<RefCell<Vec<(u8, bool)>>>, tag: u8) {
        let sink = Rc::clone(log);
        promise.then(move |ok| sink.borrow_mut().push((tag, ok)));
    }

    #[test]
    fn read_any_returns_the_whole_window() {
        let afd = Afd::new(MockIo::unlimited(), 5, FdKind::Stream);
        let got = capture(&afd.read_any());
        afd.on_data(b"hello");
        assert_eq!(
            got.borrow().as_ref().unwrap(),
            &ReadArg { error: false, data: b"hello".to_vec() }
        );
    }

    #[test]
    fn read_n_waits_for_enough_bytes() {
        let afd = Afd::new(MockIo::unlimited(), 5, FdKind::Stream);
        let got = capture(&afd.read_n(10));
        afd.on_data(b"hell");
        assert!(got.borrow().is_none());
        afd.on_data(b"o worlds");
        assert_eq!(got.borrow().as_ref().unwrap().data, b"hello worl");
    }

    #[test]
    fn split_delimiter_matches_exactly_once() {
        let afd = Afd::new(MockIo::unlimited(), 5, FdKind::Stream);
        let got = capture(&afd.read_until(*b"\r\n\r\n"));
        for chunk in [&b"A"[..], b"\r", b"\n", b"\r"] {
            afd.on_data(chunk);
            assert!(got.borrow().is_none());
        }
        afd.on_data(b"\n");
        assert_eq!(got.borrow().as_ref().unwrap().data, b"A");

        // No delimiter byte leaks into the next request.
        let next = capture(&afd.read_any());
        afd.on_data(b"Z");
        assert_eq!(next.borrow().as_ref().unwrap().data, b"Z");
    }

    #[test]
    fn false_delimiter_prefix_is_not_trusted() {
        let afd = Afd::new(MockIo::unlimited(), 5, FdKind::Stream);
        let got = capture(&afd.read_until(*b"\r\n\r\n"));
        afd.on_data(b"A\r\n");
        afd.on_data(b"B\r\nC");
        assert!(got.borrow().is_none());
        afd.on_data(b"\r\n\r\n");
        assert_eq!(got.borrow().as_ref().unwrap().data, b"A\r\nB\r\nC");
    }

    #[test]
    fn mixed_requests_resolve_in_request_order() {
        let afd = Afd::new(MockIo::unlimited(), 5, FdKind::Stream);
        let first = capture(&afd.read_n(5));
        let second = capture(&afd.read_until(*b"|"));
        let third = capture(&afd.read_any());
        afd.on_data(b"hello wo");
        assert_eq!(first.borrow().as_ref().unwrap().data, b"hello");
        assert!(second.borrow().is_none());
        afd.on_data(b"rld|rest");
        assert_eq!(second.borrow().as_ref().unwrap().data, b" world");
        assert_eq!(third.borrow().as_ref().unwrap().data, b"rest");
    }

    #[test]
    fn write_promises_track_cumulative_flushes() {
        let io = MockIo::throttled(50 * 1024);
        let afd = Afd::new(Rc::clone(&io) as Rc<dyn AfdIo>, 5, FdKind::Stream);
        let log = Rc::new(RefCell::new(Vec::new()));
        let payload_a = vec![b'a'; 100 * 1024];
        let payload_b = vec![b'b'; 100 * 1024];
        let payload_c = vec![b'c'; 100 * 1024];
        capture_write(&afd.write(&payload_a), &log, 1);
        capture_write(&afd.write(&payload_b), &log, 2);
        capture_write(&afd.write(&payload_c), &log, 3);
        // The immediate attempt flushed only 50 KiB; no promise is due yet.
        assert!(log.borrow().is_empty());

        // Each writability notification lets another 50 KiB through.
        let mut seen = Vec::new();
        for _ in 0..5 {
            afd.on_write(0);
            seen.push(log.borrow().len());
        }
        assert_eq!(seen, vec![1, 1, 2, 2, 3]);
        assert_eq!(
            *log.borrow(),
            vec![(1, true), (2, true), (3, true)]
        );

        let sent = io.sent.borrow();
        assert_eq!(sent.len(), 300 * 1024);
        assert!(sent[..100 * 1024].iter().all(|&b| b == b'a'));
        assert!(sent[100 * 1024..200 * 1024].iter().all(|&b| b == b'b'));
        assert!(sent[200 * 1024..].iter().all(|&b| b == b'c'));
    }

    #[test]
    fn close_during_pending_read_resolves_with_error() {
        let io = MockIo::unlimited();
        let afd = Afd::new(Rc::clone(&io) as Rc<dyn AfdIo>, 5, FdKind::Stream);
        let got = capture(&afd.read_n(1024));
        afd.on_data(&[0u8; 200]);
        assert!(got.borrow().is_none());
        afd.close();
        assert_eq!(
            got.borrow().as_ref().unwrap(),
            &ReadArg { error: true, data: Vec::new() }
        );
        // Closing again is a no-op.
        afd.close();
        assert_eq!(io.closes.get(), 1);
    }

    #[test]
    fn requests_after_close_resolve_immediately() {
        let afd = Afd::new(MockIo::unlimited(), 5, FdKind::Stream);
        afd.close();
        let read = capture(&afd.read_any());
        assert!(read.borrow().as_ref().unwrap().error);
        let log = Rc::new(RefCell::new(Vec::new()));
        capture_write(&afd.write(b"late"), &log, 9);
        assert_eq!(*log.borrow(), vec![(9, false)]);
    }

    #[test]
    fn close_fails_pending_writes() {
        let io = MockIo::throttled(1);
        let afd = Afd::new(io, 5, FdKind::Stream);
        let log = Rc::new(RefCell::new(Vec::new()));
        capture_write(&afd.write(b"abcd"), &log, 1);
        capture_write(&afd.write(b"efgh"), &log, 2);
        assert!(log.borrow().is_empty());
        afd.on_close();
        assert_eq!(*log.borrow(), vec![(1, false), (2, false)]);
    }

    #[test]
    fn empty_queue_hook_installs_the_next_read() {
        let afd = Afd::new(MockIo::unlimited(), 5, FdKind::Stream);
        let got = Rc::new(RefCell::new(None));
        let hook_afd = afd.clone();
        let sink = Rc::clone(&got);
        afd.set_on_empty_queue(move || {
            let sink = Rc::clone(&sink);
            hook_afd
                .read_any()
                .then(move |arg| *sink.borrow_mut() = Some(arg));
        });
        afd.on_data(b"pushed");
        assert_eq!(got.borrow().as_ref().unwrap().data, b"pushed");
    }

    #[test]
    fn buffering_disabled_discards_unclaimed_bytes() {
        let afd = Afd::new(MockIo::unlimited(), 5, FdKind::Stream);
        afd.set_buffering(false);
        afd.on_data(b"dropped");
        let got = capture(&afd.read_any());
        afd.on_data(b"kept");
        assert_eq!(got.borrow().as_ref().unwrap().data, b"kept");
    }

    #[test]
    fn failed_backend_write_fails_every_promise() {
        let io = MockIo::throttled(1);
        let afd = Afd::new(Rc::clone(&io) as Rc<dyn AfdIo>, 5, FdKind::Stream);
        let log = Rc::new(RefCell::new(Vec::new()));
        capture_write(&afd.write(b"ab"), &log, 1);
        capture_write(&afd.write(b"cd"), &log, 2);
        io.fail.set(true);
        afd.on_write(0);
        assert_eq!(*log.borrow(), vec![(1, false), (2, false)]);
        assert!(afd.is_error());
        // Later writes fail without touching the backend.
        capture_write(&afd.write(b"ef"), &log, 3);
        assert_eq!(log.borrow().last(), Some(&(3, false)));
    }
}
