//! The worker reactor: one thread, one backend, one mailbox, one handler.
//!
//! Worker 0 additionally owns the listening socket and the child reaper.
//! The loop waits on the backend and dispatches: accepts (round-robin,
//! local or handed off through a mailbox), control bytes on the self-pipe,
//! inbound data (read to exhaustion, EAGAIN re-arms, EOF and real errors
//! close), one-shot writability, and pipe hangups (drained before the
//! close fires).

use crate::backend::{Backend, Event, Interest};
use crate::dispatch::RoundRobin;
#[cfg(unix)]
use crate::dispatch::accept_pending;
use crate::reload::ReloadContext;
use crate::runtime::RuntimeHandle;
use anyhow::{Context, Result};
use splay_common::{
    AcceptParams, BUF_SIZE, CloseParams, Control, Fd, FdKind, Handler, InitParams, MAX_EVENTS,
    MailPayload, MailboxMessage, ReadParams, WriteParams,
};
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, trace};

#[cfg(target_os = "linux")]
use nix::sys::signalfd::SignalFd;

/// Why the reactor loop returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServeExit {
    /// Quiesce for a module reload, then re-enter.
    Stop,
    /// Tear down for good.
    Quit,
}

pub struct Worker {
    id: u32,
    backend: Rc<Backend>,
    runtime: Rc<RuntimeHandle>,
    reload: Arc<ReloadContext>,
    listener: Option<Fd>,
    rr: RoundRobin,
    initialized: bool,
    /// Consumed by the proactor backend's accept pre-posting.
    #[cfg_attr(not(windows), allow(dead_code))]
    accept_slots: u32,
    buf: Vec<u8>,
    #[cfg(target_os = "linux")]
    signal_fd: Option<SignalFd>,
}

impl Worker {
    pub fn new(
        id: u32,
        listener: Option<Fd>,
        backend: Rc<Backend>,
        runtime: Rc<RuntimeHandle>,
        reload: Arc<ReloadContext>,
    ) -> Self {
        let workers = reload.workers();
        Self {
            id,
            backend,
            runtime,
            reload,
            listener,
            rr: RoundRobin::new(workers),
            initialized: false,
            accept_slots: 4,
            buf: vec![0u8; BUF_SIZE],
            #[cfg(target_os = "linux")]
            signal_fd: None,
        }
    }

    /// Accepts pre-posted per worker by the proactor backend.
    pub fn set_accept_slots(&mut self, slots: u32) {
        self.accept_slots = slots.max(1);
    }

    fn self_pipe(&self) -> Fd {
        self.reload
            .mailbox(self.id)
            .map(|mailbox| mailbox.wake_fd())
            .unwrap_or(-1)
    }

    /// Runs the reactor until a stop or quit byte arrives. Re-entered after
    /// a reload completes; registrations and the handler context persist.
    pub fn serve(&mut self, handler: &mut dyn Handler) -> Result<ServeExit> {
        if !self.initialized {
            self.init(handler).context("initialize worker")?;
        }

        let self_pipe = self.self_pipe();
        let mut events: Vec<Event> = Vec::with_capacity(MAX_EVENTS);
        loop {
            events.clear();
            self.backend
                .wait(&mut events, None)
                .context("wait on backend")?;

            let mut exit = None;
            'batch: for n in 0..events.len() {
                let event = events[n];

                #[cfg(target_os = "linux")]
                if self.is_signal_event(&event) {
                    self.reap_children();
                    continue;
                }

                if event.kind == FdKind::Server {
                    self.accept_loop(handler, event.fd);
                    continue;
                }

                if event.fd == self_pipe {
                    if let Some(requested) = self.drain_control(handler) {
                        exit = Some(requested);
                    }
                    continue;
                }

                let mut closed = false;
                if event.writable {
                    // One writability notification per arm; interest drops
                    // back to readable until the next short write.
                    if event.kind != FdKind::Pipe {
                        if let Err(e) = self.backend.modify(event.fd, event.kind, Interest::READ) {
                            debug!("drop writable interest for fd {}: {e}", event.fd);
                        }
                    }
                    handler.on_write(WriteParams {
                        fd: event.fd,
                        written: 0,
                    });
                    self.flush_deferred(handler);
                }
                if event.readable && handler.is_fd_ready(event.fd, event.kind) {
                    closed = self.read_loop(handler, event.fd, event.kind);
                }
                if !closed && (event.error || event.hangup) {
                    if event.kind == FdKind::Pipe {
                        // Pipes can deliver data and hangup together; the
                        // remaining bytes come out before the close.
                        self.read_loop(handler, event.fd, event.kind);
                    }
                    self.close_fd(handler, event.fd, event.kind);
                    // The rest of the batch may reference the fd just
                    // closed; let the backend re-report anything live.
                    break 'batch;
                }
            }

            if let Some(exit) = exit {
                return Ok(exit);
            }
        }
    }

    fn init(&mut self, handler: &mut dyn Handler) -> Result<()> {
        let self_pipe = self.self_pipe();
        self.reload.set_event_loop(self.id, self.backend.raw());
        self.backend
            .register(self_pipe, FdKind::Pipe, Interest::READ)
            .context("register self pipe")?;

        if self.id == 0 {
            if let Some(listener) = self.listener {
                crate::server::enable_async(listener);
                self.backend
                    .register(listener, FdKind::Server, Interest::READ)
                    .context("register listening socket")?;
                #[cfg(windows)]
                self.backend
                    .prepost_accepts(listener, &self.reload.event_loops(), self.accept_slots)
                    .context("pre-post accepts")?;
            }
            self.init_child_reaper().context("init child reaper")?;
        }

        handler.on_init(InitParams {
            listener: self.listener,
        });
        self.flush_deferred(handler);
        self.initialized = true;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn init_child_reaper(&mut self) -> Result<()> {
        use nix::sys::signal::{SigSet, Signal};
        use nix::sys::signalfd::SfdFlags;
        use std::os::fd::AsRawFd;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block().context("block reaped signals")?;
        let signal_fd =
            SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK).context("create signalfd")?;
        self.backend
            .register(signal_fd.as_raw_fd(), FdKind::Other, Interest::READ)
            .context("register signalfd")?;
        self.signal_fd = Some(signal_fd);
        Ok(())
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn init_child_reaper(&mut self) -> Result<()> {
        use nix::sys::signal::{SigHandler, Signal, signal};

        // Ignoring SIGCHLD makes the kernel reap for us.
        unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }.context("ignore SIGCHLD")?;
        Ok(())
    }

    #[cfg(windows)]
    fn init_child_reaper(&mut self) -> Result<()> {
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn is_signal_event(&self, event: &Event) -> bool {
        use std::os::fd::AsRawFd;
        match &self.signal_fd {
            Some(signal_fd) => event.fd == signal_fd.as_raw_fd() && event.readable,
            None => false,
        }
    }

    #[cfg(target_os = "linux")]
    fn reap_children(&mut self) {
        use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
        use nix::unistd::Pid;

        let mut terminate = false;
        if let Some(signal_fd) = &mut self.signal_fd {
            while let Ok(Some(info)) = signal_fd.read_signal() {
                if info.ssi_signo == libc::SIGINT as u32 || info.ssi_signo == libc::SIGTERM as u32 {
                    terminate = true;
                }
            }
        }
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(status) => trace!("reaped child: {status:?}"),
            }
        }
        if terminate {
            debug!("received termination signal, fanning out quit");
            if let Err(e) = self.reload.quit() {
                error!("fan out quit bytes: {e}");
            }
        }
    }

    /// Accepts until the backlog drains, assigning each connection round
    /// robin: local ones register here, others travel by mailbox.
    #[cfg(unix)]
    fn accept_loop(&mut self, handler: &mut dyn Handler, listener: Fd) {
        loop {
            let (child, peer) = match accept_pending(listener) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    error!("accept: {e}");
                    break;
                }
            };
            let target = self.rr.next();
            let params = AcceptParams {
                listener,
                fd: child,
                kind: FdKind::Stream,
                peer,
            };
            if target == self.id {
                if let Err(e) = self.backend.register(child, FdKind::Stream, Interest::READ) {
                    error!("register accepted fd {child}: {e}");
                    let _ = self.backend.close(child, FdKind::Stream);
                    continue;
                }
                handler.on_accept(params);
                self.flush_deferred(handler);
            } else {
                let msg = MailboxMessage {
                    sender: self.id,
                    sender_loop: self.backend.raw(),
                    sender_fd: listener,
                    receiver_fd: child,
                    payload: MailPayload::Accept(params),
                };
                match self.reload.mailbox(target) {
                    Some(mailbox) => {
                        if let Err(e) = mailbox.mail(msg) {
                            error!("hand off accepted fd to worker {target}: {e}");
                        }
                    }
                    None => error!("no mailbox for worker {target}"),
                }
            }
        }
    }

    /// Under the proactor the accept already completed; the event carries
    /// the accepted socket itself. Promote it here and replenish the
    /// pre-posted pool for this worker.
    #[cfg(windows)]
    fn accept_loop(&mut self, handler: &mut dyn Handler, accepted: Fd) {
        if let Err(e) = self.backend.adopt_accepted(accepted) {
            error!("adopt accepted socket {accepted}: {e}");
            return;
        }
        handler.on_accept(AcceptParams {
            listener: self.listener.unwrap_or_default(),
            fd: accepted,
            kind: FdKind::Stream,
            peer: None,
        });
        self.flush_deferred(handler);
        if let Some(listener) = self.listener {
            let own = [Some(self.backend.raw())];
            if let Err(e) = self.backend.prepost_accepts(listener, &own, 1) {
                error!("replenish accept pool: {e}");
            }
        }
    }

    /// Reads and dispatches the control bytes queued on the self-pipe.
    fn drain_control(&mut self, handler: &mut dyn Handler) -> Option<ServeExit> {
        let mut exit = None;
        let self_pipe = self.self_pipe();
        loop {
            let n = match self.backend.recv(self_pipe, FdKind::Pipe, &mut self.buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("read self pipe: {e}");
                    break;
                }
            };
            for i in 0..n {
                match Control::from_byte(self.buf[i]) {
                    Some(Control::Stop) => {
                        handler.pre_refresh();
                        exit = Some(ServeExit::Stop);
                    }
                    Some(Control::Quit) => exit = Some(ServeExit::Quit),
                    Some(Control::Mail) => self.drain_mailbox(handler),
                    None => {}
                }
            }
        }
        exit
    }

    /// Dispatches every queued mailbox message, in enqueue order, outside
    /// the mailbox lock.
    fn drain_mailbox(&mut self, handler: &mut dyn Handler) {
        let Some(mailbox) = self.reload.mailbox(self.id) else {
            return;
        };
        let messages = mailbox.drain();
        for msg in messages {
            match &msg.payload {
                MailPayload::Accept(params) => {
                    if let Err(e) =
                        self.backend
                            .register(params.fd, params.kind, Interest::READ)
                    {
                        error!("register handed-off fd {}: {e}", params.fd);
                        let _ = self.backend.close(params.fd, params.kind);
                        continue;
                    }
                    handler.on_accept(params.clone());
                }
                MailPayload::Read { fd, kind, data } => handler.on_receive(ReadParams {
                    fd: *fd,
                    kind: *kind,
                    data,
                }),
                MailPayload::Write { fd, written } => handler.on_write(WriteParams {
                    fd: *fd,
                    written: *written,
                }),
                MailPayload::Close { fd } => handler.on_close(CloseParams { fd: *fd }),
                MailPayload::User(_) => handler.on_message(&msg),
            }
            self.flush_deferred(handler);
        }
    }

    /// Reads `fd` to exhaustion. EAGAIN re-arms via the backend; EOF and
    /// real errors take the close path. Returns whether the fd closed.
    fn read_loop(&mut self, handler: &mut dyn Handler, fd: Fd, kind: FdKind) -> bool {
        loop {
            let n = match self.backend.recv(fd, kind, &mut self.buf) {
                Ok(0) => {
                    self.close_fd(handler, fd, kind);
                    return true;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read fd {fd}: {e}");
                    self.close_fd(handler, fd, kind);
                    return true;
                }
            };
            handler.on_receive(ReadParams {
                fd,
                kind,
                data: &self.buf[..n],
            });
            self.flush_deferred(handler);
        }
    }

    fn close_fd(&self, handler: &mut dyn Handler, fd: Fd, kind: FdKind) {
        if let Err(e) = self.backend.close(fd, kind) {
            debug!("close fd {fd}: {e}");
        }
        handler.on_close(CloseParams { fd });
        self.flush_deferred(handler);
    }

    /// Delivers close events a handler requested through the ABI while one
    /// of its callbacks was still running.
    fn flush_deferred(&self, handler: &mut dyn Handler) {
        loop {
            let pending = self.runtime.take_deferred_closes();
            if pending.is_empty() {
                break;
            }
            for params in pending {
                handler.on_close(params);
            }
        }
    }
}
