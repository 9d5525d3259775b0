//! The built-in per-worker handler: owns the async fd table and bridges
//! raw worker events onto the [`Afd`] state machines, handing accepted
//! connections to an [`Application`].

use crate::afd::{Afd, AfdIo};
use crate::runtime::RuntimeHandle;
use splay_common::{
    AcceptParams, CloseParams, Fd, Handler, InitParams, MailboxMessage, ReadParams, WriteParams,
};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use tracing::debug;

/// The connection-level surface an application implements on top of the
/// async fd layer. One instance per worker; it survives module reloads.
pub trait Application {
    fn on_load(&mut self, _runtime: &Rc<RuntimeHandle>) {}

    /// A fresh connection pinned to this worker.
    fn on_accept(&mut self, conn: Afd, runtime: &Rc<RuntimeHandle>);

    fn on_message(&mut self, _msg: &MailboxMessage) {}

    fn pre_refresh(&mut self) {}

    fn refresh(&mut self) {}

    fn unload(&mut self, _quit: bool) {}
}

/// Handler implementation that promotes every connection to an [`Afd`].
pub struct ServerContext {
    runtime: Rc<RuntimeHandle>,
    fds: HashMap<Fd, Afd>,
    app: Box<dyn Application>,
}

impl ServerContext {
    pub fn new(runtime: Rc<RuntimeHandle>, app: Box<dyn Application>) -> Self {
        Self {
            runtime,
            fds: HashMap::new(),
            app,
        }
    }

    /// Opens an outbound connection and promotes it like an accepted one.
    pub fn connect(&mut self, target: &str, port: u16, datagram: bool) -> io::Result<Afd> {
        use splay_common::Runtime as _;
        let fd = self.runtime.connect(target, port, datagram)?;
        let kind = if datagram {
            splay_common::FdKind::Dgram
        } else {
            splay_common::FdKind::Stream
        };
        let io: Rc<dyn AfdIo> = self.runtime.clone();
        let afd = Afd::new(io, fd, kind);
        self.fds.insert(fd, afd.clone());
        Ok(afd)
    }

    /// Pushes the session's traffic secrets into the kernel and swaps the
    /// connection's kind tag in lockstep with the backend registration.
    #[cfg(target_os = "linux")]
    pub fn upgrade_ktls(&self, conn: &Afd, secrets: &crate::ktls::TlsSecrets) -> io::Result<()> {
        self.runtime.upgrade_ktls(conn.fd(), secrets)?;
        conn.set_kind(splay_common::FdKind::Ktls);
        Ok(())
    }

    fn lookup(&self, fd: Fd) -> Option<Afd> {
        self.fds.get(&fd).cloned()
    }
}

impl Handler for ServerContext {
    fn on_init(&mut self, _params: InitParams) {
        let runtime = Rc::clone(&self.runtime);
        self.app.on_load(&runtime);
    }

    fn on_accept(&mut self, params: AcceptParams) {
        let afd = match self.fds.get(&params.fd) {
            Some(existing) => existing.clone(),
            None => {
                let io: Rc<dyn AfdIo> = self.runtime.clone();
                let afd = Afd::new(io, params.fd, params.kind);
                self.fds.insert(params.fd, afd.clone());
                afd
            }
        };
        let runtime = Rc::clone(&self.runtime);
        self.app.on_accept(afd, &runtime);
    }

    fn on_receive(&mut self, params: ReadParams<'_>) {
        if let Some(afd) = self.lookup(params.fd) {
            afd.on_data(params.data);
        } else {
            debug!("data for unknown fd {}", params.fd);
        }
    }

    fn on_write(&mut self, params: WriteParams) {
        if let Some(afd) = self.lookup(params.fd) {
            afd.on_write(params.written);
        }
    }

    fn on_close(&mut self, params: CloseParams) {
        if let Some(afd) = self.fds.remove(&params.fd) {
            afd.on_close();
        }
    }

    fn on_message(&mut self, msg: &MailboxMessage) {
        self.app.on_message(msg);
    }

    fn pre_refresh(&mut self) {
        self.app.pre_refresh();
    }

    fn refresh(&mut self) {
        self.app.refresh();
    }

    fn unload(&mut self, quit: bool) {
        self.app.unload(quit);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::promise::Promise;
    use crate::reload::ReloadContext;
    use splay_common::FdKind;
    use std::cell::RefCell;
    use std::sync::Arc;

    struct Recorder {
        accepted: Rc<RefCell<Vec<Fd>>>,
        echoed: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl Application for Recorder {
        fn on_accept(&mut self, conn: Afd, _runtime: &Rc<RuntimeHandle>) {
            self.accepted.borrow_mut().push(conn.fd());
            let echoed = Rc::clone(&self.echoed);
            let reader = conn.clone();
            conn.set_on_empty_queue(move || {
                let echoed = Rc::clone(&echoed);
                reader.read_any().then(move |arg| {
                    if !arg.error {
                        echoed.borrow_mut().push(arg.data);
                    }
                });
            });
        }
    }

    fn harness() -> (ServerContext, Rc<RefCell<Vec<Fd>>>, Rc<RefCell<Vec<Vec<u8>>>>) {
        let backend = Rc::new(Backend::new().expect("backend"));
        let reload = Arc::new(ReloadContext::new(1, None, Vec::new()).expect("reload context"));
        let node = splay_common::NodeId {
            id: 0,
            port: 0,
            name: "localhost".into(),
        };
        let runtime = Rc::new(RuntimeHandle::new(0, 1, node, backend, reload));
        let accepted = Rc::new(RefCell::new(Vec::new()));
        let echoed = Rc::new(RefCell::new(Vec::new()));
        let app = Recorder {
            accepted: Rc::clone(&accepted),
            echoed: Rc::clone(&echoed),
        };
        (
            ServerContext::new(runtime, Box::new(app)),
            accepted,
            echoed,
        )
    }

    fn accept_params(fd: Fd) -> AcceptParams {
        AcceptParams {
            listener: 100,
            fd,
            kind: FdKind::Stream,
            peer: None,
        }
    }

    #[test]
    fn accept_promotes_and_receive_routes_to_the_afd() {
        let (mut ctx, accepted, echoed) = harness();
        ctx.on_accept(accept_params(42));
        assert_eq!(*accepted.borrow(), vec![42]);

        ctx.on_receive(ReadParams {
            fd: 42,
            kind: FdKind::Stream,
            data: b"hello",
        });
        assert_eq!(*echoed.borrow(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn close_removes_the_entry_and_resolves_pending_reads() {
        let (mut ctx, _accepted, _echoed) = harness();
        ctx.on_accept(accept_params(7));
        let afd = ctx.lookup(7).unwrap();
        let seen: Rc<RefCell<Option<bool>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        let promise: Promise<crate::afd::ReadArg> = afd.read_n(64);
        promise.then(move |arg| *sink.borrow_mut() = Some(arg.error));

        ctx.on_close(CloseParams { fd: 7 });
        assert_eq!(*seen.borrow(), Some(true));
        assert!(ctx.lookup(7).is_none());
        assert!(afd.is_closed());
    }

    #[test]
    fn data_for_unknown_fds_is_ignored() {
        let (mut ctx, _accepted, echoed) = harness();
        ctx.on_receive(ReadParams {
            fd: 9,
            kind: FdKind::Stream,
            data: b"stray",
        });
        assert!(echoed.borrow().is_empty());
    }
}
