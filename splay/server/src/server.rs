//! Server startup and lifetime: bind the listening socket, spawn the
//! worker pool, orchestrate reload re-entry, join on quit.

use crate::backend::Backend;
use crate::config::Config;
use crate::context::ServerContext;
use crate::httpd::Httpd;
use crate::reload::ReloadContext;
use crate::runtime::RuntimeHandle;
use crate::version::Version;
use crate::worker::{ServeExit, Worker};
use anyhow::{Context, Result, bail};
use splay_common::{Extension, Fd, Handler, NodeId, Runtime};
use std::process;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*};

#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd};

#[cfg(unix)]
type Listener = OwnedFd;
#[cfg(windows)]
type Listener = std::net::TcpListener;

/// The main server structure.
#[derive(Debug)]
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a new `Server` instance from the process arguments.
    pub fn new() -> Result<Self> {
        let config = Config::default();
        if config.version() {
            Version::new().print();
            process::exit(0);
        }

        let server = Self { config };
        server.init_logging().context("set log verbosity")?;
        server.config.validate().context("validate config")?;
        Ok(server)
    }

    /// Start the `Server` instance and consume it.
    pub fn start(self) -> Result<()> {
        if self.config.show_config() {
            self.config.print();
        }

        ignore_sigpipe().context("ignore SIGPIPE")?;
        // Worker threads inherit this mask, so termination signals only
        // ever surface through worker 0's signalfd.
        block_signals().context("block signals")?;

        let workers = self.config.worker_count();
        let listener = if self.config.cli() {
            None
        } else {
            Some(bind_listener(&self.config).context("bind listening socket")?)
        };
        let listener_fd = listener.as_ref().map(listener_fd);

        let reload = Arc::new(
            ReloadContext::new(
                workers,
                self.config.entrypoint().clone(),
                self.config.modules().clone(),
            )
            .context("create reload context")?,
        );

        match listener_fd {
            Some(_) => info!(
                "serving on {}:{} with {} workers",
                self.config.bind_host(),
                self.config.port(),
                workers
            ),
            None => info!("running in CLI mode with {} workers", workers),
        }

        let accept_slots = self.config.accept_backlog_per_worker();
        let mut handles = Vec::with_capacity(workers as usize);
        for id in 1..workers {
            let reload = Arc::clone(&reload);
            let node = NodeId {
                id,
                port: self.config.port(),
                name: self.config.node().clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || {
                    if let Err(e) = run_worker(id, listener_fd, node, reload, accept_slots) {
                        error!("worker {id}: {e:#}");
                        process::exit(1);
                    }
                })
                .context("spawn worker thread")?;
            handles.push(handle);
        }

        let node = NodeId {
            id: 0,
            port: self.config.port(),
            name: self.config.node().clone(),
        };
        run_worker(0, listener_fd, node, Arc::clone(&reload), accept_slots)?;

        for handle in handles {
            if handle.join().is_err() {
                bail!("worker thread panicked");
            }
        }
        info!("clean shutdown");
        Ok(())
    }

    fn init_logging(&self) -> Result<()> {
        let level =
            LevelFilter::from_str(self.config.log_level()).context("convert log level filter")?;
        let stdout = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(level);
        tracing_subscriber::registry()
            .with(stdout)
            .try_init()
            .context("init registry")?;
        Ok(())
    }
}

/// One worker's whole lifetime: serve, quiesce and re-enter on reload,
/// tear down on quit.
fn run_worker(
    id: u32,
    listener: Option<Fd>,
    node: NodeId,
    reload: Arc<ReloadContext>,
    accept_slots: u32,
) -> Result<()> {
    let backend = Rc::new(Backend::new().context("create backend")?);
    let runtime = Rc::new(RuntimeHandle::new(
        id,
        reload.workers(),
        node.clone(),
        Rc::clone(&backend),
        Arc::clone(&reload),
    ));
    let mut worker = Worker::new(id, listener, backend, Rc::clone(&runtime), Arc::clone(&reload));
    worker.set_accept_slots(accept_slots);

    // A module handler must be dropped and recreated around a swap because
    // its code lives in the swapped library; the built-in context persists
    // and keeps every connection's async state alive.
    let from_module = reload.handler_entry().is_some();
    let mut handler: Option<Box<dyn Handler>> = Some(make_handler(&runtime, &reload, &node));
    let mut extensions = instantiate_extensions(&reload, id, false);

    loop {
        let exit = {
            let handler = handler.as_mut().expect("handler present while serving");
            worker.serve(handler.as_mut()).context("serve")?
        };
        match exit {
            ServeExit::Quit => {
                for extension in &mut extensions {
                    extension.on_unload(id, true);
                }
                extensions.clear();
                if let Some(handler) = handler.as_mut() {
                    handler.unload(true);
                }
                debug!("worker {id} done");
                return Ok(());
            }
            ServeExit::Stop => {
                debug!("worker {id} quiescing for reload");
                for extension in &mut extensions {
                    extension.on_unload(id, false);
                }
                extensions.clear();
                if from_module {
                    if let Some(mut handler) = handler.take() {
                        handler.unload(false);
                    }
                }
                reload.synchronize();
                if from_module {
                    handler = Some(make_handler(&runtime, &reload, &node));
                }
                if let Some(handler) = handler.as_mut() {
                    handler.refresh();
                }
                extensions = instantiate_extensions(&reload, id, true);
            }
        }
    }
}

fn make_handler(
    runtime: &Rc<RuntimeHandle>,
    reload: &Arc<ReloadContext>,
    node: &NodeId,
) -> Box<dyn Handler> {
    if let Some(entry) = reload.handler_entry() {
        let dyn_runtime: Rc<dyn Runtime> = Rc::clone(runtime) as Rc<dyn Runtime>;
        return entry(dyn_runtime, node);
    }
    Box::new(ServerContext::new(Rc::clone(runtime), Box::new(Httpd)))
}

fn instantiate_extensions(
    reload: &Arc<ReloadContext>,
    worker: u32,
    reloaded: bool,
) -> Vec<Box<dyn Extension>> {
    reload
        .extension_entries()
        .into_iter()
        .map(|entry| {
            let mut extension = entry();
            extension.on_load(worker, reloaded);
            extension
        })
        .collect()
}

#[cfg(unix)]
fn bind_listener(config: &Config) -> Result<Listener> {
    use nix::sys::socket::{
        AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrIn6, bind, listen,
        setsockopt, socket, sockopt,
    };
    use std::net::{SocketAddrV4, SocketAddrV6};

    let family = if config.ipv6() {
        AddressFamily::Inet6
    } else {
        AddressFamily::Inet
    };
    let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .context("create server socket")?;
    setsockopt(&fd, sockopt::ReuseAddr, &true).context("set SO_REUSEADDR")?;

    if config.ipv6() {
        let ip: std::net::Ipv6Addr = config
            .bind_host()
            .parse()
            .context("resolve bind IP address")?;
        let addr = SockaddrIn6::from(SocketAddrV6::new(ip, config.port(), 0, 0));
        bind(fd.as_raw_fd(), &addr).context("bind server socket")?;
    } else {
        let ip: std::net::Ipv4Addr = config
            .bind_host()
            .parse()
            .context("resolve bind IP address")?;
        let addr = SockaddrIn::from(SocketAddrV4::new(ip, config.port()));
        bind(fd.as_raw_fd(), &addr).context("bind server socket")?;
    }

    listen(&fd, Backlog::new(20000).context("backlog size")?).context("listen on server socket")?;
    Ok(fd)
}

#[cfg(windows)]
fn bind_listener(config: &Config) -> Result<Listener> {
    let listener = std::net::TcpListener::bind((config.bind_host(), config.port()))
        .context("bind server socket")?;
    listener
        .set_nonblocking(true)
        .context("set listener non-blocking")?;
    Ok(listener)
}

#[cfg(unix)]
fn listener_fd(listener: &Listener) -> Fd {
    listener.as_raw_fd()
}

#[cfg(windows)]
fn listener_fd(listener: &Listener) -> Fd {
    use std::os::windows::io::AsRawSocket;
    listener.as_raw_socket() as Fd
}

#[cfg(unix)]
fn ignore_sigpipe() -> Result<()> {
    use nix::sys::signal::{SigHandler, Signal, signal};

    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("install handler")?;
    Ok(())
}

#[cfg(windows)]
fn ignore_sigpipe() -> Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn block_signals() -> Result<()> {
    use nix::sys::signal::{SigSet, Signal};

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().context("set signal mask")?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn block_signals() -> Result<()> {
    Ok(())
}

/// Puts an inherited or accepted fd into non-blocking mode.
#[cfg(unix)]
pub(crate) fn enable_async(fd: Fd) {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags >= 0 {
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }
}

#[cfg(windows)]
pub(crate) fn enable_async(_fd: Fd) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;

    #[test]
    fn binds_and_listens_on_an_ephemeral_port() {
        let config =
            Config::try_parse_from(["splayd", "-p", "0", "-h", "127.0.0.1"]).expect("parse");
        let listener = bind_listener(&config).expect("bind");
        // A client connect proves the socket is listening.
        let port = {
            use nix::sys::socket::{SockaddrIn, getsockname};
            let addr: SockaddrIn = getsockname(listener.as_raw_fd()).expect("getsockname");
            addr.port()
        };
        let stream = std::net::TcpStream::connect(("127.0.0.1", port));
        assert!(stream.is_ok());
    }
}
