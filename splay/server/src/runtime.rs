//! The per-worker service surface handed to handlers.
//!
//! One [`RuntimeHandle`] per worker, wrapping that worker's backend and the
//! shared mailbox array. It implements the [`Runtime`] ABI for handlers and
//! the narrow [`AfdIo`] seam the async fd layer writes and closes through.

use crate::afd::AfdIo;
use crate::backend::{Backend, Interest};
use crate::reload::ReloadContext;
use splay_common::{CloseParams, Fd, FdKind, MailboxMessage, NodeId, Runtime};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use std::net::{SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd};

pub struct RuntimeHandle {
    id: u32,
    workers: u32,
    node: NodeId,
    backend: Rc<Backend>,
    reload: Arc<ReloadContext>,
    /// Close events requested through the ABI with `callback = true`; the
    /// worker delivers them right after the current handler callback
    /// returns, so no handler re-entry happens mid-callback.
    deferred_closes: RefCell<Vec<CloseParams>>,
}

impl RuntimeHandle {
    pub fn new(
        id: u32,
        workers: u32,
        node: NodeId,
        backend: Rc<Backend>,
        reload: Arc<ReloadContext>,
    ) -> Self {
        Self {
            id,
            workers,
            node,
            backend,
            reload,
            deferred_closes: RefCell::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Rc<Backend> {
        &self.backend
    }

    pub fn reload(&self) -> &Arc<ReloadContext> {
        &self.reload
    }

    /// Close events waiting for delivery; drained by the worker loop.
    pub fn take_deferred_closes(&self) -> Vec<CloseParams> {
        self.deferred_closes.take()
    }

    /// Installs the traffic secrets and re-registers the fd under the KTLS
    /// kind tag in one backend call, so no event is delivered under the
    /// stale tag.
    #[cfg(target_os = "linux")]
    pub fn upgrade_ktls(&self, fd: Fd, secrets: &crate::ktls::TlsSecrets) -> io::Result<()> {
        crate::ktls::enable(fd, secrets)?;
        self.backend.modify(fd, FdKind::Ktls, Interest::READ)?;
        Ok(())
    }
}

impl Runtime for RuntimeHandle {
    fn worker_id(&self) -> u32 {
        self.id
    }

    fn workers(&self) -> u32 {
        self.workers
    }

    fn node(&self) -> &NodeId {
        &self.node
    }

    fn write(&self, fd: Fd, kind: FdKind, data: &[u8], offset: usize) -> isize {
        let pending = &data[offset..];
        match self.backend.send(fd, kind, pending) {
            Ok(n) => {
                if n < pending.len() {
                    // The OS send buffer is full; finish when writability
                    // comes back.
                    if let Err(e) = self.backend.modify(fd, kind, Interest::BOTH) {
                        error!("arm writable interest for fd {fd}: {e}");
                        return -1;
                    }
                }
                n as isize
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Err(e) = self.backend.modify(fd, kind, Interest::BOTH) {
                    error!("arm writable interest for fd {fd}: {e}");
                    return -1;
                }
                0
            }
            Err(e) => {
                debug!("write to fd {fd} failed: {e}");
                -1
            }
        }
    }

    fn close(&self, fd: Fd, kind: FdKind, callback: bool) -> bool {
        if let Err(e) = self.backend.close(fd, kind) {
            debug!("close fd {fd}: {e}");
            return false;
        }
        if callback {
            self.deferred_closes.borrow_mut().push(CloseParams { fd });
        }
        true
    }

    #[cfg(unix)]
    fn connect(&self, target: &str, port: u16, datagram: bool) -> io::Result<Fd> {
        use nix::sys::socket::{
            AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6, UnixAddr, connect, socket,
        };

        let sock_type = if datagram {
            SockType::Datagram
        } else {
            SockType::Stream
        };
        let kind = if datagram {
            FdKind::Dgram
        } else {
            FdKind::Stream
        };
        let flags = SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC;

        if let Some(path) = target.strip_prefix("unix:") {
            let fd = socket(AddressFamily::Unix, sock_type, flags, None)?;
            let addr = UnixAddr::new(path)?;
            let raw = fd.as_raw_fd();
            match connect(raw, &addr) {
                Ok(()) | Err(Errno::EINPROGRESS) => {}
                Err(e) => return Err(e.into()),
            }
            self.backend.register(raw, kind, Interest::BOTH)?;
            return Ok(fd.into_raw_fd());
        }

        let (want_v6, host) = match target.strip_prefix("v6:") {
            Some(rest) => (true, rest),
            None => (false, target),
        };
        let resolved: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        // `v6:` prefers an AAAA answer but falls back to IPv4 when the host
        // has none.
        let addr = if want_v6 {
            resolved
                .iter()
                .find(|a| a.is_ipv6())
                .or_else(|| resolved.iter().find(|a| a.is_ipv4()))
        } else {
            resolved.iter().find(|a| a.is_ipv4())
        }
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no usable address"))?;

        let family = if addr.is_ipv6() {
            AddressFamily::Inet6
        } else {
            AddressFamily::Inet
        };
        let fd = socket(family, sock_type, flags, None)?;
        let raw = fd.as_raw_fd();
        let status = match addr {
            SocketAddr::V4(v4) => connect(raw, &SockaddrIn::from(v4)),
            SocketAddr::V6(v6) => connect(raw, &SockaddrIn6::from(v6)),
        };
        match status {
            Ok(()) | Err(Errno::EINPROGRESS) => {}
            Err(e) => return Err(e.into()),
        }
        // Registering for both directions makes connection establishment
        // surface as the first writability event.
        self.backend.register(raw, kind, Interest::BOTH)?;
        Ok(fd.into_raw_fd())
    }

    #[cfg(windows)]
    fn connect(&self, _target: &str, _port: u16, _datagram: bool) -> io::Result<Fd> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn mail(&self, target: u32, msg: MailboxMessage) -> io::Result<()> {
        let mailbox = self
            .reload
            .mailbox(target)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such worker"))?;
        mailbox.mail(msg)
    }

    #[cfg(unix)]
    fn set_recv_timeout(&self, fd: Fd, secs: u32) -> bool {
        use nix::sys::socket::{setsockopt, sockopt};
        use nix::sys::time::TimeVal;

        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        setsockopt(
            &fd,
            sockopt::ReceiveTimeout,
            &TimeVal::new(secs.into(), 0),
        )
        .is_ok()
    }

    #[cfg(windows)]
    fn set_recv_timeout(&self, _fd: Fd, _secs: u32) -> bool {
        false
    }

    #[cfg(unix)]
    fn peername(&self, fd: Fd) -> Option<(String, u16)> {
        use nix::sys::socket::{SockaddrStorage, getpeername};

        let stored: SockaddrStorage = getpeername(fd).ok()?;
        if let Some(v4) = stored.as_sockaddr_in() {
            return Some((v4.ip().to_string(), v4.port()));
        }
        if let Some(v6) = stored.as_sockaddr_in6() {
            return Some((v6.ip().to_string(), v6.port()));
        }
        None
    }

    #[cfg(windows)]
    fn peername(&self, _fd: Fd) -> Option<(String, u16)> {
        None
    }
}

impl AfdIo for RuntimeHandle {
    fn raw_write(&self, fd: Fd, kind: FdKind, data: &[u8], offset: usize) -> isize {
        Runtime::write(self, fd, kind, data, offset)
    }

    fn raw_close(&self, fd: Fd, kind: FdKind) {
        Runtime::close(self, fd, kind, false);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn handle() -> RuntimeHandle {
        let backend = Rc::new(Backend::new().expect("backend"));
        let reload = Arc::new(
            crate::reload::ReloadContext::new(1, None, Vec::new()).expect("reload context"),
        );
        let node = NodeId {
            id: 0,
            port: 0,
            name: "localhost".into(),
        };
        RuntimeHandle::new(0, 1, node, backend, reload)
    }

    #[test]
    fn connects_a_datagram_socket_and_writes_through() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind peer");
        let port = peer.local_addr().expect("addr").port();
        let runtime = handle();

        let fd = runtime
            .connect("127.0.0.1", port, true)
            .expect("connect dgram");
        let sent = runtime.write(fd, FdKind::Dgram, b"datagram", 0);
        assert_eq!(sent, 8);

        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], b"datagram");
        assert!(runtime.close(fd, FdKind::Dgram, false));
    }

    #[test]
    fn connects_a_stream_socket_and_reports_the_peer() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let port = listener.local_addr().expect("addr").port();
        let runtime = handle();

        let fd = runtime
            .connect("127.0.0.1", port, false)
            .expect("connect stream");
        let (accepted, _) = listener.accept().expect("accept");
        drop(accepted);

        let peer = runtime.peername(fd).expect("peername");
        assert_eq!(peer.0, "127.0.0.1");
        assert_eq!(peer.1, port);
        assert!(runtime.set_recv_timeout(fd, 5));
        assert!(runtime.close(fd, FdKind::Stream, false));
    }

    #[test]
    fn connects_over_a_unix_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("splay.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).expect("bind unix");
        let runtime = handle();

        let target = format!("unix:{}", path.display());
        let fd = runtime.connect(&target, 0, false).expect("connect unix");
        assert!(runtime.close(fd, FdKind::Stream, false));
    }

    #[test]
    fn v6_prefix_falls_back_to_ipv4_hosts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let port = listener.local_addr().expect("addr").port();
        let runtime = handle();
        let fd = runtime
            .connect("v6:127.0.0.1", port, false)
            .expect("fall back to the A record");
        assert!(runtime.close(fd, FdKind::Stream, false));
    }

    #[test]
    fn unresolvable_targets_error_out() {
        let runtime = handle();
        assert!(
            runtime
                .connect("definitely-not-a-real-host.invalid", 1, false)
                .is_err()
        );
    }

    #[test]
    fn close_with_callback_defers_the_event() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind peer");
        let runtime = handle();
        let fd = runtime
            .connect("127.0.0.1", peer.local_addr().expect("addr").port(), true)
            .expect("connect");
        assert!(runtime.close(fd, FdKind::Dgram, true));
        let deferred = runtime.take_deferred_closes();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].fd, fd);
        assert!(runtime.take_deferred_closes().is_empty());
    }
}
