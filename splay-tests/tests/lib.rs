//! End-to-end tests driving the worker pool over real localhost sockets.

#![cfg(unix)]

use splay_common::{Handler, NodeId, Runtime};
use splayd::backend::Backend;
use splayd::context::{Application, ServerContext};
use splayd::httpd::Httpd;
use splayd::reload::ReloadContext;
use splayd::runtime::RuntimeHandle;
use splayd::worker::{ServeExit, Worker};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::IntoRawFd;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type AppFactory = Box<dyn FnOnce() -> Box<dyn Application> + Send>;

struct TestServer {
    port: u16,
    reload: Arc<ReloadContext>,
    threads: Vec<thread::JoinHandle<ServeExit>>,
}

impl TestServer {
    /// Binds an ephemeral listener and runs one reactor per app factory.
    fn start(factories: Vec<AppFactory>) -> Self {
        let workers = factories.len() as u32;
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let port = listener.local_addr().expect("local addr").port();
        listener.set_nonblocking(true).expect("nonblocking listener");
        let listener_fd = listener.into_raw_fd();

        let reload =
            Arc::new(ReloadContext::new(workers, None, Vec::new()).expect("reload context"));
        let mut threads = Vec::new();
        for (id, factory) in factories.into_iter().enumerate() {
            let id = id as u32;
            let reload = Arc::clone(&reload);
            threads.push(
                thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || {
                        let backend = Rc::new(Backend::new().expect("backend"));
                        let node = NodeId {
                            id,
                            port,
                            name: "localhost".into(),
                        };
                        let runtime = Rc::new(RuntimeHandle::new(
                            id,
                            workers,
                            node,
                            Rc::clone(&backend),
                            Arc::clone(&reload),
                        ));
                        let mut worker = Worker::new(
                            id,
                            Some(listener_fd),
                            backend,
                            Rc::clone(&runtime),
                            Arc::clone(&reload),
                        );
                        let mut handler = ServerContext::new(runtime, factory());
                        loop {
                            match worker.serve(&mut handler).expect("serve") {
                                ServeExit::Quit => {
                                    handler.unload(true);
                                    return ServeExit::Quit;
                                }
                                ServeExit::Stop => {
                                    reload.synchronize();
                                    handler.refresh();
                                }
                            }
                        }
                    })
                    .expect("spawn worker"),
            );
        }
        Self {
            port,
            reload,
            threads,
        }
    }

    fn start_httpd(workers: u32) -> Self {
        let factories = (0..workers)
            .map(|_| Box::new(|| Box::new(Httpd) as Box<dyn Application>) as AppFactory)
            .collect();
        Self::start(factories)
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        stream
    }

    fn stop(self) {
        self.reload.quit().expect("quit");
        for thread in self.threads {
            assert_eq!(thread.join().expect("join worker"), ServeExit::Quit);
        }
    }
}

#[test]
fn framed_echo_across_three_segments() {
    let server = TestServer::start_httpd(1);
    let mut stream = server.connect();

    for segment in [&b"GET /"[..], b" HTTP/1.1\r\n", b"X: y\r\n\r\n"] {
        stream.write_all(segment).expect("write segment");
        stream.flush().expect("flush");
        thread::sleep(Duration::from_millis(30));
    }

    let expected: &[u8] = b"HTTP/1.1 200 OK\r\nContent-length: 24\r\n\r\nGET / HTTP/1.1\r\nX: y\r\n\r\n";
    let mut response = vec![0u8; expected.len()];
    stream.read_exact(&mut response).expect("read response");
    assert_eq!(response, expected);

    server.stop();
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let server = TestServer::start_httpd(1);
    let mut stream = server.connect();

    for path in ["/first", "/second", "/third"] {
        let request = format!("GET {path} HTTP/1.1\r\n\r\n");
        stream.write_all(request.as_bytes()).expect("write request");
        let body = format!("GET {path} HTTP/1.1\r\n\r\n");
        let expected = format!(
            "HTTP/1.1 200 OK\r\nContent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut response = vec![0u8; expected.len()];
        stream.read_exact(&mut response).expect("read response");
        assert_eq!(response, expected.as_bytes());
    }

    server.stop();
}

struct TagApp {
    tx: mpsc::Sender<(u32, thread::ThreadId)>,
}

impl Application for TagApp {
    fn on_accept(&mut self, _conn: splayd::afd::Afd, runtime: &Rc<RuntimeHandle>) {
        self.tx
            .send((runtime.worker_id(), thread::current().id()))
            .ok();
    }
}

#[test]
fn accepts_spread_round_robin_across_workers() {
    let workers = 4u32;
    let accepts_per_worker = 2u32;
    let (tx, rx) = mpsc::channel();
    let factories = (0..workers)
        .map(|_| {
            let tx = tx.clone();
            Box::new(move || Box::new(TagApp { tx }) as Box<dyn Application>) as AppFactory
        })
        .collect();
    let server = TestServer::start(factories);

    // Hold the client ends open so no accept races a hangup.
    let mut streams = Vec::new();
    for _ in 0..(workers * accepts_per_worker) {
        streams.push(server.connect());
    }

    let mut counts: HashMap<u32, u32> = HashMap::new();
    let mut worker_threads: HashMap<u32, thread::ThreadId> = HashMap::new();
    for _ in 0..(workers * accepts_per_worker) {
        let (worker, thread_id) = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("accept event");
        *counts.entry(worker).or_default() += 1;
        // Every accept for one worker fires on that worker's own thread.
        let previous = worker_threads.insert(worker, thread_id);
        if let Some(previous) = previous {
            assert_eq!(previous, thread_id);
        }
    }

    assert_eq!(counts.len(), workers as usize);
    for worker in 0..workers {
        assert_eq!(counts.get(&worker), Some(&accepts_per_worker));
    }
    // Distinct workers run on distinct threads.
    let distinct: std::collections::HashSet<_> = worker_threads.values().collect();
    assert_eq!(distinct.len(), workers as usize);

    drop(streams);
    server.stop();
}

#[test]
fn reload_preserves_live_connections() {
    let server = TestServer::start_httpd(1);
    let mut stream = server.connect();

    stream
        .write_all(b"GET /before HTTP/1.1\r\n\r\n")
        .expect("write first request");
    let mut response = vec![0u8; 63];
    stream.read_exact(&mut response).expect("first response");

    // Quiesce and swap; the worker re-enters its loop with the same
    // handler context, so the connection's async state survives.
    server.reload.reload().expect("trigger reload");

    stream
        .write_all(b"GET /after HTTP/1.1\r\n\r\n")
        .expect("write second request");
    let body = "GET /after HTTP/1.1\r\n\r\n";
    let expected = format!(
        "HTTP/1.1 200 OK\r\nContent-length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let mut response = vec![0u8; expected.len()];
    stream.read_exact(&mut response).expect("second response");
    assert_eq!(response, expected.as_bytes());

    server.stop();
}

#[test]
fn quit_tears_down_with_connections_open() {
    let server = TestServer::start_httpd(2);
    let _idle = server.connect();
    let mut inflight = server.connect();
    inflight.write_all(b"GET /partial").expect("write partial");
    server.stop();
}

#[test]
fn large_responses_flush_under_backpressure() {
    let server = TestServer::start_httpd(1);
    let mut stream = server.connect();

    // A body large enough to overflow the socket send buffer forces the
    // buffered-write path with writability re-arms.
    let body = vec![b'x'; 512 * 1024];
    let head = format!("POST /big HTTP/1.1\r\nContent-length: {}\r\n\r\n", body.len());
    stream.write_all(head.as_bytes()).expect("write head");
    stream.write_all(&body).expect("write body");

    let echoed_len = head.len() + body.len();
    let expected_head = format!("HTTP/1.1 200 OK\r\nContent-length: {echoed_len}\r\n\r\n");
    let mut response = vec![0u8; expected_head.len() + echoed_len];
    stream.read_exact(&mut response).expect("read response");
    assert!(response.starts_with(expected_head.as_bytes()));
    assert!(response.ends_with(b"xxxx"));

    server.stop();
}
