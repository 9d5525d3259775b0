//! Built-in HTTP application, the default entrypoint.
//!
//! A deliberately small keep-alive server that demonstrates the async fd
//! surface: read a request head up to the blank line, optionally read the
//! body announced by `content-length`, echo the whole request back in a 200
//! response, repeat.

use crate::afd::Afd;
use crate::buffer::ByteBuf;
use crate::context::Application;
use crate::runtime::RuntimeHandle;
use std::rc::Rc;
use tracing::debug;

const HEAD_DELIMITER: &[u8] = b"\r\n\r\n";

/// The echoing HTTP application.
#[derive(Default)]
pub struct Httpd;

impl Application for Httpd {
    fn on_accept(&mut self, conn: Afd, _runtime: &Rc<RuntimeHandle>) {
        serve_request(conn);
    }
}

/// Arms one request/response cycle; re-arms itself after a successful
/// response write.
pub(crate) fn serve_request(conn: Afd) {
    let head_conn = conn.clone();
    conn.read_until(HEAD_DELIMITER).then(move |arg| {
        if arg.error {
            return;
        }
        let head = arg.data;
        if let Some(line) = head.split(|&b| b == b'\r').next() {
            debug!("request: {}", String::from_utf8_lossy(line));
        }
        let body_len = content_length(&head);
        if body_len > 0 {
            let body_conn = head_conn.clone();
            head_conn.read_n(body_len).then(move |arg| {
                if arg.error {
                    return;
                }
                respond(body_conn, &head, &arg.data);
            });
        } else {
            respond(head_conn, &head, &[]);
        }
    });
}

fn respond(conn: Afd, head: &[u8], body: &[u8]) {
    let mut echoed = Vec::with_capacity(head.len() + HEAD_DELIMITER.len() + body.len());
    echoed.extend_from_slice(head);
    echoed.extend_from_slice(HEAD_DELIMITER);
    echoed.extend_from_slice(body);

    let mut response = ByteBuf::with_capacity(64 + echoed.len());
    response.put_str("HTTP/1.1 200 OK\r\nContent-length: ");
    response.put_fmt(format_args!("{}", echoed.len()));
    response.put_str("\r\n\r\n");
    response.put(&echoed);

    let next = conn.clone();
    conn.write(response.as_slice()).then(move |ok| {
        if ok {
            serve_request(next);
        }
    });
}

/// Extracts a `content-length` value from a request head; absent or
/// malformed headers read as zero.
fn content_length(head: &[u8]) -> usize {
    for line in head.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if line[..colon].eq_ignore_ascii_case(b"content-length") {
            let value = String::from_utf8_lossy(&line[colon + 1..]);
            return value.trim().parse().unwrap_or(0);
        }
    }
    0
}
