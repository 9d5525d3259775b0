//! Round-robin assignment of accepted connections to workers.
//!
//! Each accepting worker keeps its own counter rather than sharing an
//! atomic; fairness is best-effort and there is no backpressure from the
//! workers back to the dispatcher.

use splay_common::Fd;
use std::io;

#[cfg(unix)]
use nix::sys::socket::{SockaddrStorage, getpeername};
#[cfg(unix)]
use std::net::SocketAddr;

/// Per-worker accept counter.
#[derive(Debug)]
pub struct RoundRobin {
    next: u32,
    workers: u32,
}

impl RoundRobin {
    pub fn new(workers: u32) -> Self {
        Self { next: 0, workers }
    }

    /// The worker that receives the next accepted connection.
    pub fn next(&mut self) -> u32 {
        let target = self.next;
        self.next += 1;
        if self.next == self.workers {
            self.next = 0;
        }
        target
    }
}

/// Accepts one pending connection without blocking. `Ok(None)` means the
/// backlog is drained.
#[cfg(unix)]
pub fn accept_pending(listener: Fd) -> io::Result<Option<(Fd, Option<SocketAddr>)>> {
    use nix::errno::Errno;
    use nix::sys::socket::{SockFlag, accept4};

    match accept4(
        listener,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    ) {
        Ok(fd) => Ok(Some((fd, peer_addr(fd)))),
        Err(Errno::EAGAIN) => Ok(None),
        Err(Errno::EINTR) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn peer_addr(fd: Fd) -> Option<SocketAddr> {
    let stored: SockaddrStorage = getpeername(fd).ok()?;
    if let Some(v4) = stored.as_sockaddr_in() {
        return Some(SocketAddr::from((v4.ip(), v4.port())));
    }
    if let Some(v6) = stored.as_sockaddr_in6() {
        return Some(SocketAddr::from((v6.ip(), v6.port())));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_accepts_evenly_over_full_windows() {
        let workers = 4u32;
        let mut rr = RoundRobin::new(workers);
        let mut counts = [0u32; 4];
        for _ in 0..32 {
            counts[rr.next() as usize] += 1;
        }
        assert_eq!(counts, [8, 8, 8, 8]);
    }

    #[test]
    fn worker_zero_leads_by_at_most_one() {
        let mut rr = RoundRobin::new(3);
        let mut counts = [0i64; 3];
        for _ in 0..100 {
            counts[rr.next() as usize] += 1;
            let max = *counts.iter().max().unwrap();
            let min = *counts.iter().min().unwrap();
            assert!(max - min <= 1);
        }
    }

    #[test]
    fn single_worker_degenerates_to_self() {
        let mut rr = RoundRobin::new(1);
        for _ in 0..5 {
            assert_eq!(rr.next(), 0);
        }
    }
}
