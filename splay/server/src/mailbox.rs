//! Per-worker inbox for cross-worker messages.
//!
//! Senders append under the mailbox lock and wake the owning worker through
//! a self-pipe; a `signaled` flag elides redundant wakeup bytes. The owner
//! drains by swapping the message vector out under the lock and dispatching
//! outside it, so a handler that mails the same worker back cannot
//! deadlock. Order is preserved per sender; cross-sender order is not.

use splay_common::{Control, Fd, MailboxMessage};
use std::io;
use std::mem;
use std::sync::Mutex;

#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd};

/// Reserved slots added whenever the queue runs out of room.
const GROW: usize = 1000;

#[derive(Default)]
struct Inner {
    messages: Vec<MailboxMessage>,
    signaled: bool,
}

/// One worker's inbox plus its wakeup channel.
pub struct Mailbox {
    id: u32,
    inner: Mutex<Inner>,
    #[cfg(unix)]
    wake_rx: OwnedFd,
    #[cfg(unix)]
    wake_tx: OwnedFd,
    #[cfg(windows)]
    wake_rx: Fd,
    #[cfg(windows)]
    wake_tx: Fd,
}

impl Mailbox {
    #[cfg(unix)]
    pub fn new(id: u32) -> io::Result<Self> {
        let (wake_rx, wake_tx) = nix::unistd::pipe()?;
        crate::server::enable_async(wake_rx.as_raw_fd());
        crate::server::enable_async(wake_tx.as_raw_fd());
        let mut inner = Inner::default();
        inner.messages.reserve(32);
        Ok(Self {
            id,
            inner: Mutex::new(inner),
            wake_rx,
            wake_tx,
        })
    }

    #[cfg(windows)]
    pub fn new(id: u32) -> io::Result<Self> {
        let (wake_rx, wake_tx) = crate::backend::wake_pipe(id)?;
        let mut inner = Inner::default();
        inner.messages.reserve(32);
        Ok(Self {
            id,
            inner: Mutex::new(inner),
            wake_rx,
            wake_tx,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Read end of the wakeup channel, registered in the owner's backend.
    pub fn wake_fd(&self) -> Fd {
        #[cfg(unix)]
        {
            self.wake_rx.as_raw_fd()
        }
        #[cfg(windows)]
        {
            self.wake_rx
        }
    }

    /// Appends a message and wakes the owner unless a wakeup is already in
    /// flight. A failed queue growth is reported to the caller and nowhere
    /// else.
    pub fn mail(&self, msg: MailboxMessage) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| io::Error::other(format!("mailbox lock: {e}")))?;
        if inner.messages.len() == inner.messages.capacity() {
            inner
                .messages
                .try_reserve(GROW)
                .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        }
        inner.messages.push(msg);
        if !inner.signaled {
            inner.signaled = true;
            self.write_byte(Control::Mail.as_byte())?;
        }
        Ok(())
    }

    /// Writes a control byte directly, bypassing the `signaled` elision.
    /// Used for the stop and quit fan-outs.
    pub fn signal(&self, control: Control) -> io::Result<()> {
        let _inner = self
            .inner
            .lock()
            .map_err(|e| io::Error::other(format!("mailbox lock: {e}")))?;
        self.write_byte(control.as_byte())
    }

    /// Takes every queued message. The vector is moved out under the lock,
    /// so the caller dispatches without holding it.
    pub fn drain(&self) -> Vec<MailboxMessage> {
        match self.inner.lock() {
            Ok(mut inner) => {
                inner.signaled = false;
                mem::take(&mut inner.messages)
            }
            Err(_) => Vec::new(),
        }
    }

    #[cfg(unix)]
    fn write_byte(&self, byte: u8) -> io::Result<()> {
        let data = [byte];
        let n = unsafe { libc::write(self.wake_tx.as_raw_fd(), data.as_ptr().cast(), 1) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn write_byte(&self, byte: u8) -> io::Result<()> {
        crate::backend::wake_write(self.wake_tx, byte)
    }
}

#[cfg(windows)]
impl Drop for Mailbox {
    fn drop(&mut self) {
        crate::backend::close_handle(self.wake_rx);
        crate::backend::close_handle(self.wake_tx);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use splay_common::MailPayload;

    fn user_msg(sender: u32, body: &[u8]) -> MailboxMessage {
        MailboxMessage {
            sender,
            sender_loop: -1,
            sender_fd: -1,
            receiver_fd: -1,
            payload: MailPayload::User(body.to_vec()),
        }
    }

    fn read_wake(mailbox: &Mailbox, buf: &mut [u8]) -> usize {
        let n = unsafe { libc::read(mailbox.wake_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 { 0 } else { n as usize }
    }

    #[test]
    fn preserves_per_sender_fifo() {
        let mailbox = Mailbox::new(0).unwrap();
        for i in 0..10u8 {
            mailbox.mail(user_msg(1, &[i])).unwrap();
        }
        let drained = mailbox.drain();
        assert_eq!(drained.len(), 10);
        for (i, msg) in drained.iter().enumerate() {
            match &msg.payload {
                MailPayload::User(body) => assert_eq!(body[0], i as u8),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn elides_redundant_wakeups() {
        let mailbox = Mailbox::new(0).unwrap();
        for _ in 0..100 {
            mailbox.mail(user_msg(0, b"x")).unwrap();
        }
        let mut buf = [0u8; 16];
        assert_eq!(read_wake(&mailbox, &mut buf), 1);
        assert_eq!(buf[0], Control::Mail.as_byte());
        // Pipe is drained; no second byte was written.
        assert_eq!(read_wake(&mailbox, &mut buf), 0);
    }

    #[test]
    fn drain_rearms_the_wakeup() {
        let mailbox = Mailbox::new(0).unwrap();
        mailbox.mail(user_msg(0, b"a")).unwrap();
        assert_eq!(mailbox.drain().len(), 1);
        let mut buf = [0u8; 4];
        assert_eq!(read_wake(&mailbox, &mut buf), 1);

        mailbox.mail(user_msg(0, b"b")).unwrap();
        assert_eq!(read_wake(&mailbox, &mut buf), 1);
        assert_eq!(mailbox.drain().len(), 1);
    }

    #[test]
    fn grows_past_the_initial_reservation() {
        let mailbox = Mailbox::new(0).unwrap();
        for i in 0..5000u32 {
            mailbox.mail(user_msg(0, &i.to_le_bytes())).unwrap();
        }
        assert_eq!(mailbox.drain().len(), 5000);
        assert!(mailbox.drain().is_empty());
    }

    #[test]
    fn stop_signal_bypasses_elision() {
        let mailbox = Mailbox::new(0).unwrap();
        mailbox.mail(user_msg(0, b"x")).unwrap();
        mailbox.signal(Control::Stop).unwrap();
        mailbox.signal(Control::Quit).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read_wake(&mailbox, &mut buf), 3);
        assert_eq!(
            &buf[..3],
            &[
                Control::Mail.as_byte(),
                Control::Stop.as_byte(),
                Control::Quit.as_byte()
            ]
        );
    }
}
