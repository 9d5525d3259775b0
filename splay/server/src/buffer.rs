//! Growable byte container with append and format helpers, used wherever
//! responses are assembled piecewise.

use std::fmt::{self, Write as _};

/// A byte buffer that grows in large steps so repeated small appends do not
/// thrash the allocator. Growth reserves half the current capacity plus a
/// fixed 64 KiB headroom on top of the requested space.
#[derive(Debug, Default)]
pub struct ByteBuf {
    data: Vec<u8>,
}

const HEADROOM: usize = 65536;

impl ByteBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    fn ensure(&mut self, space: usize) {
        if self.data.len() + space >= self.data.capacity() {
            let grow = space + (self.data.capacity() >> 1) + HEADROOM;
            self.data.reserve(grow);
        }
    }

    pub fn put_byte(&mut self, byte: u8) {
        self.ensure(1);
        self.data.push(byte);
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    pub fn put_str(&mut self, text: &str) {
        self.put(text.as_bytes());
    }

    /// Appends formatted text, e.g. `buf.put_fmt(format_args!("{}", n))`.
    pub fn put_fmt(&mut self, args: fmt::Arguments<'_>) {
        // Writing into a Vec<u8> through the fmt adapter cannot fail.
        let _ = Adapter(&mut self.data).write_fmt(args);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl AsRef<[u8]> for ByteBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

struct Adapter<'a>(&'a mut Vec<u8>);

impl fmt::Write for Adapter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}
