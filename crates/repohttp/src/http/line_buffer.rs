//! Append-only byte queue with CRLF line extraction.
//!
//! The receive state machine appends each body chunk here and pulls out
//! complete `\r\n`-terminated lines as they become available, so parsing is
//! independent of how the transport splits the body into chunks.

use std::io::{self, Write};

use bytes::{Bytes, BytesMut};
use memchr::memchr_iter;

/// FIFO byte buffer. Data is never rewritten or reordered; callers may
/// interleave [`append`](Self::append) and [`read_line`](Self::read_line)
/// freely.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `data` at the end of the buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete line if a strict CRLF terminator is
    /// present, consuming the line and its terminator. The returned bytes
    /// never include the terminator.
    pub fn read_line(&mut self) -> Option<Bytes> {
        let idx = memchr_iter(b'\n', &self.buf).find(|&idx| idx > 0 && self.buf[idx - 1] == b'\r')?;
        let mut line = self.buf.split_to(idx + 1);
        line.truncate(idx - 1);
        Some(line.freeze())
    }

    /// Number of queued bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Writes all queued bytes to `writer`, emptying the buffer.
    pub fn drain_to<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        let data = self.buf.split();
        writer.write_all(&data)
    }
}
