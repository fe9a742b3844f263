//! Outgoing side of the modem line channel.

use std::io::{self, Write};

use crate::codec::LineCodec;

/// Sink for outgoing command lines.
pub trait LineWriter: Send {
    /// Write one line; the terminator is appended by the implementation.
    fn write_line(&mut self, line: &str) -> io::Result<()>;
}

/// [`LineWriter`] over any byte stream (serial device, TCP socket).
#[derive(Debug)]
pub struct StreamWriter<W> {
    inner: W,
}

impl<W: Write + Send> StreamWriter<W> {
    /// Wrap a byte stream.
    pub fn new(inner: W) -> Self {
        StreamWriter { inner }
    }
}

impl<W: Write + Send> LineWriter for StreamWriter<W> {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(&LineCodec::encode_line(line))?;
        self.inner.flush()
    }
}
