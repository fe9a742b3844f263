//! Line-based codec for AT communication.
//!
//! Modems terminate every line with `\r\n` but some firmware emits bare `\r`
//! or `\n`, and blank lines are common between a response body and the final
//! `OK`. The codec accepts any of these terminators and never yields empty
//! lines.

use bytes::BytesMut;
use tracing::warn;

/// Line terminator appended to outgoing commands.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Maximum length of an incoming line. Longer partial lines are dropped.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Initial capacity of the receive buffer.
const INITIAL_CAPACITY: usize = 512;

/// A codec for reading and writing AT lines.
///
/// - Accumulates received bytes until a complete line is found
/// - Trims surrounding whitespace and skips blank lines
#[derive(Debug)]
pub struct LineCodec {
    /// Buffer for accumulating incoming data.
    buffer: BytesMut,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    /// Create a new line codec.
    pub fn new() -> Self {
        LineCodec {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Add received data to the buffer.
    ///
    /// An unterminated tail longer than [`MAX_LINE_LENGTH`] (e.g. noise from
    /// a port at the wrong speed) is discarded; complete lines before it are
    /// kept.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        let complete = self
            .buffer
            .iter()
            .rposition(|&b| b == b'\r' || b == b'\n')
            .map_or(0, |pos| pos + 1);
        let partial = self.buffer.len() - complete;
        if partial > MAX_LINE_LENGTH {
            warn!("LineCodec: discarding {} bytes without line terminator", partial);
            self.buffer.truncate(complete);
        }
    }

    /// Try to decode a complete line from the buffer.
    ///
    /// Returns `Some(line)` with surrounding whitespace removed, or `None` if
    /// more data is needed.
    pub fn decode_line(&mut self) -> Option<String> {
        loop {
            let end = self.buffer.iter().position(|&b| b == b'\r' || b == b'\n')?;

            let line_data = self.buffer.split_to(end);
            let line = String::from_utf8_lossy(&line_data).trim().to_string();

            // Skip the terminator character(s)
            while !self.buffer.is_empty() && (self.buffer[0] == b'\r' || self.buffer[0] == b'\n') {
                let _ = self.buffer.split_to(1);
            }

            if !line.is_empty() {
                return Some(line);
            }
        }
    }

    /// Encode a line for transmission, appending `\r\n`.
    pub fn encode_line(line: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(line.len() + LINE_TERMINATOR.len());
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(LINE_TERMINATOR);
        buf
    }
}
