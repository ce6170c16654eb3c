//! Output buffer with ANSI stripping.
//!
//! Router responses arrive as raw terminal bytes; the buffer strips
//! escape sequences on the way in so prompt inspection sees plain text.

use vte::{Params, Parser, Perform};

/// Buffer for accumulating shell output.
pub struct PatternBuffer {
    /// The accumulated, ANSI-stripped output.
    buffer: Vec<u8>,

    /// Stateful ANSI parser, so escape sequences split across reads
    /// are still stripped.
    parser: Parser,
}

impl PatternBuffer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            parser: Parser::new(),
        }
    }

    /// Extend the buffer with new data, stripping ANSI escape codes.
    pub fn extend(&mut self, data: &[u8]) {
        let mut sink = StripSink {
            out: &mut self.buffer,
        };
        self.parser.advance(&mut sink, data);
    }

    /// Take ownership of the buffer contents and reset.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Get a reference to the accumulated output.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Get the buffer contents as a string (lossy UTF-8 conversion).
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for PatternBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// vte performer that keeps printable characters and control characters
/// the prompt logic cares about (CR, LF, TAB) and drops everything else.
struct StripSink<'a> {
    out: &'a mut Vec<u8>,
}

impl Perform for StripSink<'_> {
    fn print(&mut self, c: char) {
        let mut utf8 = [0u8; 4];
        self.out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
    }

    fn execute(&mut self, byte: u8) {
        if matches!(byte, b'\r' | b'\n' | b'\t') {
            self.out.push(byte);
        }
    }

    fn hook(&mut self, _: &Params, _: &[u8], _: bool, _: char) {}
    fn put(&mut self, _: u8) {}
    fn unhook(&mut self) {}
    fn osc_dispatch(&mut self, _: &[&[u8]], _: bool) {}
    fn csi_dispatch(&mut self, _: &Params, _: &[u8], _: bool, _: char) {}
    fn esc_dispatch(&mut self, _: &[u8], _: bool, _: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_data_passes_through() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"show status\r\nline one\r\n");
        assert_eq!(buffer.as_slice(), b"show status\r\nline one\r\n");
    }

    #[test]
    fn ansi_sequences_are_stripped() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"\x1b[32mgreen\x1b[0m text");
        assert_eq!(buffer.as_slice(), b"green text");
    }

    #[test]
    fn escape_split_across_reads_is_stripped() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"abc\x1b[3");
        buffer.extend(b"2mdef");
        assert_eq!(buffer.as_slice(), b"abcdef");
    }

    #[test]
    fn take_clears_the_buffer() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"test data");
        assert_eq!(buffer.take(), b"test data");
        assert!(buffer.is_empty());
    }
}
