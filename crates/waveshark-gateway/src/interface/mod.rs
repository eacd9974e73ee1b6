//! Line-oriented transports to WaveShark Communicators
//!
//! The Communicator speaks plain text over its serial port: commands are
//! written terminated by a carriage return, and everything it emits (command
//! echoes, banners, received radio frames) arrives as newline-terminated
//! lines. There is no framing and there are no sequence numbers.
//!
//! - [`LineTransport`] - one attached port, read/write by line
//! - [`PortProvider`] - enumerates and opens ports
//! - [`serial::SerialPortProvider`] - real serial ports (requires `serial` feature)
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::{SerialLineTransport, SerialPortProvider};

use crate::error::Result;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tracing::trace;

/// Maximum bytes buffered without seeing a line terminator
const MAX_PENDING_LINE: usize = 4096;

/// Trait for line-oriented Communicator connections
///
/// Implementations only move bytes; the write-then-drain-echoes contract
/// lives in the provided [`LineTransport::write_line`] so every back-end
/// behaves identically.
#[async_trait]
pub trait LineTransport: Send {
    /// Write raw bytes to the device
    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read one line, waiting at most `timeout`
    ///
    /// Returns the trimmed line, or an empty string on timeout, read error or
    /// undecodable bytes. Never fails.
    async fn read_line_within(&mut self, timeout: Duration) -> String;

    /// Default timeout of [`LineTransport::read_line`]
    fn read_timeout(&self) -> Duration;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;

    /// Write `text` followed by a carriage return, then read and discard
    /// `lines_to_consume` lines (the device echoes commands back)
    async fn write_line(&mut self, text: &str, lines_to_consume: usize) -> Result<()> {
        let encoded = encode_line(text);
        trace!(transport = %self.name(), line = %text, "Writing line");
        self.write_raw(&encoded).await?;

        for _ in 0..lines_to_consume {
            let echo = self.read_line().await;
            trace!(transport = %self.name(), echo = %echo, "Consumed echo line");
        }
        Ok(())
    }

    /// Read one line with the default timeout
    async fn read_line(&mut self) -> String {
        let timeout = self.read_timeout();
        self.read_line_within(timeout).await
    }
}

/// A serial port as reported by the operating system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// Port name (e.g. /dev/ttyUSB0, COM3)
    pub name: String,
    /// Hardware description (product and manufacturer strings)
    pub description: String,
}

impl PortDescriptor {
    /// Create a descriptor
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Trait for enumerating and opening Communicator ports
#[async_trait]
pub trait PortProvider: Send + Sync {
    /// List every port currently present
    fn available_ports(&self) -> Result<Vec<PortDescriptor>>;

    /// Open a port for line I/O
    async fn open(&self, port: &str) -> Result<Box<dyn LineTransport>>;
}

/// Encode a line for the device: 7-bit text terminated by a carriage return
///
/// Characters outside 7-bit ASCII are replaced with `?`.
pub fn encode_line(text: &str) -> Vec<u8> {
    let mut encoded: Vec<u8> = text
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect();
    encoded.push(b'\r');
    encoded
}

/// Accumulates raw bytes from the device and splits them into lines
///
/// Partial lines survive a read timeout and are completed by later reads.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: BytesMut,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the device
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);

        if self.pending.len() > MAX_PENDING_LINE && !self.pending.contains(&b'\n') {
            trace!(discarded = self.pending.len(), "Discarding unterminated line");
            self.pending.clear();
        }
    }

    /// Take the next complete line
    ///
    /// Returns `None` when no terminator has arrived yet. A complete line that
    /// is not 7-bit text yields `Some("")`: it is consumed but reported as
    /// "no line available".
    pub fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let raw = self.pending.split_to(end);
        self.pending.advance(1);
        Some(decode_line(&raw))
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Decode one raw line: 7-bit text only, trimmed; anything else becomes ""
fn decode_line(raw: &[u8]) -> String {
    if !raw.is_ascii() {
        trace!(len = raw.len(), "Discarding non 7-bit line");
        return String::new();
    }
    String::from_utf8_lossy(raw).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_line_appends_carriage_return() {
        assert_eq!(encode_line("/NAME"), b"/NAME\r".to_vec());
    }

    #[test]
    fn test_encode_line_replaces_non_ascii() {
        assert_eq!(encode_line("café"), b"caf?\r".to_vec());
    }

    #[test]
    fn test_take_line_trims_crlf() {
        let mut buf = LineBuffer::new();
        buf.extend(b"sender name is [Ridge]\r\nnext");

        assert_eq!(buf.take_line().as_deref(), Some("sender name is [Ridge]"));
        assert_eq!(buf.take_line(), None);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_partial_line_completed_later() {
        let mut buf = LineBuffer::new();
        buf.extend(b"[RSS: -40] [SN");
        assert_eq!(buf.take_line(), None);

        buf.extend(b"R: 9] <Alice> hi\n");
        assert_eq!(
            buf.take_line().as_deref(),
            Some("[RSS: -40] [SNR: 9] <Alice> hi")
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_garbled_line_reported_as_empty() {
        let mut buf = LineBuffer::new();
        buf.extend(&[0x41, 0xFF, 0x42, b'\n']);
        buf.extend(b"ok\n");

        assert_eq!(buf.take_line().as_deref(), Some(""));
        assert_eq!(buf.take_line().as_deref(), Some("ok"));
    }

    #[test]
    fn test_unterminated_flood_is_dropped() {
        let mut buf = LineBuffer::new();
        buf.extend(&vec![b'x'; MAX_PENDING_LINE + 1]);
        assert!(buf.is_empty());
    }
}
