//! Radio frames and the network envelope
//!
//! A radio frame is a line the Communicator prints for every message it hears
//! over the air:
//!
//! ```text
//! [RSS: -40] [SNR: 9] <Alice> Ridge SEND hello there
//! ```
//!
//! Only the `[RSS: ` prefix, the first `<...>` token and the text after it
//! are used; the signal fields are kept verbatim and never parsed.
//!
//! Everything published on the shared topic is an [`OutboundEnvelope`]
//! rendered as `[via <device>] <<sender>> <body>` before encryption.

use std::fmt;

/// Prefix of every radio frame
pub const RADIO_FRAME_PREFIX: &str = "[RSS: ";

/// Marker every envelope on the shared topic carries
pub const VIA_MARKER: &str = "[via ";

/// A received over-the-air message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioFrame {
    /// Signal quality fields, e.g. `[RSS: -40] [SNR: 9]`
    pub signal_tag: String,
    /// Callsign of the radio user who sent the message
    pub sender_name: String,
    /// Message text after the sender token
    pub body: String,
}

impl RadioFrame {
    /// Parse a line read from the device
    ///
    /// Returns `None` if the line does not start with the frame prefix or has
    /// no `<sender>` token. Such lines are device chatter, not messages.
    pub fn parse(line: &str) -> Option<Self> {
        if !line.starts_with(RADIO_FRAME_PREFIX) {
            return None;
        }

        let open = line.find('<')?;
        let close = open + line[open..].find('>')?;

        let signal_tag = line[..open].trim().to_string();
        let sender_name = line[open + 1..close].to_string();
        let rest = &line[close + 1..];
        let body = rest.strip_prefix(' ').unwrap_or(rest).to_string();

        Some(Self {
            signal_tag,
            sender_name,
            body,
        })
    }
}

/// Plaintext of one message published on the shared topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    /// Name of the Communicator that bridged the message
    pub via_device: String,
    /// Radio user who sent it
    pub from_sender: String,
    /// Message text
    pub body: String,
}

impl OutboundEnvelope {
    /// Create an envelope
    pub fn new(
        via_device: impl Into<String>,
        from_sender: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            via_device: via_device.into(),
            from_sender: from_sender.into(),
            body: body.into(),
        }
    }
}

impl fmt::Display for OutboundEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[via {}] <{}> {}",
            self.via_device, self.from_sender, self.body
        )
    }
}

/// Check that decrypted text has the shape of an envelope
pub fn has_via_marker(text: &str) -> bool {
    text.contains(VIA_MARKER)
}

/// Check whether `text` was bridged by `device_name` (case-insensitive)
pub fn is_echo_of(text: &str, device_name: &str) -> bool {
    let tag = format!("[via {}]", device_name).to_lowercase();
    text.to_lowercase().contains(&tag)
}
