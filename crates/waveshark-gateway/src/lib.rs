//! WaveShark Internet Gateway
//!
//! This crate bridges a WaveShark Communicator (a packet-radio mesh device on
//! a serial port) to an encrypted publish/subscribe topic, so radio-only users
//! and Internet users can exchange short text messages.
//!
//! # Architecture
//!
//! The gateway is built from five layers, leaf first:
//!
//! 1. **Line Transport** - newline-delimited 7-bit text over the serial port
//! 2. **Device Handshake** - scan ports, confirm a Communicator, read its name
//! 3. **Message Codec** - AES-128-CBC under a pre-shared key, base-64 tokens
//! 4. **Publish/Subscribe Channel** - MQTT broker connection
//! 5. **Relay Engine** - command grammar, echo suppression, announcements
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `full` feature for the serial and MQTT back-ends
//! // Cargo.toml: waveshark-gateway = { version = "0.1", features = ["full"] }
//!
//! use std::sync::Arc;
//! use waveshark_gateway::{
//!     DeviceHandshake, GatewayConfigBuilder, MessageCodec, MqttChannel, RelayEngine,
//!     SerialPortProvider,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfigBuilder::new()
//!         .topic("mFiFocNe")
//!         .encryption("TmAAYuFzCkuPxBXu", "GTGbbsTfViwIoOEI")
//!         .build();
//!     config.validate()?;
//!
//!     let handshake =
//!         DeviceHandshake::from_config(SerialPortProvider::from_config(&config.serial), &config);
//!     let codec = MessageCodec::from_config(&config.encryption)?;
//!
//!     let mut engine = RelayEngine::establish(&handshake, &config, codec, || async {
//!         MqttChannel::connect(&config.broker).await.map(Arc::new)
//!     })
//!     .await?;
//!     engine.run().await;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port back-end (requires `libudev-dev` on Linux)
//! - `mqtt` - MQTT broker back-end
//! - `full` - Enable all back-ends
//!
//! # Message Flow
//!
//! ## Radio → Internet
//!
//! 1. Communicator prints `[RSS: ..] [SNR: ..] <Alice> Ridge SEND hello`
//! 2. RelayEngine parses the frame and extracts the post `hello`
//! 3. The envelope `[via Ridge] <Alice> hello` is encrypted and published
//! 4. Alice gets `Alice, your message has been sent.`
//!
//! ## Internet → Radio
//!
//! 1. The channel delivers a token from the topic
//! 2. GatewaySession decrypts it and checks for the `[via ` marker
//! 3. Envelopes tagged with this gateway's own name are dropped
//! 4. Everything else is written to the Communicator verbatim

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod interface;

// Protocol
pub mod codec;
pub mod command;
pub mod frame;
pub mod handshake;

// Network integration
pub mod pubsub;
pub mod relay;

// Testing utilities
pub mod test_utils;

// Re-exports for convenience
pub use config::{
    BrokerConfig, EncryptionConfig, GatewayConfig, GatewayConfigBuilder, HandshakeConfig,
    OperationMode, RelayConfig, SerialConfig,
};
pub use error::{CodecError, GatewayError, Result};
pub use interface::{encode_line, LineBuffer, LineTransport, PortDescriptor, PortProvider};

#[cfg(feature = "serial")]
pub use interface::{SerialLineTransport, SerialPortProvider};

pub use codec::MessageCodec;
pub use command::{classify, extract_post, Command};
pub use frame::{OutboundEnvelope, RadioFrame};
pub use handshake::{
    parse_name_response, select_port, AttachedDevice, CommunicatorCandidate, DeviceHandshake,
    DiscoveredDevice,
};

pub use pubsub::{MessageCallback, PubSubChannel};

#[cfg(feature = "mqtt")]
pub use pubsub::MqttChannel;

pub use relay::{
    listen_only, AnnouncementTimer, GatewaySession, InboundOutcome, RelayEngine, RelayState,
    RelayStats,
};

// Protocol constants re-exports
pub use command::{
    ANNOUNCEMENT_ECHO_LINES, NETWORK_ECHO_LINES, REPLY_ECHO_LINES, SETUP_ECHO_LINES,
};
pub use config::{
    CONFIRM_READS_PER_RETRY, CONFIRM_RETRY_LIMIT, DEFAULT_BAUD_RATE, DEVICE_SETUP_COMMAND,
    PROBE_POLL_LIMIT, TOPIC_PREFIX, USB_BRIDGE_DESCRIPTOR,
};
pub use frame::{RADIO_FRAME_PREFIX, VIA_MARKER};
pub use handshake::{NAME_QUERY, NAME_RESPONSE_MARKER, READY_BANNER};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_BAUD_RATE, 115200);
        assert_eq!(NAME_QUERY, "/NAME");
        assert_eq!(CONFIRM_RETRY_LIMIT, 20);
        assert_eq!(CONFIRM_READS_PER_RETRY, 2);
        assert_eq!(PROBE_POLL_LIMIT, 100);
        assert_eq!(TOPIC_PREFIX, "my/");
    }
}
