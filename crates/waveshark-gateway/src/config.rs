//! Configuration types for the WaveShark gateway
//!
//! This module provides configuration structures for the gateway including
//! serial port settings, handshake bounds, broker location, encryption
//! material and relay behavior.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Default baud rate for WaveShark Communicators
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default bounded timeout for one serial line read
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Hardware descriptor substring of the Communicator's USB-UART bridge
pub const USB_BRIDGE_DESCRIPTOR: &str = "CP210";

/// Reads performed while waiting for the boot banner or first name response
pub const PROBE_POLL_LIMIT: usize = 100;

/// Read timeout used while polling for the boot banner
pub const DEFAULT_PROBE_READ_TIMEOUT_MS: u64 = 100;

/// Name queries re-sent before a port is declared "not found"
pub const CONFIRM_RETRY_LIMIT: usize = 20;

/// Lines read after each re-sent name query
pub const CONFIRM_READS_PER_RETRY: usize = 2;

/// Default interval between gateway announcements (0 disables them)
pub const DEFAULT_ANNOUNCE_INTERVAL_SECS: u64 = 600;

/// Default sleep between main loop iterations
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Command that switches the Communicator into gateway output mode
pub const DEVICE_SETUP_COMMAND: &str = "/SEROUT FIELDTEST";

/// Prefix applied to the configured topic name
pub const TOPIC_PREFIX: &str = "my/";

/// Required length of the encryption key and IV in bytes
pub const KEY_MATERIAL_LEN: usize = 16;

/// Default message broker host
pub const DEFAULT_BROKER_HOST: &str = "localhost";

/// Default message broker port
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Main configuration for the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Topic name shared by every gateway of the group (without prefix)
    #[serde(default)]
    pub topic: String,

    /// Pre-shared encryption material
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Message broker location
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Serial port settings
    #[serde(default)]
    pub serial: SerialConfig,

    /// Device confirmation protocol bounds
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Relay behavior settings
    #[serde(default)]
    pub relay: RelayConfig,
}

impl GatewayConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// The shared topic messages are published and received on
    pub fn qualified_topic(&self) -> String {
        format!("{}{}", TOPIC_PREFIX, self.topic)
    }

    /// Check that everything required to run the gateway is present
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(GatewayError::MissingConfig("topic".to_string()));
        }
        if self.topic.contains(&['#', '+'][..]) {
            return Err(GatewayError::InvalidConfig(format!(
                "topic [{}] must not contain wildcards",
                self.topic
            )));
        }
        self.encryption.validate()?;
        if self.handshake.confirm_retries == 0 {
            return Err(GatewayError::InvalidConfig(
                "handshake.confirm_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pre-shared key and initialization vector
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// 16-character key
    pub key: String,
    /// 16-character initialization vector
    pub iv: String,
}

impl EncryptionConfig {
    /// Check key and IV lengths
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(GatewayError::MissingConfig("encryption.key".to_string()));
        }
        if self.iv.is_empty() {
            return Err(GatewayError::MissingConfig("encryption.iv".to_string()));
        }
        if self.key.len() != KEY_MATERIAL_LEN {
            return Err(GatewayError::InvalidKeyMaterial {
                what: "key",
                len: self.key.len(),
            });
        }
        if self.iv.len() != KEY_MATERIAL_LEN {
            return Err(GatewayError::InvalidKeyMaterial {
                what: "iv",
                len: self.iv.len(),
            });
        }
        Ok(())
    }
}

/// Message broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker host name
    #[serde(default = "default_broker_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// Keep-alive interval
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,

    /// How long to wait for the broker to accept the connection
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_broker_host() -> String {
    DEFAULT_BROKER_HOST.to_string()
}

fn default_broker_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BROKER_HOST.to_string(),
            port: DEFAULT_BROKER_PORT,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Serial port settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port to attach to (required when several Communicators are present)
    #[serde(default)]
    pub port: Option<String>,

    /// Baud rate (default: 115200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Bounded timeout of one line read
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Hardware descriptor substring identifying Communicator ports
    #[serde(default = "default_descriptor_match")]
    pub descriptor_match: String,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(DEFAULT_READ_TIMEOUT_MS)
}

fn default_descriptor_match() -> String {
    USB_BRIDGE_DESCRIPTOR.to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            descriptor_match: USB_BRIDGE_DESCRIPTOR.to_string(),
        }
    }
}

/// Bounds of the device confirmation protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Reads spent waiting for the banner or the first name response
    #[serde(default = "default_probe_poll_limit")]
    pub probe_poll_limit: usize,

    /// Timeout of each banner poll read
    #[serde(with = "humantime_serde", default = "default_probe_read_timeout")]
    pub probe_read_timeout: Duration,

    /// Name queries re-sent before giving up
    #[serde(default = "default_confirm_retries")]
    pub confirm_retries: usize,

    /// Lines inspected after each re-sent query
    #[serde(default = "default_reads_per_retry")]
    pub reads_per_retry: usize,
}

fn default_probe_poll_limit() -> usize {
    PROBE_POLL_LIMIT
}

fn default_probe_read_timeout() -> Duration {
    Duration::from_millis(DEFAULT_PROBE_READ_TIMEOUT_MS)
}

fn default_confirm_retries() -> usize {
    CONFIRM_RETRY_LIMIT
}

fn default_reads_per_retry() -> usize {
    CONFIRM_READS_PER_RETRY
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            probe_poll_limit: PROBE_POLL_LIMIT,
            probe_read_timeout: Duration::from_millis(DEFAULT_PROBE_READ_TIMEOUT_MS),
            confirm_retries: CONFIRM_RETRY_LIMIT,
            reads_per_retry: CONFIRM_READS_PER_RETRY,
        }
    }
}

/// What the process does once started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Attach a Communicator and relay in both directions
    #[default]
    Bridge,
    /// Only decrypt and log network traffic, no device
    ListenOnly,
}

/// Relay behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Operation mode
    #[serde(default)]
    pub mode: OperationMode,

    /// Seconds between announcements, 0 disables them
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,

    /// Republish every radio frame, not only SEND commands
    #[serde(default)]
    pub repeat_all: bool,

    /// Sleep between main loop iterations
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Command written to the device before relaying starts
    #[serde(default = "default_setup_command")]
    pub setup_command: Option<String>,
}

fn default_announce_interval() -> u64 {
    DEFAULT_ANNOUNCE_INTERVAL_SECS
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
}

fn default_setup_command() -> Option<String> {
    Some(DEVICE_SETUP_COMMAND.to_string())
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::Bridge,
            announce_interval_secs: DEFAULT_ANNOUNCE_INTERVAL_SECS,
            repeat_all: false,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            setup_command: Some(DEVICE_SETUP_COMMAND.to_string()),
        }
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Set the topic name
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    /// Set the encryption key and IV
    pub fn encryption(mut self, key: impl Into<String>, iv: impl Into<String>) -> Self {
        self.config.encryption = EncryptionConfig {
            key: key.into(),
            iv: iv.into(),
        };
        self
    }

    /// Set the broker location
    pub fn broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.broker.host = host.into();
        self.config.broker.port = port;
        self
    }

    /// Select the serial port to attach to
    pub fn serial_port(mut self, port: impl Into<String>) -> Self {
        self.config.serial.port = Some(port.into());
        self
    }

    /// Set the serial read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.serial.read_timeout = timeout;
        self
    }

    /// Set the announcement interval in seconds (0 disables)
    pub fn announce_interval_secs(mut self, secs: u64) -> Self {
        self.config.relay.announce_interval_secs = secs;
        self
    }

    /// Enable or disable repeat-all mode
    pub fn repeat_all(mut self, enabled: bool) -> Self {
        self.config.relay.repeat_all = enabled;
        self
    }

    /// Set the operation mode
    pub fn mode(mut self, mode: OperationMode) -> Self {
        self.config.relay.mode = mode;
        self
    }

    /// Set the main loop sleep
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.relay.poll_interval = interval;
        self
    }

    /// Set or clear the device setup command
    pub fn setup_command(mut self, command: Option<String>) -> Self {
        self.config.relay.setup_command = command;
        self
    }

    /// Set the handshake bounds
    pub fn handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.config.handshake = handshake;
        self
    }

    /// Build the configuration
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::new()
            .topic("mFiFocNe")
            .encryption("TmAAYuFzCkuPxBXu", "GTGbbsTfViwIoOEI")
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.serial.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.handshake.confirm_retries, 20);
        assert_eq!(config.handshake.probe_poll_limit, 100);
        assert_eq!(config.relay.announce_interval_secs, 600);
        assert_eq!(config.relay.mode, OperationMode::Bridge);
        assert!(!config.relay.repeat_all);
    }

    #[test]
    fn test_config_builder() {
        let config = valid_builder()
            .serial_port("COM3")
            .announce_interval_secs(0)
            .repeat_all(true)
            .build();

        assert_eq!(config.serial.port.as_deref(), Some("COM3"));
        assert_eq!(config.relay.announce_interval_secs, 0);
        assert!(config.relay.repeat_all);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_qualified_topic() {
        let config = valid_builder().build();
        assert_eq!(config.qualified_topic(), "my/mFiFocNe");
    }

    #[test]
    fn test_validate_rejects_short_key() {
        let config = GatewayConfigBuilder::new()
            .topic("t")
            .encryption("short", "GTGbbsTfViwIoOEI")
            .build();

        match config.validate() {
            Err(GatewayError::InvalidKeyMaterial { what, len }) => {
                assert_eq!(what, "key");
                assert_eq!(len, 5);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_validate_requires_topic() {
        let config = GatewayConfigBuilder::new()
            .encryption("TmAAYuFzCkuPxBXu", "GTGbbsTfViwIoOEI")
            .build();
        assert!(matches!(
            config.validate(),
            Err(GatewayError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_wildcard_topic() {
        let config = valid_builder().topic("a/#").build();
        assert!(matches!(
            config.validate(),
            Err(GatewayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_json_file_with_humantime_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "topic": "mFiFocNe",
                "encryption": {{ "key": "TmAAYuFzCkuPxBXu", "iv": "GTGbbsTfViwIoOEI" }},
                "serial": {{ "port": "/dev/ttyUSB0", "read_timeout": "250ms" }},
                "relay": {{ "announce_interval_secs": 0, "poll_interval": "5ms", "mode": "listen_only" }}
            }}"#
        )
        .unwrap();

        let config = GatewayConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.serial.read_timeout, Duration::from_millis(250));
        assert_eq!(config.serial.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.relay.poll_interval, Duration::from_millis(5));
        assert_eq!(config.relay.mode, OperationMode::ListenOnly);
        assert_eq!(
            config.relay.setup_command.as_deref(),
            Some(DEVICE_SETUP_COMMAND)
        );
        assert_eq!(config.broker.port, DEFAULT_BROKER_PORT);
        assert!(config.validate().is_ok());
    }
}
