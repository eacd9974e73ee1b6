//! Error types for WaveShark gateway operations
//!
//! This module provides error handling for every gateway boundary: serial
//! line transport, device discovery, message encryption, publish/subscribe
//! delivery and configuration.

use thiserror::Error;

/// Failures of the message codec
///
/// The relay engine treats every variant the same way: the message is
/// undecryptable and is discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Token is not valid base-64 text
    #[error("Token is not valid base-64: {0}")]
    Decode(String),

    /// Ciphertext has the wrong size or padding (wrong key/IV or corrupted token)
    #[error("Cipher failure: {0}")]
    Cipher(String),

    /// Decrypted bytes are not UTF-8
    #[error("Decrypted text is not UTF-8: {0}")]
    Text(String),
}

/// Main error type for WaveShark gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    // ===== Serial/Interface Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port name
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Serial port enumeration failed
    #[error("Failed to enumerate serial ports: {0}")]
    EnumerationFailed(String),

    /// Serial write error
    #[error("Serial write error: {0}")]
    WriteError(String),

    // ===== Discovery Errors =====
    /// No Communicator answered on any port
    #[error("Did not find any WaveShark Communicators attached to this computer")]
    NoCommunicators,

    /// More than one Communicator and no port selected
    #[error(
        "{count} WaveShark Communicators are attached to this computer, select one with --port"
    )]
    AmbiguousDevice {
        /// Number of Communicators discovered
        count: usize,
    },

    /// Requested port has no Communicator
    #[error("There is no WaveShark Communicator attached to port [{0}]")]
    NoDeviceOnPort(String),

    /// Confirmation protocol exhausted its retries
    #[error("Communicator on {port} did not report its name after {attempts} attempts")]
    HandshakeFailed {
        /// Port name
        port: String,
        /// Name queries sent
        attempts: usize,
    },

    // ===== Codec Errors =====
    /// Message could not be decrypted
    #[error("Undecryptable message: {0}")]
    Codec(#[from] CodecError),

    /// Key or IV has the wrong length
    #[error("Invalid encryption {what}: expected 16 bytes, got {len}")]
    InvalidKeyMaterial {
        /// "key" or "iv"
        what: &'static str,
        /// Actual length in bytes
        len: usize,
    },

    // ===== Publish/Subscribe Errors =====
    /// Broker connection failed
    #[error("Failed to connect to message broker {host}:{port}: {reason}")]
    BrokerConnectFailed {
        /// Broker host
        host: String,
        /// Broker port
        port: u16,
        /// Failure reason
        reason: String,
    },

    /// Publish failed
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Subscribe failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ===== General Errors =====
    /// JSON error wrapper
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Check if this is a transport fault that only aborts the current operation
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GatewayError::WriteError(_)
                | GatewayError::PortOpenFailed { .. }
                | GatewayError::HandshakeFailed { .. }
                | GatewayError::PublishFailed(_)
        )
    }

    /// Check if this error means an inbound message could not be decrypted
    pub fn is_codec_error(&self) -> bool {
        matches!(self, GatewayError::Codec(_))
    }

    /// Check if this error must stop the process during startup
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::NoCommunicators
                | GatewayError::AmbiguousDevice { .. }
                | GatewayError::NoDeviceOnPort(_)
                | GatewayError::BrokerConnectFailed { .. }
                | GatewayError::InvalidKeyMaterial { .. }
                | GatewayError::InvalidConfig(_)
                | GatewayError::MissingConfig(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::PortNotFound(_) => "PORT_NOT_FOUND",
            GatewayError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            GatewayError::EnumerationFailed(_) => "ENUMERATION_FAILED",
            GatewayError::WriteError(_) => "WRITE_ERROR",
            GatewayError::NoCommunicators => "NO_COMMUNICATORS",
            GatewayError::AmbiguousDevice { .. } => "AMBIGUOUS_DEVICE",
            GatewayError::NoDeviceOnPort(_) => "NO_DEVICE_ON_PORT",
            GatewayError::HandshakeFailed { .. } => "HANDSHAKE_FAILED",
            GatewayError::Codec(CodecError::Decode(_)) => "CODEC_DECODE",
            GatewayError::Codec(CodecError::Cipher(_)) => "CODEC_CIPHER",
            GatewayError::Codec(CodecError::Text(_)) => "CODEC_TEXT",
            GatewayError::InvalidKeyMaterial { .. } => "INVALID_KEY_MATERIAL",
            GatewayError::BrokerConnectFailed { .. } => "BROKER_CONNECT_FAILED",
            GatewayError::PublishFailed(_) => "PUBLISH_FAILED",
            GatewayError::SubscribeFailed(_) => "SUBSCRIBE_FAILED",
            GatewayError::InvalidConfig(_) => "INVALID_CONFIG",
            GatewayError::MissingConfig(_) => "MISSING_CONFIG",
            GatewayError::Json(_) => "JSON_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for GatewayError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => GatewayError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                GatewayError::Io(std::io::Error::new(kind, err.description))
            }
            _ => GatewayError::EnumerationFailed(err.description),
        }
    }
}

#[cfg(feature = "mqtt")]
impl From<rumqttc::ClientError> for GatewayError {
    fn from(err: rumqttc::ClientError) -> Self {
        GatewayError::PublishFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = GatewayError::PortNotFound("/dev/ttyUSB0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");

        let err: GatewayError = CodecError::Cipher("bad padding".to_string()).into();
        assert_eq!(err.error_code(), "CODEC_CIPHER");
    }

    #[test]
    fn test_is_retriable() {
        assert!(GatewayError::WriteError("broken pipe".to_string()).is_retriable());
        assert!(!GatewayError::NoCommunicators.is_retriable());
    }

    #[test]
    fn test_conversions() {
        let err: GatewayError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.error_code(), "IO_ERROR");

        let err: GatewayError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.error_code(), "JSON_ERROR");
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_codec_errors_are_equivalent() {
        for err in [
            CodecError::Decode("x".to_string()),
            CodecError::Cipher("x".to_string()),
            CodecError::Text("x".to_string()),
        ] {
            let err: GatewayError = err.into();
            assert!(err.is_codec_error());
            assert!(!err.is_startup_fatal());
        }
    }

    #[test]
    fn test_startup_fatal() {
        assert!(GatewayError::NoCommunicators.is_startup_fatal());
        assert!(GatewayError::AmbiguousDevice { count: 2 }.is_startup_fatal());
        assert!(GatewayError::NoDeviceOnPort("COM9".to_string()).is_startup_fatal());
        assert!(!GatewayError::WriteError("timeout".to_string()).is_startup_fatal());
    }

    #[test]
    fn test_messages_name_the_port() {
        let err = GatewayError::NoDeviceOnPort("COM9".to_string());
        assert!(err.to_string().contains("[COM9]"));

        let err = GatewayError::AmbiguousDevice { count: 3 };
        assert!(err.to_string().contains("--port"));
    }
}
