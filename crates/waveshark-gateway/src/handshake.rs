//! Communicator discovery and attachment
//!
//! Turns the computer's serial ports into zero or one attached Communicator.
//!
//! # Confirmation protocol
//!
//! The device's command echo is not line-synchronized with its responses, so
//! a single query/read pair desynchronizes now and then. Confirmation runs in
//! two bounded phases:
//!
//! 1. **Probe**: send the name query, then poll up to `probe_poll_limit`
//!    short reads for a readiness banner or a name response. A slow-booting
//!    device prints the banner late; a fast one answers right away.
//! 2. **Confirm**: up to `confirm_retries` times, re-send the query and
//!    inspect `reads_per_retry` lines for `sender name is [<NAME>]`.
//!
//! Exhausting both phases, or any transport failure, means "no Communicator
//! here". Scanning never aborts on a bad port.

use std::fmt;

use tracing::{debug, info, trace, warn};

use crate::config::{GatewayConfig, HandshakeConfig, USB_BRIDGE_DESCRIPTOR};
use crate::error::{GatewayError, Result};
use crate::interface::{LineTransport, PortProvider};

/// Command asking the device for its configured name
pub const NAME_QUERY: &str = "/NAME";

/// Text preceding the name in the device's response
pub const NAME_RESPONSE_MARKER: &str = "sender name is [";

/// Text the device prints once it has booted (matched case-insensitively)
pub const READY_BANNER: &str = "Communicator ready";

/// A port that might have a Communicator on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicatorCandidate {
    /// Port name
    pub physical_port: String,
    /// Whether the hardware descriptor names the USB bridge chip
    pub descriptor_match: bool,
}

/// A Communicator that answered the confirmation protocol during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Port name
    pub port: String,
    /// Name the device reported
    pub device_name: String,
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[WaveShark Communicator name: {}] [Port: {}]",
            self.device_name, self.port
        )
    }
}

/// A confirmed Communicator with its open line session
pub struct AttachedDevice {
    /// Port name
    pub port: String,
    /// Name the device reported
    pub device_name: String,
    /// Open transport, owned by whoever holds the device
    pub session: Box<dyn LineTransport>,
}

impl fmt::Debug for AttachedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedDevice")
            .field("port", &self.port)
            .field("device_name", &self.device_name)
            .field("session", &self.session.name())
            .finish()
    }
}

/// Runs discovery and the confirmation protocol over a [`PortProvider`]
pub struct DeviceHandshake<P: PortProvider> {
    provider: P,
    config: HandshakeConfig,
    descriptor_match: String,
}

impl<P: PortProvider> DeviceHandshake<P> {
    /// Create a handshake with default bounds
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            config: HandshakeConfig::default(),
            descriptor_match: USB_BRIDGE_DESCRIPTOR.to_string(),
        }
    }

    /// Create from gateway configuration
    pub fn from_config(provider: P, config: &GatewayConfig) -> Self {
        Self {
            provider,
            config: config.handshake.clone(),
            descriptor_match: config.serial.descriptor_match.clone(),
        }
    }

    /// Replace the protocol bounds
    pub fn with_config(mut self, config: HandshakeConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the port provider
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// List every port with its descriptor match flag
    pub fn candidates(&self) -> Result<Vec<CommunicatorCandidate>> {
        let ports = self.provider.available_ports()?;
        Ok(ports
            .into_iter()
            .map(|port| CommunicatorCandidate {
                descriptor_match: port.description.contains(&self.descriptor_match),
                physical_port: port.name,
            })
            .collect())
    }

    /// Find every attached Communicator
    ///
    /// Ports that do not match the descriptor, fail to open or never confirm
    /// are left out. Enumeration failure yields an empty list.
    pub async fn scan(&self) -> Vec<DiscoveredDevice> {
        let candidates = match self.candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(code = e.error_code(), error = %e, "Port enumeration failed");
                return Vec::new();
            }
        };

        let mut discovered = Vec::new();
        for candidate in candidates.into_iter().filter(|c| c.descriptor_match) {
            match self.attach(&candidate.physical_port).await {
                Some(device) => {
                    debug!(
                        port = %device.port,
                        device = %device.device_name,
                        "Communicator confirmed on port"
                    );
                    discovered.push(DiscoveredDevice {
                        port: device.port,
                        device_name: device.device_name,
                    });
                }
                None => debug!(port = %candidate.physical_port, "No Communicator on port"),
            }
        }
        discovered
    }

    /// Scan, pick the Communicator to use, and attach to it
    ///
    /// Every discovered Communicator is logged. Fails with the startup errors
    /// of [`select_port`], or [`GatewayError::NoDeviceOnPort`] if the chosen
    /// device stops answering between the scan and the attach.
    pub async fn discover(&self, requested: Option<&str>) -> Result<AttachedDevice> {
        let discovered = self.scan().await;
        for device in &discovered {
            info!("{}", device);
        }

        let selected = select_port(&discovered, requested)?;
        let device = self
            .attach(&selected.port)
            .await
            .ok_or_else(|| GatewayError::NoDeviceOnPort(selected.port.clone()))?;

        info!(
            device = %device.device_name,
            port = %device.port,
            "Connected to WaveShark Communicator"
        );
        Ok(device)
    }

    /// Open `port` and confirm a Communicator is on it
    pub async fn attach(&self, port: &str) -> Option<AttachedDevice> {
        match self.try_attach(port).await {
            Ok(device) => Some(device),
            Err(e) => {
                debug!(port = %port, code = e.error_code(), error = %e, "Attach failed");
                None
            }
        }
    }

    async fn try_attach(&self, port: &str) -> Result<AttachedDevice> {
        let mut session = self.provider.open(port).await?;
        let device_name = self.confirm_device(port, session.as_mut()).await?;

        Ok(AttachedDevice {
            port: port.to_string(),
            device_name,
            session,
        })
    }

    /// Run the confirmation protocol on an open transport
    ///
    /// Returns the device name, or [`GatewayError::HandshakeFailed`] once the
    /// retry bound is exhausted. Write failures are returned as they occur.
    pub async fn confirm_device(
        &self,
        port: &str,
        transport: &mut dyn LineTransport,
    ) -> Result<String> {
        transport.write_line(NAME_QUERY, 0).await?;

        for _ in 0..self.config.probe_poll_limit {
            let line = transport
                .read_line_within(self.config.probe_read_timeout)
                .await;
            if line.is_empty() {
                continue;
            }
            trace!(port = %port, line = %line, "Probe line");

            if let Some(name) = parse_name_response(&line) {
                return Ok(name);
            }
            if is_ready_banner(&line) {
                debug!(port = %port, "Communicator ready");
                break;
            }
        }

        for attempt in 1..=self.config.confirm_retries {
            transport.write_line(NAME_QUERY, 0).await?;

            for _ in 0..self.config.reads_per_retry {
                let line = transport.read_line().await;
                if let Some(name) = parse_name_response(&line) {
                    debug!(port = %port, attempt, "Communicator confirmed");
                    return Ok(name);
                }
            }
        }

        Err(GatewayError::HandshakeFailed {
            port: port.to_string(),
            attempts: self.config.confirm_retries + 1,
        })
    }
}

/// Extract `<NAME>` from a `sender name is [<NAME>]` line
///
/// The name ends at the first `]`; a name containing `]` is truncated. An
/// empty name is no match.
pub fn parse_name_response(line: &str) -> Option<String> {
    let start = line.find(NAME_RESPONSE_MARKER)? + NAME_RESPONSE_MARKER.len();
    let rest = &line[start..];
    let end = rest.find(']')?;
    let name = &rest[..end];

    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Check for the device's readiness banner
pub fn is_ready_banner(line: &str) -> bool {
    line.to_lowercase().contains(&READY_BANNER.to_lowercase())
}

/// Pick the Communicator to attach to
///
/// - none discovered: [`GatewayError::NoCommunicators`]
/// - exactly one: that one, even if another port was requested
/// - several and a requested port: the case-insensitive match, otherwise
///   [`GatewayError::NoDeviceOnPort`]
/// - several and no request: [`GatewayError::AmbiguousDevice`]
pub fn select_port<'a>(
    discovered: &'a [DiscoveredDevice],
    requested: Option<&str>,
) -> Result<&'a DiscoveredDevice> {
    match (discovered, requested) {
        ([], _) => Err(GatewayError::NoCommunicators),
        ([only], requested) => {
            if let Some(port) = requested.filter(|p| !p.eq_ignore_ascii_case(&only.port)) {
                warn!(
                    requested = %port,
                    port = %only.port,
                    "Only one Communicator attached, ignoring requested port"
                );
            }
            Ok(only)
        }
        (many, Some(port)) => many
            .iter()
            .find(|d| d.port.eq_ignore_ascii_case(port))
            .ok_or_else(|| GatewayError::NoDeviceOnPort(port.to_string())),
        (many, None) => Err(GatewayError::AmbiguousDevice { count: many.len() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{SimulatedCommunicator, SimulatedPortProvider};
    use std::time::Duration;

    fn fast() -> HandshakeConfig {
        HandshakeConfig {
            probe_read_timeout: Duration::from_millis(1),
            ..HandshakeConfig::default()
        }
    }

    fn device(port: &str, name: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            port: port.to_string(),
            device_name: name.to_string(),
        }
    }

    #[test]
    fn test_parse_name_response() {
        assert_eq!(
            parse_name_response("sender name is [Ridge]").as_deref(),
            Some("Ridge")
        );
        assert_eq!(
            parse_name_response("> sender name is [Base Camp] ok").as_deref(),
            Some("Base Camp")
        );
        assert_eq!(
            parse_name_response("sender name is [a]b]").as_deref(),
            Some("a")
        );
    }

    #[test]
    fn test_parse_name_response_no_match() {
        assert_eq!(parse_name_response(""), None);
        assert_eq!(parse_name_response("/NAME"), None);
        assert_eq!(parse_name_response("sender name is [Ridge"), None);
        assert_eq!(parse_name_response("sender name is []"), None);
    }

    #[test]
    fn test_ready_banner() {
        assert!(is_ready_banner("WaveShark Communicator READY"));
        assert!(!is_ready_banner("sender name is [Ridge]"));
    }

    #[test]
    fn test_select_single_device() {
        let found = vec![device("COM3", "Ridge")];
        assert_eq!(select_port(&found, None).unwrap().port, "COM3");
        assert_eq!(select_port(&found, Some("COM9")).unwrap().port, "COM3");
    }

    #[test]
    fn test_select_requires_port_when_ambiguous() {
        let found = vec![device("COM3", "Ridge"), device("COM4", "Summit")];

        assert!(matches!(
            select_port(&found, None),
            Err(GatewayError::AmbiguousDevice { count: 2 })
        ));
        assert_eq!(select_port(&found, Some("com4")).unwrap().device_name, "Summit");
        assert!(matches!(
            select_port(&found, Some("COM9")),
            Err(GatewayError::NoDeviceOnPort(p)) if p == "COM9"
        ));
    }

    #[test]
    fn test_select_none() {
        assert!(matches!(
            select_port(&[], Some("COM3")),
            Err(GatewayError::NoCommunicators)
        ));
    }

    #[tokio::test]
    async fn test_probe_phase_accepts_immediate_answer() {
        let sim = SimulatedCommunicator::new("Ridge").with_echo();
        let handshake = DeviceHandshake::new(SimulatedPortProvider::new()).with_config(fast());
        let mut transport = sim.clone();

        let name = handshake.confirm_device("COM3", &mut transport).await.unwrap();
        assert_eq!(name, "Ridge");
        assert_eq!(sim.name_queries(), 1);
    }

    #[tokio::test]
    async fn test_banner_then_retries() {
        let sim = SimulatedCommunicator::new("Ridge")
            .with_banner("WaveShark Communicator ready")
            .ignoring_queries(2);
        let handshake = DeviceHandshake::new(SimulatedPortProvider::new()).with_config(fast());
        let mut transport = sim.clone();

        let name = handshake.confirm_device("COM3", &mut transport).await.unwrap();
        assert_eq!(name, "Ridge");
        assert_eq!(sim.name_queries(), 3);
    }

    #[tokio::test]
    async fn test_unresponsive_device_fails() {
        let sim = SimulatedCommunicator::unresponsive();
        let handshake = DeviceHandshake::new(SimulatedPortProvider::new()).with_config(fast());
        let mut transport = sim.clone();

        let result = handshake.confirm_device("COM5", &mut transport).await;
        assert!(matches!(
            result,
            Err(GatewayError::HandshakeFailed { attempts: 21, .. })
        ));
        assert_eq!(sim.name_queries(), 21);
    }

    #[tokio::test]
    async fn test_scan_skips_non_matching_descriptor() {
        let provider = SimulatedPortProvider::new()
            .with_device("COM3", "CP2102 USB to UART", SimulatedCommunicator::new("Ridge"))
            .with_device("COM7", "FTDI FT232R", SimulatedCommunicator::new("Other"));
        let handshake = DeviceHandshake::new(provider).with_config(fast());

        let found = handshake.scan().await;
        assert_eq!(found, vec![device("COM3", "Ridge")]);
    }

    #[tokio::test]
    async fn test_scan_survives_open_failure() {
        let provider = SimulatedPortProvider::new()
            .with_unopenable_port("COM1", "CP2102 USB to UART")
            .with_device("COM3", "CP2102 USB to UART", SimulatedCommunicator::new("Ridge"));
        let handshake = DeviceHandshake::new(provider).with_config(fast());

        assert_eq!(handshake.scan().await, vec![device("COM3", "Ridge")]);
    }

    #[tokio::test]
    async fn test_attach_keeps_session() {
        let provider = SimulatedPortProvider::new().with_device(
            "COM3",
            "CP2102 USB to UART",
            SimulatedCommunicator::new("Base Camp"),
        );
        let handshake = DeviceHandshake::new(provider).with_config(fast());

        let attached = handshake.attach("COM3").await.unwrap();
        assert_eq!(attached.device_name, "Base Camp");
        assert_eq!(attached.port, "COM3");
        assert!(handshake.attach("COM4").await.is_none());
    }

    #[tokio::test]
    async fn test_discover_single_device() {
        let provider = SimulatedPortProvider::new()
            .with_device("COM3", "CP2102 USB to UART", SimulatedCommunicator::new("Ridge"))
            .with_device("COM5", "CP2102 USB to UART", SimulatedCommunicator::unresponsive());
        let handshake = DeviceHandshake::new(provider).with_config(fast());

        let attached = handshake.discover(None).await.unwrap();
        assert_eq!(attached.port, "COM3");
        assert_eq!(attached.device_name, "Ridge");
    }

    #[tokio::test]
    async fn test_discover_nothing() {
        let handshake = DeviceHandshake::new(SimulatedPortProvider::new());
        assert!(matches!(
            handshake.discover(None).await,
            Err(GatewayError::NoCommunicators)
        ));
    }

    #[test]
    fn test_discovery_report_format() {
        assert_eq!(
            device("COM3", "Ridge").to_string(),
            "[WaveShark Communicator name: Ridge] [Port: COM3]"
        );
    }
}
