//! Simulated hardware and network for testing
//!
//! These stand-ins let the handshake and relay run end to end without a
//! Communicator or a broker:
//!
//! - [`SimulatedCommunicator`] - scripted device behind [`LineTransport`]
//! - [`SimulatedPortProvider`] - fixed set of ports, some with devices
//! - [`RecordingChannel`] - captures publishes and injects inbound payloads
//!
//! # Example
//!
//! ```rust,ignore
//! use waveshark_gateway::test_utils::{SimulatedCommunicator, SimulatedPortProvider};
//! use waveshark_gateway::DeviceHandshake;
//!
//! let provider = SimulatedPortProvider::new()
//!     .with_device("COM3", "CP2102 USB to UART", SimulatedCommunicator::new("Ridge"));
//! let found = DeviceHandshake::new(provider).scan().await;
//! assert_eq!(found[0].device_name, "Ridge");
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{GatewayError, Result};
use crate::handshake::NAME_QUERY;
use crate::interface::{LineTransport, PortDescriptor, PortProvider};
use crate::pubsub::{MessageCallback, PubSubChannel};

/// Scripted Communicator
///
/// Clones share one device, so a test can keep a handle while the relay owns
/// the transport. Reads never block: a read with nothing queued returns an
/// empty line immediately.
#[derive(Clone)]
pub struct SimulatedCommunicator {
    state: Arc<Mutex<DeviceState>>,
}

#[derive(Debug, Default)]
struct DeviceState {
    device_name: Option<String>,
    ignore_queries: usize,
    name_queries: usize,
    echo: bool,
    fail_writes: bool,
    pending: VecDeque<String>,
    written: Vec<String>,
}

impl SimulatedCommunicator {
    /// A device that answers name queries with `device_name`
    pub fn new(device_name: impl Into<String>) -> Self {
        Self::with_state(DeviceState {
            device_name: Some(device_name.into()),
            ..DeviceState::default()
        })
    }

    /// A device that never answers name queries
    pub fn unresponsive() -> Self {
        Self::with_state(DeviceState::default())
    }

    fn with_state(state: DeviceState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Queue a boot banner ahead of everything else
    pub fn with_banner(self, banner: impl Into<String>) -> Self {
        self.state.lock().pending.push_front(banner.into());
        self
    }

    /// Stay silent for the first `count` name queries
    pub fn ignoring_queries(self, count: usize) -> Self {
        self.state.lock().ignore_queries = count;
        self
    }

    /// Echo every written line back before any response
    pub fn with_echo(self) -> Self {
        self.state.lock().echo = true;
        self
    }

    /// Make every write fail
    pub fn set_write_failure(&self, enabled: bool) {
        self.state.lock().fail_writes = enabled;
    }

    /// Queue a line as if the device printed it
    pub fn push_line(&self, line: impl Into<String>) {
        self.state.lock().pending.push_back(line.into());
    }

    /// Queue a radio frame from `sender`
    pub fn push_frame(&self, sender: &str, body: &str) {
        self.push_line(format!("[RSS: -40] [SNR: 9] <{}> {}", sender, body));
    }

    /// Lines written to the device, without terminators
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// Forget the written lines
    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    /// Name queries received so far
    pub fn name_queries(&self) -> usize {
        self.state.lock().name_queries
    }

    /// Lines queued but not yet read
    pub fn pending_lines(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[async_trait]
impl LineTransport for SimulatedCommunicator {
    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(GatewayError::WriteError("simulated write failure".to_string()));
        }

        let text = String::from_utf8_lossy(bytes)
            .trim_end_matches('\r')
            .to_string();
        trace!(line = %text, "Simulated device received");

        if state.echo {
            state.pending.push_back(text.clone());
        }

        if text == NAME_QUERY {
            state.name_queries += 1;
            if state.name_queries > state.ignore_queries {
                if let Some(name) = state.device_name.clone() {
                    state.pending.push_back(format!("sender name is [{}]", name));
                }
            }
        }

        state.written.push(text);
        Ok(())
    }

    async fn read_line_within(&mut self, _timeout: Duration) -> String {
        self.state.lock().pending.pop_front().unwrap_or_default()
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

impl std::fmt::Debug for SimulatedCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedCommunicator")
            .field("device_name", &state.device_name)
            .field("pending", &state.pending.len())
            .field("written", &state.written.len())
            .finish()
    }
}

/// Port provider over a fixed set of simulated ports
#[derive(Debug, Default, Clone)]
pub struct SimulatedPortProvider {
    ports: Vec<PortDescriptor>,
    devices: HashMap<String, SimulatedCommunicator>,
    fail_enumeration: bool,
}

impl SimulatedPortProvider {
    /// Create a provider with no ports
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port with a device on it
    pub fn with_device(
        mut self,
        port: &str,
        description: &str,
        device: SimulatedCommunicator,
    ) -> Self {
        self.ports.push(PortDescriptor::new(port, description));
        self.devices.insert(port.to_string(), device);
        self
    }

    /// Add a port that fails to open
    pub fn with_unopenable_port(mut self, port: &str, description: &str) -> Self {
        self.ports.push(PortDescriptor::new(port, description));
        self
    }

    /// Make enumeration fail
    pub fn with_enumeration_failure(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }

    /// Get the device on `port`
    pub fn device(&self, port: &str) -> Option<SimulatedCommunicator> {
        self.devices.get(port).cloned()
    }
}

#[async_trait]
impl PortProvider for SimulatedPortProvider {
    fn available_ports(&self) -> Result<Vec<PortDescriptor>> {
        if self.fail_enumeration {
            return Err(GatewayError::EnumerationFailed(
                "simulated enumeration failure".to_string(),
            ));
        }
        Ok(self.ports.clone())
    }

    async fn open(&self, port: &str) -> Result<Box<dyn LineTransport>> {
        match self.devices.get(port) {
            Some(device) => Ok(Box::new(device.clone())),
            None => Err(GatewayError::PortOpenFailed {
                port: port.to_string(),
                reason: "simulated open failure".to_string(),
            }),
        }
    }
}

/// In-memory publish/subscribe channel
///
/// With loopback enabled every publish is delivered to the topic's
/// subscribers, the way a broker fans a message back out to its publisher.
#[derive(Default)]
pub struct RecordingChannel {
    published: Mutex<Vec<(String, String)>>,
    subscriptions: Mutex<HashMap<String, Vec<MessageCallback>>>,
    loopback: bool,
    fail_publish: Mutex<bool>,
}

impl RecordingChannel {
    /// Create a channel that only records
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel that also delivers publishes to subscribers
    pub fn with_loopback() -> Self {
        Self {
            loopback: true,
            ..Self::default()
        }
    }

    /// Make every publish fail
    pub fn set_publish_failure(&self, enabled: bool) {
        *self.fail_publish.lock() = enabled;
    }

    /// Deliver `payload` to the subscribers of `topic`
    ///
    /// Returns the number of callbacks invoked.
    pub fn inject(&self, topic: &str, payload: &str) -> usize {
        let callbacks = self
            .subscriptions
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for callback in &callbacks {
            callback(payload.to_string());
        }
        callbacks.len()
    }

    /// Every `(topic, payload)` published so far
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Topics with at least one subscriber
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl PubSubChannel for RecordingChannel {
    async fn subscribe(&self, topic: &str, on_message: MessageCallback) -> Result<()> {
        self.subscriptions
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(on_message);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if *self.fail_publish.lock() {
            return Err(GatewayError::PublishFailed(
                "simulated publish failure".to_string(),
            ));
        }

        self.published
            .lock()
            .push((topic.to_string(), payload.to_string()));

        if self.loopback {
            self.inject(topic, payload);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

impl std::fmt::Debug for RecordingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingChannel")
            .field("published", &self.published.lock().len())
            .field("loopback", &self.loopback)
            .finish()
    }
}
