//! RelayEngine - bridges one Communicator to the shared topic
//!
//! The engine owns the attached device and the channel session and relays in
//! both directions:
//!
//! - Radio → network: the main loop reads one line per pass, parses radio
//!   frames, and publishes the post of every `<name> SEND <post>` command as
//!   an encrypted envelope.
//! - Network → radio: payloads on the topic are decrypted, filtered for
//!   shape and echoes, and written to the device by a delivery task.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         RelayEngine                            │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐  │
//! │  │ Communicator │◄─►│ GatewaySession │◄──│ delivery task    │  │
//! │  │ (serial)     │   │ Mutex<line io> │   │ (mpsc receiver)  │  │
//! │  └──────────────┘   │ MessageCodec   │   └────────▲─────────┘  │
//! │                     │ RelayStats     │            │ callback   │
//! │   main loop ───────►└────────────────┘   ┌────────┴─────────┐  │
//! │   (poll, dispatch,   encrypt + publish ─►│ PubSubChannel    │  │
//! │    announce)                             └──────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every device write holds the transport lock until its echo lines are
//! drained, so a network delivery never interleaves with a reply or steals
//! its echo.
//!
//! # Example
//!
//! ```rust,ignore
//! use waveshark_gateway::{DeviceHandshake, GatewayConfig, MessageCodec, MqttChannel, RelayEngine};
//!
//! let handshake = DeviceHandshake::from_config(SerialPortProvider::from_config(&config.serial), &config);
//! let codec = MessageCodec::from_config(&config.encryption)?;
//!
//! let mut engine = RelayEngine::establish(&handshake, &config, codec, || async {
//!     MqttChannel::connect(&config.broker).await.map(Arc::new)
//! })
//! .await?;
//! engine.run().await;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as StatsLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::codec::MessageCodec;
use crate::command::{
    self, Command, ANNOUNCEMENT_ECHO_LINES, NETWORK_ECHO_LINES, REPLY_ECHO_LINES,
    SETUP_ECHO_LINES,
};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::frame::{self, OutboundEnvelope, RadioFrame};
use crate::handshake::{AttachedDevice, DeviceHandshake};
use crate::interface::{LineTransport, PortProvider};
use crate::pubsub::{MessageCallback, PubSubChannel};

/// Lifecycle of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Nothing done yet
    Init,
    /// Scanning ports for Communicators
    Discovering,
    /// Device confirmed, preparing it and the channel
    Attached,
    /// Relaying
    Running,
    /// Startup failed; the process exits
    Failed,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Init => "init",
            RelayState::Discovering => "discovering",
            RelayState::Attached => "attached",
            RelayState::Running => "running",
            RelayState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Relay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Radio frames read from the device
    pub radio_frames: u64,
    /// Envelopes published for SEND commands
    pub messages_published: u64,
    /// Empty SEND commands answered with a prompt
    pub prompts_sent: u64,
    /// Unrecognized commands answered with usage
    pub usage_replies: u64,
    /// Frames republished in repeat-all mode
    pub frames_repeated: u64,
    /// Announcements written to the device
    pub announcements: u64,
    /// Network messages written to the device
    pub network_delivered: u64,
    /// Own messages received back from the network
    pub echoes_suppressed: u64,
    /// Decrypted payloads without the envelope marker
    pub foreign_rejected: u64,
    /// Payloads that failed to decrypt
    pub undecryptable: u64,
    /// Faults absorbed by the main loop or the delivery task
    pub iteration_errors: u64,
}

/// What happened to one payload received from the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Written to the device
    Delivered,
    /// Codec failure, discarded
    Undecryptable,
    /// Not an envelope, discarded
    Foreign,
    /// This gateway's own envelope, discarded
    Echo,
}

/// State shared by the main loop and the delivery task
pub struct GatewaySession {
    device_name: String,
    port: String,
    codec: MessageCodec,
    transport: Mutex<Box<dyn LineTransport>>,
    stats: StatsLock<RelayStats>,
}

impl GatewaySession {
    /// Take ownership of an attached device
    pub fn new(device: AttachedDevice, codec: MessageCodec) -> Self {
        Self {
            device_name: device.device_name,
            port: device.port,
            codec,
            transport: Mutex::new(device.session),
            stats: StatsLock::new(RelayStats::default()),
        }
    }

    /// Name the device reported at attach
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Port the device is attached to
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Get the message codec
    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    /// Write a line and drain its echoes under the transport lock
    pub async fn write_line(&self, text: &str, lines_to_consume: usize) -> Result<()> {
        let mut transport = self.transport.lock().await;
        transport.write_line(text, lines_to_consume).await
    }

    /// Read one line under the transport lock
    pub async fn read_line(&self) -> String {
        let mut transport = self.transport.lock().await;
        transport.read_line().await
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> RelayStats {
        self.stats.lock().clone()
    }

    fn record(&self, update: impl FnOnce(&mut RelayStats)) {
        update(&mut *self.stats.lock());
    }

    /// Decrypt a payload from the network and write it to the device
    ///
    /// Codec failures, payloads without the envelope marker and this
    /// gateway's own envelopes are discarded. Only a device write failure is
    /// returned as an error.
    pub async fn deliver_network_message(&self, token: &str) -> Result<InboundOutcome> {
        let plaintext = match self.codec.decrypt(token) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                let e = GatewayError::from(e);
                warn!(code = e.error_code(), error = %e, "Discarding undecryptable message");
                self.record(|s| s.undecryptable += 1);
                return Ok(InboundOutcome::Undecryptable);
            }
        };

        if !frame::has_via_marker(&plaintext) {
            debug!(text = %plaintext, "Discarding message without envelope marker");
            self.record(|s| s.foreign_rejected += 1);
            return Ok(InboundOutcome::Foreign);
        }

        if frame::is_echo_of(&plaintext, &self.device_name) {
            trace!(text = %plaintext, "Suppressing own message");
            self.record(|s| s.echoes_suppressed += 1);
            return Ok(InboundOutcome::Echo);
        }

        info!("Received via Internet: {}", plaintext);
        self.write_line(&plaintext, NETWORK_ECHO_LINES).await?;
        self.record(|s| s.network_delivered += 1);
        Ok(InboundOutcome::Delivered)
    }
}

impl fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySession")
            .field("device_name", &self.device_name)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Periodic announcement schedule
///
/// Fires once `now` reaches the next fire time, then moves the fire time
/// forward by exactly one interval. An interval of zero never fires, and a
/// schedule whose next fire time is past the clock's range stops firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnouncementTimer {
    interval: Duration,
    next_fire_at: Option<Instant>,
}

impl AnnouncementTimer {
    /// First fire is at `start`
    pub fn new(interval_secs: u64, start: Instant) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            next_fire_at: (interval_secs != 0).then_some(start),
        }
    }

    /// Whether another announcement is scheduled
    pub fn is_enabled(&self) -> bool {
        self.next_fire_at.is_some()
    }

    /// Next fire time, `None` once disabled
    pub fn next_fire_at(&self) -> Option<Instant> {
        self.next_fire_at
    }

    /// Returns true if an announcement is due at `now`
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next_fire_at {
            Some(next) if now >= next => {
                self.next_fire_at = next.checked_add(self.interval);
                true
            }
            _ => false,
        }
    }
}

/// Main relay service
pub struct RelayEngine<C: PubSubChannel + 'static> {
    session: Arc<GatewaySession>,
    channel: Arc<C>,
    topic: String,
    repeat_all: bool,
    poll_interval: Duration,
    timer: AnnouncementTimer,
    state: RelayState,
    delivery_task: JoinHandle<()>,
}

impl<C: PubSubChannel + 'static> RelayEngine<C> {
    /// Discover and attach a Communicator, connect the channel, and subscribe
    ///
    /// Runs `Init → Discovering → Attached → Running`. The channel is only
    /// connected once a device is attached. Any failure moves to `Failed` and
    /// is returned; these are the startup failures that stop the process.
    pub async fn establish<P, F, Fut>(
        handshake: &DeviceHandshake<P>,
        config: &GatewayConfig,
        codec: MessageCodec,
        connect: F,
    ) -> Result<Self>
    where
        P: PortProvider,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<C>>>,
    {
        let mut state = RelayState::Init;
        transition(&mut state, RelayState::Discovering);

        let result = match handshake.discover(config.serial.port.as_deref()).await {
            Ok(device) => {
                transition(&mut state, RelayState::Attached);
                match connect().await {
                    Ok(channel) => Self::start(device, config, codec, channel).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => transition(&mut state, RelayState::Running),
            Err(e) => {
                transition(&mut state, RelayState::Failed);
                error!(code = e.error_code(), error = %e, "Gateway startup failed");
            }
        }
        result
    }

    /// Prepare an already attached device and subscribe to the topic
    ///
    /// Writes the setup command (if configured), subscribes the delivery
    /// task to the shared topic, and arms the announcement timer so the first
    /// announcement goes out on the first pass.
    pub async fn start(
        device: AttachedDevice,
        config: &GatewayConfig,
        codec: MessageCodec,
        channel: Arc<C>,
    ) -> Result<Self> {
        let session = Arc::new(GatewaySession::new(device, codec));
        let topic = config.qualified_topic();

        if let Some(setup) = &config.relay.setup_command {
            session.write_line(setup, SETUP_ECHO_LINES).await?;
            debug!(command = %setup, "Device configured");
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let on_message: MessageCallback = Arc::new(move |payload: String| {
            if inbound_tx.send(payload).is_err() {
                trace!("Delivery task stopped, dropping payload");
            }
        });
        channel.subscribe(&topic, on_message).await?;
        let delivery_task = tokio::spawn(deliver_inbound(session.clone(), inbound_rx));

        info!(
            device = %session.device_name(),
            topic = %topic,
            channel = %channel.name(),
            "WaveShark Internet Gateway running"
        );

        Ok(Self {
            session,
            channel,
            topic,
            repeat_all: config.relay.repeat_all,
            poll_interval: config.relay.poll_interval,
            timer: AnnouncementTimer::new(config.relay.announce_interval_secs, Instant::now()),
            state: RelayState::Running,
            delivery_task,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Get the shared session
    pub fn session(&self) -> &Arc<GatewaySession> {
        &self.session
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> RelayStats {
        self.session.stats()
    }

    /// Next announcement time, if announcements are enabled
    pub fn next_announcement(&self) -> Option<Instant> {
        self.timer.next_fire_at()
    }

    /// Run the main loop until the task is dropped
    pub async fn run(&mut self) {
        loop {
            self.poll_once().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One main loop pass at the current time
    pub async fn poll_once(&mut self) {
        self.poll_once_at(Instant::now()).await;
    }

    /// One main loop pass: read and dispatch a line, then announce if due
    ///
    /// Faults are logged with the line being handled and absorbed.
    pub async fn poll_once_at(&mut self, now: Instant) {
        let line = self.session.read_line().await;
        if !line.is_empty() {
            if let Err(e) = self.dispatch_line(&line).await {
                warn!(line = %line, code = e.error_code(), error = %e, "Failed to handle radio line");
                self.session.record(|s| s.iteration_errors += 1);
            }
        }

        if self.timer.poll(now) {
            if let Err(e) = self.announce().await {
                warn!(code = e.error_code(), error = %e, "Failed to send announcement");
                self.session.record(|s| s.iteration_errors += 1);
            }
        }
    }

    async fn dispatch_line(&self, line: &str) -> Result<()> {
        let Some(frame) = RadioFrame::parse(line) else {
            trace!(line = %line, "Device line");
            return Ok(());
        };

        info!("Via WaveShark: {}", line);
        self.session.record(|s| s.radio_frames += 1);

        let device_name = self.session.device_name();
        match command::classify(line, &frame, device_name, self.repeat_all) {
            Command::Send { post } if post.is_empty() => {
                info!(sender = %frame.sender_name, "SEND command without a message");
                self.session
                    .write_line(&command::prompt_text(&frame.sender_name), REPLY_ECHO_LINES)
                    .await?;
                self.session.record(|s| s.prompts_sent += 1);
            }
            Command::Send { post } => {
                info!(sender = %frame.sender_name, "Received message to send [{}]", post);
                self.publish(&frame.sender_name, &post).await?;
                self.session.record(|s| s.messages_published += 1);
                self.session
                    .write_line(&command::ack_text(&frame.sender_name), REPLY_ECHO_LINES)
                    .await?;
            }
            Command::Repeat { body } => {
                if !body.trim().is_empty() {
                    self.publish(&frame.sender_name, &body).await?;
                    self.session.record(|s| s.frames_repeated += 1);
                }
            }
            Command::Unrecognized => {
                info!(sender = %frame.sender_name, "Unrecognized command");
                self.session
                    .write_line(
                        &command::usage_text(&frame.sender_name, device_name),
                        REPLY_ECHO_LINES,
                    )
                    .await?;
                self.session.record(|s| s.usage_replies += 1);
            }
            Command::NotAddressed => {}
        }
        Ok(())
    }

    async fn publish(&self, sender: &str, body: &str) -> Result<()> {
        let envelope = OutboundEnvelope::new(self.session.device_name(), sender, body);
        let token = self.session.codec().encrypt(&envelope.to_string());
        self.channel.publish(&self.topic, &token).await?;
        debug!(topic = %self.topic, envelope = %envelope, "Published");
        Ok(())
    }

    async fn announce(&self) -> Result<()> {
        info!("Sending announcement");
        let text = command::announcement_text(self.session.device_name());
        self.session
            .write_line(&text, ANNOUNCEMENT_ECHO_LINES)
            .await?;
        self.session.record(|s| s.announcements += 1);
        Ok(())
    }
}

impl<C: PubSubChannel + 'static> Drop for RelayEngine<C> {
    fn drop(&mut self) {
        self.delivery_task.abort();
    }
}

impl<C: PubSubChannel + 'static> fmt::Debug for RelayEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayEngine")
            .field("session", &self.session)
            .field("topic", &self.topic)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn transition(state: &mut RelayState, next: RelayState) {
    debug!(from = %state, to = %next, "Relay state");
    *state = next;
}

async fn deliver_inbound(
    session: Arc<GatewaySession>,
    mut inbound_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(token) = inbound_rx.recv().await {
        match session.deliver_network_message(&token).await {
            Ok(outcome) => trace!(?outcome, "Network message handled"),
            Err(e) => {
                warn!(code = e.error_code(), error = %e, "Failed to deliver network message");
                session.record(|s| s.iteration_errors += 1);
            }
        }
    }
}

/// Decrypt and log every envelope on `topic`, without a device
///
/// Returns once subscribed; envelopes are logged from the channel's delivery
/// context until the process exits.
pub async fn listen_only<C: PubSubChannel + ?Sized>(
    channel: &C,
    codec: MessageCodec,
    topic: &str,
) -> Result<()> {
    let on_message: MessageCallback = Arc::new(move |token: String| match codec.decrypt(&token) {
        Ok(plaintext) if frame::has_via_marker(&plaintext) => {
            info!("Received via Internet: {}", plaintext);
        }
        Ok(plaintext) => debug!(text = %plaintext, "Ignoring message without envelope marker"),
        Err(e) => {
            let e = GatewayError::from(e);
            warn!(code = e.error_code(), error = %e, "Discarding undecryptable message");
        }
    });

    channel.subscribe(topic, on_message).await?;
    info!(topic = %topic, channel = %channel.name(), "Listening");
    Ok(())
}
