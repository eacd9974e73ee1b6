//! Publish/subscribe channel to the wide-area network
//!
//! The relay only needs three things from the network side: connect (done by
//! each back-end's constructor), subscribe with a callback, and publish.
//! Delivery is at-most-once and the callback may run on the back-end's own
//! task at any time after `subscribe` returns. Reconnecting and
//! re-subscribing after a broker outage is the back-end's job.
//!
//! - [`mqtt::MqttChannel`] - MQTT broker (requires `mqtt` feature)
//! - [`crate::test_utils::RecordingChannel`] - in-memory channel for tests

#[cfg(feature = "mqtt")]
mod mqtt;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttChannel;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked with every payload received on a subscribed topic
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Trait for publish/subscribe back-ends
#[async_trait]
pub trait PubSubChannel: Send + Sync {
    /// Deliver every future payload on `topic` to `on_message`
    async fn subscribe(&self, topic: &str, on_message: MessageCallback) -> Result<()>;

    /// Publish `payload` on `topic`
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Get the channel name (for logging)
    fn name(&self) -> &str;
}

