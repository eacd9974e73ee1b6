//! MQTT back-end
//!
//! Connects to a broker with rumqttc, publishes and subscribes at QoS 0, and
//! drives the client event loop on a background task. The event loop
//! reconnects on its own after a broker drop; every remembered subscription
//! is re-sent when the broker acknowledges the new connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::BrokerConfig;
use crate::error::{GatewayError, Result};
use crate::pubsub::{MessageCallback, PubSubChannel};

/// Capacity of the client request queue
const REQUEST_CAPACITY: usize = 64;

/// Pause before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

type Subscriptions = Arc<RwLock<HashMap<String, Vec<MessageCallback>>>>;

/// Publish/subscribe channel over an MQTT broker
pub struct MqttChannel {
    client: AsyncClient,
    subscriptions: Subscriptions,
    name: String,
    event_task: JoinHandle<()>,
}

impl MqttChannel {
    /// Connect to the broker and wait for it to accept the session
    ///
    /// # Errors
    ///
    /// [`GatewayError::BrokerConnectFailed`] if the broker refuses, is
    /// unreachable, or does not answer within `connect_timeout`.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let client_id = format!("ws-internet-gateway-{:08x}", rand::random::<u32>());
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connect_failed = |reason: String| GatewayError::BrokerConnectFailed {
            host: config.host.clone(),
            port: config.port,
            reason,
        };

        match tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut event_loop)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(connect_failed(reason)),
            Err(_) => return Err(connect_failed("timed out".to_string())),
        }

        let name = format!("mqtt:{}:{}", config.host, config.port);
        info!(broker = %name, "Connected to message broker");

        let subscriptions: Subscriptions = Arc::new(RwLock::new(HashMap::new()));
        let event_task = tokio::spawn(drive_event_loop(
            event_loop,
            client.clone(),
            subscriptions.clone(),
        ));

        Ok(Self {
            client,
            subscriptions,
            name,
            event_task,
        })
    }
}

#[async_trait]
impl PubSubChannel for MqttChannel {
    async fn subscribe(&self, topic: &str, on_message: MessageCallback) -> Result<()> {
        self.subscriptions
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(on_message);

        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| GatewayError::SubscribeFailed(e.to_string()))?;

        info!(broker = %self.name, topic = %topic, "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await?;

        trace!(broker = %self.name, topic = %topic, bytes = payload.len(), "Published");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

impl std::fmt::Debug for MqttChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttChannel")
            .field("name", &self.name)
            .field("topics", &self.subscriptions.read().len())
            .finish()
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> std::result::Result<(), String> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                let callbacks = subscriptions
                    .read()
                    .get(&publish.topic)
                    .cloned()
                    .unwrap_or_default();

                trace!(topic = %publish.topic, handlers = callbacks.len(), "Payload received");
                for callback in callbacks {
                    callback(payload.clone());
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let topics: Vec<String> = subscriptions.read().keys().cloned().collect();
                info!(topics = topics.len(), "Reconnected to broker, resubscribing");
                for topic in topics {
                    // The request queue is drained by this task, so never await here
                    if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                        warn!(topic = %topic, error = %e, "Resubscribe failed");
                    }
                }
            }
            Ok(event) => {
                trace!(?event, "MQTT event");
            }
            Err(e) => {
                warn!(error = %e, "Broker connection lost");
                tokio::time::sleep(RECONNECT_DELAY).await;
                debug!("Reconnecting to broker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(port: u16, connect_timeout: Duration) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout,
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = MqttChannel::connect(&broker(port, Duration::from_secs(5))).await;

        match result {
            Err(e @ GatewayError::BrokerConnectFailed { .. }) => {
                assert!(e.is_startup_fatal());
                assert_eq!(e.error_code(), "BROKER_CONNECT_FAILED");
            }
            other => panic!("expected BrokerConnectFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_times_out_without_connack() {
        // Accepts the TCP connection but never answers CONNECT
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let result = MqttChannel::connect(&broker(port, Duration::from_millis(200))).await;
        silent.abort();

        match result {
            Err(GatewayError::BrokerConnectFailed { host, port: p, reason }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(p, port);
                assert_eq!(reason, "timed out");
            }
            other => panic!("expected BrokerConnectFailed, got {:?}", other),
        }
    }
}
