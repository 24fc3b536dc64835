//! Channel Bus contract and MQTT realization
//!
//! The bus provides named channels carrying opaque byte payloads:
//! publishers fire-and-forget, subscribers receive payloads published after
//! they attached, in publish order, at most once, with no persistence.
//!
//! Every `subscribe()` opens its own broker connection so handles are
//! independent: a stage or client session can drop its subscription without
//! affecting anyone else's.

use crate::infra::config::Config;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Returned by subscription reads once the subscription has terminated.
///
/// A timeout is not an error; this only surfaces when the handle's transport
/// is gone for good and no further payloads can ever arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionClosed;

impl std::fmt::Display for SubscriptionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bus subscription closed")
    }
}

impl std::error::Error for SubscriptionClosed {}

/// One attached subscriber on a single channel
#[async_trait]
pub trait BusSubscription: Send {
    /// Wait up to `timeout` for the next payload.
    ///
    /// `Ok(None)` means nothing arrived within the timeout — never an error.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Bytes>, SubscriptionClosed>;

    /// Non-blocking read of an already-buffered payload.
    fn try_next(&mut self) -> Result<Option<Bytes>, SubscriptionClosed>;
}

/// Publish/subscribe broker handle shared across stages and sessions
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish; never blocks the caller. Delivery is not
    /// guaranteed when no subscriber is attached.
    fn publish(&self, channel: &str, payload: Bytes);

    /// Open a fresh, independent subscription receiving payloads published
    /// after this call.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<Box<dyn BusSubscription>>;
}

/// MQTT-backed bus using the embedded rumqttd broker
pub struct MqttBus {
    host: String,
    port: u16,
    publisher: AsyncClient,
}

impl MqttBus {
    /// Connect the shared publisher client to the broker.
    ///
    /// The publisher eventloop runs on its own task and reconnects with
    /// backoff; publishes issued while disconnected are dropped, which is
    /// within the bus contract.
    pub fn connect(config: &Config) -> Self {
        let client_id = format!("crowdgate-pub-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.bus_host(), config.bus_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("bus_publisher_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "bus_publisher_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { host: config.bus_host().to_string(), port: config.bus_port(), publisher: client }
    }
}

#[async_trait]
impl Bus for MqttBus {
    fn publish(&self, channel: &str, payload: Bytes) {
        // QoS 0: at-most-once, no broker-side queueing for absent subscribers
        if let Err(e) = self.publisher.try_publish(channel, QoS::AtMostOnce, false, payload) {
            debug!(error = %e, channel = %channel, "bus_publish_dropped");
        }
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<Box<dyn BusSubscription>> {
        let client_id = format!("crowdgate-sub-{}", Uuid::now_v7().simple());
        let mut mqttoptions = MqttOptions::new(client_id, &self.host, self.port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
        client.subscribe(channel, QoS::AtMostOnce).await?;

        let (tx, rx) = mpsc::channel(256);
        let channel_name = channel.to_string();
        let pump = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        // Receiver dropped means the handle was closed
                        if tx.send(publish.payload).await.is_err() {
                            return;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!(channel = %channel_name, "bus_subscription_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, channel = %channel_name, "bus_subscription_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Box::new(MqttSubscription { client, rx, pump }))
    }
}

/// Subscription handle backed by a dedicated MQTT connection
struct MqttSubscription {
    client: AsyncClient,
    rx: mpsc::Receiver<Bytes>,
    pump: JoinHandle<()>,
}

#[async_trait]
impl BusSubscription for MqttSubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Bytes>, SubscriptionClosed> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(SubscriptionClosed),
            Err(_elapsed) => Ok(None),
        }
    }

    fn try_next(&mut self) -> Result<Option<Bytes>, SubscriptionClosed> {
        match self.rx.try_recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SubscriptionClosed),
        }
    }
}

impl Drop for MqttSubscription {
    fn drop(&mut self) {
        let _ = self.client.try_disconnect();
        self.pump.abort();
    }
}
