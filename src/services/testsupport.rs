//! In-memory bus for unit tests
//!
//! Implements the Channel Bus contract on top of tokio broadcast channels so
//! stage and gateway tests run without a broker or the network. Semantics
//! match the real bus: subscribers only see payloads published after they
//! attached, per-channel publish order is preserved, and a closed channel
//! surfaces as `SubscriptionClosed`.

use crate::io::bus::{Bus, BusSubscription, SubscriptionClosed};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self { channels: Mutex::new(HashMap::new()) }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    /// Number of live subscriptions on a channel; tests use this to wait
    /// until a session has attached before publishing.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap();
        channels.get(channel).map(|tx| tx.receiver_count()).unwrap_or(0)
    }

    /// Drop the channel's sender so every subscription on it terminates
    pub fn close_channel(&self, channel: &str) {
        let mut channels = self.channels.lock().unwrap();
        channels.remove(channel);
    }
}

#[async_trait]
impl Bus for MemoryBus {
    fn publish(&self, channel: &str, payload: Bytes) {
        // No subscribers attached is fine; the payload is simply lost
        let _ = self.sender(channel).send(payload);
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<Box<dyn BusSubscription>> {
        Ok(Box::new(MemorySubscription { rx: self.sender(channel).subscribe() }))
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Bytes>, SubscriptionClosed> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Ok(payload)) => return Ok(Some(payload)),
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => return Err(SubscriptionClosed),
                Err(_elapsed) => return Ok(None),
            }
        }
    }

    fn try_next(&mut self) -> Result<Option<Bytes>, SubscriptionClosed> {
        loop {
            match self.rx.try_recv() {
                Ok(payload) => return Ok(Some(payload)),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => return Err(SubscriptionClosed),
            }
        }
    }
}
