// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-process pub/sub substrate: one tokio broadcast channel per channel name.
// Publishing to a channel nobody listens on succeeds and drops the payload,
// like a broker would.
//
// Each subscriber buffers at most `capacity` payloads. One that falls further
// behind loses the oldest ones; the loss is logged, counted in
// `meshbus_transport_dropped_total` and in `dropped()`.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::domain::transport::{ByteStream, PubSubBackend, TransportError};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct InMemoryPubSub {
    channels: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    available: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
            dropped: Arc::new(AtomicU64::new(0)),
            capacity: capacity.max(1),
        }
    }

    /// Simulates a broker outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Payloads lost by lagging subscribers since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn ensure_available(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unavailable("in-memory broker is down".to_string()))
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubBackend for InMemoryPubSub {
    async fn connect(&self) -> Result<(), TransportError> {
        self.ensure_available()
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_available()?;
        let receivers = self.sender(channel).send(payload).unwrap_or(0);
        debug!(channel, receivers, "Published to in-memory channel");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<ByteStream, TransportError> {
        self.ensure_available()?;
        let receiver = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let dropped = self.dropped.clone();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let item = match item {
                Ok(bytes) => Some(bytes),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(channel = %channel, skipped, "In-memory subscriber fell behind, messages dropped");
                    dropped.fetch_add(skipped, Ordering::Relaxed);
                    metrics::counter!("meshbus_transport_dropped_total", "channel" => channel.clone()).increment(skipped);
                    None
                }
            };
            futures::future::ready(item)
        });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.ensure_available()
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let pubsub = InMemoryPubSub::new();
        let mut a = pubsub.subscribe("mesh.broadcast").await.unwrap();
        let mut b = pubsub.subscribe("mesh.broadcast").await.unwrap();

        pubsub.publish("mesh.broadcast", Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(b.next().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(pubsub.subscriber_count("mesh.broadcast"), 2);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let pubsub = InMemoryPubSub::new();
        let mut other = pubsub.subscribe("mesh.agent.b").await.unwrap();
        pubsub.publish("mesh.agent.a", Bytes::from_static(b"x")).await.unwrap();
        pubsub.publish("mesh.agent.b", Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(other.next().await.unwrap(), Bytes::from_static(b"y"));
    }

    #[tokio::test]
    async fn test_outage_switch() {
        let pubsub = InMemoryPubSub::new();
        pubsub.set_available(false);
        assert!(pubsub.ping().await.is_err());
        assert!(pubsub.publish("c", Bytes::new()).await.is_err());
        assert!(pubsub.subscribe("c").await.is_err());

        pubsub.set_available(true);
        assert!(pubsub.ping().await.is_ok());
        assert!(pubsub.publish("c", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_loss_is_counted() {
        let pubsub = InMemoryPubSub::with_capacity(2);
        let mut slow = pubsub.subscribe("mesh.agent.slow").await.unwrap();
        for n in 0..5u8 {
            pubsub.publish("mesh.agent.slow", Bytes::from(vec![n])).await.unwrap();
        }

        assert_eq!(slow.next().await.unwrap(), Bytes::from(vec![3u8]));
        assert_eq!(slow.next().await.unwrap(), Bytes::from(vec![4u8]));
        assert_eq!(pubsub.dropped(), 3);
    }
}
