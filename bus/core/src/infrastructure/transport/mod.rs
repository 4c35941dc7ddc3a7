// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Connection Manager
//!
//! Owns the single logical connection to the pub/sub substrate.
//!
//! - `connect()` retries with exponential backoff up to the policy's attempt limit.
//! - `is_healthy()` is a ping bounded by an explicit deadline.
//! - `publish()` / `subscribe()` fail fast with [`TransportError::Unavailable`]
//!   while disconnected. A failed publish marks the manager disconnected; it
//!   never reconnects on its own. The maintenance sweeper calls
//!   [`ConnectionManager::ensure_connected`] on each pass.

pub mod memory;
pub mod tcp;

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::backoff::BackoffPolicy;
use crate::domain::mesh_config::{TransportBackend, TransportConfig};
use crate::domain::transport::{ByteStream, PubSubBackend, TransportError};

pub use memory::InMemoryPubSub;
pub use tcp::{TcpBroker, TcpPubSub};

/// Substrate for the configured backend.
pub fn build_backend(config: &TransportConfig) -> Result<Arc<dyn PubSubBackend>, TransportError> {
    match config.backend {
        TransportBackend::Memory => Ok(Arc::new(InMemoryPubSub::with_capacity(config.channel_capacity))),
        TransportBackend::Tcp => {
            let broker = config
                .broker
                .as_deref()
                .ok_or_else(|| TransportError::Unavailable("tcp backend needs a broker address".to_string()))?;
            Ok(Arc::new(TcpPubSub::new(broker, config.channel_capacity)))
        }
    }
}

pub struct ConnectionManager {
    backend: Arc<dyn PubSubBackend>,
    reconnect: BackoffPolicy,
    ping_timeout: Duration,
    connected: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn PubSubBackend>, reconnect: BackoffPolicy, ping_timeout: Duration) -> Self {
        Self {
            backend,
            reconnect,
            ping_timeout,
            connected: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Connects, retrying with backoff. Concurrent callers share one attempt loop.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let mut attempt: u32 = 1;
        loop {
            match self.backend.connect().await {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    info!(backend = self.backend.name(), attempt, "Connected to pub/sub substrate");
                    return Ok(());
                }
                Err(err) => {
                    if !self.reconnect.allows(attempt + 1) {
                        warn!(backend = self.backend.name(), attempt, "Giving up connecting: {}", err);
                        return Err(err);
                    }
                    let delay = self.reconnect.jittered_delay(attempt);
                    warn!(
                        backend = self.backend.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Connect failed, retrying: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Pings the substrate within the ping deadline.
    pub async fn is_healthy(&self) -> bool {
        match tokio::time::timeout(self.ping_timeout, self.backend.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!("Health check failed: {}", err);
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.ping_timeout.as_millis() as u64, "Health check timed out");
                false
            }
        }
    }

    /// Pings the substrate and reconnects when it is unhealthy or marked down.
    pub async fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() && self.is_healthy().await {
            return Ok(());
        }
        self.mark_disconnected();
        self.connect().await
    }

    pub async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_marked_connected()?;
        self.backend.publish(channel, payload).await.inspect_err(|err| {
            warn!(channel, "Publish failed, marking transport disconnected: {}", err);
            self.mark_disconnected();
        })
    }

    pub async fn subscribe(&self, channel: &str) -> Result<ByteStream, TransportError> {
        self.ensure_marked_connected()?;
        self.backend.subscribe(channel).await.inspect_err(|err| {
            warn!(channel, "Subscribe failed, marking transport disconnected: {}", err);
            self.mark_disconnected();
        })
    }

    fn ensure_marked_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Unavailable("not connected".to_string()))
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::AtomicU32;

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            factor: 2.0,
            cap: Duration::from_millis(5),
            max_attempts: Some(max_attempts),
            jitter: 0.0,
        }
    }

    /// Fails the first `failures` connect attempts.
    struct FlakyBackend {
        inner: InMemoryPubSub,
        failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl PubSubBackend for FlakyBackend {
        async fn connect(&self) -> Result<(), TransportError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                Err(TransportError::Unavailable(format!("refused #{attempt}")))
            } else {
                self.inner.connect().await
            }
        }

        async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<ByteStream, TransportError> {
            self.inner.subscribe(channel).await
        }

        async fn ping(&self) -> Result<(), TransportError> {
            self.inner.ping().await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_connect_retries_with_backoff() {
        let backend = Arc::new(FlakyBackend {
            inner: InMemoryPubSub::new(),
            failures: 2,
            attempts: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(backend.clone(), fast_policy(5), Duration::from_millis(100));
        manager.connect().await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_gives_up_at_attempt_limit() {
        let backend = Arc::new(FlakyBackend {
            inner: InMemoryPubSub::new(),
            failures: 10,
            attempts: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(backend.clone(), fast_policy(3), Duration::from_millis(100));
        assert!(manager.connect().await.is_err());
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 3);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_publish_fails_fast_and_sweeper_style_reconnect() {
        let pubsub = InMemoryPubSub::new();
        let manager = ConnectionManager::new(Arc::new(pubsub.clone()), fast_policy(2), Duration::from_millis(100));
        manager.connect().await.unwrap();
        let mut stream = manager.subscribe("c").await.unwrap();

        pubsub.set_available(false);
        assert!(manager.publish("c", Bytes::from_static(b"lost")).await.is_err());
        assert!(!manager.is_connected());

        pubsub.set_available(true);
        // Still disconnected until someone reconnects.
        assert!(manager.publish("c", Bytes::from_static(b"early")).await.is_err());

        manager.ensure_connected().await.unwrap();
        manager.publish("c", Bytes::from_static(b"back")).await.unwrap();
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"back"));
    }

    #[test]
    fn test_backend_follows_config() {
        let mut config = TransportConfig::default();
        assert_eq!(build_backend(&config).unwrap().name(), "memory");

        config.backend = TransportBackend::Tcp;
        assert!(build_backend(&config).is_err());

        config.broker = Some("127.0.0.1:7450".to_string());
        assert_eq!(build_backend(&config).unwrap().name(), "tcp");
    }

    #[tokio::test]
    async fn test_health_check() {
        let pubsub = InMemoryPubSub::new();
        let manager = ConnectionManager::new(Arc::new(pubsub.clone()), fast_policy(1), Duration::from_millis(50));
        assert!(manager.is_healthy().await);
        pubsub.set_available(false);
        assert!(!manager.is_healthy().await);
    }
}
