// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Pub/Sub Substrate Boundary
//
// The bus only ever needs four things from its substrate: connect, publish
// bytes to a named channel, subscribe to a named channel, and a liveness
// check. Backends (in-memory, a broker client) implement `PubSubBackend`;
// everything above the connection manager sees `TransportError::Unavailable`
// and nothing else.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use crate::domain::agent::{AgentId, DomainId};

pub type ByteStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Establish (or re-establish) the underlying connection.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Publish one payload to a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Subscribe to a channel. The stream ends when the backend drops the subscription.
    async fn subscribe(&self, channel: &str) -> Result<ByteStream, TransportError>;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Channel naming scheme under a shared prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    prefix: String,
}

impl Channels {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn agent(&self, agent_id: &AgentId) -> String {
        format!("{}.agent.{}", self.prefix, agent_id)
    }

    pub fn broadcast(&self) -> String {
        format!("{}.broadcast", self.prefix)
    }

    pub fn domain_inbound(&self, domain: &DomainId) -> String {
        format!("{}.domain.{}.inbound", self.prefix, domain)
    }

    pub fn domain_acks(&self, domain: &DomainId) -> String {
        format!("{}.domain.{}.acks", self.prefix, domain)
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new("meshbus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        let channels = Channels::new("mesh");
        assert_eq!(channels.agent(&AgentId::new("sql-expert")), "mesh.agent.sql-expert");
        assert_eq!(channels.broadcast(), "mesh.broadcast");
        assert_eq!(channels.domain_inbound(&DomainId::new("eu")), "mesh.domain.eu.inbound");
        assert_eq!(channels.domain_acks(&DomainId::new("eu")), "mesh.domain.eu.acks");
    }
}
