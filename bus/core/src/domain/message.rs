// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Envelope
//!
//! A single tagged envelope carries every kind of bus traffic. The `type` tag
//! is an open enum: tags this build does not know decode to
//! [`MessageType::Unknown`] so newer peers can introduce message types without
//! breaking older ones.
//!
//! Envelopes are immutable once built. `id` and `timestamp` are assigned by
//! [`Message::new`] and no method rewrites them; intermediaries that need a
//! different target derive a new message with [`Message::redirected`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::domain::agent::AgentId;

/// Wire keys owned by the envelope itself. Extensions never shadow them.
pub const RESERVED_FIELDS: [&str; 11] = [
    "id",
    "type",
    "source",
    "target",
    "payload",
    "timestamp",
    "priority",
    "correlationId",
    "routingKey",
    "ttl",
    "transactionId",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse_str(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Message type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Discovery,
    Simple,
    HelpWanted,
    HelpResponse,
    HelpSelected,
    HelpCompleted,
    TechnicalExchange,
    SystemHealth,
    DeliveryAck,
    /// Tag not understood by this build; the raw tag is kept for re-encoding.
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Discovery => "discovery",
            Self::Simple => "simple",
            Self::HelpWanted => "help-wanted",
            Self::HelpResponse => "help-response",
            Self::HelpSelected => "help-selected",
            Self::HelpCompleted => "help-completed",
            Self::TechnicalExchange => "technical-exchange",
            Self::SystemHealth => "system-health",
            Self::DeliveryAck => "delivery-ack",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "discovery" => Self::Discovery,
            "simple" => Self::Simple,
            "help-wanted" => Self::HelpWanted,
            "help-response" => Self::HelpResponse,
            "help-selected" => Self::HelpSelected,
            "help-completed" => Self::HelpCompleted,
            "technical-exchange" => Self::TechnicalExchange,
            "system-health" => Self::SystemHealth,
            "delivery-ack" => Self::DeliveryAck,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::parse(&tag))
    }
}

/// Immutable message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub(crate) id: MessageId,
    #[serde(rename = "type")]
    pub(crate) message_type: MessageType,
    pub(crate) source: AgentId,
    pub(crate) target: Option<AgentId>,
    pub(crate) payload: Map<String, Value>,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) correlation_id: Option<String>,
    pub(crate) routing_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) ttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) transaction_id: Option<String>,
    /// Wire fields not modelled above, preserved for forward compatibility.
    #[serde(flatten)]
    pub(crate) extensions: Map<String, Value>,
}

impl Message {
    /// Creates a broadcast message stamped with a fresh id and the current time.
    pub fn new(message_type: MessageType, source: impl Into<AgentId>) -> Self {
        let routing_key = message_type.as_str().to_string();
        Self {
            id: MessageId::new(),
            message_type,
            source: source.into(),
            target: None,
            payload: Map::new(),
            timestamp: Utc::now(),
            priority: 0,
            correlation_id: None,
            routing_key,
            ttl: None,
            transaction_id: None,
            extensions: Map::new(),
        }
    }

    /// Builds a reply addressed to the sender of `request`, carrying its correlation.
    pub fn reply_to(request: &Message, message_type: MessageType, source: impl Into<AgentId>) -> Self {
        let correlation = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| request.id.to_string());
        Self::new(message_type, source)
            .to(request.source.clone())
            .correlated_with(correlation)
    }

    pub fn to(mut self, target: impl Into<AgentId>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlated_with(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl = Some(ttl_seconds);
        self
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    /// Adds an extension field. Keys owned by the envelope are ignored.
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !RESERVED_FIELDS.contains(&key.as_str()) {
            self.extensions.insert(key, value.into());
        }
        self
    }

    /// Derives a copy addressed to `new_target`.
    ///
    /// The copy is a distinct message: it gets a new id and timestamp and
    /// records the original id under the `redirectedFrom` extension.
    pub fn redirected(&self, new_target: impl Into<AgentId>) -> Self {
        let mut copy = self.clone();
        copy.id = MessageId::new();
        copy.timestamp = Utc::now();
        copy.target = Some(new_target.into());
        copy.extensions
            .insert("redirectedFrom".to_string(), Value::String(self.id.to_string()));
        copy
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn source(&self) -> &AgentId {
        &self.source
    }

    pub fn target(&self) -> Option<&AgentId> {
        self.target.as_ref()
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn extensions(&self) -> &Map<String, Value> {
        &self.extensions
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        let deadline = i64::try_from(ttl)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl));
        match deadline {
            Some(deadline) => now > deadline,
            None => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message encoding failed: {0}")]
    Encoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_keeps_raw_tag() {
        let ty = MessageType::parse("quantum-entanglement");
        assert!(ty.is_unknown());
        assert_eq!(ty.as_str(), "quantum-entanglement");
        assert_eq!(MessageType::parse("help-wanted"), MessageType::HelpWanted);
    }

    #[test]
    fn test_reply_carries_correlation() {
        let request = Message::new(MessageType::HelpWanted, "requester").correlated_with("req-1");
        let reply = Message::reply_to(&request, MessageType::HelpResponse, "helper");
        assert_eq!(reply.target(), Some(&AgentId::new("requester")));
        assert_eq!(reply.correlation_id(), Some("req-1"));

        let bare = Message::new(MessageType::Simple, "a");
        let reply = Message::reply_to(&bare, MessageType::Simple, "b");
        assert_eq!(reply.correlation_id(), Some(bare.id().to_string().as_str()));
    }

    #[test]
    fn test_redirect_is_a_new_message() {
        let original = Message::new(MessageType::Simple, "a").to("b").with_field("k", 1);
        let redirected = original.redirected("c");
        assert_ne!(redirected.id(), original.id());
        assert_eq!(redirected.target(), Some(&AgentId::new("c")));
        assert_eq!(redirected.payload(), original.payload());
        assert_eq!(
            redirected.extensions().get("redirectedFrom"),
            Some(&Value::String(original.id().to_string()))
        );
        assert_eq!(original.target(), Some(&AgentId::new("b")));
    }

    #[test]
    fn test_reserved_extension_keys_are_ignored() {
        let message = Message::new(MessageType::Simple, "a")
            .with_extension("id", "spoofed")
            .with_extension("x-trace", "abc");
        assert!(message.extensions().get("id").is_none());
        assert_eq!(message.extensions().get("x-trace"), Some(&Value::from("abc")));
    }

    #[test]
    fn test_ttl_expiry() {
        let message = Message::new(MessageType::Simple, "a").with_ttl(30);
        assert!(!message.is_expired_at(message.timestamp() + chrono::Duration::seconds(29)));
        assert!(message.is_expired_at(message.timestamp() + chrono::Duration::seconds(31)));
        assert!(!Message::new(MessageType::Simple, "a").is_expired_at(Utc::now()));

        let forever = Message::new(MessageType::Simple, "a").with_ttl(u64::MAX);
        assert!(!forever.is_expired_at(Utc::now()));
    }
}
