// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// JSON Wire Codec
//
// Envelopes travel as one JSON object each. Decoding is strict only about the
// four fields that give a message its identity (id, type, source, timestamp);
// every other field falls back to its default with a warning when it has the
// wrong shape, and keys the envelope does not model are carried in
// `extensions` so they survive a decode/encode hop through this node.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::domain::agent::AgentId;
use crate::domain::message::{Message, MessageError, MessageId, MessageType, RESERVED_FIELDS};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode(message: &Message) -> Result<Bytes, MessageError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| MessageError::Encoding(e.to_string()))
    }

    pub fn encode_value(message: &Message) -> Result<Value, MessageError> {
        serde_json::to_value(message).map_err(|e| MessageError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, MessageError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| MessageError::Malformed(format!("invalid JSON: {e}")))?;
        Self::decode_value(value)
    }

    pub fn decode_value(value: Value) -> Result<Message, MessageError> {
        let Value::Object(mut object) = value else {
            return Err(MessageError::Malformed("message is not a JSON object".to_string()));
        };

        let id = required_str(&object, "id")?;
        let id = MessageId::parse_str(id).map_err(|e| MessageError::Malformed(format!("id: {e}")))?;
        let message_type = MessageType::parse(required_str(&object, "type")?);
        let source = AgentId::new(required_str(&object, "source")?);
        let timestamp = DateTime::parse_from_rfc3339(required_str(&object, "timestamp")?)
            .map_err(|e| MessageError::Malformed(format!("timestamp: {e}")))?
            .with_timezone(&Utc);

        let target = optional(&object, "target", |v| v.as_str().map(AgentId::new));
        let payload = optional(&object, "payload", |v| v.as_object().cloned()).unwrap_or_default();
        let priority = optional(&object, "priority", |v| v.as_i64().and_then(|p| i32::try_from(p).ok()))
            .unwrap_or(0);
        let correlation_id = optional(&object, "correlationId", |v| v.as_str().map(str::to_string));
        let routing_key = optional(&object, "routingKey", |v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| message_type.as_str().to_string());
        let ttl = optional(&object, "ttl", Value::as_u64);
        let transaction_id = optional(&object, "transactionId", |v| v.as_str().map(str::to_string));

        for key in RESERVED_FIELDS {
            object.remove(key);
        }
        let extensions: Map<String, Value> = object;

        Ok(Message {
            id,
            message_type,
            source,
            target,
            payload,
            timestamp,
            priority,
            correlation_id,
            routing_key,
            ttl,
            transaction_id,
            extensions,
        })
    }
}

fn required_str<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a str, MessageError> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(MessageError::Malformed(format!(
            "field '{field}' must be a string, got {}",
            json_kind(other)
        ))),
        None => Err(MessageError::Malformed(format!("missing field '{field}'"))),
    }
}

/// Reads an optional field; null and absent are `None`, a mis-shaped value is
/// dropped with a warning.
fn optional<T>(object: &Map<String, Value>, field: &str, read: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
    match object.get(field) {
        None | Some(Value::Null) => None,
        Some(value) => {
            let parsed = read(value);
            if parsed.is_none() {
                warn!(field, kind = json_kind(value), "Ignoring mis-shaped message field");
            }
            parsed
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Message {
        Message::new(MessageType::HelpWanted, "requester")
            .with_field("requiredCapabilities", json!(["sql"]))
            .with_priority(7)
            .correlated_with("req-1")
            .with_ttl(60)
            .with_transaction("tx-9")
            .with_extension("x-trace", "abc")
    }

    #[test]
    fn test_decode_inverts_encode() {
        let message = sample();
        let bytes = JsonCodec::encode(&message).unwrap();
        assert_eq!(JsonCodec::decode(&bytes).unwrap(), message);

        let targeted = Message::new(MessageType::Simple, "a").to("b");
        let bytes = JsonCodec::encode(&targeted).unwrap();
        assert_eq!(JsonCodec::decode(&bytes).unwrap(), targeted);
    }

    #[test]
    fn test_wire_shape() {
        let value = JsonCodec::encode_value(&sample()).unwrap();
        assert_eq!(value["type"], "help-wanted");
        assert_eq!(value["source"], "requester");
        assert_eq!(value["target"], Value::Null);
        assert_eq!(value["correlationId"], "req-1");
        assert_eq!(value["routingKey"], "help-wanted");
        assert_eq!(value["x-trace"], "abc");
        assert!(value.get("extensions").is_none());
    }

    #[test]
    fn test_unknown_fields_survive_reencoding() {
        let raw = json!({
            "id": MessageId::new().to_string(),
            "type": "future-kind",
            "source": "peer",
            "target": null,
            "payload": {},
            "timestamp": "2026-03-01T12:00:00Z",
            "priority": 0,
            "routingKey": "future-kind",
            "hopCount": 3
        });
        let decoded = JsonCodec::decode_value(raw.clone()).unwrap();
        assert_eq!(decoded.message_type(), &MessageType::Unknown("future-kind".into()));
        assert_eq!(decoded.extensions().get("hopCount"), Some(&json!(3)));

        let reencoded = JsonCodec::encode_value(&decoded).unwrap();
        assert_eq!(reencoded["hopCount"], 3);
        assert_eq!(reencoded["type"], "future-kind");
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        assert!(matches!(JsonCodec::decode(b"not json"), Err(MessageError::Malformed(_))));
        assert!(matches!(JsonCodec::decode(b"[1,2]"), Err(MessageError::Malformed(_))));

        let missing_source = json!({
            "id": MessageId::new().to_string(),
            "type": "simple",
            "timestamp": "2026-03-01T12:00:00Z"
        });
        assert!(JsonCodec::decode_value(missing_source).is_err());

        let bad_id = json!({
            "id": "not-a-uuid",
            "type": "simple",
            "source": "a",
            "timestamp": "2026-03-01T12:00:00Z"
        });
        assert!(JsonCodec::decode_value(bad_id).is_err());

        let bad_timestamp = json!({
            "id": MessageId::new().to_string(),
            "type": "simple",
            "source": "a",
            "timestamp": 12345
        });
        assert!(JsonCodec::decode_value(bad_timestamp).is_err());
    }

    #[test]
    fn test_misshaped_optional_fields_fall_back() {
        let raw = json!({
            "id": MessageId::new().to_string(),
            "type": "simple",
            "source": "a",
            "target": 42,
            "payload": "oops",
            "timestamp": "2026-03-01T12:00:00+02:00",
            "priority": "high",
            "ttl": -5
        });
        let decoded = JsonCodec::decode_value(raw).unwrap();
        assert!(decoded.is_broadcast());
        assert!(decoded.payload().is_empty());
        assert_eq!(decoded.priority(), 0);
        assert_eq!(decoded.ttl(), None);
        assert_eq!(decoded.routing_key(), "simple");
        assert_eq!(decoded.timestamp().to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }
}
