//! Deliveries and decoded events
//!
//! `InboundMessage` is what the broker hands us; `DecodedEvent` is what sinks see.

use crate::error::WorkerError;
use crate::payload::Payload;
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::fmt;

/// Handle used to acknowledge or reject one delivery.
///
/// AMQP delivery tags are per channel and restart at 1 on every new channel,
/// so the tag is paired with the generation of the session that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    generation: u64,
    tag: u64,
}

impl DeliveryTag {
    pub fn new(generation: u64, tag: u64) -> Self {
        Self { generation, tag }
    }

    /// Session generation that issued this tag
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Channel-level delivery tag
    pub fn value(&self) -> u64 {
        self.tag
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.generation, self.tag)
    }
}

/// One delivery as received from the broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Exchange the message was published to (the entity)
    pub exchange: String,

    /// Routing key, `entity.event`
    pub routing_key: String,

    /// Raw body bytes
    pub body: Vec<u8>,

    pub delivery_tag: DeliveryTag,

    /// Set by the broker when this message was delivered before
    pub redelivered: bool,
}

impl InboundMessage {
    /// Body as text for logging, with invalid UTF-8 replaced
    pub fn body_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// A delivery after decoding
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    /// Entity, taken from the exchange
    pub entity: String,

    /// Event type, the routing key's segment after the entity
    pub event_type: String,

    /// Full routing key, used for sink selection
    pub routing_key: String,

    /// When this worker received the delivery
    pub received_at: DateTime<Utc>,

    pub payload: Payload,
}

impl DecodedEvent {
    /// Decode a delivery. Fails with [`WorkerError::Decode`] when the body is not UTF-8 JSON.
    pub fn decode(message: &InboundMessage, received_at: DateTime<Utc>) -> Result<Self, WorkerError> {
        let payload = Payload::decode(&message.body)?;
        let event_type = message
            .routing_key
            .split_once('.')
            .map(|(_, event)| event)
            .unwrap_or(message.routing_key.as_str());

        Ok(Self {
            entity: message.exchange.clone(),
            event_type: event_type.to_string(),
            routing_key: message.routing_key.clone(),
            received_at,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(exchange: &str, routing_key: &str, body: &str) -> InboundMessage {
        InboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.as_bytes().to_vec(),
            delivery_tag: DeliveryTag::new(1, 7),
            redelivered: false,
        }
    }

    #[test]
    fn test_decode_splits_routing_key() {
        let now = Utc::now();
        let event = DecodedEvent::decode(&message("user", "user.created", r#"{"name":"x"}"#), now).unwrap();

        assert_eq!(event.entity, "user");
        assert_eq!(event.event_type, "created");
        assert_eq!(event.routing_key, "user.created");
        assert_eq!(event.received_at, now);
        assert_eq!(event.payload.get("name").and_then(Payload::as_str), Some("x"));
    }

    #[test]
    fn test_routing_key_without_dot_is_the_event_type() {
        let event = DecodedEvent::decode(&message("user", "user-registered", "{}"), Utc::now()).unwrap();
        assert_eq!(event.event_type, "user-registered");
    }

    #[test]
    fn test_decode_failure() {
        let result = DecodedEvent::decode(&message("link", "link.redirected", "not json"), Utc::now());
        assert!(matches!(result, Err(WorkerError::Decode(_))));
    }

    #[test]
    fn test_delivery_tag_display() {
        let tag = DeliveryTag::new(3, 42);
        assert_eq!(tag.to_string(), "3#42");
        assert_eq!(tag.generation(), 3);
        assert_eq!(tag.value(), 42);
    }
}
