//! Projections of decoded events into sink records

use amqp_worker::{DecodedEvent, Payload, SinkError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

/// Routing key of the link redirect event
pub const LINK_REDIRECTED: &str = "link.redirected";

/// A short link being followed, as published by the link service
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRedirect {
    pub id: String,
    pub original: String,
    pub shortened: String,
    /// Redirect latency in milliseconds
    pub latency: i64,
    pub timestamp: DateTime<Utc>,
}

impl LinkRedirect {
    /// Project the payload fields this record needs; everything else is ignored.
    pub fn from_payload(payload: &Payload) -> Result<Self, SinkError> {
        let id = required_tag(payload, "id")?.to_string();
        let original = required_tag(payload, "original")?.to_string();
        let shortened = required_tag(payload, "shortened")?.to_string();
        let latency = required_i64(payload, "latency")?;

        let timestamp = parse_timestamp(required_str(payload, "timestamp")?)?;
        if timestamp.timestamp_nanos_opt().is_none() {
            return Err(SinkError::mapping(format!(
                "field 'timestamp' is outside the nanosecond range, got {}",
                timestamp.to_rfc3339()
            )));
        }

        Ok(Self {
            id,
            original,
            shortened,
            latency,
            timestamp,
        })
    }
}

fn required<'a>(payload: &'a Payload, field: &str) -> Result<&'a Payload, SinkError> {
    match payload.get(field) {
        Some(value) if !value.is_null() => Ok(value),
        _ => Err(SinkError::mapping(format!("missing field '{field}'"))),
    }
}

fn required_str<'a>(payload: &'a Payload, field: &str) -> Result<&'a str, SinkError> {
    let value = required(payload, field)?;
    value.as_str().ok_or_else(|| {
        SinkError::mapping(format!(
            "field '{field}' must be a string, got {}",
            value.type_name()
        ))
    })
}

/// String usable as a line-protocol tag value. Line breaks cannot be escaped
/// there, and a trailing backslash would swallow the following separator.
fn required_tag<'a>(payload: &'a Payload, field: &str) -> Result<&'a str, SinkError> {
    let value = required_str(payload, field)?;
    if value.is_empty() {
        return Err(SinkError::mapping(format!("field '{field}' must not be empty")));
    }
    if value.contains(['\n', '\r']) {
        return Err(SinkError::mapping(format!(
            "field '{field}' must not contain line breaks"
        )));
    }
    if value.ends_with('\\') {
        return Err(SinkError::mapping(format!(
            "field '{field}' must not end with a backslash"
        )));
    }
    Ok(value)
}

fn required_i64(payload: &Payload, field: &str) -> Result<i64, SinkError> {
    let value = required(payload, field)?;
    value.as_i64().ok_or_else(|| {
        SinkError::mapping(format!(
            "field '{field}' must be an integer, got {}",
            value.type_name()
        ))
    })
}

/// RFC 3339, or a naive ISO-8601 date-time which is taken as UTC
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, SinkError> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| SinkError::mapping(format!("invalid timestamp '{value}': {e}")))
}

/// Document stored for every event the time-series sink does not handle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDocument {
    pub entity: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub received_at: DateTime<Utc>,
    /// Payload, unchanged
    pub data: Payload,
}

impl From<&DecodedEvent> for EventDocument {
    fn from(event: &DecodedEvent) -> Self {
        Self {
            entity: event.entity.clone(),
            event_type: event.event_type.clone(),
            received_at: event.received_at,
            data: event.payload.clone(),
        }
    }
}
