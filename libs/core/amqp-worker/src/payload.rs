//! Schema-free message payload.
//!
//! Payloads are decoded into a closed value tree; each sink picks the subset it
//! needs through the accessor helpers and serializes the rest untouched.

use crate::error::WorkerError;
use serde::Serialize;
use std::collections::BTreeMap;

/// Decoded JSON value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Payload>),
    Object(BTreeMap<String, Payload>),
}

impl Payload {
    /// Decode raw message bytes: UTF-8 text containing one JSON document.
    pub fn decode(bytes: &[u8]) -> Result<Self, WorkerError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| WorkerError::Decode(format!("payload is not valid UTF-8: {e}")))?;
        let value: serde_json::Value = serde_json::from_str(text)?;
        Ok(value.into())
    }

    /// Field lookup on objects; `None` for other variants
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Payload::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integral numbers only
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Payload::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Payload::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Payload::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Payload]> {
        match self {
            Payload::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Payload>> {
        match self {
            Payload::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    /// JSON type name, for mapping error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Null => "null",
            Payload::Bool(_) => "bool",
            Payload::Number(_) => "number",
            Payload::String(_) => "string",
            Payload::Array(_) => "array",
            Payload::Object(_) => "object",
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Payload::Null,
            serde_json::Value::Bool(b) => Payload::Bool(b),
            serde_json::Value::Number(n) => Payload::Number(n),
            serde_json::Value::String(s) => Payload::String(s),
            serde_json::Value::Array(items) => {
                Payload::Array(items.into_iter().map(Payload::from).collect())
            }
            serde_json::Value::Object(map) => Payload::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Payload::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<Payload> for serde_json::Value {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Null => serde_json::Value::Null,
            Payload::Bool(b) => serde_json::Value::Bool(b),
            Payload::Number(n) => serde_json::Value::Number(n),
            Payload::String(s) => serde_json::Value::String(s),
            Payload::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            Payload::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, serde_json::Value::from(value)))
                    .collect(),
            ),
        }
    }
}
