//! InfluxDB time-series sink for link redirects

use crate::models::LinkRedirect;
use amqp_worker::{DecodedEvent, Sink, SinkError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_config::influxdb::InfluxConfig;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Measurement written for every redirect
pub const LINK_REDIRECTS_MEASUREMENT: &str = "link-redirects";

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Field value types for InfluxDB
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

/// One line-protocol point
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Nanoseconds since the epoch
    pub timestamp_ns: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp_ns: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp_ns,
        }
    }

    /// Point at `timestamp`, which must fit in `i64` nanoseconds (1677..2262)
    pub fn at(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Result<Self, SinkError> {
        let timestamp_ns = timestamp.timestamp_nanos_opt().ok_or_else(|| {
            SinkError::mapping(format!(
                "timestamp {} is outside the nanosecond range",
                timestamp.to_rfc3339()
            ))
        })?;
        Ok(Self::new(measurement, timestamp_ns))
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Convert to InfluxDB line protocol, nanosecond precision
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.measurement);

        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_tag(key));
            line.push('=');
            line.push_str(&escape_tag(value));
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    FieldValue::String(s) => format!("\"{}\"", escape_string(s)),
                    FieldValue::Integer(i) => format!("{i}i"),
                    FieldValue::Float(f) => format!("{f}"),
                    FieldValue::Boolean(b) => format!("{b}"),
                };
                format!("{}={}", escape_tag(k), value)
            })
            .collect();

        format!("{line} {} {}", fields.join(","), self.timestamp_ns)
    }
}

impl TryFrom<&LinkRedirect> for Point {
    type Error = SinkError;

    fn try_from(redirect: &LinkRedirect) -> Result<Self, Self::Error> {
        Ok(Point::at(LINK_REDIRECTS_MEASUREMENT, redirect.timestamp)?
            .tag("link", redirect.id.clone())
            .tag("original", redirect.original.clone())
            .tag("shortened", redirect.shortened.clone())
            .field("latency", FieldValue::Integer(redirect.latency)))
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escape special characters in tag keys/values and field keys
fn escape_tag(s: &str) -> String {
    s.replace(' ', "\\ ")
        .replace(',', "\\,")
        .replace('=', "\\=")
}

/// Escape special characters in string field values
fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Destination for points
#[async_trait]
pub trait PointWriter: Send + Sync {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError>;
}

/// InfluxDB v2 HTTP write API client
#[derive(Clone)]
pub struct InfluxWriter {
    client: reqwest::Client,
    config: InfluxConfig,
}

impl InfluxWriter {
    pub fn new(config: InfluxConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn write_url(&self) -> String {
        format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            self.config.url.trim_end_matches('/'),
            urlencoding::encode(&self.config.org),
            urlencoding::encode(&self.config.bucket)
        )
    }
}

/// InfluxDB reports failures as `{"code": "...", "message": "..."}`
fn influx_reason(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl PointWriter for InfluxWriter {
    #[instrument(skip(self, points), fields(count = points.len(), bucket = %self.config.bucket))]
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }

        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        let response = self
            .client
            .post(self.write_url())
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .timeout(WRITE_TIMEOUT)
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::unavailable(format!("InfluxDB request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!("Points written to InfluxDB");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = influx_reason(&body);
        warn!(status = %status, reason = %reason, "InfluxDB write failed");

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(SinkError::unavailable(format!("InfluxDB returned {status}: {reason}")))
        } else {
            Err(SinkError::rejected(format!("InfluxDB returned {status}: {reason}")))
        }
    }
}

/// Writes one `link-redirects` point per `link.redirected` event
pub struct LinkRedirectSink<W> {
    writer: W,
}

impl<W: PointWriter> LinkRedirectSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: PointWriter> Sink for LinkRedirectSink<W> {
    async fn persist(&self, event: &DecodedEvent) -> Result<(), SinkError> {
        let redirect = LinkRedirect::from_payload(&event.payload)?;
        let point = Point::try_from(&redirect)?;
        debug!(link = %redirect.id, latency = redirect.latency, "Writing redirect point");
        self.writer.write(std::slice::from_ref(&point)).await
    }

    fn name(&self) -> &'static str {
        "influxdb"
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        pub PointWriter {}

        #[async_trait]
        impl PointWriter for PointWriter {
            async fn write(&self, points: &[Point]) -> Result<(), SinkError>;
        }
    }
}
