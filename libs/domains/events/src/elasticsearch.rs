//! Elasticsearch document sink for every other event

use crate::models::EventDocument;
use amqp_worker::{DecodedEvent, Sink, SinkError};
use async_trait::async_trait;
use core_config::elasticsearch::ElasticsearchConfig;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const INDEX_TIMEOUT: Duration = Duration::from_secs(10);

/// Destination for event documents
#[async_trait]
pub trait DocumentIndexer: Send + Sync {
    async fn index(&self, document: &EventDocument) -> Result<(), SinkError>;
}

/// Elasticsearch index API client (`POST /{index}/_doc`)
#[derive(Clone)]
pub struct ElasticsearchIndexer {
    client: reqwest::Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchIndexer {
    pub fn new(config: ElasticsearchConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn index_url(&self) -> String {
        format!(
            "{}/{}/_doc",
            self.config.url.trim_end_matches('/'),
            urlencoding::encode(&self.config.index)
        )
    }
}

/// Elasticsearch error bodies look like
/// `{"error": {"type": "...", "reason": "..."}, "status": 400}`; older
/// versions and proxies may send `{"error": "..."}` or plain text.
fn error_reason(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };

    match value.get("error") {
        Some(serde_json::Value::Object(error)) => error
            .get("reason")
            .and_then(|r| r.as_str())
            .or_else(|| error.get("type").and_then(|t| t.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Some(serde_json::Value::String(reason)) => reason.clone(),
        _ => body.to_string(),
    }
}

#[async_trait]
impl DocumentIndexer for ElasticsearchIndexer {
    #[instrument(skip(self, document), fields(index = %self.config.index, entity = %document.entity))]
    async fn index(&self, document: &EventDocument) -> Result<(), SinkError> {
        let mut request = self
            .client
            .post(self.index_url())
            .timeout(INDEX_TIMEOUT)
            .json(document);

        if let Some((username, password)) = self.config.credentials() {
            request = request.basic_auth(username, password);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::unavailable(format!("Elasticsearch request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = %status, "Document indexed");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = error_reason(&body);
        warn!(status = %status, reason = %reason, "Elasticsearch rejected document");

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(SinkError::unavailable(reason))
        } else {
            Err(SinkError::rejected(reason))
        }
    }
}

/// Indexes every event it receives as an [`EventDocument`]
pub struct DocumentSink<I> {
    indexer: I,
}

impl<I: DocumentIndexer> DocumentSink<I> {
    pub fn new(indexer: I) -> Self {
        Self { indexer }
    }
}

#[async_trait]
impl<I: DocumentIndexer> Sink for DocumentSink<I> {
    async fn persist(&self, event: &DecodedEvent) -> Result<(), SinkError> {
        let document = EventDocument::from(event);
        self.indexer.index(&document).await
    }

    fn name(&self) -> &'static str {
        "elasticsearch"
    }
}
