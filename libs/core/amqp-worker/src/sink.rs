//! Sink capability and routing-key based selection

use crate::error::SinkError;
use crate::event::DecodedEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A persistence backend for decoded events
#[async_trait]
pub trait Sink: Send + Sync {
    async fn persist(&self, event: &DecodedEvent) -> Result<(), SinkError>;

    /// Label used in logs and metrics
    fn name(&self) -> &'static str;
}

/// Maps routing keys to sinks. Unmatched keys go to the fallback, so every
/// event has somewhere to land.
#[derive(Clone)]
pub struct SinkRouter {
    routes: HashMap<String, Arc<dyn Sink>>,
    fallback: Arc<dyn Sink>,
}

impl SinkRouter {
    pub fn new(fallback: Arc<dyn Sink>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    /// Send `routing_key` (case-insensitive) to `sink`
    pub fn route(mut self, routing_key: &str, sink: Arc<dyn Sink>) -> Self {
        self.routes.insert(routing_key.trim().to_lowercase(), sink);
        self
    }

    pub fn select(&self, routing_key: &str) -> &Arc<dyn Sink> {
        self.routes
            .get(&routing_key.to_lowercase())
            .unwrap_or(&self.fallback)
    }

    /// `(routing key, sink name)` for every explicit route, sorted
    pub fn routes(&self) -> Vec<(String, &'static str)> {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|(key, sink)| (key.clone(), sink.name()))
            .collect();
        routes.sort();
        routes
    }

    pub fn fallback_name(&self) -> &'static str {
        self.fallback.name()
    }
}
