//! Events Domain
//!
//! Sinks for events consumed from the broker:
//! - InfluxDB for link redirects (`link.redirected` → `link-redirects` points)
//! - Elasticsearch for every other event (one document per event)
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       Event Flow                           │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  link.redirected ──► LinkRedirectSink ──► InfluxDB         │
//! │                                                            │
//! │  anything else  ──► DocumentSink     ──► Elasticsearch     │
//! │                                                            │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod elasticsearch;
mod influxdb;
mod models;

use amqp_worker::{Sink, SinkRouter};
use core_config::elasticsearch::ElasticsearchConfig;
use core_config::influxdb::InfluxConfig;
use std::sync::Arc;

pub use elasticsearch::{DocumentIndexer, DocumentSink, ElasticsearchIndexer};
pub use influxdb::{
    FieldValue, InfluxWriter, LINK_REDIRECTS_MEASUREMENT, LinkRedirectSink, Point, PointWriter,
};
pub use models::{EventDocument, LINK_REDIRECTED, LinkRedirect, parse_timestamp};

/// `link.redirected` goes to `time_series`, everything else to `documents`
pub fn sink_router(time_series: Arc<dyn Sink>, documents: Arc<dyn Sink>) -> SinkRouter {
    SinkRouter::new(documents).route(LINK_REDIRECTED, time_series)
}

/// Router backed by the real InfluxDB and Elasticsearch clients
pub fn backend_router(influx: InfluxConfig, elasticsearch: ElasticsearchConfig) -> SinkRouter {
    sink_router(
        Arc::new(LinkRedirectSink::new(InfluxWriter::new(influx))),
        Arc::new(DocumentSink::new(ElasticsearchIndexer::new(elasticsearch))),
    )
}
