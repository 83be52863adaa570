//! Metrics Worker Service - Entry Point
//!
//! Consumes broker events and stores them in InfluxDB and Elasticsearch.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_metrics_worker::run().await
}
