//! Metrics Worker Service
//!
//! Consumes domain events from RabbitMQ and stores them for reporting.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ topic exchanges (one per entity)
//!   ↓ (queues: {entity}-{event}-queue, prefetch-limited)
//! AmqpWorker
//!   ↓ (decode → route by routing key)
//!   ├─ link.redirected → InfluxDB  (link-redirects points)
//!   └─ everything else → Elasticsearch (event documents)
//! ```
//!
//! ## Features
//!
//! - Bounded reconnection with a fixed delay
//! - Explicit ack/reject with a configurable reject policy
//! - Graceful shutdown handling
//! - Health check endpoint for Kubernetes probes

pub mod config;

use amqp_worker::{health_router, metrics, topology, AmqpWorker, HealthState, LapinBroker};
use axum::Router;
use config::Settings;
use core_config::server::ServerConfig;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const APP_NAME: &str = "metrics-worker";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start the health HTTP server
///
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, server: ServerConfig) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = server.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the metrics worker
///
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads configuration and resolves the queue bindings
/// 3. Starts the health server
/// 4. Runs the worker until SIGINT/SIGTERM
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is missing or invalid
/// - An expected exchange does not exist
/// - The broker stays unreachable for every reconnect attempt
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(APP_NAME, &environment);

    metrics::init_metrics();

    info!(name = APP_NAME, version = APP_VERSION, "Starting metrics worker service");
    info!("Environment: {:?}", environment);

    let settings = Settings::from_env().wrap_err("Failed to load configuration")?;

    let bindings = topology::resolve_pairs(settings.topics.all_pairs());
    info!(
        broker = %settings.amqp.address(),
        vhost = %settings.amqp.vhost,
        queues = bindings.len(),
        influx_bucket = %settings.influx.bucket,
        elasticsearch_index = %settings.elasticsearch.index,
        reject_policy = %settings.worker.reject_policy,
        "Configuration loaded"
    );

    let router = domain_events::backend_router(settings.influx.clone(), settings.elasticsearch.clone());
    let broker = LapinBroker::new(settings.amqp.uri(), APP_NAME);
    let worker = AmqpWorker::new(
        APP_NAME,
        broker,
        bindings,
        router,
        settings.worker.worker_config(APP_NAME),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(APP_NAME, APP_VERSION, worker.state_receiver());
    let server = settings.server.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, server).await {
            error!(error = %e, "Health server failed");
        }
    });

    worker
        .run(shutdown_rx)
        .await
        .wrap_err("Metrics worker stopped with a fatal error")?;

    info!("Metrics worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
