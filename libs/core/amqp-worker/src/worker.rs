//! Composition root: connection, consume loop, heartbeat, teardown.

use crate::broker::Broker;
use crate::config::WorkerConfig;
use crate::connection::{shutdown_requested, ConnectionManager, ConnectionState};
use crate::error::WorkerError;
use crate::metrics::WorkerMetrics;
use crate::pipeline::{Inbox, MessagePipeline};
use crate::sink::SinkRouter;
use crate::topology::Binding;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Consumes every bound queue and persists each event through the router.
///
/// ```ignore
/// let worker = AmqpWorker::new("metrics-worker", broker, bindings, router, config);
/// let readiness = worker.state_receiver();
/// worker.run(shutdown_rx).await?;
/// ```
pub struct AmqpWorker<B: Broker> {
    name: String,
    connection: ConnectionManager<B>,
    pipeline: MessagePipeline,
    inbox: Inbox,
    heartbeat_interval: Duration,
}

impl<B: Broker> AmqpWorker<B> {
    pub fn new(
        name: impl Into<String>,
        broker: B,
        bindings: Vec<Binding>,
        router: SinkRouter,
        config: WorkerConfig,
    ) -> Self {
        let name = name.into();
        let metrics = WorkerMetrics::new(name.clone());

        let (delivery_tx, deliveries) = mpsc::channel(config.delivery_buffer());
        let (lost_tx, lost) = mpsc::unbounded_channel();

        let heartbeat_interval = config.heartbeat_interval;
        let pipeline = MessagePipeline::new(router, config.reject_policy)
            .with_requeue_delay(config.requeue_delay)
            .with_metrics(metrics.clone());

        let mut connection =
            ConnectionManager::new(broker, bindings, config, delivery_tx).with_metrics(metrics);
        connection.on_shutdown(move |notice| {
            // Receiver lives as long as the worker
            let _ = lost_tx.send(notice);
        });

        Self {
            name,
            connection,
            pipeline,
            inbox: Inbox { deliveries, lost },
            heartbeat_interval,
        }
    }

    /// Connection state for readiness probes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn bindings(&self) -> &[Binding] {
        self.connection.bindings()
    }

    /// Run until shutdown is signalled or the connection cannot be recovered.
    ///
    /// The broker session is closed on every exit path. A requested shutdown
    /// returns `Ok(())`. Fatal errors (no bindings, missing exchange, exhausted
    /// reconnects) are returned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        if self.bindings().is_empty() {
            return Err(WorkerError::Config("no queue bindings configured".to_string()));
        }

        info!(
            worker = %self.name,
            queues = ?self.bindings().iter().map(|b| b.queue.as_str()).collect::<Vec<_>>(),
            "Starting worker"
        );

        let heartbeat = tokio::spawn(heartbeat(
            self.name.clone(),
            self.heartbeat_interval,
            shutdown.clone(),
        ));

        let result = match self.connection.connect_with_retry(&mut shutdown).await {
            Ok(()) => {
                self.pipeline
                    .run(&mut self.connection, &mut self.inbox, &mut shutdown)
                    .await
            }
            Err(e) => Err(e),
        };

        self.connection.close().await;
        heartbeat.abort();

        match result {
            Ok(()) | Err(WorkerError::Shutdown) => {
                info!(worker = %self.name, "Worker stopped");
                Ok(())
            }
            Err(e) => {
                error!(worker = %self.name, error = %e, kind = e.kind(), "Worker failed");
                Err(e)
            }
        }
    }
}

/// Periodic liveness log line until shutdown. A zero interval disables it.
async fn heartbeat(name: String, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => info!(worker = %name, at = %Utc::now().to_rfc3339(), "Worker running"),
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }
}
