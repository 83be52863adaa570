//! Broker session ownership and the reconnection state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (lost) Disconnected -> Connecting ...
//!                                   |                                   |
//!                                (close)                          (exhausted)
//!                                   v                                   v
//!                              ShuttingDown                           fatal
//! ```
//!
//! Every connect attempt bumps the session generation. Delivery tags and
//! shutdown notices carry the generation they were issued under, so tags from
//! a dead channel are never resolved against its replacement and a late
//! notice from an old session cannot tear down a healthy one.

use crate::broker::{Broker, BrokerSession, ShutdownHandler, ShutdownNotice};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::event::{DeliveryTag, InboundMessage};
use crate::metrics::WorkerMetrics;
use crate::pipeline::Outcome;
use crate::topology::{self, Binding};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// Connection lifecycle state, published to the readiness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

impl ConnectionState {
    pub(crate) fn as_gauge(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::ShuttingDown => 3.0,
        }
    }
}

/// Resolves once shutdown has been requested. Never resolves if the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Owns the broker session for a fixed set of bindings
pub struct ConnectionManager<B: Broker> {
    broker: B,
    bindings: Vec<Binding>,
    config: WorkerConfig,
    session: Option<B::Session>,
    generation: u64,
    state: watch::Sender<ConnectionState>,
    shutdown_handler: Option<ShutdownHandler>,
    deliveries: mpsc::Sender<InboundMessage>,
    metrics: WorkerMetrics,
}

impl<B: Broker> ConnectionManager<B> {
    /// Deliveries from every bound queue are forwarded into `deliveries`.
    pub fn new(
        broker: B,
        bindings: Vec<Binding>,
        config: WorkerConfig,
        deliveries: mpsc::Sender<InboundMessage>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            broker,
            bindings,
            config,
            session: None,
            generation: 0,
            state,
            shutdown_handler: None,
            deliveries,
            metrics: WorkerMetrics::new("amqp-worker"),
        }
    }

    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register the callback for unsolicited session loss.
    ///
    /// Applies to sessions opened after this call.
    pub fn on_shutdown<F>(&mut self, handler: F)
    where
        F: Fn(ShutdownNotice) + Send + Sync + 'static,
    {
        self.shutdown_handler = Some(Arc::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Read-only view of the connection state
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Generation of the most recent session attempt
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// True if `tag` was issued by the session that is currently open
    pub fn is_current(&self, tag: DeliveryTag) -> bool {
        self.session.is_some() && tag.generation() == self.generation
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        self.metrics.connection_state(state);
    }

    /// One connection attempt: open, declare topology, set prefetch, start consumers.
    ///
    /// Any previous session is released first. On failure the half-open
    /// session is closed and the state goes back to `Disconnected`.
    #[instrument(skip(self), fields(generation = self.generation + 1))]
    pub async fn connect(&mut self) -> Result<(), WorkerError> {
        self.release().await;

        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);

        let handler = self
            .shutdown_handler
            .clone()
            .unwrap_or_else(|| Arc::new(|_: ShutdownNotice| {}));

        let session = match self.broker.open(generation, handler).await {
            Ok(session) => session,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if let Err(e) = self.setup(&session).await {
            if let Err(close_err) = session.close().await {
                debug!(error = %close_err, "Ignoring close error on half-open session");
            }
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        self.session = Some(session);
        self.set_state(ConnectionState::Connected);
        info!(
            generation,
            queues = self.bindings.len(),
            prefetch = self.config.prefetch,
            "Connected to broker"
        );
        Ok(())
    }

    async fn setup(&self, session: &B::Session) -> Result<(), WorkerError> {
        for exchange in topology::exchanges(&self.bindings) {
            if self.config.declare_exchanges {
                session.declare_exchange(&exchange).await?;
            } else {
                session.assert_exchange(&exchange).await?;
            }
        }

        for binding in &self.bindings {
            session.declare_queue(binding).await?;
            debug!(
                exchange = %binding.exchange,
                queue = %binding.queue,
                routing_key = %binding.routing_key,
                "Queue bound"
            );
        }

        session.set_prefetch(self.config.prefetch).await?;

        for binding in &self.bindings {
            let consumer_tag = self.config.consumer_tag_for(&binding.queue);
            session
                .consume(&binding.queue, &consumer_tag, self.deliveries.clone())
                .await?;
        }

        Ok(())
    }

    /// Connect with up to `max_reconnect_attempts` attempts, sleeping
    /// `reconnect_delay` between them (not after the last one).
    ///
    /// Topology errors are returned immediately. Returns
    /// [`WorkerError::Shutdown`] if shutdown is requested while waiting.
    pub async fn connect_with_retry(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        let max_attempts = self.config.max_reconnect_attempts;
        let delay = self.config.reconnect_delay;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if *shutdown.borrow() {
                return Err(WorkerError::Shutdown);
            }

            match self.connect().await {
                Ok(()) => {
                    self.metrics.connect_attempt(true);
                    return Ok(());
                }
                Err(e @ WorkerError::Topology(_)) => {
                    self.metrics.connect_attempt(false);
                    error!(error = %e, "Broker topology is not usable");
                    return Err(e);
                }
                Err(e) => {
                    self.metrics.connect_attempt(false);
                    warn!(attempt, max_attempts, error = %e, "Connection attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts {
                debug!(delay_ms = delay.as_millis() as u64, "Waiting before next attempt");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_requested(shutdown) => return Err(WorkerError::Shutdown),
                }
            }
        }

        Err(WorkerError::ReconnectExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// React to an unsolicited session loss: release handles and reconnect.
    ///
    /// Notices for a session other than the current one are ignored.
    pub async fn handle_shutdown(
        &mut self,
        notice: ShutdownNotice,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        if self.session.is_none() || notice.generation != self.generation {
            debug!(
                notice_generation = notice.generation,
                current_generation = self.generation,
                "Ignoring stale shutdown notice"
            );
            return Ok(());
        }

        warn!(generation = notice.generation, reason = %notice.reason, "Broker session lost");
        self.metrics.connection_lost();
        self.release().await;
        self.set_state(ConnectionState::Disconnected);

        self.connect_with_retry(shutdown).await
    }

    /// Ack or reject one delivery. Tags from a previous session are skipped.
    pub async fn resolve(&self, tag: DeliveryTag, outcome: Outcome) -> Result<(), WorkerError> {
        if !self.is_current(tag) {
            debug!(%tag, generation = self.generation, "Skipping stale delivery tag");
            return Ok(());
        }

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| WorkerError::Connection("no open session".to_string()))?;

        match outcome {
            Outcome::Ack => session.ack(tag.value()).await,
            Outcome::Reject { requeue } => session.reject(tag.value(), requeue).await,
        }
    }

    /// Close the session for good
    pub async fn close(&mut self) {
        self.set_state(ConnectionState::ShuttingDown);
        if let Some(session) = self.session.take() {
            match session.close().await {
                Ok(()) => info!(generation = self.generation, "Broker session closed"),
                Err(e) => warn!(error = %e, "Error while closing broker session"),
            }
        }
    }

    /// Drop the current session, ignoring cleanup errors
    async fn release(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!(error = %e, "Ignoring close error while releasing session");
            }
        }
    }
}
