//! Decode, route, persist, resolve.
//!
//! Deliveries are handled one at a time in arrival order. Per-message failures
//! become a reject and never leave the loop; connection loss is handed to the
//! [`ConnectionManager`].

use crate::broker::{Broker, ShutdownNotice};
use crate::config::RejectPolicy;
use crate::connection::{shutdown_requested, ConnectionManager};
use crate::error::WorkerError;
use crate::event::{DecodedEvent, InboundMessage};
use crate::metrics::WorkerMetrics;
use crate::sink::SinkRouter;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// How a delivery is resolved with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Reject { requeue: bool },
}

/// Receiving ends fed by the connection manager
pub struct Inbox {
    pub deliveries: mpsc::Receiver<InboundMessage>,
    pub lost: mpsc::UnboundedReceiver<ShutdownNotice>,
}

enum Next {
    Stop,
    Lost(ShutdownNotice),
    Delivery(InboundMessage),
}

pub struct MessagePipeline {
    router: SinkRouter,
    policy: RejectPolicy,
    requeue_delay: Duration,
    metrics: WorkerMetrics,
}

impl MessagePipeline {
    pub fn new(router: SinkRouter, policy: RejectPolicy) -> Self {
        Self {
            router,
            policy,
            requeue_delay: Duration::ZERO,
            metrics: WorkerMetrics::new("amqp-worker"),
        }
    }

    /// Hold requeueing rejects for `delay` so a failing backend is not
    /// hammered by immediate redelivery
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Handle one delivery and decide its outcome
    #[instrument(
        skip_all,
        fields(routing_key = %message.routing_key, delivery_tag = %message.delivery_tag)
    )]
    pub async fn process(&self, message: &InboundMessage) -> Outcome {
        self.metrics.delivery_received(&message.routing_key);

        let event = match DecodedEvent::decode(message, Utc::now()) {
            Ok(event) => event,
            Err(e) => return self.reject(message, e),
        };

        let sink = self.router.select(&event.routing_key);
        let started = Instant::now();

        match sink.persist(&event).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                debug!(
                    sink = sink.name(),
                    entity = %event.entity,
                    event_type = %event.event_type,
                    duration_ms = elapsed.as_millis() as u64,
                    "Event persisted"
                );
                self.metrics.delivery_acked(sink.name(), elapsed);
                Outcome::Ack
            }
            Err(e) => self.reject(message, WorkerError::from(e)),
        }
    }

    fn reject(&self, message: &InboundMessage, error: WorkerError) -> Outcome {
        let requeue = self.policy.should_requeue(&error);
        error!(
            error = %error,
            kind = error.kind(),
            category = %error.category(),
            requeue,
            redelivered = message.redelivered,
            payload = %message.body_lossy(),
            "Failed to process message"
        );
        self.metrics.delivery_rejected(error.kind(), requeue);
        Outcome::Reject { requeue }
    }

    /// Consume until shutdown or a fatal connection error.
    ///
    /// Shutdown is only observed between deliveries, so a message being
    /// processed is always resolved before this returns.
    pub async fn run<B: Broker>(
        &self,
        connection: &mut ConnectionManager<B>,
        inbox: &mut Inbox,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        info!(
            routes = ?self.router.routes(),
            fallback = self.router.fallback_name(),
            policy = %self.policy,
            "Consuming"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => Next::Stop,
                Some(notice) = inbox.lost.recv() => Next::Lost(notice),
                Some(message) = inbox.deliveries.recv() => Next::Delivery(message),
                else => Next::Stop,
            };

            match next {
                Next::Stop => {
                    info!("Consume loop stopping");
                    return Ok(());
                }
                Next::Lost(notice) => connection.handle_shutdown(notice, shutdown).await?,
                Next::Delivery(message) => {
                    if !connection.is_current(message.delivery_tag) {
                        debug!(delivery_tag = %message.delivery_tag, "Dropping delivery from a closed session");
                        self.metrics.stale_delivery();
                        continue;
                    }

                    let outcome = self.process(&message).await;
                    if outcome == (Outcome::Reject { requeue: true }) {
                        self.pause_before_requeue(shutdown).await;
                    }
                    if let Err(e) = connection.resolve(message.delivery_tag, outcome).await {
                        warn!(
                            delivery_tag = %message.delivery_tag,
                            ?outcome,
                            error = %e,
                            "Failed to resolve delivery"
                        );
                    }
                }
            }
        }
    }

    /// Cut short by shutdown; the delivery is still resolved afterwards
    async fn pause_before_requeue(&self, shutdown: &mut watch::Receiver<bool>) {
        if self.requeue_delay.is_zero() {
            return;
        }
        debug!(delay_ms = self.requeue_delay.as_millis() as u64, "Delaying requeue");
        tokio::select! {
            _ = tokio::time::sleep(self.requeue_delay) => {}
            _ = shutdown_requested(shutdown) => {}
        }
    }
}
