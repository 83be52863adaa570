//! Broker client abstraction
//!
//! The connection manager talks to the broker only through these traits:
//! - `LapinBroker` (RabbitMQ, production)
//! - `FakeBroker` (in-memory, `testing` feature)
//!
//! Raw connection/channel handles never leave the implementations.

use crate::error::WorkerError;
use crate::event::InboundMessage;
use crate::topology::Binding;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sent when a session is lost without a local close
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownNotice {
    /// Generation of the session that went away
    pub generation: u64,
    pub reason: String,
}

/// Callback invoked on unsolicited session loss
pub type ShutdownHandler = Arc<dyn Fn(ShutdownNotice) + Send + Sync>;

/// Factory for broker sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    type Session: BrokerSession;

    /// Open a transport connection plus one channel.
    ///
    /// `on_shutdown` must be invoked (with `generation`) if the session later
    /// breaks on its own. It must not be invoked for a local `close()`.
    async fn open(
        &self,
        generation: u64,
        on_shutdown: ShutdownHandler,
    ) -> Result<Self::Session, WorkerError>;
}

/// One open connection + channel.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Passive declare: fails with [`WorkerError::Topology`] if the exchange is absent.
    async fn assert_exchange(&self, exchange: &str) -> Result<(), WorkerError>;

    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), WorkerError>;

    /// Declare the queue durable, non-exclusive, non-auto-delete and bind it.
    async fn declare_queue(&self, binding: &Binding) -> Result<(), WorkerError>;

    /// Limit unacknowledged deliveries on the channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), WorkerError>;

    /// Start a manual-ack consumer on `queue`, forwarding deliveries into `deliveries`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        deliveries: mpsc::Sender<InboundMessage>,
    ) -> Result<(), WorkerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError>;

    /// Close channel then connection.
    async fn close(&self) -> Result<(), WorkerError>;
}
