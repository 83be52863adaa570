//! AMQP Worker Framework
//!
//! Consumes RabbitMQ topic exchanges and hands every delivery to a pluggable
//! sink.
//!
//! ## Features
//!
//! - **Topic bindings**: one durable queue per `entity.event` pair
//! - **Bounded reconnection**: fixed delay, cancellable by shutdown, fatal when exhausted
//! - **Sequential pipeline**: decode, route, persist, then ack or reject
//! - **Reject policy**: dead-letter everything, or requeue transient sink failures
//! - **Prometheus metrics** and **health endpoints** tied to the connection state
//!
//! ## Example
//!
//! ```ignore
//! use amqp_worker::{topology, AmqpWorker, LapinBroker, SinkRouter, WorkerConfig};
//!
//! let bindings = topology::resolve(&["link", "user"], &["created", "redirected"]);
//! let router = SinkRouter::new(documents).route("link.redirected", points);
//! let broker = LapinBroker::new(amqp.uri(), "metrics-worker");
//!
//! let worker = AmqpWorker::new("metrics-worker", broker, bindings, router, WorkerConfig::new());
//! worker.run(shutdown_rx).await?;
//! ```

mod amqp;
mod broker;
mod config;
mod connection;
mod error;
mod event;
mod health;
pub mod metrics;
mod payload;
mod pipeline;
mod sink;
pub mod topology;
mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use amqp::{LapinBroker, LapinSession};
pub use broker::{Broker, BrokerSession, ShutdownHandler, ShutdownNotice};
pub use config::{RejectPolicy, WorkerConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{ErrorCategory, SinkError, WorkerError};
pub use event::{DecodedEvent, DeliveryTag, InboundMessage};
pub use health::{health_router, HealthState};
pub use self::metrics::{init_metrics, WorkerMetrics};
pub use payload::Payload;
pub use pipeline::{Inbox, MessagePipeline, Outcome};
pub use sink::{Sink, SinkRouter};
pub use topology::Binding;
pub use worker::AmqpWorker;
