//! In-memory broker and sinks for tests.
//!
//! `FakeBroker` routes published messages to bound queues by exact
//! `(exchange, routing key)` match, hands out per-session delivery tags and
//! requeues unacknowledged deliveries when a session dies, like RabbitMQ.
//! Once the session sets a prefetch, no more than that many deliveries are
//! outstanding; the rest wait in the queue until something is acked or rejected.

use crate::broker::{Broker, BrokerSession, ShutdownHandler, ShutdownNotice};
use crate::error::{SinkError, WorkerError};
use crate::event::{DecodedEvent, DeliveryTag, InboundMessage};
use crate::sink::Sink;
use crate::topology::Binding;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    generation: u64,
    tag: String,
    queue: String,
    inbox: mpsc::UnboundedSender<InboundMessage>,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    exchanges: BTreeSet<String>,
    fail_next_opens: u32,
    fail_all_opens: bool,
    open_attempts: u32,

    live: Option<u64>,
    handler: Option<ShutdownHandler>,
    next_tag: u64,

    bindings: Vec<Binding>,
    backlog: HashMap<String, VecDeque<Stored>>,
    consumers: Vec<Consumer>,
    unacked: BTreeMap<(u64, u64), (String, Stored)>,

    asserted: Vec<String>,
    declared: Vec<String>,
    prefetch: Option<u16>,
    acks: Vec<DeliveryTag>,
    rejects: Vec<(DeliveryTag, bool)>,
    closed: Vec<u64>,
}

impl State {
    /// Append to the queue, then deliver whatever the prefetch window allows
    fn enqueue(&mut self, queue: &str, message: Stored) {
        self.backlog.entry(queue.to_string()).or_default().push_back(message);
        self.dispatch();
    }

    /// Deliveries of `generation` not yet acked or rejected
    fn in_flight(&self, generation: u64) -> usize {
        self.unacked.keys().filter(|(g, _)| *g == generation).count()
    }

    /// Move ready messages to live consumers until the prefetch window is full
    fn dispatch(&mut self) {
        let Some(generation) = self.live else {
            return;
        };
        let window = self.prefetch.map_or(usize::MAX, usize::from);

        while self.in_flight(generation) < window {
            let Some(index) = self.consumers.iter().position(|c| {
                c.generation == generation
                    && self.backlog.get(&c.queue).is_some_and(|b| !b.is_empty())
            }) else {
                return;
            };
            let queue = self.consumers[index].queue.clone();
            let Some(message) = self.backlog.get_mut(&queue).and_then(VecDeque::pop_front) else {
                return;
            };

            self.next_tag += 1;
            let tag = DeliveryTag::new(generation, self.next_tag);
            let delivery = InboundMessage {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                delivery_tag: tag,
                redelivered: message.redelivered,
            };
            if self.consumers[index].inbox.send(delivery).is_err() {
                self.backlog.entry(queue).or_default().push_front(message);
                return;
            }
            self.unacked.insert((generation, tag.value()), (queue, message));
        }
    }

    /// Tear a session down: stop its consumers and requeue what it never acked
    fn end_session(&mut self, generation: u64) {
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.consumers)
            .into_iter()
            .partition(|c| c.generation == generation);
        self.consumers = kept;
        for consumer in gone {
            consumer.forwarder.abort();
        }

        let orphaned: Vec<_> = self
            .unacked
            .keys()
            .filter(|(g, _)| *g == generation)
            .copied()
            .collect();
        // Reversed so the oldest ends up at the head of the queue
        for key in orphaned.into_iter().rev() {
            if let Some((queue, mut message)) = self.unacked.remove(&key) {
                message.redelivered = true;
                self.backlog.entry(queue).or_default().push_front(message);
            }
        }

        if self.live == Some(generation) {
            self.live = None;
            self.handler = None;
            self.next_tag = 0;
        }
    }
}

/// In-memory stand-in for RabbitMQ
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    /// Broker without any exchanges
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker where the given exchanges already exist
    pub fn with_exchanges<I, S>(exchanges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let broker = Self::new();
        broker.lock().exchanges = exchanges.into_iter().map(Into::into).collect();
        broker
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().fail_next_opens = count;
    }

    /// Refuse every connection attempt
    pub fn fail_all_opens(&self) {
        self.lock().fail_all_opens = true;
    }

    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    /// Publish to `exchange`; routed to every queue bound with exactly `routing_key`
    pub fn publish(&self, exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        let body = body.into();
        let queues: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();

        for queue in queues {
            state.enqueue(
                &queue,
                Stored {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    redelivered: false,
                },
            );
        }
    }

    /// Kill the live session as if the server went away
    pub fn drop_connection(&self, reason: &str) {
        let notice = {
            let mut state = self.lock();
            let Some(generation) = state.live else {
                return;
            };
            let handler = state.handler.clone();
            state.end_session(generation);
            handler.map(|h| (h, generation))
        };

        if let Some((handler, generation)) = notice {
            handler(ShutdownNotice {
                generation,
                reason: reason.to_string(),
            });
        }
    }

    /// Deliveries handed out by the live session and not yet resolved
    pub fn unacked_count(&self) -> usize {
        let state = self.lock();
        state.live.map_or(0, |generation| state.in_flight(generation))
    }

    pub fn acks(&self) -> Vec<DeliveryTag> {
        self.lock().acks.clone()
    }

    pub fn rejects(&self) -> Vec<(DeliveryTag, bool)> {
        self.lock().rejects.clone()
    }

    /// Queues declared so far, sorted and distinct
    pub fn declared_queues(&self) -> Vec<String> {
        let queues: BTreeSet<_> = self.lock().bindings.iter().map(|b| b.queue.clone()).collect();
        queues.into_iter().collect()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.lock().prefetch
    }

    /// Exchanges checked passively, in order (distinct)
    pub fn asserted_exchanges(&self) -> Vec<String> {
        dedup(&self.lock().asserted)
    }

    /// Exchanges declared actively, in order (distinct)
    pub fn declared_exchanges(&self) -> Vec<String> {
        dedup(&self.lock().declared)
    }

    /// Consumer tags of the live session
    pub fn consumer_tags(&self) -> Vec<String> {
        let state = self.lock();
        state
            .consumers
            .iter()
            .filter(|c| Some(c.generation) == state.live)
            .map(|c| c.tag.clone())
            .collect()
    }

    /// Generations closed locally, in order
    pub fn closed_sessions(&self) -> Vec<u64> {
        self.lock().closed.clone()
    }

    /// Messages waiting in `queue`, not delivered to any consumer
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().backlog.get(queue).map_or(0, VecDeque::len)
    }

    /// Wait until at least `count` deliveries have been acked or rejected
    pub async fn wait_for_resolutions(&self, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let state = self.lock();
                if state.acks.len() + state.rejects.len() >= count {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn dedup(items: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .iter()
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

#[async_trait]
impl Broker for FakeBroker {
    type Session = FakeSession;

    async fn open(
        &self,
        generation: u64,
        on_shutdown: ShutdownHandler,
    ) -> Result<FakeSession, WorkerError> {
        let mut state = self.lock();
        state.open_attempts += 1;

        if state.fail_all_opens || state.fail_next_opens > 0 {
            state.fail_next_opens = state.fail_next_opens.saturating_sub(1);
            return Err(WorkerError::Connection("connection refused".to_string()));
        }

        state.live = Some(generation);
        state.handler = Some(on_shutdown);
        state.next_tag = 0;
        state.prefetch = None;

        Ok(FakeSession {
            state: self.state.clone(),
            generation,
        })
    }
}

/// Session handed out by [`FakeBroker`]
pub struct FakeSession {
    state: Arc<Mutex<State>>,
    generation: u64,
}

impl FakeSession {
    fn lock(&self) -> Result<MutexGuard<'_, State>, WorkerError> {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.live != Some(self.generation) {
            return Err(WorkerError::Connection("channel is closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn assert_exchange(&self, exchange: &str) -> Result<(), WorkerError> {
        let mut state = self.lock()?;
        if !state.exchanges.contains(exchange) {
            return Err(WorkerError::Topology(format!(
                "NOT_FOUND - no exchange '{exchange}' in vhost '/'"
            )));
        }
        state.asserted.push(exchange.to_string());
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), WorkerError> {
        let mut state = self.lock()?;
        state.exchanges.insert(exchange.to_string());
        state.declared.push(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, binding: &Binding) -> Result<(), WorkerError> {
        let mut state = self.lock()?;
        if !state.exchanges.contains(&binding.exchange) {
            return Err(WorkerError::Topology(format!(
                "NOT_FOUND - no exchange '{}' in vhost '/'",
                binding.exchange
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), WorkerError> {
        let mut state = self.lock()?;
        state.prefetch = Some(count);
        state.dispatch();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        deliveries: mpsc::Sender<InboundMessage>,
    ) -> Result<(), WorkerError> {
        let mut state = self.lock()?;

        let (inbox, mut outbox) = mpsc::unbounded_channel::<InboundMessage>();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                if deliveries.send(message).await.is_err() {
                    break;
                }
            }
        });

        state.consumers.push(Consumer {
            generation: self.generation,
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            inbox,
            forwarder,
        });

        state.dispatch();
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError> {
        let mut state = self.lock()?;
        state
            .unacked
            .remove(&(self.generation, delivery_tag))
            .ok_or_else(|| WorkerError::Connection(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}")))?;
        state.acks.push(DeliveryTag::new(self.generation, delivery_tag));
        state.dispatch();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError> {
        let mut state = self.lock()?;
        let (queue, mut message) = state
            .unacked
            .remove(&(self.generation, delivery_tag))
            .ok_or_else(|| WorkerError::Connection(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}")))?;
        state
            .rejects
            .push((DeliveryTag::new(self.generation, delivery_tag), requeue));
        if requeue {
            message.redelivered = true;
            state.backlog.entry(queue).or_default().push_front(message);
        }
        state.dispatch();
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.closed.push(self.generation);
        state.end_session(self.generation);
        Ok(())
    }
}

/// Sink that records every event it is asked to persist
pub struct RecordingSink {
    name: &'static str,
    failure: Option<SinkError>,
    events: Mutex<Vec<DecodedEvent>>,
}

impl RecordingSink {
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            failure: None,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Records the attempt, then fails with `error`
    pub fn failing(name: &'static str, error: SinkError) -> Self {
        Self {
            failure: Some(error),
            ..Self::named(name)
        }
    }

    pub fn events(&self) -> Vec<DecodedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn persist(&self, event: &DecodedEvent) -> Result<(), SinkError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
