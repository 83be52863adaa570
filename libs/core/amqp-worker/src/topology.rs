//! Broker topology derived from configuration.
//!
//! Every `(entity, event)` pair becomes one binding:
//!
//! | exchange | queue                   | routing key       |
//! |----------|-------------------------|-------------------|
//! | link     | link-redirected-queue   | link.redirected   |
//! | user     | user-created-queue      | user.created      |
//!
//! Exchanges are owned by the publishers (one topic exchange per entity).
//! Queues are owned by this worker.

use std::collections::BTreeSet;

/// One queue bound to one exchange with one routing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Binding {
    fn new(entity: &str, event: &str) -> Self {
        Self {
            exchange: entity.to_string(),
            queue: format!("{entity}-{event}-queue"),
            routing_key: format!("{entity}.{event}"),
        }
    }
}

fn normalize(token: &str) -> Option<String> {
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_lowercase())
}

/// Bindings for the cross product of `entities` × `events`.
///
/// Tokens are trimmed and lower-cased; empty tokens are skipped. The result is
/// sorted by (entity, event) and free of duplicates, so declaration order is
/// reproducible.
pub fn resolve<E, V>(entities: &[E], events: &[V]) -> Vec<Binding>
where
    E: AsRef<str>,
    V: AsRef<str>,
{
    resolve_pairs(entities.iter().flat_map(|entity| {
        events
            .iter()
            .map(move |event| (entity.as_ref().to_string(), event.as_ref().to_string()))
    }))
}

/// Bindings for explicit `(entity, event)` pairs, normalized like [`resolve`].
pub fn resolve_pairs<I, E, V>(pairs: I) -> Vec<Binding>
where
    I: IntoIterator<Item = (E, V)>,
    E: AsRef<str>,
    V: AsRef<str>,
{
    pairs
        .into_iter()
        .filter_map(|(entity, event)| Some((normalize(entity.as_ref())?, normalize(event.as_ref())?)))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|(entity, event)| Binding::new(&entity, &event))
        .collect()
}

/// Distinct exchanges referenced by `bindings`, in binding order.
pub fn exchanges(bindings: &[Binding]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    bindings
        .iter()
        .filter(|b| seen.insert(b.exchange.as_str()))
        .map(|b| b.exchange.clone())
        .collect()
}
