//! Which broker topics the worker listens to.
//!
//! Two equivalent forms are accepted and may be combined:
//! - `METRICS_ENTITIES=link,user` + `METRICS_EVENTS=created,redirected` (cross product)
//! - `METRICS_LISTEN_TO_EVENTS=link.redirected,user.created` (explicit pairs)

use crate::{env_optional, ConfigError, FromEnv};

const ENTITIES_KEY: &str = "METRICS_ENTITIES";
const EVENTS_KEY: &str = "METRICS_EVENTS";
const PAIRS_KEY: &str = "METRICS_LISTEN_TO_EVENTS";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicConfig {
    pub entities: Vec<String>,
    pub events: Vec<String>,
    pub pairs: Vec<(String, String)>,
}

impl TopicConfig {
    /// Parse and validate the raw comma-separated values.
    pub fn parse(
        entities: Option<&str>,
        events: Option<&str>,
        pairs: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let (entities, events) = match (entities, events) {
            (Some(entities), Some(events)) => (
                split_tokens(ENTITIES_KEY, entities)?,
                split_tokens(EVENTS_KEY, events)?,
            ),
            (None, None) => (Vec::new(), Vec::new()),
            (Some(_), None) => return Err(ConfigError::MissingEnvVar(EVENTS_KEY.to_string())),
            (None, Some(_)) => return Err(ConfigError::MissingEnvVar(ENTITIES_KEY.to_string())),
        };

        let pairs = match pairs {
            Some(raw) => raw
                .split(',')
                .map(|token| split_pair(token.trim()))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        if entities.is_empty() && pairs.is_empty() {
            return Err(ConfigError::Invalid {
                key: PAIRS_KEY.to_string(),
                details: format!("set {PAIRS_KEY} or both {ENTITIES_KEY} and {EVENTS_KEY}"),
            });
        }

        Ok(Self {
            entities,
            events,
            pairs,
        })
    }

    /// Every configured (entity, event) combination: cross product first, then explicit pairs.
    pub fn all_pairs(&self) -> Vec<(String, String)> {
        self.entities
            .iter()
            .flat_map(|entity| {
                self.events
                    .iter()
                    .map(move |event| (entity.clone(), event.clone()))
            })
            .chain(self.pairs.iter().cloned())
            .collect()
    }
}

impl FromEnv for TopicConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::parse(
            env_optional(ENTITIES_KEY).as_deref(),
            env_optional(EVENTS_KEY).as_deref(),
            env_optional(PAIRS_KEY).as_deref(),
        )
    }
}

fn split_tokens(key: &str, raw: &str) -> Result<Vec<String>, ConfigError> {
    raw.split(',')
        .map(|token| {
            let token = token.trim();
            if token.is_empty() {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    details: format!("empty token in '{raw}'"),
                });
            }
            if token.contains('.') {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    details: format!("'{token}' must not contain '.'"),
                });
            }
            Ok(token.to_string())
        })
        .collect()
}

fn split_pair(token: &str) -> Result<(String, String), ConfigError> {
    let invalid = || ConfigError::Invalid {
        key: PAIRS_KEY.to_string(),
        details: format!("'{token}' is not of the form entity.event"),
    };

    let (entity, event) = token.split_once('.').ok_or_else(invalid)?;
    let (entity, event) = (entity.trim(), event.trim());
    if entity.is_empty() || event.is_empty() || event.contains('.') {
        return Err(invalid());
    }
    Ok((entity.to_string(), event.to_string()))
}
