//! Service configuration loaded from the environment

use amqp_worker::{RejectPolicy, WorkerConfig};
use core_config::amqp::AmqpConfig;
use core_config::elasticsearch::ElasticsearchConfig;
use core_config::influxdb::InfluxConfig;
use core_config::server::ServerConfig;
use core_config::topics::TopicConfig;
use core_config::{env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// Consumer tuning
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSettings {
    pub prefetch: u16,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub declare_exchanges: bool,
    pub heartbeat_interval: Duration,
    pub reject_policy: RejectPolicy,
    pub requeue_delay: Duration,
}

impl FromEnv for WorkerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let prefetch: u16 = env_parse("AMQP_PREFETCH", 1)?;
        if prefetch == 0 {
            return Err(ConfigError::Invalid {
                key: "AMQP_PREFETCH".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        let max_reconnect_attempts: u32 = env_parse("AMQP_MAX_RECONNECT_ATTEMPTS", 3)?;
        if max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "AMQP_MAX_RECONNECT_ATTEMPTS".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            prefetch,
            max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(env_parse("AMQP_RECONNECT_DELAY_MS", 3000)?),
            declare_exchanges: env_parse("AMQP_DECLARE_EXCHANGES", false)?,
            heartbeat_interval: Duration::from_secs(env_parse("HEARTBEAT_INTERVAL_SECS", 5)?),
            reject_policy: env_parse("REJECT_POLICY", RejectPolicy::DeadLetter)?,
            requeue_delay: Duration::from_millis(env_parse("REQUEUE_DELAY_MS", 1000)?),
        })
    }
}

impl WorkerSettings {
    pub fn worker_config(&self, consumer_tag: &str) -> WorkerConfig {
        WorkerConfig::new()
            .with_consumer_tag(consumer_tag)
            .with_prefetch(self.prefetch)
            .with_reconnect(self.max_reconnect_attempts, self.reconnect_delay)
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_declare_exchanges(self.declare_exchanges)
            .with_reject_policy(self.reject_policy)
            .with_requeue_delay(self.requeue_delay)
    }
}

/// Everything the service reads at startup
#[derive(Clone, Debug)]
pub struct Settings {
    pub amqp: AmqpConfig,
    pub influx: InfluxConfig,
    pub elasticsearch: ElasticsearchConfig,
    pub topics: TopicConfig,
    pub worker: WorkerSettings,
    pub server: ServerConfig,
}

impl FromEnv for Settings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            amqp: AmqpConfig::from_env()?,
            influx: InfluxConfig::from_env()?,
            elasticsearch: ElasticsearchConfig::from_env()?,
            topics: TopicConfig::from_env()?,
            worker: WorkerSettings::from_env()?,
            server: ServerConfig::from_env()?,
        })
    }
}
