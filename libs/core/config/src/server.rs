use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::net::Ipv4Addr;

/// Health/metrics HTTP server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for ServerConfig {
    /// - HEALTH_HOST: defaults to 0.0.0.0
    /// - HEALTH_PORT: defaults to 8083
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("HEALTH_HOST", &Ipv4Addr::UNSPECIFIED.to_string());
        let port = env_parse("HEALTH_PORT", 8083)?;

        Ok(Self { host, port })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 8083,
        }
    }
}
