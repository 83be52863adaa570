pub mod amqp;
pub mod elasticsearch;
pub mod influxdb;
pub mod server;
pub mod topics;
pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("Invalid value for '{key}': {details}")]
    Invalid { key: String, details: String },
}

/// Application environment (dev = local/kind, prod = full k8s)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development, // Local dev or docker compose
    Production,  // k8s cluster
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load and parse environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load and parse environment variable or return error
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Environment variable that may be absent. Blank values count as absent.
pub fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable into `T`, falling back to `default` when unset
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });

        temp_env::with_var("APP_ENV", Some("Production"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });
    }

    #[test]
    fn test_environment_unknown_defaults_to_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("TEST_VAR", Some("test_value"), || {
            assert_eq!(env_or_default("TEST_VAR", "default"), "test_value");
        });
        temp_env::with_var_unset("MISSING_VAR", || {
            assert_eq!(env_or_default("MISSING_VAR", "default_value"), "default_value");
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("MISSING_REQUIRED", || {
            let err = env_required("MISSING_REQUIRED").unwrap_err();
            assert!(err.to_string().contains("MISSING_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_optional_treats_blank_as_unset() {
        temp_env::with_var("BLANK_VAR", Some("   "), || {
            assert_eq!(env_optional("BLANK_VAR"), None);
        });
        temp_env::with_var("SET_VAR", Some("x"), || {
            assert_eq!(env_optional("SET_VAR"), Some("x".to_string()));
        });
    }

    #[test]
    fn test_env_parse() {
        temp_env::with_var("PARSE_VAR", Some(" 42 "), || {
            assert_eq!(env_parse::<u32>("PARSE_VAR", 1).unwrap(), 42);
        });
        temp_env::with_var_unset("PARSE_VAR", || {
            assert_eq!(env_parse::<u32>("PARSE_VAR", 7).unwrap(), 7);
        });
        temp_env::with_var("PARSE_VAR", Some("nope"), || {
            let err = env_parse::<u32>("PARSE_VAR", 1).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { .. }));
        });
    }
}
