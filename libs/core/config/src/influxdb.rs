use crate::{env_or_default, env_required, ConfigError, FromEnv};

/// InfluxDB v2 write settings
#[derive(Clone, Debug)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

impl FromEnv for InfluxConfig {
    /// Requires INFLUXDB_URL and INFLUXDB_TOKEN.
    /// INFLUXDB_ORG defaults to "shrtr", INFLUXDB_BUCKET to "reporting".
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_required("INFLUXDB_URL")?.trim_end_matches('/').to_string(),
            token: env_required("INFLUXDB_TOKEN")?,
            org: env_or_default("INFLUXDB_ORG", "shrtr"),
            bucket: env_or_default("INFLUXDB_BUCKET", "reporting"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_influx_config_from_env() {
        temp_env::with_vars(
            [
                ("INFLUXDB_URL", Some("http://influx:8086/")),
                ("INFLUXDB_TOKEN", Some("secret")),
                ("INFLUXDB_ORG", None),
                ("INFLUXDB_BUCKET", None),
            ],
            || {
                let config = InfluxConfig::from_env().unwrap();
                assert_eq!(config.url, "http://influx:8086");
                assert_eq!(config.token, "secret");
                assert_eq!(config.org, "shrtr");
                assert_eq!(config.bucket, "reporting");
            },
        );
    }

    #[test]
    fn test_influx_config_requires_token() {
        temp_env::with_vars(
            [("INFLUXDB_URL", Some("http://influx:8086")), ("INFLUXDB_TOKEN", None)],
            || {
                let err = InfluxConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("INFLUXDB_TOKEN"));
            },
        );
    }
}
