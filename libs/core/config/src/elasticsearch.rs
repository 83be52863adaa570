use crate::{env_optional, env_or_default, env_required, ConfigError, FromEnv};

/// Elasticsearch document store settings
#[derive(Clone, Debug)]
pub struct ElasticsearchConfig {
    pub url: String,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ElasticsearchConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            index: "events".to_string(),
            username: None,
            password: None,
        }
    }

    /// Basic auth credentials, when a username is configured
    pub fn credentials(&self) -> Option<(&str, Option<&str>)> {
        self.username
            .as_deref()
            .map(|user| (user, self.password.as_deref()))
    }
}

impl FromEnv for ElasticsearchConfig {
    /// Requires ELASTICSEARCH_URL. ELASTICSEARCH_INDEX defaults to "events".
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_required("ELASTICSEARCH_URL")?.trim_end_matches('/').to_string(),
            index: env_or_default("ELASTICSEARCH_INDEX", "events"),
            username: env_optional("ELASTICSEARCH_USERNAME"),
            password: env_optional("ELASTICSEARCH_PASSWORD"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elasticsearch_config_defaults() {
        temp_env::with_vars(
            [
                ("ELASTICSEARCH_URL", Some("http://elastic:9200")),
                ("ELASTICSEARCH_INDEX", None),
                ("ELASTICSEARCH_USERNAME", None),
                ("ELASTICSEARCH_PASSWORD", None),
            ],
            || {
                let config = ElasticsearchConfig::from_env().unwrap();
                assert_eq!(config.url, "http://elastic:9200");
                assert_eq!(config.index, "events");
                assert!(config.credentials().is_none());
            },
        );
    }

    #[test]
    fn test_elasticsearch_credentials() {
        temp_env::with_vars(
            [
                ("ELASTICSEARCH_URL", Some("http://elastic:9200")),
                ("ELASTICSEARCH_USERNAME", Some("elastic")),
                ("ELASTICSEARCH_PASSWORD", Some("changeme")),
            ],
            || {
                let config = ElasticsearchConfig::from_env().unwrap();
                assert_eq!(config.credentials(), Some(("elastic", Some("changeme"))));
            },
        );
    }
}
