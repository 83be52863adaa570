//! Shared test utilities
//!
//! - `TestRabbitMq`: RabbitMQ container with automatic cleanup (feature: "rabbitmq")
//! - `TestDataBuilder`: Deterministic names for exchanges and events (always available)
//!
//! # Features
//!
//! - `rabbitmq` (default): Enables RabbitMQ test infrastructure
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRabbitMq};
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn my_broker_test() {
//!     let rabbit = TestRabbitMq::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_broker_test");
//!
//!     let entity = builder.entity("link");
//!     rabbit.declare_topic_exchange(&entity).await;
//! }
//! ```

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

/// Builder for test data with deterministic randomization
///
/// Tests sharing one broker get distinct exchanges and queues, and a rerun
/// of the same test produces the same names.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_link_redirect");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Entity token usable as an exchange name and routing-key segment
    ///
    /// Lower-case, no dots or dashes, so it survives topic resolution unchanged.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(42);
    /// assert_eq!(builder.entity("link"), "link42");
    /// ```
    pub fn entity(&self, base: &str) -> String {
        format!("{}{}", base.to_lowercase(), self.seed % 1_000_000)
    }

    /// Generate a unique name for testing, e.g. `test-consumer-12345-main`
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.entity("link"), builder2.entity("link"));
        assert_eq!(
            builder1.name("consumer", "test"),
            builder2.name("consumer", "test")
        );
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.name("consumer", "a"), builder2.name("consumer", "a"));
    }

    #[test]
    fn test_entity_has_no_separators() {
        let entity = TestDataBuilder::from_test_name("anything").entity("User");
        assert!(entity.starts_with("user"));
        assert!(!entity.contains('.') && !entity.contains('-'));
    }
}
