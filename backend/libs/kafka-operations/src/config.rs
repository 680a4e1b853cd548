//! Layered configuration.
//!
//! Sources, lowest priority first:
//! 1. built-in defaults
//! 2. optional TOML file
//! 3. environment variables prefixed with `KAFKA_OPS`, sections separated by
//!    `__` (e.g. `KAFKA_OPS__PRODUCER__INTERVAL_SECONDS=30`)
//!
//! `topics` and `kafka.brokers` accept comma-separated lists from the
//! environment. A `.env` file is loaded first when present.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::{Validate, ValidationError};

use crate::error::ConfigError;

const ENV_PREFIX: &str = "KAFKA_OPS";

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct Settings {
    #[serde(default)]
    #[validate(nested)]
    pub kafka: KafkaSettings,

    /// Topic set, in the order topics are created
    #[serde(default)]
    #[validate(custom(function = "validate_topic_names"))]
    pub topics: Vec<String>,

    #[serde(default)]
    #[validate(nested)]
    pub producer: ProducerSchedule,
}

/// Kafka connection settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct KafkaSettings {
    /// Bootstrap servers
    #[validate(length(min = 1))]
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    #[validate(length(min = 1, max = 255))]
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Consumer group
    #[validate(length(min = 1, max = 255))]
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Partitions for topics created by `ensure_topics`
    #[validate(range(min = 1))]
    #[serde(default = "default_partitions")]
    pub partitions: i32,

    #[validate(range(min = 1))]
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,

    /// Pause after a failed receive before polling again
    #[serde(default = "default_receive_backoff")]
    pub receive_backoff_ms: u64,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_client_id() -> String {
    "kafka-operations".to_string()
}

fn default_group_id() -> String {
    "kafka-operations".to_string()
}

fn default_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i32 {
    1
}

fn default_request_timeout() -> u64 {
    30
}

fn default_delivery_timeout() -> u64 {
    30
}

fn default_receive_backoff() -> u64 {
    5000
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            client_id: default_client_id(),
            group_id: default_group_id(),
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
            request_timeout_secs: default_request_timeout(),
            delivery_timeout_secs: default_delivery_timeout(),
            receive_backoff_ms: default_receive_backoff(),
        }
    }
}

impl KafkaSettings {
    /// Bootstrap servers as a comma-separated string
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn receive_backoff(&self) -> Duration {
        Duration::from_millis(self.receive_backoff_ms)
    }
}

/// Timing of the periodic producer.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ProducerSchedule {
    /// Wait before the first cycle
    #[serde(default)]
    pub delay_seconds: u64,

    /// Wait between the end of one cycle and the start of the next
    #[validate(range(min = 1))]
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
}

fn default_interval() -> u64 {
    60
}

impl Default for ProducerSchedule {
    fn default() -> Self {
        Self {
            delay_seconds: 0,
            interval_seconds: default_interval(),
        }
    }
}

impl ProducerSchedule {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

fn validate_topic_names(topics: &[String]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for topic in topics {
        if topic.trim().is_empty() {
            return Err(ValidationError::new("blank_topic"));
        }
        if !seen.insert(topic.as_str()) {
            let mut err = ValidationError::new("duplicate_topic");
            err.add_param("topic".into(), topic);
            return Err(err);
        }
    }
    Ok(())
}

impl Settings {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment, then validate it.
    ///
    /// A `config_path` that does not exist is skipped.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            if path.exists() {
                debug!(path = %path.display(), "Loading configuration file");
                builder = builder.add_source(config::File::from(path));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("topics")
                .with_list_parse_key("kafka.brokers")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();

        assert!(settings.validate().is_ok());
        assert_eq!(settings.kafka.bootstrap_servers(), "localhost:9092");
        assert_eq!(settings.producer.delay(), Duration::ZERO);
        assert_eq!(settings.producer.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_toml() {
        let settings = Settings::from_toml_str(
            r#"
            topics = ["users", "orders"]

            [kafka]
            brokers = ["k1:9092", "k2:9092"]
            group_id = "inventory"
            partitions = 6

            [producer]
            delay_seconds = 5
            interval_seconds = 30
            "#,
        )
        .unwrap();

        assert_eq!(settings.topics, vec!["users", "orders"]);
        assert_eq!(settings.kafka.bootstrap_servers(), "k1:9092,k2:9092");
        assert_eq!(settings.kafka.group_id, "inventory");
        assert_eq!(settings.kafka.partitions, 6);
        assert_eq!(settings.kafka.replication_factor, 1);
        assert_eq!(settings.producer.delay(), Duration::from_secs(5));
        assert_eq!(settings.producer.interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_duplicate_topics_rejected() {
        let result = Settings::from_toml_str(r#"topics = ["users", "users"]"#);

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_blank_topic_rejected() {
        let result = Settings::from_toml_str(r#"topics = ["users", "  "]"#);

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = Settings::from_toml_str(
            r#"
            [producer]
            interval_seconds = 0
            "#,
        );

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_toml() {
        let result = Settings::from_toml_str("topics = [");

        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_load_file_with_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            topics = ["products"]

            [kafka]
            client_id = "from-file"
            "#
        )
        .unwrap();

        std::env::set_var("KAFKA_OPS__KAFKA__CLIENT_ID", "from-env");
        let settings = Settings::load(Some(file.path())).unwrap();
        std::env::remove_var("KAFKA_OPS__KAFKA__CLIENT_ID");

        assert_eq!(settings.topics, vec!["products"]);
        assert_eq!(settings.kafka.client_id, "from-env");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let settings = Settings::load(Some(Path::new("/nonexistent/kafka-ops.toml"))).unwrap();

        assert_eq!(settings.producer.interval_seconds, 60);
    }
}
