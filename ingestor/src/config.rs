use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use envconfig::Envconfig;
use thiserror::Error;
use tracing::Level;

use crate::model::WireEncoding;
use crate::publisher::retry::RetryPolicy;
use crate::publisher::{OverloadMode, PartitionKey, PublisherConfig};
use crate::validator::ValidationRules;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "ingestor")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub log_level: Level,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub github: GithubConfig,

    #[envconfig(default = "event_id")]
    pub partition_key: PartitionKey,

    #[envconfig(default = "4")]
    pub publish_max_attempts: u32, // Total attempts, the first one included

    #[envconfig(default = "100")]
    pub publish_backoff_initial_ms: u64,

    #[envconfig(default = "2000")]
    pub publish_backoff_max_ms: u64,

    #[envconfig(default = "2")]
    pub publish_backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub publish_max_in_flight: usize,

    #[envconfig(default = "block")]
    pub overload_mode: OverloadMode,

    #[envconfig(default = "250")]
    pub publish_acquire_timeout_ms: u64,

    #[envconfig(default = "5")]
    pub deferred_retry_after_secs: u64,

    #[envconfig(default = "600")]
    pub dedup_window_secs: u64,

    pub dedup_max_entries: Option<usize>,

    #[envconfig(default = "300")]
    pub max_timestamp_skew_secs: u64,

    #[envconfig(default = "1")]
    pub schema_versions: String, // Comma-delimited allow-list

    pub schema_catalog_path: Option<String>,

    #[envconfig(default = "1048576")]
    pub max_body_bytes: usize,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
    #[envconfig(default = "1000000")]
    pub kafka_producer_message_max_bytes: u32, // message.max.bytes - max kafka message size we will produce
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    #[envconfig(default = "")]
    pub kafka_hosts: String,
    #[envconfig(default = "events_ingestion")]
    pub kafka_topic: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
    #[envconfig(default = "")]
    pub kafka_client_id: String,
    #[envconfig(default = "all")]
    pub kafka_producer_acks: String,
    #[envconfig(default = "json")]
    pub kafka_encoding: WireEncoding,
}

// Upper bound for DEDUP_WINDOW_SECS and MAX_TIMESTAMP_SKEW_SECS: one year
const MAX_TIME_SPAN_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Envconfig, Clone)]
pub struct GithubConfig {
    #[envconfig(default = "false")]
    pub github_feed: bool, // Poll the GitHub public events API as an upstream producer
    pub github_token: Option<String>,
    #[envconfig(default = "https://api.github.com")]
    pub github_api_url: String,
    #[envconfig(default = "5000")]
    pub github_poll_interval_ms: u64, // Delay between the end of one poll and the next
    #[envconfig(default = "10000")]
    pub github_request_timeout_ms: u64,
}

impl GithubConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.github_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.github_request_timeout_ms)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("PUBLISH_MAX_ATTEMPTS must be at least 1")]
    NoAttempts,
    #[error("PUBLISH_MAX_IN_FLIGHT must be at least 1")]
    NoInFlightCapacity,
    #[error("DEDUP_WINDOW_SECS must be at least 1")]
    NoDedupWindow,
    #[error("{name} is {secs}s, the longest supported span is {max_secs}s")]
    SpanTooLong {
        name: &'static str,
        secs: u64,
        max_secs: u64,
    },
    #[error("DEDUP_MAX_ENTRIES must be at least 1 when set")]
    NoDedupCapacity,
    #[error("invalid SCHEMA_VERSIONS '{0}': expected comma-separated positive integers")]
    InvalidSchemaVersions(String),
    #[error("KAFKA_HOSTS is required unless PRINT_SINK is enabled")]
    MissingKafkaHosts,
    #[error("GITHUB_TOKEN is required when GITHUB_FEED is enabled")]
    MissingGithubToken,
    #[error("GITHUB_POLL_INTERVAL_MS must be at least 1")]
    NoPollInterval,
    #[error("PUBLISH_BACKOFF_INITIAL_MS ({initial_ms}) is larger than PUBLISH_BACKOFF_MAX_MS ({max_ms})")]
    BackoffInverted { initial_ms: u64, max_ms: u64 },
}

impl Config {
    /// Checks the relations between options that envconfig cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.publish_max_in_flight == 0 {
            return Err(ConfigError::NoInFlightCapacity);
        }
        if self.dedup_window_secs == 0 {
            return Err(ConfigError::NoDedupWindow);
        }
        for (name, secs) in [
            ("DEDUP_WINDOW_SECS", self.dedup_window_secs),
            ("MAX_TIMESTAMP_SKEW_SECS", self.max_timestamp_skew_secs),
        ] {
            if secs > MAX_TIME_SPAN_SECS {
                return Err(ConfigError::SpanTooLong {
                    name,
                    secs,
                    max_secs: MAX_TIME_SPAN_SECS,
                });
            }
        }
        if self.dedup_max_entries == Some(0) {
            return Err(ConfigError::NoDedupCapacity);
        }
        self.allowed_versions()?;
        if !self.print_sink && self.kafka.kafka_hosts.trim().is_empty() {
            return Err(ConfigError::MissingKafkaHosts);
        }
        if self.github.github_feed {
            let token = self.github.github_token.as_deref().unwrap_or_default();
            if token.trim().is_empty() {
                return Err(ConfigError::MissingGithubToken);
            }
            if self.github.github_poll_interval_ms == 0 {
                return Err(ConfigError::NoPollInterval);
            }
        }
        if self.publish_backoff_initial_ms > self.publish_backoff_max_ms {
            return Err(ConfigError::BackoffInverted {
                initial_ms: self.publish_backoff_initial_ms,
                max_ms: self.publish_backoff_max_ms,
            });
        }
        Ok(())
    }

    pub fn allowed_versions(&self) -> Result<BTreeSet<u32>, ConfigError> {
        let invalid = || ConfigError::InvalidSchemaVersions(self.schema_versions.clone());
        let versions = self
            .schema_versions
            .split(',')
            .map(|version| match version.trim().parse::<u32>() {
                Ok(version) if version > 0 => Ok(version),
                _ => Err(invalid()),
            })
            .collect::<Result<BTreeSet<u32>, ConfigError>>()?;
        if versions.is_empty() {
            return Err(invalid());
        }
        Ok(versions)
    }

    pub fn validation_rules(&self) -> Result<ValidationRules, ConfigError> {
        Ok(ValidationRules {
            max_skew: time::Duration::seconds(
                i64::try_from(self.max_timestamp_skew_secs).unwrap_or(i64::MAX),
            ),
            allowed_versions: self.allowed_versions()?,
        })
    }

    pub fn dedup_window(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.dedup_window_secs).unwrap_or(i64::MAX))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.publish_max_attempts,
            self.publish_backoff_coefficient,
            Duration::from_millis(self.publish_backoff_initial_ms),
            Duration::from_millis(self.publish_backoff_max_ms),
        )
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            topic: self.kafka.kafka_topic.clone(),
            encoding: self.kafka.kafka_encoding,
            partition_key: self.partition_key,
            retry: self.retry_policy(),
            max_in_flight: self.publish_max_in_flight,
            overload_mode: self.overload_mode,
            acquire_timeout: Duration::from_millis(self.publish_acquire_timeout_ms),
        }
    }

    pub fn deferred_retry_after(&self) -> Duration {
        Duration::from_secs(self.deferred_retry_after_secs)
    }

    /// Longest a publication can take before it settles: waiting for a slot,
    /// every attempt timing out and every backoff sleep.
    pub fn publication_budget(&self) -> Duration {
        let per_attempt = Duration::from_millis(u64::from(self.kafka.kafka_message_timeout_ms));
        Duration::from_millis(self.publish_acquire_timeout_ms)
            + per_attempt.saturating_mul(self.publish_max_attempts)
            + self.retry_policy().total_backoff()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let mut env: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        env.entry("KAFKA_HOSTS".to_string())
            .or_insert_with(|| "kafka:9092".to_string());
        Config::init_from_hashmap(&env).expect("config should parse")
    }

    #[test]
    fn defaults() {
        let config = config(&[]);
        assert_eq!(config.address.to_string(), "127.0.0.1:3000");
        assert_eq!(config.kafka.kafka_topic, "events_ingestion");
        assert_eq!(config.kafka.kafka_encoding, WireEncoding::Json);
        assert_eq!(config.partition_key, PartitionKey::EventId);
        assert_eq!(config.overload_mode, OverloadMode::Block);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.dedup_max_entries, None);
        assert_eq!(config.allowed_versions(), Ok(BTreeSet::from([1])));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn parses_enums() {
        let config = config(&[
            ("PARTITION_KEY", "source"),
            ("OVERLOAD_MODE", "reject"),
            ("KAFKA_ENCODING", "json-gzip"),
            ("SCHEMA_VERSIONS", "1, 2,3"),
        ]);
        assert_eq!(config.partition_key, PartitionKey::Source);
        assert_eq!(config.overload_mode, OverloadMode::Reject);
        assert_eq!(config.kafka.kafka_encoding, WireEncoding::JsonGzip);
        assert_eq!(config.allowed_versions(), Ok(BTreeSet::from([1, 2, 3])));

        let env = HashMap::from([("OVERLOAD_MODE".to_string(), "drop".to_string())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let cases = [
            (("PUBLISH_MAX_ATTEMPTS", "0"), ConfigError::NoAttempts),
            (("PUBLISH_MAX_IN_FLIGHT", "0"), ConfigError::NoInFlightCapacity),
            (("DEDUP_WINDOW_SECS", "0"), ConfigError::NoDedupWindow),
            (
                ("DEDUP_WINDOW_SECS", "9223372036854775807"),
                ConfigError::SpanTooLong {
                    name: "DEDUP_WINDOW_SECS",
                    secs: 9223372036854775807,
                    max_secs: 31_536_000,
                },
            ),
            (
                ("MAX_TIMESTAMP_SKEW_SECS", "31536001"),
                ConfigError::SpanTooLong {
                    name: "MAX_TIMESTAMP_SKEW_SECS",
                    secs: 31_536_001,
                    max_secs: 31_536_000,
                },
            ),
            (("DEDUP_MAX_ENTRIES", "0"), ConfigError::NoDedupCapacity),
            (
                ("SCHEMA_VERSIONS", "1,two"),
                ConfigError::InvalidSchemaVersions("1,two".to_string()),
            ),
            (
                ("SCHEMA_VERSIONS", ""),
                ConfigError::InvalidSchemaVersions("".to_string()),
            ),
            (("KAFKA_HOSTS", " "), ConfigError::MissingKafkaHosts),
            (
                ("PUBLISH_BACKOFF_INITIAL_MS", "5000"),
                ConfigError::BackoffInverted {
                    initial_ms: 5000,
                    max_ms: 2000,
                },
            ),
        ];
        for ((key, value), expected) in cases {
            assert_eq!(config(&[(key, value)]).validate(), Err(expected), "{key}");
        }
    }

    #[test]
    fn github_feed_needs_a_token() {
        let missing = config(&[("GITHUB_FEED", "true")]);
        assert_eq!(missing.validate(), Err(ConfigError::MissingGithubToken));

        let blank = config(&[("GITHUB_FEED", "true"), ("GITHUB_TOKEN", "  ")]);
        assert_eq!(blank.validate(), Err(ConfigError::MissingGithubToken));

        let busy = config(&[
            ("GITHUB_FEED", "true"),
            ("GITHUB_TOKEN", "ghp_test"),
            ("GITHUB_POLL_INTERVAL_MS", "0"),
        ]);
        assert_eq!(busy.validate(), Err(ConfigError::NoPollInterval));

        let feed = config(&[("GITHUB_FEED", "true"), ("GITHUB_TOKEN", "ghp_test")]);
        assert_eq!(feed.validate(), Ok(()));
        assert_eq!(feed.github.github_api_url, "https://api.github.com");
        assert_eq!(feed.github.poll_interval(), Duration::from_secs(5));

        // The token only matters when the feed runs
        assert_eq!(config(&[]).validate(), Ok(()));
    }

    #[test]
    fn print_sink_needs_no_kafka() {
        let config = config(&[("PRINT_SINK", "true"), ("KAFKA_HOSTS", "")]);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn publication_budget_covers_every_attempt() {
        let config = config(&[("KAFKA_MESSAGE_TIMEOUT_MS", "1000")]);
        // 250ms slot wait, 4 x 1s attempts, 100 + 200 + 400ms of backoff
        assert_eq!(config.publication_budget(), Duration::from_millis(4950));
    }
}
