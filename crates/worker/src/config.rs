//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use messaging::{ConsumerConfig, KafkaConfig};
use saga::{OrchestratorConfig, ReconcilerConfig, TerminalStartPolicy};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address of the HTTP endpoints (default `0.0.0.0:8080`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json`
/// - `DATABASE_URL`: PostgreSQL store; unset means in-memory
/// - `KAFKA_BROKERS`: Kafka bootstrap servers; unset means an in-memory
///   broker with simulated step executors
/// - `CONSUMER_GROUP`, `TOPIC_PREFIX`
/// - `PARTITION_WORKERS`, `MAX_DELIVERY_ATTEMPTS`
/// - `DEDUP_CAPACITY`, `DEDUP_TTL_SECS`
/// - `RECONCILE_INTERVAL_SECS`, `RECONCILE_BATCH_SIZE`
/// - `PENDING_TIMEOUT_SECS`: how long a saga may stay pending before the
///   reconciler starts it
/// - `DISPATCH_GRACE_SECS`: how long a command may stay unconfirmed before
///   the reconciler publishes it again
/// - `TERMINAL_START_POLICY`: `ignore` or `reject`
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub kafka_brokers: Option<String>,
    pub consumer_group: String,
    pub topic_prefix: String,
    pub partition_workers: usize,
    pub max_delivery_attempts: usize,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_batch_size: usize,
    pub pending_timeout: Duration,
    pub dispatch_grace: Duration,
    pub terminal_start_policy: TerminalStartPolicy,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_var(&lookup, "LOG_FORMAT").unwrap_or(defaults.log_format),
            database_url: non_empty("DATABASE_URL"),
            kafka_brokers: non_empty("KAFKA_BROKERS"),
            consumer_group: non_empty("CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            topic_prefix: lookup("TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
            partition_workers: parse_var(&lookup, "PARTITION_WORKERS")
                .unwrap_or(defaults.partition_workers),
            max_delivery_attempts: parse_var(&lookup, "MAX_DELIVERY_ATTEMPTS")
                .unwrap_or(defaults.max_delivery_attempts),
            dedup_capacity: parse_var(&lookup, "DEDUP_CAPACITY").unwrap_or(defaults.dedup_capacity),
            dedup_ttl: parse_var(&lookup, "DEDUP_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.dedup_ttl),
            reconcile_interval: parse_var(&lookup, "RECONCILE_INTERVAL_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_interval),
            reconcile_batch_size: parse_var(&lookup, "RECONCILE_BATCH_SIZE")
                .filter(|size: &usize| *size > 0)
                .unwrap_or(defaults.reconcile_batch_size),
            pending_timeout: parse_var(&lookup, "PENDING_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.pending_timeout),
            dispatch_grace: parse_var(&lookup, "DISPATCH_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.dispatch_grace),
            terminal_start_policy: parse_var(&lookup, "TERMINAL_START_POLICY")
                .unwrap_or(defaults.terminal_start_policy),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when no Kafka is configured and executors run in-process.
    pub fn simulate_executors(&self) -> bool {
        self.kafka_brokers.is_none()
    }

    pub fn consumer_config(&self, topics: Vec<String>) -> ConsumerConfig {
        ConsumerConfig {
            partition_workers: self.partition_workers,
            max_delivery_attempts: self.max_delivery_attempts,
            dedup_capacity: self.dedup_capacity,
            dedup_ttl: self.dedup_ttl,
            ..ConsumerConfig::new(topics)
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            terminal_start_policy: self.terminal_start_policy,
            dispatch_grace: self.dispatch_grace,
            ..OrchestratorConfig::default()
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            batch_size: self.reconcile_batch_size,
            pending_timeout: self.pending_timeout,
        }
    }

    /// Kafka client settings, if a broker list is configured.
    pub fn kafka_config(&self) -> Option<KafkaConfig> {
        self.kafka_brokers
            .as_deref()
            .map(|brokers| KafkaConfig::new(brokers, self.consumer_group.as_str()))
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|value| value.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            kafka_brokers: None,
            consumer_group: "saga-orchestrator".to_string(),
            topic_prefix: "booking".to_string(),
            partition_workers: 8,
            max_delivery_attempts: 5,
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(600),
            reconcile_interval: Duration::from_secs(5),
            reconcile_batch_size: 500,
            pending_timeout: Duration::from_secs(10),
            dispatch_grace: Duration::from_secs(5),
            terminal_start_policy: TerminalStartPolicy::Ignore,
        }
    }
}
