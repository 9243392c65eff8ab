//! Client configuration.
//!
//! All knobs live in [`MqConfig`], which deserializes from TOML. Every section
//! has a `Default`, and `#[serde(default)]` lets a file override only the fields
//! it cares about:
//!
//! ```toml
//! brokers = ["kafka-0:9092", "kafka-1:9092"]
//! client_id = "im-logic"
//!
//! [producer]
//! compression = "zstd"
//! linger_ms = 10
//!
//! [consumer]
//! group_id = "message-persist"
//! auto_offset_reset = "earliest"
//! ```
//!
//! Producer and consumer sections may name their own brokers and client id;
//! when left empty they inherit the top-level values (see
//! [`MqConfig::resolved_producer`] and [`MqConfig::resolved_consumer`]).
//!
//! Durations are stored as integer milliseconds and exposed as [`Duration`]
//! through accessor methods.

use crate::error::{MqError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_BROKER: &str = "localhost:19092";

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqConfig {
    /// Bootstrap broker addresses (`host:port`).
    pub brokers: Vec<String>,
    /// Client id reported to the broker.
    pub client_id: String,
    pub security: SecurityConfig,
    pub connection: ConnectionConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub pool: PoolConfig,
    pub performance: PerformanceConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            brokers: vec![DEFAULT_BROKER.to_string()],
            client_id: "chatmq-client".to_string(),
            security: SecurityConfig::default(),
            connection: ConnectionConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            pool: PoolConfig::default(),
            performance: PerformanceConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl MqConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: MqConfig = toml::from_str(s)?;
        Ok(config)
    }

    /// Load and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MqError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Serialize back to TOML (useful for dumping the effective config).
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| MqError::ConfigError(e.to_string()))
    }

    /// Check the connection-level settings and the pool.
    ///
    /// Producer and consumer settings are validated when those components
    /// are built, since a process may only use one of them.
    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(MqError::ConfigError("brokers must not be empty".into()));
        }
        if self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(MqError::ConfigError("broker address must not be blank".into()));
        }
        if self.client_id.is_empty() {
            return Err(MqError::ConfigError("client_id must not be empty".into()));
        }
        self.security.validate()?;
        self.pool.validate()?;
        Ok(())
    }

    /// Producer settings with brokers and client id inherited from the top level.
    pub fn resolved_producer(&self) -> ProducerConfig {
        let mut producer = self.producer.clone();
        if producer.brokers.is_empty() {
            producer.brokers = self.brokers.clone();
        }
        if producer.client_id.is_empty() {
            producer.client_id = format!("{}-producer", self.client_id);
        }
        producer
    }

    /// Consumer settings with brokers and client id inherited from the top level.
    pub fn resolved_consumer(&self) -> ConsumerConfig {
        let mut consumer = self.consumer.clone();
        if consumer.brokers.is_empty() {
            consumer.brokers = self.brokers.clone();
        }
        if consumer.client_id.is_empty() {
            consumer.client_id = format!("{}-consumer", self.client_id);
        }
        consumer
    }
}

/// Transport security protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub protocol: SecurityProtocol,
    pub sasl: SaslConfig,
    pub tls: TlsConfig,
}

impl SecurityConfig {
    fn validate(&self) -> Result<()> {
        match self.protocol {
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl => {
                if self.sasl.mechanism.is_empty() || self.sasl.username.is_empty() {
                    return Err(MqError::ConfigError(
                        "SASL protocol requires sasl.mechanism and sasl.username".into(),
                    ));
                }
            }
            SecurityProtocol::Plaintext | SecurityProtocol::Ssl => {}
        }
        if matches!(
            self.protocol,
            SecurityProtocol::Ssl | SecurityProtocol::SaslSsl
        ) && !self.tls.enabled
        {
            return Err(MqError::ConfigError(
                "SSL protocol requires tls.enabled = true".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SaslConfig {
    /// `PLAIN`, `SCRAM-SHA-256` or `SCRAM-SHA-512`.
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SaslConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslConfig")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
    pub insecure_skip_verify: bool,
}

/// Socket-level settings applied to every broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub dial_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub keep_alive_ms: u64,
    pub max_retries: usize,
    pub retry_backoff_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            keep_alive_ms: 7_000,
            max_retries: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl ConnectionConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Broker acknowledgment level for produced records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Do not wait for the broker to persist anything.
    None,
    /// Wait for the partition leader.
    Leader,
    /// Wait for every in-sync replica.
    #[default]
    All,
}

/// Payload compression codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Gzip,
    Snappy,
    #[default]
    Lz4,
    Zstd,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Snappy => "snappy",
            CompressionType::Lz4 => "lz4",
            CompressionType::Zstd => "zstd",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(CompressionType::None),
            "gzip" => Some(CompressionType::Gzip),
            "snappy" => Some(CompressionType::Snappy),
            "lz4" => Some(CompressionType::Lz4),
            "zstd" => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

/// Producer configuration.
///
/// # Defaults
///
/// - `batch_size_bytes`: 16 KiB
/// - `batch_max_records`: 100
/// - `linger_ms`: 5
/// - `max_message_bytes`: 1 MiB
/// - `acks`: all
/// - `enable_idempotence`: true
/// - `send_queue_capacity`: 10 batches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Overrides the top-level brokers when non-empty.
    pub brokers: Vec<String>,
    /// Overrides the top-level client id when non-empty.
    pub client_id: String,
    pub compression: CompressionType,
    /// Flush the open batch once its payload reaches this many bytes.
    pub batch_size_bytes: usize,
    /// Flush the open batch once it holds this many records.
    pub batch_max_records: usize,
    /// Maximum time a non-empty batch waits before it is flushed.
    pub linger_ms: u64,
    /// Per-record payload limit (key + value).
    pub max_message_bytes: usize,
    pub acks: Acks,
    pub request_timeout_ms: u64,
    pub enable_idempotence: bool,
    pub max_in_flight_requests: usize,
    pub retry_backoff_ms: u64,
    pub max_retries: usize,
    /// Batches waiting for the sender worker; further batches are dropped.
    pub send_queue_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            client_id: String::new(),
            compression: CompressionType::Lz4,
            batch_size_bytes: 16 * 1024,
            batch_max_records: 100,
            linger_ms: 5,
            max_message_bytes: 1024 * 1024,
            acks: Acks::All,
            request_timeout_ms: 30_000,
            enable_idempotence: true,
            max_in_flight_requests: 5,
            retry_backoff_ms: 100,
            max_retries: 3,
            send_queue_capacity: 10,
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size_bytes == 0 || self.batch_max_records == 0 {
            return Err(MqError::ConfigError(
                "producer batch thresholds must be positive".into(),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(MqError::ConfigError(
                "producer max_message_bytes must be positive".into(),
            ));
        }
        if self.send_queue_capacity == 0 {
            return Err(MqError::ConfigError(
                "producer send_queue_capacity must be positive".into(),
            ));
        }
        if self.max_in_flight_requests == 0 {
            return Err(MqError::ConfigError(
                "producer max_in_flight_requests must be positive".into(),
            ));
        }
        if self.enable_idempotence && self.acks != Acks::All {
            return Err(MqError::ConfigError(
                "idempotent producer requires acks = \"all\"".into(),
            ));
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Retry policy derived from `max_retries` and `retry_backoff_ms`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Where a consumer starts when its group has no committed offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
    /// Fail with `InvalidOffset`.
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadUncommitted,
    ReadCommitted,
}

/// Consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    /// Consumer group; required.
    pub group_id: String,
    pub auto_offset_reset: OffsetReset,
    pub enable_auto_commit: bool,
    pub auto_commit_interval_ms: u64,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Upper bound on records returned by one poll.
    pub max_poll_records: usize,
    pub max_poll_interval_ms: u64,
    pub fetch_min_bytes: usize,
    pub fetch_max_bytes: usize,
    /// Upper bound on how long one poll waits for data.
    pub fetch_max_wait_ms: u64,
    pub isolation_level: IsolationLevel,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            client_id: String::new(),
            group_id: String::new(),
            auto_offset_reset: OffsetReset::Latest,
            enable_auto_commit: true,
            auto_commit_interval_ms: 5_000,
            session_timeout_ms: 10_000,
            heartbeat_interval_ms: 3_000,
            max_poll_records: 500,
            max_poll_interval_ms: 300_000,
            fetch_min_bytes: 1,
            fetch_max_bytes: 50 * 1024 * 1024,
            fetch_max_wait_ms: 500,
            isolation_level: IsolationLevel::ReadUncommitted,
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(MqError::ConfigError("consumer client_id must not be empty".into()));
        }
        if self.group_id.is_empty() {
            return Err(MqError::ConfigError("consumer group_id must not be empty".into()));
        }
        if self.session_timeout_ms == 0 {
            return Err(MqError::ConfigError("session_timeout_ms must be positive".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(MqError::ConfigError("heartbeat_interval_ms must be positive".into()));
        }
        if self.heartbeat_interval_ms >= self.session_timeout_ms {
            return Err(MqError::ConfigError(
                "heartbeat_interval_ms must be smaller than session_timeout_ms".into(),
            ));
        }
        // A long poll at least as long as the request timeout would always time out.
        if self.fetch_max_wait_ms >= self.session_timeout_ms {
            return Err(MqError::ConfigError(
                "fetch_max_wait_ms must be smaller than session_timeout_ms".into(),
            ));
        }
        if self.max_poll_records == 0 {
            return Err(MqError::ConfigError("max_poll_records must be positive".into()));
        }
        if self.enable_auto_commit && self.auto_commit_interval_ms == 0 {
            return Err(MqError::ConfigError(
                "auto_commit_interval_ms must be positive when auto-commit is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms)
    }

    pub fn fetch_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_max_wait_ms)
    }
}

/// Connection pool sizing and lifetimes.
///
/// # Defaults
///
/// - `max_connections`: 10
/// - `min_idle_connections`: 2 (pre-warmed at startup)
/// - `max_idle_connections`: 5
/// - `connection_max_lifetime_ms`: 1 hour
/// - `connection_max_idle_time_ms`: 30 minutes
/// - `health_check_interval_ms`: 30 seconds (0 disables the background check)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub min_idle_connections: usize,
    pub max_idle_connections: usize,
    pub connection_max_lifetime_ms: u64,
    pub connection_max_idle_time_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_idle_connections: 2,
            max_idle_connections: 5,
            connection_max_lifetime_ms: 60 * 60 * 1000,
            connection_max_idle_time_ms: 30 * 60 * 1000,
            health_check_interval_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(MqError::ConfigError("pool.max_connections must be positive".into()));
        }
        if self.max_idle_connections < self.min_idle_connections {
            return Err(MqError::ConfigError(
                "pool.max_idle_connections must be >= min_idle_connections".into(),
            ));
        }
        if self.max_idle_connections > self.max_connections {
            return Err(MqError::ConfigError(
                "pool.max_idle_connections must be <= max_connections".into(),
            ));
        }
        Ok(())
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.connection_max_lifetime_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.connection_max_idle_time_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }
}

/// Tuning hints for small chat payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub target_latency_micros: u64,
    pub target_throughput_per_sec: u64,
    /// Skip compression for payloads below `small_message_threshold_bytes`.
    pub optimize_for_small_messages: bool,
    pub small_message_threshold_bytes: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            target_latency_micros: 1_000,
            target_throughput_per_sec: 100_000,
            optimize_for_small_messages: true,
            small_message_threshold_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    /// How often the producer and pool push snapshots to the collector.
    pub metrics_interval_ms: u64,
    pub enable_tracing: bool,
    /// Default filter for `chatmq_observability::logging::init`.
    pub log_level: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_interval_ms: 10_000,
            enable_tracing: false,
            log_level: "info".to_string(),
        }
    }
}

impl MonitoringConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MqConfig::default();
        config.validate().unwrap();
        config.resolved_producer().validate().unwrap();

        assert_eq!(config.brokers, vec!["localhost:19092".to_string()]);
        assert_eq!(config.producer.compression, CompressionType::Lz4);
        assert_eq!(config.producer.batch_size_bytes, 16384);
        assert_eq!(config.consumer.max_poll_records, 500);
        assert_eq!(config.pool.max_connections, 10);
    }

    #[test]
    fn test_consumer_requires_group_id() {
        let config = MqConfig::default();
        let err = config.resolved_consumer().validate().unwrap_err();
        assert!(matches!(err, MqError::ConfigError(_)));

        let mut config = MqConfig::default();
        config.consumer.group_id = "persist".into();
        config.resolved_consumer().validate().unwrap();
    }

    #[test]
    fn test_heartbeat_must_be_below_session_timeout() {
        let mut consumer = ConsumerConfig {
            brokers: vec!["b:1".into()],
            client_id: "c".into(),
            group_id: "g".into(),
            ..Default::default()
        };
        consumer.heartbeat_interval_ms = consumer.session_timeout_ms;
        assert!(consumer.validate().is_err());
    }

    #[test]
    fn test_fetch_wait_must_be_below_session_timeout() {
        let mut consumer = ConsumerConfig {
            brokers: vec!["b:1".into()],
            client_id: "c".into(),
            group_id: "g".into(),
            ..Default::default()
        };
        consumer.validate().unwrap();

        consumer.fetch_max_wait_ms = consumer.session_timeout_ms;
        let err = consumer.validate().unwrap_err();
        assert!(matches!(err, MqError::ConfigError(ref m) if m.contains("fetch_max_wait_ms")));

        consumer.session_timeout_ms = 60_000;
        consumer.heartbeat_interval_ms = 3_000;
        consumer.validate().unwrap();
    }

    #[test]
    fn test_pool_validation() {
        let mut pool = PoolConfig::default();
        pool.max_connections = 0;
        assert!(pool.validate().is_err());

        let pool = PoolConfig {
            max_connections: 4,
            min_idle_connections: 3,
            max_idle_connections: 2,
            ..Default::default()
        };
        assert!(pool.validate().is_err());

        let pool = PoolConfig {
            max_connections: 4,
            min_idle_connections: 1,
            max_idle_connections: 5,
            ..Default::default()
        };
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_idempotence_requires_acks_all() {
        let producer = ProducerConfig {
            brokers: vec!["b:1".into()],
            acks: Acks::Leader,
            ..Default::default()
        };
        assert!(producer.validate().is_err());

        let producer = ProducerConfig {
            enable_idempotence: false,
            ..producer
        };
        producer.validate().unwrap();
    }

    #[test]
    fn test_sub_configs_inherit_brokers_and_client_id() {
        let mut config = MqConfig::default();
        config.brokers = vec!["kafka-0:9092".into()];
        config.client_id = "im-logic".into();

        let producer = config.resolved_producer();
        assert_eq!(producer.brokers, vec!["kafka-0:9092".to_string()]);
        assert_eq!(producer.client_id, "im-logic-producer");

        config.consumer.brokers = vec!["other:9092".into()];
        config.consumer.client_id = "explicit".into();
        let consumer = config.resolved_consumer();
        assert_eq!(consumer.brokers, vec!["other:9092".to_string()]);
        assert_eq!(consumer.client_id, "explicit");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MqConfig::from_toml_str(
            r#"
            brokers = ["kafka-0:9092", "kafka-1:9092"]

            [producer]
            compression = "zstd"
            linger_ms = 20

            [consumer]
            group_id = "persist"
            auto_offset_reset = "earliest"

            [security]
            protocol = "SASL_PLAINTEXT"

            [security.sasl]
            mechanism = "PLAIN"
            username = "svc"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.producer.compression, CompressionType::Zstd);
        assert_eq!(config.producer.linger(), Duration::from_millis(20));
        assert_eq!(config.producer.batch_max_records, 100);
        assert_eq!(config.consumer.auto_offset_reset, OffsetReset::Earliest);
        assert_eq!(config.security.protocol, SecurityProtocol::SaslPlaintext);
        assert!(!format!("{:?}", config.security.sasl).contains("secret"));
        config.validate().unwrap();
    }

    #[test]
    fn test_sasl_protocol_requires_credentials() {
        let mut config = MqConfig::default();
        config.security.protocol = SecurityProtocol::SaslSsl;
        config.security.tls.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = MqConfig::from_toml_str("brokers = 7").unwrap_err();
        assert!(matches!(err, MqError::ConfigError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mq.toml");

        let mut config = MqConfig::default();
        config.client_id = "persist-worker".into();
        config.pool.max_connections = 3;
        config.pool.max_idle_connections = 3;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = MqConfig::load(&path).unwrap();
        assert_eq!(loaded.client_id, "persist-worker");
        assert_eq!(loaded.pool.max_connections, 3);

        let missing = MqConfig::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, MqError::ConfigError(_)));
    }
}
