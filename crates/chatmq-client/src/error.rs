//! Error types for chatmq client operations.
//!
//! Every fallible operation in the pool, producer, offset manager and consumer
//! returns [`MqError`]. Errors carry enough context (operation, topic, partition,
//! wrapped cause) to be logged without the caller adding anything.
//!
//! ## Error Handling Strategy
//!
//! - **Retryable errors**: `ConnectionFailed`, `PoolExhausted`, `Timeout`, `RebalanceInProgress`
//! - **Fatal errors**: `AuthenticationFailed`, `AuthorizationFailed`, `ConfigError`,
//!   `InvalidTopic`, `InvalidPartition`
//! - **Caller errors**: `MessageTooLarge`, `ReservedHeader`, `ProducerClosed`, `ConsumerClosed`,
//!   `PoolClosed`
//! - **Everything else** surfaces as-is after the first attempt
//!
//! ## Examples
//!
//! ```ignore
//! use chatmq_client::{MqError, Record};
//!
//! match producer.send_sync(record, Duration::from_secs(5)).await {
//!     Ok(ack) => println!("stored at {}/{}", ack.partition, ack.offset),
//!     Err(MqError::MessageTooLarge { size, max, .. }) => {
//!         eprintln!("payload of {} bytes exceeds {}", size, max);
//!     }
//!     Err(e) if e.is_retryable() => eprintln!("transient failure: {}", e),
//!     Err(e) => eprintln!("fatal: {}", e),
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Convenience type alias for `Result<T, MqError>`.
///
/// All public APIs of the client return this type.
pub type Result<T> = std::result::Result<T, MqError>;

/// Error type for chatmq client operations.
///
/// ## Error Categories
///
/// - **Configuration**: `ConfigError`
/// - **Connection**: `ConnectionFailed`, `PoolExhausted`, `PoolClosed`, `Timeout`
/// - **Producer**: `ProducerClosed`, `ProduceFailed`, `MessageTooLarge`, `ReservedHeader`,
///   `SendQueueFull`
/// - **Consumer**: `ConsumerClosed`, `ConsumeFailed`, `OffsetCommitFailed`, `RebalanceInProgress`
/// - **Codec**: `SerializationFailed`, `DeserializationFailed`, `CompressionFailed`,
///   `DecompressionFailed`
/// - **Security**: `AuthenticationFailed`, `AuthorizationFailed`
/// - **Routing**: `InvalidTopic`, `InvalidPartition`, `InvalidOffset`
/// - **Unknown**: `Internal`
#[derive(Debug, Clone, Error)]
pub enum MqError {
    /// Invalid client configuration.
    ///
    /// ## Causes
    /// - Empty broker list or client id
    /// - Pool sizing violates `min_idle <= max_idle <= max`
    /// - Heartbeat interval not smaller than the session timeout
    ///
    /// ## Resolution
    /// - Review the TOML file or builder calls
    /// - Run `MqConfig::validate()` at startup
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Failed to dial or talk to a broker.
    ///
    /// ## Causes
    /// - Broker is down or restarting
    /// - Network partition
    /// - Connection was closed underneath us
    ///
    /// ## Resolution
    /// - Retried automatically with backoff
    /// - Check broker reachability if it keeps happening
    #[error("Connection failed during {operation}: {cause}")]
    ConnectionFailed { operation: String, cause: String },

    /// Every pooled connection is in use and the pool is at its maximum.
    ///
    /// Borrowing never queues behind other borrowers; it fails fast so the
    /// caller can back off.
    ///
    /// ## Resolution
    /// - Increase `pool.max_connections`
    /// - Release connections sooner
    #[error("Connection pool exhausted ({max} connections in use)")]
    PoolExhausted { max: usize },

    /// The pool was closed; no further connections are handed out.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Operation exceeded its deadline.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    /// The producer was closed; sends are rejected.
    #[error("Producer is closed")]
    ProducerClosed,

    /// The broker rejected a produce request.
    #[error("Produce to '{topic}' failed: {cause}")]
    ProduceFailed { topic: String, cause: String },

    /// Record payload exceeds `producer.max_message_bytes`.
    ///
    /// ## Resolution
    /// - Split the payload
    /// - Enable compression
    /// - Raise the limit on both client and broker
    #[error("Message for topic '{topic}' is {size} bytes, exceeding the {max} byte limit")]
    MessageTooLarge {
        topic: String,
        size: usize,
        max: usize,
    },

    /// The record carries a header name the client reserves for itself.
    #[error("Header '{name}' on a record for topic '{topic}' is reserved")]
    ReservedHeader { topic: String, name: String },

    /// The producer's send queue was saturated and a batch was dropped.
    ///
    /// Only delivered to records sent with a callback; fire-and-forget records
    /// are dropped with a warning log.
    #[error("Send queue full, batch of {records} record(s) dropped")]
    SendQueueFull { records: usize },

    /// The consumer was closed.
    #[error("Consumer is closed")]
    ConsumerClosed,

    /// A fetch from the broker failed.
    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    /// Committing offsets to the broker failed.
    ///
    /// Pending offsets stay pending and are retried on the next commit.
    #[error("Offset commit failed for {partitions} partition(s): {cause}")]
    OffsetCommitFailed { partitions: usize, cause: String },

    /// The consumer group is rebalancing.
    #[error("Consumer group rebalance in progress")]
    RebalanceInProgress,

    /// Payload serialization failed.
    #[error("Serialization error: {0}")]
    SerializationFailed(String),

    /// Payload deserialization failed.
    #[error("Deserialization error: {0}")]
    DeserializationFailed(String),

    /// Compression with the named codec failed.
    #[error("{codec} compression failed: {cause}")]
    CompressionFailed { codec: String, cause: String },

    /// Decompression with the named codec failed.
    ///
    /// ## Causes
    /// - Corrupted payload
    /// - Header names a codec the payload was not encoded with
    #[error("{codec} decompression failed: {cause}")]
    DecompressionFailed { codec: String, cause: String },

    /// SASL or TLS handshake rejected the client.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The client is not allowed to perform the operation.
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Topic name is empty or unknown to the broker.
    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    /// Partition does not exist for the topic.
    #[error("Partition {partition} does not exist for topic '{topic}'")]
    InvalidPartition { topic: String, partition: i32 },

    /// No valid offset to start from (e.g. reset policy `none` without a commit).
    #[error("Invalid offset for {topic}/{partition}: {reason}")]
    InvalidOffset {
        topic: String,
        partition: i32,
        reason: String,
    },

    /// Internal error that shouldn't normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MqError {
    /// Stable, upper-case code used as a metric label and in structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            MqError::ConfigError(_) => "INVALID_CONFIG",
            MqError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            MqError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            MqError::PoolClosed => "CONNECTION_CLOSED",
            MqError::Timeout { .. } => "TIMEOUT",
            MqError::ProducerClosed => "PRODUCER_CLOSED",
            MqError::ProduceFailed { .. } => "PRODUCE_FAILED",
            MqError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            MqError::ReservedHeader { .. } => "RESERVED_HEADER",
            MqError::SendQueueFull { .. } => "SEND_QUEUE_FULL",
            MqError::ConsumerClosed => "CONSUMER_CLOSED",
            MqError::ConsumeFailed(_) => "CONSUME_FAILED",
            MqError::OffsetCommitFailed { .. } => "OFFSET_COMMIT_FAILED",
            MqError::RebalanceInProgress => "REBALANCE_IN_PROGRESS",
            MqError::SerializationFailed(_) => "SERIALIZATION_FAILED",
            MqError::DeserializationFailed(_) => "DESERIALIZATION_FAILED",
            MqError::CompressionFailed { .. } => "COMPRESSION_FAILED",
            MqError::DecompressionFailed { .. } => "DECOMPRESSION_FAILED",
            MqError::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            MqError::AuthorizationFailed(_) => "AUTHORIZATION_FAILED",
            MqError::InvalidTopic(_) => "INVALID_TOPIC",
            MqError::InvalidPartition { .. } => "INVALID_PARTITION",
            MqError::InvalidOffset { .. } => "INVALID_OFFSET",
            MqError::Internal(_) => "INTERNAL",
        }
    }

    /// Transient failures that may succeed if the operation is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MqError::ConnectionFailed { .. }
                | MqError::PoolExhausted { .. }
                | MqError::Timeout { .. }
                | MqError::RebalanceInProgress
        )
    }

    /// Failures that will not go away without operator intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MqError::AuthenticationFailed(_)
                | MqError::AuthorizationFailed(_)
                | MqError::ConfigError(_)
                | MqError::InvalidTopic(_)
                | MqError::InvalidPartition { .. }
        )
    }

    pub(crate) fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        MqError::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    pub(crate) fn connection(operation: impl Into<String>, cause: impl ToString) -> Self {
        MqError::ConnectionFailed {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

impl From<toml::de::Error> for MqError {
    fn from(e: toml::de::Error) -> Self {
        MqError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MqError::connection("produce", "reset by peer").is_retryable());
        assert!(MqError::PoolExhausted { max: 2 }.is_retryable());
        assert!(MqError::timeout("borrow", Duration::from_millis(10)).is_retryable());
        assert!(MqError::RebalanceInProgress.is_retryable());

        assert!(!MqError::ProducerClosed.is_retryable());
        assert!(!MqError::AuthenticationFailed("bad password".into()).is_retryable());
        assert!(!MqError::MessageTooLarge {
            topic: "t".into(),
            size: 10,
            max: 5
        }
        .is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MqError::AuthorizationFailed("acl".into()).is_fatal());
        assert!(MqError::ConfigError("brokers".into()).is_fatal());
        assert!(MqError::InvalidPartition {
            topic: "t".into(),
            partition: 9
        }
        .is_fatal());
        assert!(!MqError::PoolClosed.is_fatal());
        assert!(!MqError::connection("ping", "eof").is_fatal());
    }

    #[test]
    fn test_retryable_and_fatal_are_disjoint() {
        let errors = vec![
            MqError::ConfigError("x".into()),
            MqError::connection("x", "y"),
            MqError::PoolExhausted { max: 1 },
            MqError::timeout("x", Duration::ZERO),
            MqError::RebalanceInProgress,
            MqError::AuthenticationFailed("x".into()),
            MqError::InvalidTopic("x".into()),
        ];
        for e in errors {
            assert!(!(e.is_retryable() && e.is_fatal()), "{} is both", e.code());
        }
    }

    #[test]
    fn test_display_carries_context() {
        let e = MqError::MessageTooLarge {
            topic: "chat.messages".into(),
            size: 2_000_000,
            max: 1_048_576,
        };
        let msg = e.to_string();
        assert!(msg.contains("chat.messages"));
        assert!(msg.contains("2000000"));
        assert_eq!(e.code(), "MESSAGE_TOO_LARGE");
    }
}
