//! chatmq Client - message-queue engine for chat services
//!
//! This crate wraps a partitioned log broker with the machinery a chat backend
//! needs around it: a bounded connection pool, a batching producer with linger
//! and size triggers, a callback-driven consumer with pause/seek, and
//! group offset management with auto-commit.
//!
//! ```text
//!   Producer ──▶ BatchManager ──▶ sender ──┐
//!      │ send_sync                         ▼
//!      └──────────────────────────▶ ConnectionPool ──▶ BrokerConnector
//!                                          ▲
//!   Consumer ── fetch loop ── callback     │
//!      └── OffsetManager (auto-commit) ────┘
//! ```
//!
//! The broker wire protocol is not implemented here; plug one in through
//! [`BrokerConnector`] / [`BrokerClient`], or use [`MemoryBroker`] in-process.
//!
//! # Examples
//!
//! ## Producer
//!
//! ```ignore
//! use chatmq_client::{Mq, MqConfig, Record};
//!
//! let mq = Mq::connect(MqConfig::load("mq.toml")?, connector).await?;
//!
//! mq.producer()
//!     .send_sync(Record::new("chat.messages", body).with_key(room_id), Duration::from_secs(5))
//!     .await?;
//! ```
//!
//! ## Consumer
//!
//! ```ignore
//! use chatmq_client::{ConsumeAction, Message};
//!
//! let consumer = mq.consumer("message-persist").await?;
//! consumer
//!     .subscribe(&["chat.messages"], |msg: Message| {
//!         store(msg);
//!         ConsumeAction::Continue
//!     })
//!     .await?;
//! ```

pub mod batch;
pub mod broker;
pub mod codec;
pub mod config;
pub mod connection_pool;
pub mod consumer;
pub mod error;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod mq;
pub mod offset;
pub mod producer;
pub mod retry;

pub use batch::{BatchConfig, BatchManager, BatchSink, BatchStats};
pub use broker::{BrokerClient, BrokerConnector, Headers, OffsetSpec, TopicPartition};
pub use codec::{Codec, JsonSerializer};
pub use config::{
    Acks, CompressionType, ConsumerConfig, MqConfig, OffsetReset, PoolConfig, ProducerConfig,
};
pub use connection_pool::{ConnectionPool, PoolStats, PooledConnection};
pub use consumer::{ConsumeAction, Consumer, ConsumerBuilder, ConsumerMetrics, ConsumerState, Message};
pub use error::{MqError, Result};
pub use health::{HealthChecker, HealthRegistry, HealthStatus};
pub use memory::MemoryBroker;
pub use metrics::{InMemoryCollector, MetricsCollector, NoopCollector, PrometheusCollector};
pub use mq::Mq;
pub use offset::OffsetManager;
pub use producer::{Producer, ProducerBuilder, ProducerMetrics, Record, RecordMetadata};
pub use retry::{retry_with_backoff, retry_with_jittered_backoff, RetryPolicy};
