//! Broker client seam.
//!
//! The engine never speaks the broker wire protocol itself. Framing, group
//! membership and rebalancing belong to an underlying broker client, which the
//! engine reaches through two traits:
//!
//! - [`BrokerConnector`] dials new connections (used by the pool)
//! - [`BrokerClient`] is one live connection
//!
//! ```text
//! ConnectionPool ──connect()──▶ BrokerConnector
//!        │
//!        ▼ Box<dyn BrokerClient>
//!   Producer:  produce()
//!   Consumer:  fetch(), list_offset(), partitions()
//!   Offsets:   commit_offsets(), committed_offsets()
//!   Pool:      ping(), close()
//! ```
//!
//! [`crate::memory::MemoryBroker`] implements both traits in-process.

use crate::config::Acks;
use crate::error::Result;
use crate::producer::Record;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Record headers (string name to opaque bytes).
pub type Headers = HashMap<String, Bytes>;

/// A `(topic, partition)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// One produce request; records may span topics and partitions.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    /// Set when idempotent publishing is enabled.
    pub producer_id: Option<u64>,
    /// Sequence of the first record; record `i` carries `base_sequence + i`.
    pub base_sequence: u64,
    pub acks: Acks,
    pub timeout: Duration,
    pub records: Vec<Record>,
}

/// Where a produced record landed.
///
/// `offset` is `-1` when the request was sent with `Acks::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAck {
    pub partition: i32,
    pub offset: i64,
}

/// Per-record outcome of a produce request, in request order.
pub type ProduceResponse = Vec<Result<RecordAck>>;

/// A record as read back from a partition log.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Fetch starting at the given positions.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Next offset to read, per partition.
    pub positions: Vec<(TopicPartition, i64)>,
    pub max_records: usize,
    /// Return early with nothing if no data arrives within this window.
    pub max_wait: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    /// Records in log order within each partition.
    pub records: Vec<FetchedRecord>,
    /// Log end offset of every requested partition.
    pub high_watermarks: HashMap<TopicPartition, i64>,
}

/// Offset lookup target for `list_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    Earliest,
    Latest,
}

/// One live broker connection.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connection id, for logs.
    fn id(&self) -> u64;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Publish records. The outer error means the whole request failed; inner
    /// errors are per-record rejections.
    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse>;

    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;

    /// Commit `next offset to consume` per partition for a group.
    async fn commit_offsets(&self, group_id: &str, offsets: &HashMap<TopicPartition, i64>)
        -> Result<()>;

    /// Committed offsets for a group; partitions without a commit are absent.
    async fn committed_offsets(
        &self,
        group_id: &str,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>>;

    async fn list_offset(&self, tp: &TopicPartition, spec: OffsetSpec) -> Result<i64>;

    /// Partition ids of a topic.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    async fn close(&self);
}

/// Dials new broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerClient>>;
}
