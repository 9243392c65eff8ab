//! Producer API for publishing chat events.
//!
//! The Producer combines the [`Codec`], the [`BatchManager`] and a shared
//! [`ConnectionPool`] behind one facade.
//!
//! ## Send Paths
//!
//! ```text
//! send_sync / send_batch_sync / send_json ──────────────┐
//!   (caller waits for the acknowledgment)               │
//!                                                       ▼
//! send_async(cb) / send ──▶ BatchManager ──▶ sender ──▶ produce()
//!   (returns immediately)    linger/size     worker     borrow → publish → release
//!                                                       retry with jittered backoff
//! ```
//!
//! - `send_sync` and `send_batch_sync` bypass the batch queue, so they are never
//!   dropped by a saturated queue and never wait behind queued batches
//! - `send_async` callbacks fire exactly once: with the record's metadata, with
//!   the publish error after retries are exhausted, or with `SendQueueFull` when
//!   the batch was dropped
//! - `send` is fire-and-forget; a dropped batch only shows up in
//!   [`ProducerMetrics::dropped_batches`] and the logs
//!
//! ## Partition Routing
//!
//! 1. **Explicit**: `Record::with_partition` pins the partition
//! 2. **Key-based**: the partition key (or the record key) is hashed with
//!    SipHash; the same key always lands on the same partition
//! 3. **Round-robin**: keyless records are spread by the broker
//!
//! ## Idempotence
//!
//! With `enable_idempotence` every produce request carries a random producer
//! id and a per-record sequence. Retries resend the same sequences, so a
//! request whose acknowledgment was lost is not appended twice.
//!
//! ## Examples
//!
//! ```ignore
//! use chatmq_client::{Producer, Record};
//!
//! let producer = Producer::builder()
//!     .pool(pool.clone())
//!     .client_id("im-logic")
//!     .linger(Duration::from_millis(10))
//!     .build()
//!     .await?;
//!
//! // Wait for the broker
//! let meta = producer
//!     .send_sync(Record::new("chat.messages", payload).with_key("room-42"), Duration::from_secs(5))
//!     .await?;
//!
//! // Fire and continue
//! producer.send_async(Record::new("chat.presence", update), |result| {
//!     if let Err(e) = result {
//!         tracing::warn!(error = %e, "presence update lost");
//!     }
//! });
//!
//! producer.close().await;
//! ```

use crate::batch::{Batch, BatchConfig, BatchManager, BatchSink, PendingRecord, SendCallback};
use crate::broker::{Headers, ProduceRequest};
use crate::codec::{Codec, JsonSerializer, COMPRESSION_HEADER, CONTENT_TYPE_HEADER};
use crate::config::{Acks, CompressionType, PerformanceConfig, ProducerConfig};
use crate::connection_pool::ConnectionPool;
use crate::error::{MqError, Result};
use crate::metrics::{MetricsCollector, NoopCollector};
use crate::retry::{retry_with_jittered_backoff, RetryPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A record to publish. Immutable once handed to the producer.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    /// Pins the partition, overriding key routing.
    pub partition: Option<i32>,
    /// Routes by this instead of `key` when set.
    pub partition_key: Option<Bytes>,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Record {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            partition_key: None,
            key: None,
            value: value.into(),
            headers: Headers::new(),
            timestamp: now_millis(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<Bytes>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Payload size (key + value), which is what `max_message_bytes` limits.
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map_or(0, |k| k.len()) + self.value.len()
    }
}

/// Where a record was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    /// `-1` when sent with `acks = "none"`.
    pub offset: i64,
    pub timestamp: i64,
}

/// Map a key to a partition in `[0, partition_count)`.
///
/// SipHash keeps the mapping stable across processes and releases, so every
/// producer sends a given room's events to the same partition.
pub fn partition_for_key(key: &[u8], partition_count: i32) -> i32 {
    let mut hasher = siphasher::sip::SipHasher::new();
    key.hash(&mut hasher);
    let hash = hasher.finish();
    (hash % partition_count.max(1) as u64) as i32
}

/// Point-in-time producer counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProducerMetrics {
    /// Records accepted by a send call.
    pub total_messages: u64,
    pub success_messages: u64,
    pub failed_messages: u64,
    /// Payload bytes of acknowledged records.
    pub total_bytes: u64,
    pub avg_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub messages_per_sec: f64,
    pub bytes_per_sec: f64,
    pub dropped_batches: u64,
}

#[derive(Debug)]
struct MetricsTracker {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    latency_total_micros: AtomicU64,
    min_latency_micros: AtomicU64,
    max_latency_micros: AtomicU64,
    started_at: Instant,
}

impl MetricsTracker {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            latency_total_micros: AtomicU64::new(0),
            min_latency_micros: AtomicU64::new(u64::MAX),
            max_latency_micros: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    fn accepted(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    fn succeeded(&self, bytes: usize, latency: Duration) {
        let micros = latency.as_micros() as u64;
        self.success.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.latency_total_micros.fetch_add(micros, Ordering::Relaxed);
        self.min_latency_micros.fetch_min(micros, Ordering::Relaxed);
        self.max_latency_micros.fetch_max(micros, Ordering::Relaxed);
    }

    fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, dropped_batches: u64) -> ProducerMetrics {
        let success = self.success.load(Ordering::Relaxed);
        let bytes = self.bytes.load(Ordering::Relaxed);
        let min = self.min_latency_micros.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let per_sec = |n: u64| if elapsed > 0.0 { n as f64 / elapsed } else { 0.0 };

        ProducerMetrics {
            total_messages: self.total.load(Ordering::Relaxed),
            success_messages: success,
            failed_messages: self.failed.load(Ordering::Relaxed),
            total_bytes: bytes,
            avg_latency: if success > 0 {
                Duration::from_micros(self.latency_total_micros.load(Ordering::Relaxed) / success)
            } else {
                Duration::ZERO
            },
            min_latency: if min == u64::MAX {
                Duration::ZERO
            } else {
                Duration::from_micros(min)
            },
            max_latency: Duration::from_micros(self.max_latency_micros.load(Ordering::Relaxed)),
            messages_per_sec: per_sec(success),
            bytes_per_sec: per_sec(bytes),
            dropped_batches,
        }
    }
}

/// State shared by the producer facade and its sender worker.
struct ProducerCore {
    config: ProducerConfig,
    pool: ConnectionPool,
    codec: Codec,
    retry_policy: RetryPolicy,
    producer_id: Option<u64>,
    next_sequence: AtomicU64,
    in_flight: Semaphore,
    tracker: Arc<MetricsTracker>,
    collector: Arc<dyn MetricsCollector>,
}

impl ProducerCore {
    fn check(&self, record: &Record) -> Result<()> {
        if record.topic.is_empty() {
            return Err(MqError::InvalidTopic(String::new()));
        }
        // Consumers decompress on this header; a caller-set one would corrupt the value.
        if record.headers.contains_key(COMPRESSION_HEADER) {
            return Err(MqError::ReservedHeader {
                topic: record.topic.clone(),
                name: COMPRESSION_HEADER.to_string(),
            });
        }
        let size = record.size_bytes();
        if size > self.config.max_message_bytes {
            return Err(MqError::MessageTooLarge {
                topic: record.topic.clone(),
                size,
                max: self.config.max_message_bytes,
            });
        }
        Ok(())
    }

    /// Validate and compress a record for the wire.
    fn prepare(&self, mut record: Record) -> Result<Record> {
        self.check(&record)?;
        self.codec.encode_record(&mut record)?;
        Ok(record)
    }

    /// Publish records as one request, retrying transient failures.
    ///
    /// The outer error means no record was acknowledged (all retries failed,
    /// or `timeout` expired); inner errors are per-record rejections.
    async fn produce(
        &self,
        records: Vec<Record>,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<Vec<Result<RecordMetadata>>> {
        let started = Instant::now();
        let count = records.len();
        let sizes: Vec<usize> = records.iter().map(Record::size_bytes).collect();
        let stamps: Vec<(String, i64)> = records
            .iter()
            .map(|r| (r.topic.clone(), r.timestamp))
            .collect();

        let request = ProduceRequest {
            producer_id: self.producer_id,
            base_sequence: self.next_sequence.fetch_add(count as u64, Ordering::SeqCst),
            acks: self.config.acks,
            timeout: self.config.request_timeout(),
            records,
        };

        let attempt = retry_with_jittered_backoff(&self.retry_policy, || {
            let request = request.clone();
            async move {
                let _permit = self
                    .in_flight
                    .acquire()
                    .await
                    .map_err(|_| MqError::ProducerClosed)?;
                let mut conn = self.pool.borrow(timeout).await?;
                let result = match tokio::time::timeout(request.timeout, conn.produce(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(MqError::timeout("produce request", self.config.request_timeout())),
                };
                if matches!(
                    result,
                    Err(MqError::ConnectionFailed { .. }) | Err(MqError::Timeout { .. })
                ) {
                    conn.mark_unhealthy();
                }
                self.pool.release(conn).await;
                result
            }
        });

        let response = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.collector.record_error(operation, e.code());
                error!(operation, records = count, code = e.code(), error = %e, "Produce failed");
                return Err(e);
            }
            Err(_) => {
                let e = MqError::timeout(operation, started.elapsed());
                self.collector.record_error(operation, e.code());
                return Err(e);
            }
        };

        if response.len() != count {
            return Err(MqError::Internal(format!(
                "broker acknowledged {} of {} records",
                response.len(),
                count
            )));
        }

        let latency = started.elapsed();
        let mut ok_records = 0;
        let mut ok_bytes = 0;
        let results = response
            .into_iter()
            .zip(stamps)
            .zip(sizes)
            .map(|((ack, (topic, timestamp)), size)| match ack {
                Ok(ack) => {
                    ok_records += 1;
                    ok_bytes += size as u64;
                    Ok(RecordMetadata {
                        topic,
                        partition: ack.partition,
                        offset: ack.offset,
                        timestamp,
                    })
                }
                Err(e) => {
                    self.collector.record_error(operation, e.code());
                    Err(e)
                }
            })
            .collect();

        self.collector.record_latency(operation, latency);
        self.collector
            .record_throughput(operation, ok_records, ok_bytes);
        debug!(
            operation,
            records = count,
            acknowledged = ok_records,
            latency_ms = latency.as_millis() as u64,
            "Produce request completed"
        );
        Ok(results)
    }

    /// Wrap a caller callback so the outcome also lands in the metrics.
    fn tracked(&self, size: usize, callback: Option<SendCallback>) -> SendCallback {
        let tracker = Arc::clone(&self.tracker);
        let enqueued_at = Instant::now();
        Box::new(move |result: Result<RecordMetadata>| {
            match &result {
                Ok(_) => tracker.succeeded(size, enqueued_at.elapsed()),
                Err(_) => tracker.failed(),
            }
            if let Some(callback) = callback {
                callback(result);
            }
        })
    }
}

#[async_trait]
impl BatchSink for ProducerCore {
    async fn deliver(&self, batch: Batch) {
        let (records, callbacks): (Vec<Record>, Vec<Option<SendCallback>>) = batch
            .records
            .into_iter()
            .map(|p| (p.record, p.callback))
            .unzip();

        let outcome = self
            .produce(records, self.config.request_timeout(), "produce_batch")
            .await;

        match outcome {
            Ok(results) => {
                for (callback, result) in callbacks.into_iter().zip(results) {
                    if let Some(callback) = callback {
                        callback(result);
                    }
                }
            }
            Err(e) => {
                for callback in callbacks.into_iter().flatten() {
                    callback(Err(e.clone()));
                }
            }
        }
    }
}

/// High-level producer.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Producer {
    core: Arc<ProducerCore>,
    batches: BatchManager,
    closed: AtomicBool,
}

impl Producer {
    /// Create a new `ProducerBuilder`.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let producer = Producer::builder()
    ///     .pool(pool)
    ///     .client_id("im-gateway")
    ///     .build()
    ///     .await?;
    /// ```
    pub fn builder() -> ProducerBuilder {
        ProducerBuilder::new()
    }

    pub fn client_id(&self) -> &str {
        &self.core.config.client_id
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.core.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MqError::ProducerClosed);
        }
        Ok(())
    }

    /// Publish one record and wait for the acknowledgment configured by `acks`.
    ///
    /// # Errors
    ///
    /// - `ProducerClosed` after [`Producer::close`]
    /// - `MessageTooLarge` when key + value exceed `max_message_bytes`
    /// - `Timeout` when no acknowledgment arrives within `timeout`
    /// - the last broker error once retries are exhausted
    pub async fn send_sync(&self, record: Record, timeout: Duration) -> Result<RecordMetadata> {
        self.ensure_open()?;
        self.core.tracker.accepted(1);
        let started = Instant::now();

        let outcome = match self.core.prepare(record) {
            Ok(record) => {
                let size = record.size_bytes();
                self.core
                    .produce(vec![record], timeout, "produce")
                    .await
                    .and_then(|mut results| {
                        results
                            .pop()
                            .unwrap_or_else(|| Err(MqError::Internal("empty produce response".into())))
                    })
                    .map(|meta| (meta, size))
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok((meta, size)) => {
                self.core.tracker.succeeded(size, started.elapsed());
                Ok(meta)
            }
            Err(e) => {
                self.core.tracker.failed();
                Err(e)
            }
        }
    }

    /// Queue a record and return immediately. `callback` fires exactly once,
    /// from the sender worker (or inline if the record is rejected up front).
    pub fn send_async<F>(&self, record: Record, callback: F)
    where
        F: FnOnce(Result<RecordMetadata>) + Send + 'static,
    {
        self.enqueue(record, Some(Box::new(callback)));
    }

    /// Queue a record without waiting for, or hearing about, the outcome.
    ///
    /// Validation errors are still returned; a batch dropped on a full send
    /// queue is only visible in the metrics and the logs.
    pub fn send(&self, record: Record) -> Result<()> {
        self.ensure_open()?;
        let record = self.core.prepare(record)?;
        self.enqueue_prepared(record, None);
        Ok(())
    }

    fn enqueue(&self, record: Record, callback: Option<SendCallback>) {
        self.core.tracker.accepted(1);
        let size = record.size_bytes();
        let callback = self.core.tracked(size, callback);

        if self.is_closed() {
            callback(Err(MqError::ProducerClosed));
            return;
        }
        match self.core.prepare(record) {
            Ok(record) => {
                if let Err(pending) = self.batches.add(PendingRecord::new(record, Some(callback))) {
                    pending.complete(Err(MqError::ProducerClosed));
                }
            }
            Err(e) => callback(Err(e)),
        }
    }

    fn enqueue_prepared(&self, record: Record, callback: Option<SendCallback>) {
        self.core.tracker.accepted(1);
        let callback = self.core.tracked(record.size_bytes(), callback);
        if let Err(pending) = self.batches.add(PendingRecord::new(record, Some(callback))) {
            pending.complete(Err(MqError::ProducerClosed));
        }
    }

    /// Publish several records as one request. One result per record, in
    /// order; a partial failure is not rolled back.
    ///
    /// Only `ProducerClosed` fails the call as a whole.
    pub async fn send_batch_sync(
        &self,
        records: Vec<Record>,
        timeout: Duration,
    ) -> Result<Vec<Result<RecordMetadata>>> {
        self.ensure_open()?;
        let started = Instant::now();
        self.core.tracker.accepted(records.len() as u64);

        let mut results: Vec<Option<Result<RecordMetadata>>> = Vec::with_capacity(records.len());
        let mut to_send = Vec::new();
        let mut slots = Vec::new();
        for record in records {
            match self.core.prepare(record) {
                Ok(record) => {
                    slots.push((results.len(), record.size_bytes()));
                    to_send.push(record);
                    results.push(None);
                }
                Err(e) => results.push(Some(Err(e))),
            }
        }

        if !to_send.is_empty() {
            match self.core.produce(to_send, timeout, "produce_batch_sync").await {
                Ok(acks) => {
                    for ((slot, size), ack) in slots.into_iter().zip(acks) {
                        if ack.is_ok() {
                            self.core.tracker.succeeded(size, started.elapsed());
                        }
                        results[slot] = Some(ack);
                    }
                }
                Err(e) => {
                    for (slot, _) in slots {
                        results[slot] = Some(Err(e.clone()));
                    }
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|r| {
                let r = r.unwrap_or_else(|| Err(MqError::Internal("record result missing".into())));
                if r.is_err() {
                    self.core.tracker.failed();
                }
                r
            })
            .collect())
    }

    /// Serialize `value` as JSON and publish it synchronously.
    pub async fn send_json<T>(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &T,
        timeout: Duration,
    ) -> Result<RecordMetadata>
    where
        T: Serialize + ?Sized,
    {
        let serializer = JsonSerializer;
        let mut record = Record::new(topic, serializer.serialize(value)?)
            .with_header(CONTENT_TYPE_HEADER, serializer.content_type());
        if let Some(key) = key {
            record = record.with_key(key.to_string());
        }
        self.send_sync(record, timeout).await
    }

    /// Seal the open batch and wait until every queued batch has been sent.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.batches.flush_and_wait()).await {
            Ok(result) => result,
            Err(_) => Err(MqError::timeout("producer flush", started.elapsed())),
        }
    }

    /// Reject further sends, flush what is queued, and push a final metrics
    /// snapshot. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.batches.stop().await;

        let metrics = self.metrics();
        self.core
            .collector
            .record_producer_metrics(&self.core.config.client_id, &metrics);
        info!(
            client_id = %self.core.config.client_id,
            total = metrics.total_messages,
            success = metrics.success_messages,
            failed = metrics.failed_messages,
            dropped_batches = metrics.dropped_batches,
            "Producer closed"
        );
    }

    pub fn metrics(&self) -> ProducerMetrics {
        self.core.tracker.snapshot(self.batches.stats().dropped_batches)
    }

    /// Push the current snapshot to the metrics collector.
    pub fn report_metrics(&self) {
        self.core
            .collector
            .record_producer_metrics(&self.core.config.client_id, &self.metrics());
    }
}

/// Builder for [`Producer`].
///
/// A connection pool is required; everything else has defaults taken from
/// [`ProducerConfig::default`].
///
/// # Examples
///
/// ```ignore
/// let producer = Producer::builder()
///     .pool(pool)
///     .config(mq_config.resolved_producer())
///     .performance(mq_config.performance.clone())
///     .collector(Arc::new(PrometheusCollector::new()))
///     .build()
///     .await?;
/// ```
pub struct ProducerBuilder {
    pool: Option<ConnectionPool>,
    config: ProducerConfig,
    performance: PerformanceConfig,
    collector: Option<Arc<dyn MetricsCollector>>,
}

impl ProducerBuilder {
    pub fn new() -> Self {
        Self {
            pool: None,
            config: ProducerConfig::default(),
            performance: PerformanceConfig::default(),
            collector: None,
        }
    }

    /// Set the connection pool (required).
    pub fn pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Replace every producer setting at once.
    pub fn config(mut self, config: ProducerConfig) -> Self {
        self.config = config;
        self
    }

    /// Small-message compression policy.
    pub fn performance(mut self, performance: PerformanceConfig) -> Self {
        self.performance = performance;
        self
    }

    pub fn collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.config.compression = compression;
        self
    }

    /// Records per batch before it is sealed.
    pub fn batch_max_records(mut self, records: usize) -> Self {
        self.config.batch_max_records = records;
        self
    }

    /// Payload bytes per batch before it is sealed.
    pub fn batch_size_bytes(mut self, bytes: usize) -> Self {
        self.config.batch_size_bytes = bytes;
        self
    }

    /// Maximum time a partial batch waits.
    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger_ms = linger.as_millis() as u64;
        self
    }

    pub fn acks(mut self, acks: Acks) -> Self {
        self.config.acks = acks;
        self
    }

    pub fn enable_idempotence(mut self, enabled: bool) -> Self {
        self.config.enable_idempotence = enabled;
        self
    }

    pub fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.config.max_message_bytes = bytes;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Sealed batches that may wait for the sender worker.
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.send_queue_capacity = capacity;
        self
    }

    /// Build the Producer
    pub async fn build(self) -> Result<Producer> {
        let pool = self
            .pool
            .ok_or_else(|| MqError::ConfigError("connection pool is required".into()))?;

        let mut config = self.config;
        if config.client_id.is_empty() {
            config.client_id = "chatmq-producer".to_string();
        }
        config.validate()?;

        let core = Arc::new(ProducerCore {
            pool,
            codec: Codec::new(config.compression, &self.performance),
            retry_policy: config.retry_policy(),
            producer_id: config.enable_idempotence.then(rand::random::<u64>),
            next_sequence: AtomicU64::new(0),
            in_flight: Semaphore::new(config.max_in_flight_requests),
            tracker: Arc::new(MetricsTracker::new()),
            collector: self.collector.unwrap_or_else(|| Arc::new(NoopCollector)),
            config,
        });

        let sink: Arc<dyn BatchSink> = core.clone();
        let batches = BatchManager::new(BatchConfig::from(&core.config), sink);

        info!(
            client_id = %core.config.client_id,
            compression = core.config.compression.as_str(),
            acks = ?core.config.acks,
            idempotent = core.producer_id.is_some(),
            batch_max_records = core.config.batch_max_records,
            linger_ms = core.config.linger_ms,
            "Producer created"
        );
        if core.config.acks == Acks::None {
            warn!(client_id = %core.config.client_id, "acks = none, offsets will not be reported");
        }

        Ok(Producer {
            core,
            batches,
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::memory::MemoryBroker;
    use tokio::sync::oneshot;

    async fn producer(broker: &MemoryBroker) -> Producer {
        let pool = ConnectionPool::new(
            Arc::new(broker.clone()),
            PoolConfig {
                min_idle_connections: 0,
                health_check_interval_ms: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        Producer::builder()
            .pool(pool)
            .compression(CompressionType::None)
            .linger(Duration::from_millis(5))
            .retry_backoff(Duration::from_millis(1))
            .build()
            .await
            .unwrap()
    }

    #[test]
    fn test_partition_for_key_is_stable_and_in_range() {
        let a = partition_for_key(b"room-42", 10);
        assert_eq!(a, partition_for_key(b"room-42", 10));
        for key in [&b"a"[..], b"b", b"user-123", b""] {
            let p = partition_for_key(key, 7);
            assert!((0..7).contains(&p));
        }
        assert_eq!(partition_for_key(b"anything", 1), 0);
    }

    #[test]
    fn test_record_builders() {
        let record = Record::new("chat", "hello")
            .with_key("room-1")
            .with_partition(2)
            .with_header("trace-id", "abc");
        assert_eq!(record.size_bytes(), 6 + 5);
        assert_eq!(record.partition, Some(2));
        assert_eq!(record.headers["trace-id"], Bytes::from("abc"));
        assert!(record.timestamp > 0);
    }

    #[test]
    fn test_metrics_tracker_latency_bounds() {
        let tracker = MetricsTracker::new();
        tracker.accepted(3);
        tracker.succeeded(10, Duration::from_millis(2));
        tracker.succeeded(30, Duration::from_millis(6));
        tracker.failed();

        let m = tracker.snapshot(1);
        assert_eq!(m.total_messages, 3);
        assert_eq!(m.success_messages, 2);
        assert_eq!(m.failed_messages, 1);
        assert_eq!(m.total_bytes, 40);
        assert_eq!(m.min_latency, Duration::from_millis(2));
        assert_eq!(m.max_latency, Duration::from_millis(6));
        assert_eq!(m.avg_latency, Duration::from_millis(4));
        assert_eq!(m.dropped_batches, 1);
    }

    #[tokio::test]
    async fn test_send_sync_returns_offset() {
        let broker = MemoryBroker::new(1);
        let producer = producer(&broker).await;

        let first = producer
            .send_sync(Record::new("chat", "a"), Duration::from_secs(1))
            .await
            .unwrap();
        let second = producer
            .send_sync(Record::new("chat", "b"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!((first.partition, first.offset), (0, 0));
        assert_eq!(second.offset, 1);
        producer.close().await;
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let broker = MemoryBroker::new(1);
        let pool = ConnectionPool::new(Arc::new(broker.clone()), PoolConfig::default())
            .await
            .unwrap();
        let producer = Producer::builder()
            .pool(pool)
            .max_message_bytes(8)
            .build()
            .await
            .unwrap();

        let err = producer
            .send_sync(Record::new("chat", "123456789"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::MessageTooLarge { size: 9, max: 8, .. }));
        assert_eq!(broker.stats().produce_requests, 0);
    }

    #[tokio::test]
    async fn test_caller_set_compression_header_is_rejected() {
        let broker = MemoryBroker::new(1);
        let producer = producer(&broker).await;
        let forged = || Record::new("chat", "plain text").with_header(COMPRESSION_HEADER, "gzip");

        let err = producer
            .send_sync(forged(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::ReservedHeader { .. }));
        assert_eq!(err.code(), "RESERVED_HEADER");

        let (tx, rx) = oneshot::channel();
        producer.send_async(forged(), move |r| {
            let _ = tx.send(r);
        });
        assert!(matches!(rx.await.unwrap(), Err(MqError::ReservedHeader { .. })));
        assert!(matches!(
            producer.send(forged()),
            Err(MqError::ReservedHeader { .. })
        ));

        assert_eq!(broker.stats().produce_requests, 0);
        assert_eq!(producer.metrics().failed_messages, 2);
        producer.close().await;
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let broker = MemoryBroker::new(1);
        let producer = producer(&broker).await;
        producer.close().await;
        producer.close().await;

        let err = producer
            .send_sync(Record::new("chat", "x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::ProducerClosed));

        let (tx, rx) = oneshot::channel();
        producer.send_async(Record::new("chat", "x"), move |r| {
            let _ = tx.send(r);
        });
        assert!(matches!(rx.await.unwrap(), Err(MqError::ProducerClosed)));
        assert!(matches!(
            producer.send(Record::new("chat", "x")),
            Err(MqError::ProducerClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_async_callback_gets_metadata() {
        let broker = MemoryBroker::new(1);
        let producer = producer(&broker).await;

        let (tx, rx) = oneshot::channel();
        producer.send_async(Record::new("chat", "async"), move |r| {
            let _ = tx.send(r);
        });

        let meta = rx.await.unwrap().unwrap();
        assert_eq!(meta.topic, "chat");
        assert_eq!(meta.offset, 0);
        assert_eq!(producer.metrics().success_messages, 1);
        producer.close().await;
    }

    #[tokio::test]
    async fn test_large_values_are_compressed_on_the_wire() {
        let broker = MemoryBroker::new(1);
        let pool = ConnectionPool::new(Arc::new(broker.clone()), PoolConfig::default())
            .await
            .unwrap();
        let producer = Producer::builder()
            .pool(pool)
            .compression(CompressionType::Lz4)
            .build()
            .await
            .unwrap();

        let value = "chat message body ".repeat(200);
        producer
            .send_sync(Record::new("chat", value.clone()), Duration::from_secs(1))
            .await
            .unwrap();
        producer
            .send_sync(Record::new("chat", "tiny"), Duration::from_secs(1))
            .await
            .unwrap();

        let stored = broker.records("chat", 0).await;
        assert!(stored[0].value.len() < value.len());
        assert_eq!(stored[0].headers[COMPRESSION_HEADER], Bytes::from("lz4"));
        assert!(!stored[1].headers.contains_key(COMPRESSION_HEADER));

        let mut headers = stored[0].headers.clone();
        let decoded = Codec::decode_value(&mut headers, stored[0].value.clone()).unwrap();
        assert_eq!(decoded, Bytes::from(value));
        producer.close().await;
    }

    #[tokio::test]
    async fn test_send_json_sets_content_type() {
        #[derive(Serialize)]
        struct Presence<'a> {
            user: &'a str,
            online: bool,
        }

        let broker = MemoryBroker::new(1);
        let producer = producer(&broker).await;
        producer
            .send_json(
                "presence",
                Some("u1"),
                &Presence {
                    user: "u1",
                    online: true,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let stored = broker.records("presence", 0).await;
        assert_eq!(
            stored[0].headers[CONTENT_TYPE_HEADER],
            Bytes::from("application/json")
        );
        assert_eq!(stored[0].value, Bytes::from(r#"{"user":"u1","online":true}"#));
        producer.close().await;
    }
}
