//! Consumer API for reading chat events.
//!
//! A consumer runs one fetch loop per subscription and hands every record to
//! an application callback, in partition order.
//!
//! ## Lifecycle
//!
//! ```text
//!            subscribe()                 callback → Stop
//!   Idle ───────────────▶ Running ───────────────────────▶ Closed
//!                            │                               ▲
//!                            └───────────── close() ─────────┘
//! ```
//!
//! ## Fetch Loop
//!
//! 1. Check cancellation
//! 2. Apply pending seeks
//! 3. Fetch up to `max_poll_records` from every assigned, non-paused
//!    partition (waiting at most `fetch_max_wait_ms`)
//! 4. For each record: decompress, invoke the callback, advance the position,
//!    and (with auto-commit) mark `offset + 1` for commit
//! 5. `ConsumeAction::Stop` ends the loop at once; the refusing record is not
//!    advanced past or committed, the rest of the poll is discarded, and
//!    nothing is fetched again
//!
//! Fetch errors retire the connection and back off before the next attempt.
//!
//! ## Starting Positions
//!
//! A partition starts at the group's committed offset. Without one, the
//! `auto_offset_reset` policy decides: `earliest`, `latest`, or `none`, which
//! fails `subscribe` with `InvalidOffset`.
//!
//! ## Example
//!
//! ```ignore
//! use chatmq_client::{ConsumeAction, Consumer};
//!
//! let consumer = Consumer::builder()
//!     .pool(pool)
//!     .group_id("message-persist")
//!     .auto_offset_reset(OffsetReset::Earliest)
//!     .build()
//!     .await?;
//!
//! consumer
//!     .subscribe(&["chat.messages"], |msg| {
//!         persist(&msg.value);
//!         ConsumeAction::Continue
//!     })
//!     .await?;
//!
//! // ...
//! consumer.close().await?;
//! ```

use crate::broker::{FetchRequest, FetchResponse, Headers, OffsetSpec, TopicPartition};
use crate::codec::{Codec, JsonSerializer};
use crate::config::{ConsumerConfig, OffsetReset};
use crate::connection_pool::{ConnectionPool, PooledConnection};
use crate::error::{MqError, Result};
use crate::metrics::{MetricsCollector, NoopCollector};
use crate::offset::OffsetManager;
use crate::retry::RetryPolicy;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Consumer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerState {
    Idle,
    Running,
    Closed,
}

/// What the fetch loop does after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeAction {
    Continue,
    /// Stop consuming; the consumer moves to `Closed`. This record is left
    /// for the group's next consumer.
    Stop,
}

/// A record delivered to the application, already decompressed.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Message {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers.get(name)
    }

    /// Deserialize the value as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        JsonSerializer.deserialize(&self.value)
    }
}

/// Point-in-time consumer counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerMetrics {
    pub total_messages: u64,
    pub total_bytes: u64,
    pub polls: u64,
    pub fetch_errors: u64,
    /// Records whose payload could not be decompressed (skipped).
    pub decode_errors: u64,
    pub messages_per_sec: f64,
    /// High watermark minus the committed offset (or the current position when
    /// nothing is committed yet).
    pub lag: HashMap<TopicPartition, i64>,
    /// Next offset to be delivered.
    pub positions: HashMap<TopicPartition, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeekTarget {
    Offset(i64),
    Beginning,
    End,
}

#[derive(Debug, Default)]
struct Counters {
    messages: AtomicU64,
    bytes: AtomicU64,
    polls: AtomicU64,
    fetch_errors: AtomicU64,
    decode_errors: AtomicU64,
}

struct Inner {
    config: ConsumerConfig,
    pool: ConnectionPool,
    offsets: OffsetManager,
    collector: Arc<dyn MetricsCollector>,
    request_timeout: Duration,
    fetch_backoff: RetryPolicy,

    state: Mutex<ConsumerState>,
    assignment: RwLock<Vec<TopicPartition>>,
    positions: RwLock<HashMap<TopicPartition, i64>>,
    high_watermarks: RwLock<HashMap<TopicPartition, i64>>,
    paused: RwLock<HashSet<TopicPartition>>,
    seeks: Mutex<HashMap<TopicPartition, SeekTarget>>,

    counters: Counters,
    started_at: Instant,
    cancel: CancellationToken,
    fetch_task: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Callback-driven consumer for one group.
///
/// Cheap to clone; clones control the same subscription.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl Consumer {
    /// Create a new `ConsumerBuilder`.
    pub fn builder() -> ConsumerBuilder {
        ConsumerBuilder::new()
    }

    pub fn group_id(&self) -> &str {
        &self.inner.config.group_id
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConsumerState {
        *lock(&self.inner.state)
    }

    /// Subscribe to `topics` and start the fetch loop.
    ///
    /// Resolves every partition of every topic and its starting position
    /// before returning; the callback then runs on the fetch task.
    ///
    /// # Arguments
    ///
    /// * `topics` - Topics to consume; all of their partitions are assigned
    /// * `callback` - Invoked once per record, in partition order
    ///
    /// # Errors
    ///
    /// - `ConsumerClosed` after [`Consumer::close`] or a `Stop`
    /// - `ConsumeFailed` if the consumer is already subscribed
    /// - `InvalidOffset` when a partition has no committed offset and the
    ///   reset policy is `none`
    /// - connection errors while resolving partitions or offsets
    pub async fn subscribe<S, F>(&self, topics: &[S], callback: F) -> Result<()>
    where
        S: AsRef<str>,
        F: FnMut(Message) -> ConsumeAction + Send + 'static,
    {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                ConsumerState::Idle => *state = ConsumerState::Running,
                ConsumerState::Running => {
                    return Err(MqError::ConsumeFailed(
                        "consumer is already subscribed".into(),
                    ))
                }
                ConsumerState::Closed => return Err(MqError::ConsumerClosed),
            }
        }

        let topics: Vec<String> = topics.iter().map(|t| t.as_ref().to_string()).collect();
        let assignment = match self.inner.assign(&topics).await {
            Ok(assignment) => assignment,
            Err(e) => {
                *lock(&self.inner.state) = ConsumerState::Idle;
                return Err(e);
            }
        };

        if self.inner.config.enable_auto_commit {
            self.inner
                .offsets
                .start_auto_commit(self.inner.config.auto_commit_interval());
        }

        let handle = tokio::spawn(fetch_loop(Arc::clone(&self.inner), callback));
        *lock(&self.inner.fetch_task) = Some(handle);

        info!(
            group_id = %self.inner.config.group_id,
            client_id = %self.inner.config.client_id,
            topics = ?topics,
            partitions = assignment.len(),
            "Consumer subscribed"
        );
        Ok(())
    }

    /// Stop fetching from `partitions` until resumed. Records already fetched
    /// for them are not delivered.
    pub async fn pause(&self, partitions: &[TopicPartition]) {
        let mut paused = self.inner.paused.write().await;
        paused.extend(partitions.iter().cloned());
        debug!(group_id = %self.inner.config.group_id, partitions = ?partitions, "Paused");
    }

    pub async fn resume(&self, partitions: &[TopicPartition]) {
        let mut paused = self.inner.paused.write().await;
        for tp in partitions {
            paused.remove(tp);
        }
        debug!(group_id = %self.inner.config.group_id, partitions = ?partitions, "Resumed");
    }

    pub async fn paused(&self) -> Vec<TopicPartition> {
        let mut paused: Vec<_> = self.inner.paused.read().await.iter().cloned().collect();
        paused.sort();
        paused
    }

    /// Make `offset` the next record fetched from `tp`.
    ///
    /// Takes effect before the next poll; records from the current poll
    /// that were not delivered yet are discarded for `tp`.
    pub fn seek(&self, tp: TopicPartition, offset: i64) -> Result<()> {
        self.request_seek(vec![tp], SeekTarget::Offset(offset))
    }

    pub fn seek_to_beginning(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.request_seek(partitions.to_vec(), SeekTarget::Beginning)
    }

    pub fn seek_to_end(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.request_seek(partitions.to_vec(), SeekTarget::End)
    }

    fn request_seek(&self, partitions: Vec<TopicPartition>, target: SeekTarget) -> Result<()> {
        if self.state() == ConsumerState::Closed {
            return Err(MqError::ConsumerClosed);
        }
        let mut seeks = lock(&self.inner.seeks);
        for tp in partitions {
            debug!(group_id = %self.inner.config.group_id, %tp, ?target, "Seek requested");
            seeks.insert(tp, target);
        }
        Ok(())
    }

    /// Commit the current position of every assigned partition and wait.
    pub async fn commit_sync(&self) -> Result<()> {
        let positions = self.inner.positions.read().await.clone();
        self.inner.offsets.commit_offsets(positions).await
    }

    /// Next offset to be delivered for `tp`.
    pub async fn position(&self, tp: &TopicPartition) -> Option<i64> {
        self.inner.positions.read().await.get(tp).copied()
    }

    /// Last offset committed by this consumer (or found on the broker at
    /// subscribe time).
    pub async fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.inner.offsets.committed_offset(tp).await
    }

    pub async fn assignment(&self) -> Vec<TopicPartition> {
        self.inner.assignment.read().await.clone()
    }

    pub fn offset_manager(&self) -> &OffsetManager {
        &self.inner.offsets
    }

    pub async fn metrics(&self) -> ConsumerMetrics {
        let inner = &self.inner;
        let positions = inner.positions.read().await.clone();
        let high_watermarks = inner.high_watermarks.read().await.clone();
        let committed = inner.offsets.committed_offsets().await;

        let lag = high_watermarks
            .iter()
            .filter_map(|(tp, hw)| {
                let base = committed.get(tp).or_else(|| positions.get(tp))?;
                Some((tp.clone(), (hw - base).max(0)))
            })
            .collect();

        let messages = inner.counters.messages.load(Ordering::Relaxed);
        let elapsed = inner.started_at.elapsed().as_secs_f64();
        ConsumerMetrics {
            total_messages: messages,
            total_bytes: inner.counters.bytes.load(Ordering::Relaxed),
            polls: inner.counters.polls.load(Ordering::Relaxed),
            fetch_errors: inner.counters.fetch_errors.load(Ordering::Relaxed),
            decode_errors: inner.counters.decode_errors.load(Ordering::Relaxed),
            messages_per_sec: if elapsed > 0.0 {
                messages as f64 / elapsed
            } else {
                0.0
            },
            lag,
            positions,
        }
    }

    /// Push the current snapshot to the metrics collector.
    pub async fn report_metrics(&self) {
        let metrics = self.metrics().await;
        self.inner
            .collector
            .record_consumer_metrics(&self.inner.config.group_id, &metrics);
    }

    /// Cancel the fetch loop, wait for it, and commit pending offsets.
    ///
    /// Safe to call more than once; only the first call does any work and
    /// can report a commit failure.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.cancel.cancel();
        let handle = lock(&self.inner.fetch_task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(group_id = %self.inner.config.group_id, error = %e, "Fetch task ended abnormally");
            }
        }
        *lock(&self.inner.state) = ConsumerState::Closed;

        let committed = self.inner.offsets.stop().await;
        self.report_metrics().await;
        info!(
            group_id = %self.inner.config.group_id,
            client_id = %self.inner.config.client_id,
            messages = self.inner.counters.messages.load(Ordering::Relaxed),
            "Consumer closed"
        );
        committed
    }
}

impl Inner {
    /// Resolve partitions and starting positions for `topics`.
    async fn assign(&self, topics: &[String]) -> Result<Vec<TopicPartition>> {
        let mut assignment = Vec::new();
        {
            let conn = self.pool.borrow(self.request_timeout).await?;
            let mut failure = None;
            for topic in topics {
                match conn.partitions(topic).await {
                    Ok(partitions) => assignment
                        .extend(partitions.into_iter().map(|p| TopicPartition::new(topic.clone(), p))),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            self.pool.release(conn).await;
            if let Some(e) = failure {
                return Err(e);
            }
        }

        let committed = self.offsets.fetch_committed(&assignment).await?;
        let mut positions = HashMap::with_capacity(assignment.len());
        let mut missing = Vec::new();
        for tp in &assignment {
            match committed.get(tp) {
                Some(offset) => {
                    positions.insert(tp.clone(), *offset);
                }
                None => missing.push(tp.clone()),
            }
        }

        if !missing.is_empty() {
            let spec = match self.config.auto_offset_reset {
                OffsetReset::Earliest => OffsetSpec::Earliest,
                OffsetReset::Latest => OffsetSpec::Latest,
                OffsetReset::None => {
                    let tp = &missing[0];
                    return Err(MqError::InvalidOffset {
                        topic: tp.topic.clone(),
                        partition: tp.partition,
                        reason: format!(
                            "no committed offset for group '{}' and auto_offset_reset = none",
                            self.config.group_id
                        ),
                    });
                }
            };
            let conn = self.pool.borrow(self.request_timeout).await?;
            let mut failure = None;
            for tp in missing {
                match conn.list_offset(&tp, spec).await {
                    Ok(offset) => {
                        positions.insert(tp, offset);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            self.pool.release(conn).await;
            if let Some(e) = failure {
                return Err(e);
            }
        }

        *self.positions.write().await = positions;
        *self.assignment.write().await = assignment.clone();
        Ok(assignment)
    }

    /// Apply queued seeks to the positions. Unresolved seeks stay queued.
    async fn apply_seeks(&self, conn: &PooledConnection) -> Result<()> {
        let seeks: Vec<(TopicPartition, SeekTarget)> = lock(&self.seeks).drain().collect();
        let mut remaining = seeks.into_iter();

        while let Some((tp, target)) = remaining.next() {
            let resolved = match target {
                SeekTarget::Offset(offset) => Ok(offset),
                SeekTarget::Beginning => conn.list_offset(&tp, OffsetSpec::Earliest).await,
                SeekTarget::End => conn.list_offset(&tp, OffsetSpec::Latest).await,
            };
            match resolved {
                Ok(offset) => {
                    debug!(group_id = %self.config.group_id, %tp, offset, "Seek applied");
                    self.positions.write().await.insert(tp, offset);
                }
                Err(e) => {
                    let mut seeks = lock(&self.seeks);
                    seeks.entry(tp).or_insert(target);
                    for (tp, target) in remaining {
                        seeks.entry(tp).or_insert(target);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Positions for the next poll: assigned, not paused.
    async fn fetch_positions(&self) -> Vec<(TopicPartition, i64)> {
        let positions = self.positions.read().await;
        let paused = self.paused.read().await;
        let mut active: Vec<_> = positions
            .iter()
            .filter(|(tp, _)| !paused.contains(*tp))
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect();
        active.sort();
        active
    }

    /// Wait out a backoff unless cancelled. Returns false when cancelled.
    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn fetch_failed(&self, error: &MqError, failures: usize) -> Duration {
        self.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
        self.collector.record_error("consume", error.code());
        if error.is_fatal() {
            error!(group_id = %self.config.group_id, code = error.code(), error = %error, "Fetch failed");
        } else {
            warn!(group_id = %self.config.group_id, code = error.code(), error = %error, "Fetch failed, backing off");
        }
        self.fetch_backoff.jittered_backoff(failures)
    }

    /// Hand the records of one poll to the callback. Returns `Stop` as soon
    /// as the callback does.
    async fn deliver<F>(&self, response: FetchResponse, callback: &mut F) -> ConsumeAction
    where
        F: FnMut(Message) -> ConsumeAction,
    {
        let started = Instant::now();
        let mut delivered = 0u64;
        let mut delivered_bytes = 0u64;
        let mut action = ConsumeAction::Continue;

        for record in response.records {
            let tp = TopicPartition::new(record.topic.clone(), record.partition);

            // Skip records made stale by a seek or pause issued mid-poll.
            let seek_pending = lock(&self.seeks).contains_key(&tp);
            if seek_pending || self.paused.read().await.contains(&tp) {
                continue;
            }
            if self.positions.read().await.get(&tp) != Some(&record.offset) {
                trace!(%tp, offset = record.offset, "Skipping out-of-position record");
                continue;
            }

            let next = record.offset + 1;
            let mut headers = record.headers;
            match Codec::decode_value(&mut headers, record.value) {
                Ok(value) => {
                    let size = value.len() as u64 + record.key.as_ref().map_or(0, |k| k.len() as u64);
                    let message = Message {
                        topic: record.topic,
                        partition: record.partition,
                        offset: record.offset,
                        key: record.key,
                        value,
                        headers,
                        timestamp: record.timestamp,
                    };
                    action = callback(message);
                    delivered += 1;
                    delivered_bytes += size;
                }
                Err(e) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    self.collector.record_error("consume", e.code());
                    warn!(%tp, offset = record.offset, error = %e, "Skipping undecodable record");
                }
            }

            // A refused record is neither advanced past nor committed.
            if action == ConsumeAction::Stop {
                break;
            }
            self.positions.write().await.insert(tp.clone(), next);
            if self.config.enable_auto_commit {
                self.offsets.mark_for_commit(tp, next).await;
            }
        }

        self.counters.messages.fetch_add(delivered, Ordering::Relaxed);
        self.counters.bytes.fetch_add(delivered_bytes, Ordering::Relaxed);
        if delivered > 0 {
            self.collector.record_throughput("consume", delivered, delivered_bytes);
            self.collector.record_latency("consume", started.elapsed());
        }
        action
    }
}

async fn fetch_loop<F>(inner: Arc<Inner>, mut callback: F)
where
    F: FnMut(Message) -> ConsumeAction + Send + 'static,
{
    let mut conn: Option<PooledConnection> = None;
    let mut failures = 0usize;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let mut current = match conn.take() {
            Some(c) => c,
            None => match inner.pool.borrow(inner.request_timeout).await {
                Ok(c) => c,
                Err(e) => {
                    let delay = inner.fetch_failed(&e, failures);
                    failures += 1;
                    if !inner.backoff(delay).await {
                        break;
                    }
                    continue;
                }
            },
        };

        if let Err(e) = inner.apply_seeks(&current).await {
            current.mark_unhealthy();
            inner.pool.release(current).await;
            let delay = inner.fetch_failed(&e, failures);
            failures += 1;
            if !inner.backoff(delay).await {
                break;
            }
            continue;
        }

        let positions = inner.fetch_positions().await;
        if positions.is_empty() {
            conn = Some(current);
            if !inner.backoff(inner.config.fetch_max_wait()).await {
                break;
            }
            continue;
        }

        let request = FetchRequest {
            positions,
            max_records: inner.config.max_poll_records,
            max_wait: inner.config.fetch_max_wait(),
        };
        let fetched = tokio::select! {
            _ = inner.cancel.cancelled() => {
                conn = Some(current);
                break;
            }
            result = tokio::time::timeout(inner.request_timeout, current.fetch(request)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(MqError::timeout("fetch", inner.request_timeout)),
                }
            }
        };
        inner.counters.polls.fetch_add(1, Ordering::Relaxed);

        let response = match fetched {
            Ok(response) => {
                failures = 0;
                conn = Some(current);
                response
            }
            Err(e) => {
                if matches!(e, MqError::ConnectionFailed { .. } | MqError::Timeout { .. }) {
                    current.mark_unhealthy();
                }
                inner.pool.release(current).await;
                let delay = inner.fetch_failed(&e, failures);
                failures += 1;
                if !inner.backoff(delay).await {
                    break;
                }
                continue;
            }
        };

        inner
            .high_watermarks
            .write()
            .await
            .extend(response.high_watermarks.iter().map(|(tp, hw)| (tp.clone(), *hw)));

        if inner.deliver(response, &mut callback).await == ConsumeAction::Stop {
            *lock(&inner.state) = ConsumerState::Closed;
            info!(group_id = %inner.config.group_id, "Callback requested stop, consumer closed");
            break;
        }
    }

    if let Some(conn) = conn {
        inner.pool.release(conn).await;
    }
    debug!(group_id = %inner.config.group_id, "Fetch loop exited");
}

/// Builder for [`Consumer`].
///
/// # Examples
///
/// ```ignore
/// let consumer = Consumer::builder()
///     .pool(pool)
///     .config(mq_config.resolved_consumer())
///     .build()
///     .await?;
/// ```
pub struct ConsumerBuilder {
    pool: Option<ConnectionPool>,
    config: ConsumerConfig,
    collector: Option<Arc<dyn MetricsCollector>>,
}

impl ConsumerBuilder {
    pub fn new() -> Self {
        Self {
            pool: None,
            config: ConsumerConfig::default(),
            collector: None,
        }
    }

    /// Set the connection pool (required).
    pub fn pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Set the consumer group ID (required).
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    /// Where to start when the group has no committed offset.
    pub fn auto_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.config.auto_offset_reset = reset;
        self
    }

    pub fn enable_auto_commit(mut self, enabled: bool) -> Self {
        self.config.enable_auto_commit = enabled;
        self
    }

    pub fn auto_commit_interval(mut self, interval: Duration) -> Self {
        self.config.auto_commit_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn max_poll_records(mut self, records: usize) -> Self {
        self.config.max_poll_records = records;
        self
    }

    /// Upper bound on how long one poll waits for data.
    pub fn fetch_max_wait(mut self, wait: Duration) -> Self {
        self.config.fetch_max_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Build the Consumer
    pub async fn build(self) -> Result<Consumer> {
        let pool = self
            .pool
            .ok_or_else(|| MqError::ConfigError("connection pool is required".into()))?;

        let mut config = self.config;
        if config.client_id.is_empty() {
            config.client_id = "chatmq-consumer".to_string();
        }
        config.validate()?;

        let collector = self.collector.unwrap_or_else(|| Arc::new(NoopCollector));
        let request_timeout = Duration::from_millis(config.session_timeout_ms);
        let offsets = OffsetManager::new(
            pool.clone(),
            config.group_id.clone(),
            request_timeout,
            Arc::clone(&collector),
        );

        info!(
            group_id = %config.group_id,
            client_id = %config.client_id,
            auto_offset_reset = ?config.auto_offset_reset,
            auto_commit = config.enable_auto_commit,
            "Consumer created"
        );

        Ok(Consumer {
            inner: Arc::new(Inner {
                pool,
                offsets,
                collector,
                request_timeout,
                fetch_backoff: RetryPolicy {
                    max_backoff: Duration::from_secs(5),
                    ..RetryPolicy::default()
                },
                state: Mutex::new(ConsumerState::Idle),
                assignment: RwLock::new(Vec::new()),
                positions: RwLock::new(HashMap::new()),
                high_watermarks: RwLock::new(HashMap::new()),
                paused: RwLock::new(HashSet::new()),
                seeks: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                started_at: Instant::now(),
                cancel: CancellationToken::new(),
                fetch_task: Mutex::new(None),
                closing: AtomicBool::new(false),
                config,
            }),
        })
    }
}

impl Default for ConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
