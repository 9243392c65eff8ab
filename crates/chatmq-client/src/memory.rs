//! In-process broker.
//!
//! [`MemoryBroker`] implements [`BrokerConnector`] and hands out connections
//! implementing [`BrokerClient`] against shared, in-memory partition logs. It is
//! what the test suites and the bundled example run against, and is handy for
//! local development of services that publish or consume chat events.
//!
//! Behavior mirrors what the engine relies on from a real broker:
//!
//! - partitioned append-only logs, auto-created on first use
//! - key routing by SipHash, round-robin for keyless records
//! - idempotent publishing: `(producer_id, sequence)` pairs already appended
//!   return their original acknowledgment instead of appending again
//! - long-poll fetch bounded by `max_wait`
//! - per-group committed offsets
//!
//! Faults can be injected to exercise retry and recovery paths:
//!
//! ```ignore
//! let broker = MemoryBroker::new(3);
//! broker.lose_next_acks(1);       // append succeeds, ack is lost, producer retries
//! broker.fail_next_commits(2);    // offset commits fail twice
//! broker.sever_connections();     // every open connection starts failing
//! ```

use crate::broker::{
    BrokerClient, BrokerConnector, FetchRequest, FetchResponse, FetchedRecord, OffsetSpec,
    ProduceRequest, ProduceResponse, RecordAck, TopicPartition,
};
use crate::config::Acks;
use crate::error::{MqError, Result};
use crate::producer::{partition_for_key, Record};
use async_trait::async_trait;
use lru::LruCache;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

const DEDUP_CAPACITY: usize = 100_000;

/// Shared in-memory broker. Cloning yields another handle to the same logs.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

/// Request counters, for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBrokerStats {
    pub connects: u64,
    pub open_connections: u64,
    pub produce_requests: u64,
    pub fetch_requests: u64,
    pub commit_requests: u64,
    pub pings: u64,
}

struct Inner {
    state: Mutex<State>,
    appended: Notify,
    default_partitions: i32,
    auto_create_topics: AtomicBool,
    next_connection_id: AtomicU64,
    generation: AtomicU64,
    faults: Faults,
    counters: Counters,
}

#[derive(Default)]
struct Faults {
    connect: AtomicU32,
    produce: AtomicU32,
    lost_acks: AtomicU32,
    fetch: AtomicU32,
    commit: AtomicU32,
    ping: AtomicBool,
    auth: AtomicBool,
    connect_delay_ms: AtomicU64,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    open_connections: AtomicU64,
    produce_requests: AtomicU64,
    fetch_requests: AtomicU64,
    commit_requests: AtomicU64,
    pings: AtomicU64,
}

struct State {
    logs: HashMap<String, Vec<Vec<FetchedRecord>>>,
    committed: HashMap<String, HashMap<TopicPartition, i64>>,
    commit_history: Vec<HashMap<TopicPartition, i64>>,
    dedup: LruCache<(u64, u64), RecordAck>,
    round_robin: HashMap<String, usize>,
}

impl State {
    fn partition_log(&self, tp: &TopicPartition) -> Result<&Vec<FetchedRecord>> {
        let partitions = self
            .logs
            .get(&tp.topic)
            .ok_or_else(|| MqError::InvalidTopic(tp.topic.clone()))?;
        usize::try_from(tp.partition)
            .ok()
            .and_then(|p| partitions.get(p))
            .ok_or_else(|| MqError::InvalidPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
            })
    }

    fn ensure_topic(&mut self, topic: &str, partitions: i32, auto_create: bool) -> Result<usize> {
        if topic.is_empty() {
            return Err(MqError::InvalidTopic(String::new()));
        }
        match self.logs.entry(topic.to_string()) {
            Entry::Occupied(e) => Ok(e.get().len()),
            Entry::Vacant(v) => {
                if !auto_create {
                    return Err(MqError::InvalidTopic(topic.to_string()));
                }
                debug!(topic, partitions, "Auto-creating topic");
                v.insert(vec![Vec::new(); partitions as usize]);
                Ok(partitions as usize)
            }
        }
    }

    fn append(&mut self, record: Record, default_partitions: i32, auto_create: bool) -> Result<RecordAck> {
        let count = self.ensure_topic(&record.topic, default_partitions, auto_create)? as i32;

        let partition = match record.partition {
            Some(p) if p < 0 || p >= count => {
                return Err(MqError::InvalidPartition {
                    topic: record.topic.clone(),
                    partition: p,
                })
            }
            Some(p) => p,
            None => match record.partition_key.as_ref().or(record.key.as_ref()) {
                Some(key) => partition_for_key(key, count),
                None => {
                    let next = self.round_robin.entry(record.topic.clone()).or_insert(0);
                    let p = (*next % count as usize) as i32;
                    *next += 1;
                    p
                }
            },
        };

        let log = self
            .logs
            .get_mut(&record.topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .ok_or_else(|| MqError::Internal(format!("missing log for {}", record.topic)))?;

        let offset = log.len() as i64;
        log.push(FetchedRecord {
            topic: record.topic,
            partition,
            offset,
            key: record.key,
            value: record.value,
            headers: record.headers,
            timestamp: record.timestamp,
        });
        Ok(RecordAck { partition, offset })
    }
}

/// Decrement a fault counter if it is armed. Returns whether the fault fires.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryBroker {
    /// New broker whose auto-created topics get `default_partitions` partitions.
    pub fn new(default_partitions: i32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    logs: HashMap::new(),
                    committed: HashMap::new(),
                    commit_history: Vec::new(),
                    dedup: LruCache::new(
                        NonZeroUsize::new(DEDUP_CAPACITY).unwrap_or(NonZeroUsize::MIN),
                    ),
                    round_robin: HashMap::new(),
                }),
                appended: Notify::new(),
                default_partitions: default_partitions.max(1),
                auto_create_topics: AtomicBool::new(true),
                next_connection_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                faults: Faults::default(),
                counters: Counters::default(),
            }),
        }
    }

    /// Toggle auto-creation of unknown topics (on by default).
    pub fn set_auto_create_topics(&self, enabled: bool) {
        self.inner.auto_create_topics.store(enabled, Ordering::SeqCst);
    }

    pub async fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.inner.state.lock().await;
        state
            .logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    /// Append directly to a partition, bypassing any producer. Returns the offset.
    pub async fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<i64> {
        let mut record = Record::new(topic, value.to_vec()).with_partition(partition);
        if let Some(key) = key {
            record = record.with_key(key.to_vec());
        }
        let ack = {
            let mut state = self.inner.state.lock().await;
            state.append(record, self.inner.default_partitions, true)?
        };
        self.inner.appended.notify_waiters();
        Ok(ack.offset)
    }

    /// Snapshot of one partition log.
    pub async fn records(&self, topic: &str, partition: i32) -> Vec<FetchedRecord> {
        let state = self.inner.state.lock().await;
        state
            .partition_log(&TopicPartition::new(topic, partition))
            .cloned()
            .unwrap_or_default()
    }

    /// Total records across every partition of a topic.
    pub async fn record_count(&self, topic: &str) -> usize {
        let state = self.inner.state.lock().await;
        state
            .logs
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub async fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        let state = self.inner.state.lock().await;
        state.committed.get(group_id).and_then(|m| m.get(tp)).copied()
    }

    /// Every successful commit request, in arrival order.
    pub async fn commit_history(&self) -> Vec<HashMap<TopicPartition, i64>> {
        self.inner.state.lock().await.commit_history.clone()
    }

    pub fn stats(&self) -> MemoryBrokerStats {
        let c = &self.inner.counters;
        MemoryBrokerStats {
            connects: c.connects.load(Ordering::SeqCst),
            open_connections: c.open_connections.load(Ordering::SeqCst),
            produce_requests: c.produce_requests.load(Ordering::SeqCst),
            fetch_requests: c.fetch_requests.load(Ordering::SeqCst),
            commit_requests: c.commit_requests.load(Ordering::SeqCst),
            pings: c.pings.load(Ordering::SeqCst),
        }
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.inner.faults.connect.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` produce requests before anything is appended.
    pub fn fail_next_produces(&self, n: u32) {
        self.inner.faults.produce.store(n, Ordering::SeqCst);
    }

    /// Append the next `n` produce requests but report a connection failure.
    pub fn lose_next_acks(&self, n: u32) {
        self.inner.faults.lost_acks.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.inner.faults.fetch.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, n: u32) {
        self.inner.faults.commit.store(n, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, failing: bool) {
        self.inner.faults.ping.store(failing, Ordering::SeqCst);
    }

    pub fn reject_authentication(&self, reject: bool) {
        self.inner.faults.auth.store(reject, Ordering::SeqCst);
    }

    /// Delay every dial by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner
            .faults
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every connection opened before this call fails from now on.
    pub fn sever_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerClient>> {
        let delay = self.inner.faults.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.inner.faults.auth.load(Ordering::SeqCst) {
            return Err(MqError::AuthenticationFailed(
                "SASL handshake rejected".into(),
            ));
        }
        if take(&self.inner.faults.connect) {
            return Err(MqError::connection("connect", "connection refused"));
        }

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        self.inner.counters.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.counters.open_connections.fetch_add(1, Ordering::SeqCst);
        trace!(connection_id = id, "Memory broker connection opened");

        Ok(Box::new(MemoryConnection {
            id,
            generation: self.inner.generation.load(Ordering::SeqCst),
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    generation: u64,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::connection(operation, "connection closed"));
        }
        if self.generation < self.inner.generation.load(Ordering::SeqCst) {
            return Err(MqError::connection(operation, "connection reset by broker"));
        }
        Ok(())
    }

    async fn collect(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let state = self.inner.state.lock().await;
        let mut response = FetchResponse::default();

        for (tp, position) in &request.positions {
            let log = state.partition_log(tp)?;
            response.high_watermarks.insert(tp.clone(), log.len() as i64);

            let room = request.max_records.saturating_sub(response.records.len());
            if room == 0 {
                continue;
            }
            let start = (*position).max(0) as usize;
            response
                .records
                .extend(log.iter().skip(start).take(room).cloned());
        }
        Ok(response)
    }
}

#[async_trait]
impl BrokerClient for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&self) -> Result<()> {
        self.inner.counters.pings.fetch_add(1, Ordering::SeqCst);
        self.check("ping")?;
        if self.inner.faults.ping.load(Ordering::SeqCst) {
            return Err(MqError::connection("ping", "broker did not answer"));
        }
        Ok(())
    }

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse> {
        self.inner.counters.produce_requests.fetch_add(1, Ordering::SeqCst);
        self.check("produce")?;
        if take(&self.inner.faults.produce) {
            return Err(MqError::connection("produce", "broker unavailable"));
        }

        let auto_create = self.inner.auto_create_topics.load(Ordering::SeqCst);
        let mut results = Vec::with_capacity(request.records.len());
        let mut appended = false;
        {
            let mut state = self.inner.state.lock().await;
            for (i, record) in request.records.into_iter().enumerate() {
                let sequence = request.base_sequence + i as u64;
                if let Some(producer_id) = request.producer_id {
                    if let Some(ack) = state.dedup.get(&(producer_id, sequence)) {
                        trace!(producer_id, sequence, "Duplicate record suppressed");
                        results.push(Ok(*ack));
                        continue;
                    }
                }
                match state.append(record, self.inner.default_partitions, auto_create) {
                    Ok(ack) => {
                        appended = true;
                        if let Some(producer_id) = request.producer_id {
                            state.dedup.put((producer_id, sequence), ack);
                        }
                        results.push(Ok(match request.acks {
                            Acks::None => RecordAck {
                                partition: ack.partition,
                                offset: -1,
                            },
                            Acks::Leader | Acks::All => ack,
                        }));
                    }
                    Err(e) => results.push(Err(e)),
                }
            }
        }

        if appended {
            self.inner.appended.notify_waiters();
        }
        if take(&self.inner.faults.lost_acks) {
            return Err(MqError::connection("produce", "acknowledgment lost"));
        }
        Ok(results)
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        self.inner.counters.fetch_requests.fetch_add(1, Ordering::SeqCst);
        self.check("fetch")?;
        if take(&self.inner.faults.fetch) {
            return Err(MqError::connection("fetch", "broker unavailable"));
        }

        let deadline = Instant::now() + request.max_wait;
        loop {
            // Registered before collecting so an append in between still wakes us.
            let notified = self.inner.appended.notified();
            let response = self.collect(&request).await?;
            if !response.records.is_empty() || Instant::now() >= deadline {
                return Ok(response);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(response);
            }
        }
    }

    async fn commit_offsets(
        &self,
        group_id: &str,
        offsets: &HashMap<TopicPartition, i64>,
    ) -> Result<()> {
        self.inner.counters.commit_requests.fetch_add(1, Ordering::SeqCst);
        self.check("commit_offsets")?;
        if take(&self.inner.faults.commit) {
            return Err(MqError::connection("commit_offsets", "coordinator unavailable"));
        }

        let mut state = self.inner.state.lock().await;
        state
            .committed
            .entry(group_id.to_string())
            .or_default()
            .extend(offsets.iter().map(|(tp, o)| (tp.clone(), *o)));
        state.commit_history.push(offsets.clone());
        Ok(())
    }

    async fn committed_offsets(
        &self,
        group_id: &str,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>> {
        self.check("committed_offsets")?;
        let state = self.inner.state.lock().await;
        let Some(group) = state.committed.get(group_id) else {
            return Ok(HashMap::new());
        };
        Ok(partitions
            .iter()
            .filter_map(|tp| group.get(tp).map(|o| (tp.clone(), *o)))
            .collect())
    }

    async fn list_offset(&self, tp: &TopicPartition, spec: OffsetSpec) -> Result<i64> {
        self.check("list_offset")?;
        let state = self.inner.state.lock().await;
        let log = state.partition_log(tp)?;
        Ok(match spec {
            OffsetSpec::Earliest => 0,
            OffsetSpec::Latest => log.len() as i64,
        })
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.check("partitions")?;
        let auto_create = self.inner.auto_create_topics.load(Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        let count = state.ensure_topic(topic, self.inner.default_partitions, auto_create)?;
        Ok((0..count as i32).collect())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.counters.open_connections.fetch_sub(1, Ordering::SeqCst);
            trace!(connection_id = self.id, "Memory broker connection closed");
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.counters.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
