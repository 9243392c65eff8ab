//! Consumer group offset tracking.
//!
//! The fetch loop marks `offset + 1` for every record it hands to the
//! application; the [`OffsetManager`] batches those marks and commits them to the
//! broker, either on a timer (auto-commit) or on demand.
//!
//! ```text
//!  fetch loop ──mark_for_commit──▶ pending ──┐
//!                                             │ snapshot (lock released)
//!  auto-commit tick / commit_pending ─────────┤
//!                                             ▼
//!                               borrow ─▶ commit_offsets ─▶ release
//!                                             │
//!                         ok: committed = max(committed, pending)
//!                             pending entry cleared if unchanged
//!                         err: entries stay pending for the next tick
//! ```
//!
//! Committed offsets only move forward, on every path. Entries at or below
//! the known committed offset are never sent to the broker, so a backward
//! mark or a `seek` backwards followed by an explicit commit cannot rewind
//! the group.

use crate::broker::TopicPartition;
use crate::connection_pool::ConnectionPool;
use crate::error::{MqError, Result};
use crate::metrics::MetricsCollector;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tracks pending and committed offsets for one consumer group.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OffsetManager {
    inner: Arc<Inner>,
}

struct Inner {
    group_id: String,
    pool: ConnectionPool,
    request_timeout: Duration,
    collector: Arc<dyn MetricsCollector>,
    pending: RwLock<HashMap<TopicPartition, i64>>,
    committed: RwLock<HashMap<TopicPartition, i64>>,
    cancel: CancellationToken,
    auto_commit: Mutex<Option<JoinHandle<()>>>,
}

impl OffsetManager {
    /// # Arguments
    ///
    /// * `pool` - Connections used for commit and lookup requests
    /// * `group_id` - Consumer group the offsets belong to
    /// * `request_timeout` - Bound on each borrow and commit round trip
    /// * `collector` - Receives commit latency and error counts
    pub fn new(
        pool: ConnectionPool,
        group_id: impl Into<String>,
        request_timeout: Duration,
        collector: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                group_id: group_id.into(),
                pool,
                request_timeout,
                collector,
                pending: RwLock::new(HashMap::new()),
                committed: RwLock::new(HashMap::new()),
                cancel: CancellationToken::new(),
                auto_commit: Mutex::new(None),
            }),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    /// Start the periodic commit worker. The first commit happens one full
    /// `interval` after this call. Calling it again is a no-op.
    pub fn start_auto_commit(&self, interval: Duration) {
        let mut slot = self
            .inner
            .auto_commit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        *slot = Some(tokio::spawn(auto_commit_task(weak, cancel, interval)));
        debug!(
            group_id = %self.inner.group_id,
            interval_ms = interval.as_millis() as u64,
            "Auto-commit started"
        );
    }

    /// Record `offset` (the next offset to consume) as the position to commit
    /// for `tp`. The latest mark wins, even if it is lower.
    pub async fn mark_for_commit(&self, tp: TopicPartition, offset: i64) {
        self.inner.pending.write().await.insert(tp, offset);
    }

    /// Commit everything pending as one request.
    ///
    /// On failure the entries stay pending and the error is returned; the
    /// auto-commit worker only logs it.
    pub async fn commit_pending(&self) -> Result<()> {
        self.inner.commit_pending().await
    }

    /// Commit explicit offsets, surfacing any failure.
    ///
    /// Offsets at or below what is already committed are skipped. Pending
    /// marks at or below the new committed value are dropped.
    pub async fn commit_offsets(&self, offsets: HashMap<TopicPartition, i64>) -> Result<()> {
        let offsets = self.inner.forward_only(offsets).await;
        if offsets.is_empty() {
            return Ok(());
        }
        self.inner.send_commit(&offsets).await?;
        self.inner.advance_committed(&offsets).await;

        let mut pending = self.inner.pending.write().await;
        pending.retain(|tp, o| offsets.get(tp).map_or(true, |c| *o > *c));
        Ok(())
    }

    /// Look up the group's committed offsets on the broker and cache them.
    /// Partitions without a commit are absent from the result.
    pub async fn fetch_committed(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>> {
        let inner = &self.inner;
        let mut conn = inner.pool.borrow(inner.request_timeout).await?;
        let result = match tokio::time::timeout(
            inner.request_timeout,
            conn.committed_offsets(&inner.group_id, partitions),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MqError::timeout("committed offsets lookup", inner.request_timeout)),
        };
        if matches!(
            result,
            Err(MqError::ConnectionFailed { .. }) | Err(MqError::Timeout { .. })
        ) {
            conn.mark_unhealthy();
        }
        inner.pool.release(conn).await;

        let offsets = result?;
        let mut committed = inner.committed.write().await;
        for (tp, offset) in &offsets {
            let entry = committed.entry(tp.clone()).or_insert(*offset);
            *entry = (*entry).max(*offset);
        }
        Ok(offsets)
    }

    pub async fn committed_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.inner.committed.read().await.get(tp).copied()
    }

    pub async fn pending_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.inner.pending.read().await.get(tp).copied()
    }

    pub async fn committed_offsets(&self) -> HashMap<TopicPartition, i64> {
        self.inner.committed.read().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.read().await.len()
    }

    /// Stop the auto-commit worker and commit whatever is still pending.
    /// Safe to call more than once.
    pub async fn stop(&self) -> Result<()> {
        self.inner.cancel.cancel();
        let handle = self
            .inner
            .auto_commit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.commit_pending().await
    }
}

impl Inner {
    async fn commit_pending(&self) -> Result<()> {
        // Copy out so the fetch loop can keep marking during the round trip.
        let snapshot = self.pending.read().await.clone();
        if snapshot.is_empty() {
            return Ok(());
        }
        let forward = self.forward_only(snapshot.clone()).await;

        if !forward.is_empty() {
            self.send_commit(&forward).await?;
            self.advance_committed(&forward).await;
        }

        // Backward marks were never sent; they are settled all the same.
        let mut pending = self.pending.write().await;
        for (tp, offset) in &snapshot {
            if pending.get(tp) == Some(offset) {
                pending.remove(tp);
            }
        }
        Ok(())
    }

    /// Keep only the entries that move past the known committed offset.
    async fn forward_only(
        &self,
        mut offsets: HashMap<TopicPartition, i64>,
    ) -> HashMap<TopicPartition, i64> {
        let committed = self.committed.read().await;
        offsets.retain(|tp, offset| match committed.get(tp) {
            Some(current) if *offset <= *current => {
                debug!(
                    group_id = %self.group_id,
                    topic = %tp.topic,
                    partition = tp.partition,
                    offset = *offset,
                    committed = *current,
                    "Skipping commit at or below committed offset"
                );
                false
            }
            _ => true,
        });
        offsets
    }

    async fn advance_committed(&self, offsets: &HashMap<TopicPartition, i64>) {
        let mut committed = self.committed.write().await;
        for (tp, offset) in offsets {
            let entry = committed.entry(tp.clone()).or_insert(*offset);
            *entry = (*entry).max(*offset);
        }
    }

    async fn send_commit(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<()> {
        let started = Instant::now();
        let result = async {
            let mut conn = self.pool.borrow(self.request_timeout).await?;
            let result = match tokio::time::timeout(
                self.request_timeout,
                conn.commit_offsets(&self.group_id, offsets),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(MqError::timeout("offset commit", started.elapsed())),
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
        .await;

        match result {
            Ok(()) => {
                self.collector.record_latency("offset_commit", started.elapsed());
                debug!(
                    group_id = %self.group_id,
                    partitions = offsets.len(),
                    "Committed offsets"
                );
                Ok(())
            }
            Err(e) => {
                self.collector.record_error("offset_commit", e.code());
                warn!(
                    group_id = %self.group_id,
                    partitions = offsets.len(),
                    error = %e,
                    "Offset commit failed"
                );
                Err(MqError::OffsetCommitFailed {
                    partitions: offsets.len(),
                    cause: e.to_string(),
                })
            }
        }
    }
}

async fn auto_commit_task(inner: Weak<Inner>, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        // Failures are logged in send_commit and retried next tick.
        let _ = inner.commit_pending().await;
    }
    info!("Auto-commit stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::memory::MemoryBroker;
    use crate::metrics::InMemoryCollector;

    async fn manager(broker: &MemoryBroker) -> (OffsetManager, Arc<InMemoryCollector>) {
        let pool = ConnectionPool::new(
            Arc::new(broker.clone()),
            PoolConfig {
                health_check_interval_ms: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let collector = Arc::new(InMemoryCollector::new());
        let offsets = OffsetManager::new(pool, "persist", Duration::from_secs(1), collector.clone());
        (offsets, collector)
    }

    #[tokio::test]
    async fn test_last_mark_wins() {
        let broker = MemoryBroker::new(1);
        let (offsets, _) = manager(&broker).await;
        let tp = TopicPartition::new("chat", 0);

        offsets.mark_for_commit(tp.clone(), 10).await;
        offsets.mark_for_commit(tp.clone(), 7).await;
        assert_eq!(offsets.pending_offset(&tp).await, Some(7));
    }

    #[tokio::test]
    async fn test_commit_pending_clears_and_records() {
        let broker = MemoryBroker::new(1);
        let (offsets, collector) = manager(&broker).await;
        let tp = TopicPartition::new("chat", 0);

        offsets.mark_for_commit(tp.clone(), 42).await;
        offsets.commit_pending().await.unwrap();

        assert_eq!(offsets.pending_offset(&tp).await, None);
        assert_eq!(offsets.committed_offset(&tp).await, Some(42));
        assert_eq!(broker.committed("persist", &tp).await, Some(42));
        assert_eq!(collector.latencies("offset_commit").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_pending() {
        let broker = MemoryBroker::new(1);
        let (offsets, collector) = manager(&broker).await;
        let tp = TopicPartition::new("chat", 0);

        broker.fail_next_commits(1);
        offsets.mark_for_commit(tp.clone(), 5).await;
        let err = offsets.commit_pending().await.unwrap_err();
        assert!(matches!(err, MqError::OffsetCommitFailed { partitions: 1, .. }));
        assert_eq!(offsets.pending_offset(&tp).await, Some(5));
        assert_eq!(offsets.committed_offset(&tp).await, None);
        assert_eq!(
            collector.error_count("offset_commit", "CONNECTION_FAILED"),
            1
        );

        offsets.commit_pending().await.unwrap();
        assert_eq!(offsets.committed_offset(&tp).await, Some(5));
    }

    #[tokio::test]
    async fn test_committed_never_decreases_on_auto_path() {
        let broker = MemoryBroker::new(1);
        let (offsets, _) = manager(&broker).await;
        let tp = TopicPartition::new("chat", 0);

        offsets.mark_for_commit(tp.clone(), 20).await;
        offsets.commit_pending().await.unwrap();
        offsets.mark_for_commit(tp.clone(), 12).await;
        offsets.commit_pending().await.unwrap();

        assert_eq!(offsets.committed_offset(&tp).await, Some(20));
    }

    #[tokio::test]
    async fn test_explicit_commit_clears_lower_marks() {
        let broker = MemoryBroker::new(1);
        let (offsets, _) = manager(&broker).await;
        let tp = TopicPartition::new("chat", 0);

        offsets.mark_for_commit(tp.clone(), 8).await;
        offsets
            .commit_offsets(HashMap::from([(tp.clone(), 10)]))
            .await
            .unwrap();

        assert_eq!(offsets.committed_offset(&tp).await, Some(10));
        assert_eq!(offsets.pending_offset(&tp).await, None);
    }

    #[tokio::test]
    async fn test_committed_offset_never_rewinds() {
        let broker = MemoryBroker::new(1);
        let (offsets, _) = manager(&broker).await;
        let tp = TopicPartition::new("chat", 0);

        offsets.mark_for_commit(tp.clone(), 20).await;
        offsets.commit_pending().await.unwrap();
        offsets.mark_for_commit(tp.clone(), 12).await;
        offsets.commit_pending().await.unwrap();
        offsets
            .commit_offsets(HashMap::from([(tp.clone(), 5)]))
            .await
            .unwrap();

        assert_eq!(offsets.committed_offset(&tp).await, Some(20));
        assert_eq!(offsets.pending_offset(&tp).await, None);
        assert_eq!(broker.committed("persist", &tp).await, Some(20));
        assert_eq!(broker.commit_history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_committed_reads_broker() {
        let broker = MemoryBroker::new(2);
        let (offsets, _) = manager(&broker).await;
        let tp0 = TopicPartition::new("chat", 0);
        let tp1 = TopicPartition::new("chat", 1);

        offsets
            .commit_offsets(HashMap::from([(tp0.clone(), 3)]))
            .await
            .unwrap();

        let (fresh, _) = manager(&broker).await;
        let found = fresh
            .fetch_committed(&[tp0.clone(), tp1.clone()])
            .await
            .unwrap();
        assert_eq!(found.get(&tp0), Some(&3));
        assert!(!found.contains_key(&tp1));
        assert_eq!(fresh.committed_offset(&tp0).await, Some(3));
    }

    #[tokio::test]
    async fn test_stop_commits_remaining() {
        let broker = MemoryBroker::new(1);
        let (offsets, _) = manager(&broker).await;
        let tp = TopicPartition::new("chat", 0);

        offsets.start_auto_commit(Duration::from_secs(60));
        offsets.mark_for_commit(tp.clone(), 9).await;
        offsets.stop().await.unwrap();
        offsets.stop().await.unwrap();

        assert_eq!(broker.committed("persist", &tp).await, Some(9));
        assert_eq!(broker.commit_history().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_commit_batches_marks() {
        let broker = MemoryBroker::new(1);
        let (offsets, _) = manager(&broker).await;
        let tp = TopicPartition::new("chat", 0);

        offsets.start_auto_commit(Duration::from_millis(100));
        offsets.mark_for_commit(tp.clone(), 10).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        offsets.mark_for_commit(tp.clone(), 15).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let history = broker.commit_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0][&tp], 15);
        offsets.stop().await.unwrap();
    }
}
