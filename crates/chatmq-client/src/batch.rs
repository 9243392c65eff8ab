//! Batch Accumulation for the Producer
//!
//! Records handed to `Producer::send_async` are accumulated in memory and
//! shipped to the broker a batch at a time, amortizing the round-trip.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │ send_async(record) │ Producer API (any task, never blocks on I/O)
//! └─────────┬──────────┘
//!           │ add()
//!           ▼
//! ┌──────────────────────────────┐
//! │  Open Batch (Mutex)          │
//! │  - records: Vec<Pending>     │
//! │  - size_bytes                │
//! │  - created_at (first record) │
//! └─────────┬────────────────────┘
//!           ├─→ count >= max_batch_records ─┐
//!           ├─→ bytes >= batch_size_bytes  ─┤ swap for an empty batch
//!           ├─→ linger elapsed (timer)     ─┤
//!           └─→ flush() / stop()           ─┘
//!                                           ▼
//!                      ┌──────────────────────────────────┐
//!                      │ send queue (bounded mpsc)         │── full → batch dropped,
//!                      └──────────────┬───────────────────┘   callbacks get SendQueueFull
//!                                     ▼
//!                      ┌──────────────────────────────────┐
//!                      │ sender worker → BatchSink         │
//!                      └──────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - A batch is handed off exactly once and is never touched again after the swap
//! - Empty batches are never emitted
//! - Records keep insertion order within a batch, and batches are delivered in
//!   the order they were sealed
//! - A non-empty open batch is sealed within `linger` of its first record
//!
//! ## Thread Safety
//!
//! `add` takes a short, non-async lock; callers never wait for the network.

use crate::config::ProducerConfig;
use crate::error::{MqError, Result};
use crate::producer::{Record, RecordMetadata};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Invoked exactly once with the outcome of an asynchronous send.
pub type SendCallback = Box<dyn FnOnce(Result<RecordMetadata>) + Send + 'static>;

/// A record waiting in a batch, plus whoever wants to hear about it.
pub struct PendingRecord {
    pub record: Record,
    pub callback: Option<SendCallback>,
}

impl PendingRecord {
    pub fn new(record: Record, callback: Option<SendCallback>) -> Self {
        Self { record, callback }
    }

    /// Fire the callback, if any.
    pub fn complete(self, result: Result<RecordMetadata>) {
        if let Some(callback) = self.callback {
            callback(result);
        }
    }
}

impl std::fmt::Debug for PendingRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRecord")
            .field("record", &self.record)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// A sealed batch, in insertion order.
#[derive(Debug)]
pub struct Batch {
    pub records: Vec<PendingRecord>,
    /// Sum of `Record::size_bytes` over `records`.
    pub size_bytes: usize,
    /// When the first record was added.
    pub created_at: Instant,
}

impl Batch {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            size_bytes: 0,
            created_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fail every record of the batch with the same error.
    pub fn fail(self, error: MqError) {
        for pending in self.records {
            pending.complete(Err(error.clone()));
        }
    }
}

/// Where sealed batches go. The producer implements this on top of the pool.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    /// Deliver one batch and complete every record's callback.
    async fn deliver(&self, batch: Batch);
}

/// Flush thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_bytes: usize,
    pub max_batch_records: usize,
    pub linger: Duration,
    /// Sealed batches that may wait for the sender worker.
    pub queue_capacity: usize,
}

impl From<&ProducerConfig> for BatchConfig {
    fn from(config: &ProducerConfig) -> Self {
        Self {
            max_batch_bytes: config.batch_size_bytes,
            max_batch_records: config.batch_max_records,
            linger: config.linger(),
            queue_capacity: config.send_queue_capacity,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&ProducerConfig::default())
    }
}

/// Counters kept by the batch manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batches_sealed: u64,
    pub records_sealed: u64,
    pub dropped_batches: u64,
    pub dropped_records: u64,
}

enum SendJob {
    Batch(Batch),
    /// Answered once every job queued before it has been delivered.
    Barrier(oneshot::Sender<()>),
}

struct Shared {
    config: BatchConfig,
    open: Mutex<Batch>,
    /// Signalled when the open batch receives its first record.
    armed: Notify,
    queue: Mutex<Option<mpsc::Sender<SendJob>>>,
    stopped: AtomicBool,
    batches_sealed: AtomicU64,
    records_sealed: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_records: AtomicU64,
}

impl Shared {
    fn open(&self) -> MutexGuard<'_, Batch> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue(&self) -> Option<mpsc::Sender<SendJob>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn take_open(&self) -> Option<Batch> {
        let mut open = self.open();
        if open.is_empty() {
            return None;
        }
        Some(std::mem::replace(&mut *open, Batch::new()))
    }

    /// Seal the open batch only if it has lingered long enough.
    fn take_expired(&self) -> Option<Batch> {
        let mut open = self.open();
        if open.is_empty() || open.created_at.elapsed() < self.config.linger {
            return None;
        }
        Some(std::mem::replace(&mut *open, Batch::new()))
    }

    fn linger_deadline(&self) -> Option<Instant> {
        let open = self.open();
        (!open.is_empty()).then(|| open.created_at + self.config.linger)
    }

    fn count_sealed(&self, batch: &Batch) {
        self.batches_sealed.fetch_add(1, Ordering::Relaxed);
        self.records_sealed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
    }

    /// Queue a sealed batch without waiting. A saturated queue drops it.
    fn hand_off(&self, batch: Batch, trigger: &'static str) {
        self.count_sealed(&batch);
        debug!(
            records = batch.len(),
            size_bytes = batch.size_bytes,
            trigger,
            "Sealed batch"
        );

        let Some(queue) = self.queue() else {
            batch.fail(MqError::ProducerClosed);
            return;
        };
        match queue.try_send(SendJob::Batch(batch)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(SendJob::Batch(batch))) => {
                let records = batch.len();
                self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                self.dropped_records
                    .fetch_add(records as u64, Ordering::Relaxed);
                warn!(
                    records,
                    capacity = self.config.queue_capacity,
                    "Send queue full, dropping batch"
                );
                batch.fail(MqError::SendQueueFull { records });
            }
            Err(mpsc::error::TrySendError::Closed(SendJob::Batch(batch))) => {
                batch.fail(MqError::ProducerClosed);
            }
            Err(_) => {}
        }
    }

    fn stats(&self) -> BatchStats {
        BatchStats {
            batches_sealed: self.batches_sealed.load(Ordering::Relaxed),
            records_sealed: self.records_sealed.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
        }
    }
}

/// Accumulates records into batches and feeds them to a [`BatchSink`].
pub struct BatchManager {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    linger_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    sender_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BatchManager {
    /// Start the linger timer and the sender worker. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: BatchConfig, sink: Arc<dyn BatchSink>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            config,
            open: Mutex::new(Batch::new()),
            armed: Notify::new(),
            queue: Mutex::new(Some(tx)),
            stopped: AtomicBool::new(false),
            batches_sealed: AtomicU64::new(0),
            records_sealed: AtomicU64::new(0),
            dropped_batches: AtomicU64::new(0),
            dropped_records: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        let linger_task = tokio::spawn(linger_loop(Arc::clone(&shared), cancel.clone()));
        let sender_task = tokio::spawn(sender_loop(rx, sink));

        Self {
            shared,
            cancel,
            linger_task: tokio::sync::Mutex::new(Some(linger_task)),
            sender_task: tokio::sync::Mutex::new(Some(sender_task)),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    /// Append a record to the open batch, sealing it when a size or count
    /// threshold is reached.
    ///
    /// After [`BatchManager::stop`] the record is handed back untouched so the
    /// caller can fail it.
    pub fn add(&self, pending: PendingRecord) -> std::result::Result<(), PendingRecord> {
        let sealed = {
            let mut open = self.shared.open();
            // Checked under the lock: once stop has flipped the flag, its
            // final flush sees every record that made it in.
            if self.shared.stopped.load(Ordering::SeqCst) {
                return Err(pending);
            }
            if open.is_empty() {
                open.created_at = Instant::now();
                self.shared.armed.notify_one();
            }
            open.size_bytes += pending.record.size_bytes();
            open.records.push(pending);
            trace!(
                record_count = open.len(),
                size_bytes = open.size_bytes,
                "Appended record to batch"
            );

            let full = open.len() >= self.shared.config.max_batch_records
                || open.size_bytes >= self.shared.config.max_batch_bytes;
            full.then(|| std::mem::replace(&mut *open, Batch::new()))
        };

        if let Some(batch) = sealed {
            self.shared.hand_off(batch, "threshold");
        }
        Ok(())
    }

    /// Seal the open batch (if non-empty) and queue it for sending.
    pub fn flush(&self) {
        if let Some(batch) = self.shared.take_open() {
            self.shared.hand_off(batch, "manual");
        }
    }

    /// Seal the open batch and wait until every batch queued so far has been
    /// delivered. The final hand-off waits for queue space instead of dropping.
    pub async fn flush_and_wait(&self) -> Result<()> {
        let queue = self.shared.queue().ok_or(MqError::ProducerClosed)?;

        if let Some(batch) = self.shared.take_open() {
            self.shared.count_sealed(&batch);
            if let Err(mpsc::error::SendError(SendJob::Batch(batch))) =
                queue.send(SendJob::Batch(batch)).await
            {
                batch.fail(MqError::ProducerClosed);
                return Err(MqError::ProducerClosed);
            }
        }

        let (tx, rx) = oneshot::channel();
        queue
            .send(SendJob::Barrier(tx))
            .await
            .map_err(|_| MqError::ProducerClosed)?;
        rx.await.map_err(|_| MqError::ProducerClosed)
    }

    /// Stop the timer, seal and deliver whatever is open, then stop the
    /// sender worker once the queue drains. Safe to call more than once.
    pub async fn stop(&self) {
        let already_stopped = {
            let _open = self.shared.open();
            self.shared.stopped.swap(true, Ordering::SeqCst)
        };
        if already_stopped {
            return;
        }
        self.cancel.cancel();
        if let Some(handle) = self.linger_task.lock().await.take() {
            let _ = handle.await;
        }

        if let Err(e) = self.flush_and_wait().await {
            warn!(error = %e, "Final batch flush failed");
        }

        // Dropping the last sender lets the worker drain and exit.
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = self.sender_task.lock().await.take() {
            let _ = handle.await;
        }

        let stats = self.shared.stats();
        debug!(
            batches = stats.batches_sealed,
            dropped = stats.dropped_batches,
            "Batch manager stopped"
        );
    }

    pub fn stats(&self) -> BatchStats {
        self.shared.stats()
    }

    /// Records in the open batch.
    pub fn pending_records(&self) -> usize {
        self.shared.open().len()
    }
}

impl Drop for BatchManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn linger_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let deadline = match shared.linger_deadline() {
            Some(deadline) => deadline,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = shared.armed.notified() => {}
                }
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        if let Some(batch) = shared.take_expired() {
            shared.hand_off(batch, "linger");
        }
    }
}

async fn sender_loop(mut rx: mpsc::Receiver<SendJob>, sink: Arc<dyn BatchSink>) {
    while let Some(job) = rx.recv().await {
        match job {
            SendJob::Batch(batch) => sink.deliver(batch).await,
            SendJob::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!("Sender worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Semaphore;

    /// Records every delivered batch's record count and completes callbacks.
    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<Vec<String>>>,
        gate: Option<Arc<Semaphore>>,
        entered: Notify,
    }

    impl RecordingSink {
        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn deliver(&self, batch: Batch) {
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let values = batch
                .records
                .iter()
                .map(|p| String::from_utf8(p.record.value.to_vec()).unwrap())
                .collect();
            self.batches.lock().unwrap().push(values);
            for (i, pending) in batch.records.into_iter().enumerate() {
                let topic = pending.record.topic.clone();
                pending.complete(Ok(RecordMetadata {
                    topic,
                    partition: 0,
                    offset: i as i64,
                    timestamp: 0,
                }));
            }
        }
    }

    fn config(records: usize, bytes: usize, linger_ms: u64, queue: usize) -> BatchConfig {
        BatchConfig {
            max_batch_bytes: bytes,
            max_batch_records: records,
            linger: Duration::from_millis(linger_ms),
            queue_capacity: queue,
        }
    }

    fn pending(value: &str) -> PendingRecord {
        PendingRecord::new(Record::new("chat", value.to_string()), None)
    }

    #[tokio::test]
    async fn test_count_threshold_seals_batch() {
        let sink = Arc::new(RecordingSink::default());
        let manager = BatchManager::new(config(3, usize::MAX, 10_000, 4), sink.clone());

        for v in ["a", "b", "c", "d"] {
            manager.add(pending(v)).unwrap();
        }
        manager.flush_and_wait().await.unwrap();

        assert_eq!(sink.batches()[0], vec!["a", "b", "c"]);
        assert_eq!(sink.batches()[1], vec!["d"]);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_byte_threshold_seals_batch() {
        let sink = Arc::new(RecordingSink::default());
        let manager = BatchManager::new(config(100, 10, 10_000, 4), sink.clone());

        manager.add(pending("12345")).unwrap();
        assert_eq!(manager.pending_records(), 1);
        manager.add(pending("67890")).unwrap();
        assert_eq!(manager.pending_records(), 0);

        manager.flush_and_wait().await.unwrap();
        assert_eq!(sink.batches(), vec![vec!["12345", "67890"]]);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_linger_flushes_partial_batch_once() {
        let sink = Arc::new(RecordingSink::default());
        let manager = BatchManager::new(config(3, usize::MAX, 50, 4), sink.clone());

        manager.add(pending("x")).unwrap();
        manager.add(pending("y")).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(sink.batches(), vec![vec!["x", "y"]]);
        assert_eq!(manager.stats().batches_sealed, 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_linger_rearms_after_flush() {
        let sink = Arc::new(RecordingSink::default());
        let manager = BatchManager::new(config(10, usize::MAX, 30, 4), sink.clone());

        manager.add(pending("first")).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        manager.add(pending("second")).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(sink.batches(), vec![vec!["first"], vec!["second"]]);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_empty_batches_never_emitted() {
        let sink = Arc::new(RecordingSink::default());
        let manager = BatchManager::new(config(3, usize::MAX, 10, 4), sink.clone());

        tokio::time::sleep(Duration::from_millis(40)).await;
        manager.flush();
        manager.flush_and_wait().await.unwrap();

        assert!(sink.batches().is_empty());
        assert_eq!(manager.stats().batches_sealed, 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_batch_and_notifies() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(RecordingSink::gated(gate.clone()));
        let manager = BatchManager::new(config(1, usize::MAX, 10_000, 1), sink.clone());

        // First batch is picked up by the worker and parked on the gate.
        manager.add(pending("one")).unwrap();
        sink.entered.notified().await;
        // Second fills the single queue slot.
        manager.add(pending("two")).unwrap();

        let (tx, rx) = oneshot::channel();
        let callback: SendCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        manager
            .add(PendingRecord::new(Record::new("chat", "three"), Some(callback)))
            .unwrap();

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(MqError::SendQueueFull { records: 1 })));
        assert_eq!(manager.stats().dropped_batches, 1);

        gate.add_permits(10);
        manager.stop().await;
        assert_eq!(sink.batches(), vec![vec!["one"], vec!["two"]]);
    }

    #[tokio::test]
    async fn test_stop_flushes_and_rejects_later_adds() {
        let sink = Arc::new(RecordingSink::default());
        let manager = BatchManager::new(config(10, usize::MAX, 10_000, 4), sink.clone());

        manager.add(pending("tail")).unwrap();
        manager.stop().await;
        manager.stop().await;

        assert_eq!(sink.batches(), vec![vec!["tail"]]);
        assert!(manager.add(pending("late")).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_adds_racing_stop_are_never_stranded() {
        let sink = Arc::new(RecordingSink::default());
        let manager = Arc::new(BatchManager::new(
            config(1_000, usize::MAX, 10_000, 64),
            sink.clone(),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut writers = Vec::new();
        for w in 0..4 {
            let manager = manager.clone();
            let tx = tx.clone();
            writers.push(tokio::spawn(async move {
                for i in 0..250 {
                    let done = tx.clone();
                    let callback: SendCallback = Box::new(move |result| {
                        let _ = done.send(result.is_ok());
                    });
                    let record = Record::new("chat", format!("{}-{}", w, i));
                    if let Err(rejected) = manager.add(PendingRecord::new(record, Some(callback))) {
                        rejected.complete(Err(MqError::ProducerClosed));
                    }
                    if i % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        drop(tx);
        tokio::task::yield_now().await;
        manager.stop().await;
        for writer in writers {
            writer.await.unwrap();
        }

        let mut delivered = 0;
        let mut rejected = 0;
        while let Ok(Some(ok)) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
        {
            if ok {
                delivered += 1;
            } else {
                rejected += 1;
            }
        }
        assert_eq!(delivered + rejected, 1_000);
        assert_eq!(
            delivered,
            sink.batches().iter().map(Vec::len).sum::<usize>()
        );
        assert_eq!(manager.pending_records(), 0);
    }

    #[tokio::test]
    async fn test_callbacks_fire_once_with_metadata() {
        let sink = Arc::new(RecordingSink::default());
        let manager = BatchManager::new(config(2, usize::MAX, 10_000, 4), sink.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        for v in ["a", "b"] {
            let tx = tx.clone();
            let callback: SendCallback = Box::new(move |result| {
                tx.send(result.map(|m| m.offset)).unwrap();
            });
            manager
                .add(PendingRecord::new(Record::new("chat", v), Some(callback)))
                .unwrap();
        }
        drop(tx);

        let mut offsets = Vec::new();
        while let Some(result) = rx.recv().await {
            offsets.push(result.unwrap());
        }
        assert_eq!(offsets, vec![0, 1]);
        manager.stop().await;
    }
}
