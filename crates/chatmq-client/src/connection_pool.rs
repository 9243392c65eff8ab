//! Bounded Broker Connection Pool
//!
//! Broker connections are expensive to establish (TCP + TLS + SASL), so the
//! producer and consumer borrow them from a shared pool instead of dialing per
//! request.
//!
//! ## Design
//!
//! ```text
//!            borrow(timeout)                         release(conn)
//!                 │                                       │
//!                 ▼                                       ▼
//!   ┌─────────────────────────┐  valid   ┌──────────────────────────────┐
//!   │ idle: VecDeque<Conn>    │─────────▶│ Active (one borrower)         │
//!   │ (bounded by max_idle)   │◀─────────│ healthy, not expired,         │
//!   └───────────┬─────────────┘  room    │ room in idle set             │
//!               │ empty                  └──────────────┬───────────────┘
//!               ▼                                       │ otherwise
//!     total < max ? dial : PoolExhausted                ▼
//!                                                    Closed
//! ```
//!
//! - `active + idle <= total <= max_connections` at every point
//! - Borrowing never queues: with every connection active the caller gets
//!   `PoolExhausted` immediately and decides how to back off
//! - A connection is valid while it is healthy, younger than
//!   `connection_max_lifetime`, and used within `connection_max_idle_time`
//! - `min_idle_connections` are dialed eagerly at construction; failures are
//!   logged, not fatal
//! - A background task pings one connection per `health_check_interval` and
//!   retires it if the probe fails, then prunes expired idle connections
//!
//! ## Thread Safety
//!
//! ConnectionPool is Send + Sync and cheap to clone; clones share the same
//! connections.
//!
//! ## Examples
//!
//! ```ignore
//! let pool = ConnectionPool::new(Arc::new(broker), PoolConfig::default()).await?;
//!
//! let conn = pool.borrow(Duration::from_secs(1)).await?;
//! let partitions = conn.partitions("chat.messages").await;
//! pool.release(conn).await;
//! ```

use crate::broker::{BrokerClient, BrokerConnector};
use crate::config::PoolConfig;
use crate::error::{MqError, Result};
use crate::metrics::{MetricsCollector, NoopCollector};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub max_connections: usize,
    pub created_total: u64,
    pub closed_total: u64,
    pub errors_total: u64,
}

/// A live connection plus its pool bookkeeping.
struct Connection {
    client: Box<dyn BrokerClient>,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
    healthy: bool,
}

impl Connection {
    fn new(client: Box<dyn BrokerClient>) -> Self {
        let now = Instant::now();
        Self {
            client,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            healthy: true,
        }
    }
}

/// A connection borrowed from the pool.
///
/// Derefs to the underlying [`BrokerClient`]. Hand it back with
/// [`ConnectionPool::release`]; dropping it instead closes it.
pub struct PooledConnection {
    conn: Connection,
    guard: CheckoutGuard,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.conn.client.id()
    }

    pub fn created_at(&self) -> Instant {
        self.conn.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.conn.last_used_at
    }

    pub fn use_count(&self) -> u64 {
        self.conn.use_count
    }

    pub fn is_healthy(&self) -> bool {
        self.conn.healthy
    }

    /// Flag the connection as broken; `release` will close it instead of
    /// returning it to the idle set.
    pub fn mark_unhealthy(&mut self) {
        self.conn.healthy = false;
    }
}

impl Deref for PooledConnection {
    type Target = dyn BrokerClient;

    fn deref(&self) -> &Self::Target {
        self.conn.client.as_ref()
    }
}

/// Keeps the counters right when a borrowed connection is dropped unreleased.
struct CheckoutGuard {
    shared: Arc<Shared>,
    armed: bool,
}

impl Drop for CheckoutGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.active.fetch_sub(1, Ordering::SeqCst);
            self.shared.total.fetch_sub(1, Ordering::SeqCst);
            self.shared.closed_count.fetch_add(1, Ordering::Relaxed);
            debug!("Borrowed connection dropped without release, closing it");
        }
    }
}

/// Reserved dial slot; gives the slot back unless the dial succeeded.
struct SlotReservation<'a> {
    total: &'a AtomicUsize,
    committed: bool,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.total.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct Shared {
    connector: Arc<dyn BrokerConnector>,
    config: PoolConfig,
    collector: Arc<dyn MetricsCollector>,
    idle: Mutex<VecDeque<Connection>>,
    idle_count: AtomicUsize,
    total: AtomicUsize,
    active: AtomicUsize,
    created_count: AtomicU64,
    closed_count: AtomicU64,
    errors: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    health_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn is_valid(&self, conn: &Connection) -> bool {
        conn.healthy
            && conn.created_at.elapsed() <= self.config.max_lifetime()
            && conn.last_used_at.elapsed() <= self.config.max_idle_time()
    }

    /// Drop a connection from the books. The caller closes the returned client.
    fn retire(&self, conn: Connection) -> Box<dyn BrokerClient> {
        self.total.fetch_sub(1, Ordering::SeqCst);
        self.closed_count.fetch_add(1, Ordering::Relaxed);
        conn.client
    }

    fn checkout(self: &Arc<Self>, mut conn: Connection) -> PooledConnection {
        conn.last_used_at = Instant::now();
        conn.use_count += 1;
        self.active.fetch_add(1, Ordering::SeqCst);
        PooledConnection {
            conn,
            guard: CheckoutGuard {
                shared: Arc::clone(self),
                armed: true,
            },
        }
    }

    async fn dial(&self) -> Result<Connection> {
        let reserved = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                (t < self.config.max_connections).then_some(t + 1)
            })
            .is_ok();
        if !reserved {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(MqError::PoolExhausted {
                max: self.config.max_connections,
            });
        }
        let mut slot = SlotReservation {
            total: &self.total,
            committed: false,
        };

        match self.connector.connect().await {
            Ok(client) => {
                slot.committed = true;
                self.created_count.fetch_add(1, Ordering::Relaxed);
                debug!(connection_id = client.id(), "Dialed new broker connection");
                Ok(Connection::new(client))
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Failed to dial broker connection");
                Err(e)
            }
        }
    }

    async fn borrow(self: &Arc<Self>) -> Result<PooledConnection> {
        loop {
            let candidate = {
                let mut idle = self.idle.lock().await;
                let conn = idle.pop_back();
                self.idle_count.store(idle.len(), Ordering::SeqCst);
                conn
            };
            let Some(conn) = candidate else { break };

            if self.is_valid(&conn) {
                return Ok(self.checkout(conn));
            }
            debug!(connection_id = conn.client.id(), "Evicting expired idle connection");
            self.retire(conn).close().await;
        }

        let conn = self.dial().await?;
        Ok(self.checkout(conn))
    }

    async fn release(&self, pooled: PooledConnection) {
        let PooledConnection { conn, mut guard } = pooled;

        let mut idle = self.idle.lock().await;
        guard.armed = false;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let retired = if self.closed.load(Ordering::SeqCst) || !self.is_valid(&conn) {
            Some(self.retire(conn))
        } else if idle.len() >= self.config.max_idle_connections {
            Some(self.retire(conn))
        } else {
            idle.push_back(conn);
            None
        };
        self.idle_count.store(idle.len(), Ordering::SeqCst);
        drop(idle);

        if let Some(client) = retired {
            debug!(connection_id = client.id(), "Closing released connection");
            client.close().await;
        }
    }

    /// Retire every idle connection that is no longer valid.
    async fn prune_idle(&self) -> usize {
        let expired: Vec<Connection> = {
            let mut idle = self.idle.lock().await;
            let (keep, expired): (Vec<_>, Vec<_>) =
                idle.drain(..).partition(|c| self.is_valid(c));
            *idle = VecDeque::from(keep);
            self.idle_count.store(idle.len(), Ordering::SeqCst);
            expired
        };
        let n = expired.len();
        for conn in expired {
            self.retire(conn).close().await;
        }
        n
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            total_connections: self.total.load(Ordering::SeqCst),
            active_connections: self.active.load(Ordering::SeqCst),
            idle_connections: self.idle_count.load(Ordering::SeqCst),
            max_connections: self.config.max_connections,
            created_total: self.created_count.load(Ordering::Relaxed),
            closed_total: self.closed_count.load(Ordering::Relaxed),
            errors_total: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Pool of broker connections shared by producers and consumers.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    /// Create a pool, pre-warm `min_idle_connections`, and start the health task.
    pub async fn new(connector: Arc<dyn BrokerConnector>, config: PoolConfig) -> Result<Self> {
        Self::with_collector(connector, config, Arc::new(NoopCollector)).await
    }

    /// Like [`ConnectionPool::new`], pushing stats to `collector` on every
    /// health-check tick and on close.
    pub async fn with_collector(
        connector: Arc<dyn BrokerConnector>,
        config: PoolConfig,
        collector: Arc<dyn MetricsCollector>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            connector,
            config,
            collector,
            idle: Mutex::new(VecDeque::new()),
            idle_count: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            created_count: AtomicU64::new(0),
            closed_count: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            health_task: std::sync::Mutex::new(None),
        });

        let mut warmed = 0;
        for _ in 0..shared.config.min_idle_connections {
            match shared.dial().await {
                Ok(conn) => {
                    let mut idle = shared.idle.lock().await;
                    idle.push_back(conn);
                    shared.idle_count.store(idle.len(), Ordering::SeqCst);
                    warmed += 1;
                }
                Err(e) => warn!(error = %e, "Failed to pre-warm pooled connection"),
            }
        }

        if let Some(interval) = shared.config.health_check_interval() {
            let handle = tokio::spawn(health_check_task(
                Arc::downgrade(&shared),
                shared.cancel.clone(),
                interval,
            ));
            if let Ok(mut slot) = shared.health_task.lock() {
                *slot = Some(handle);
            }
        }

        info!(
            max_connections = shared.config.max_connections,
            min_idle = shared.config.min_idle_connections,
            max_idle = shared.config.max_idle_connections,
            warmed,
            "Connection pool created"
        );

        Ok(Self { shared })
    }

    /// Borrow a connection, dialing one if the idle set is empty.
    ///
    /// # Errors
    ///
    /// - `PoolClosed` after [`ConnectionPool::close`]
    /// - `PoolExhausted` when `max_connections` are all active
    /// - `Timeout` when dialing does not finish within `timeout`
    /// - whatever the connector returns when dialing fails
    pub async fn borrow(&self, timeout: Duration) -> Result<PooledConnection> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(MqError::PoolClosed);
        }
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.shared.borrow()).await {
            Ok(result) => result,
            Err(_) => {
                self.shared.errors.fetch_add(1, Ordering::Relaxed);
                Err(MqError::timeout("connection pool borrow", started.elapsed()))
            }
        }
    }

    /// Return a connection. Invalid connections, surplus connections beyond
    /// `max_idle_connections`, and anything released after `close` are closed.
    pub async fn release(&self, conn: PooledConnection) {
        self.shared.release(conn).await;
    }

    /// Ping one pooled connection; on failure that connection is retired.
    pub async fn health_check(&self, timeout: Duration) -> Result<()> {
        let mut conn = self.borrow(timeout).await?;
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, conn.ping()).await {
            Ok(r) => r,
            Err(_) => Err(MqError::timeout("health check ping", started.elapsed())),
        };
        if let Err(e) = &result {
            conn.mark_unhealthy();
            self.shared.errors.fetch_add(1, Ordering::Relaxed);
            warn!(connection_id = conn.id(), error = %e, "Pooled connection failed health check");
        }
        self.release(conn).await;
        result
    }

    /// Close every idle connection and stop the health task. Borrowed
    /// connections are closed when released. Safe to call more than once.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel.cancel();

        let handle = self.shared.health_task.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let drained: Vec<Connection> = {
            let mut idle = self.shared.idle.lock().await;
            self.shared.idle_count.store(0, Ordering::SeqCst);
            idle.drain(..).collect()
        };
        for conn in drained {
            self.shared.retire(conn).close().await;
        }

        let stats = self.shared.stats();
        self.shared.collector.record_pool_stats(&stats);
        info!(
            created = stats.created_total,
            closed = stats.closed_total,
            still_active = stats.active_connections,
            "Connection pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Periodic liveness probe. Holds only a weak handle so an abandoned pool
/// does not live forever.
async fn health_check_task(shared: Weak<Shared>, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(shared) = shared.upgrade() else { break };
        let pool = ConnectionPool { shared };

        match pool.health_check(interval).await {
            Ok(()) => {}
            // All connections busy means they are in use, not broken.
            Err(MqError::PoolExhausted { .. }) | Err(MqError::PoolClosed) => {}
            Err(e) => debug!(error = %e, "Health check tick failed"),
        }

        let pruned = pool.shared.prune_idle().await;
        if pruned > 0 {
            debug!(pruned, "Pruned expired idle connections");
        }
        pool.shared.collector.record_pool_stats(&pool.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn config(max: usize, min_idle: usize, max_idle: usize) -> PoolConfig {
        PoolConfig {
            max_connections: max,
            min_idle_connections: min_idle,
            max_idle_connections: max_idle,
            health_check_interval_ms: 0,
            ..Default::default()
        }
    }

    async fn pool(broker: &MemoryBroker, cfg: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(Arc::new(broker.clone()), cfg).await.unwrap()
    }

    fn assert_invariant(stats: PoolStats) {
        assert!(
            stats.active_connections + stats.idle_connections <= stats.total_connections,
            "{:?}",
            stats
        );
        assert!(stats.total_connections <= stats.max_connections, "{:?}", stats);
    }

    #[tokio::test]
    async fn test_prewarm_min_idle() {
        let broker = MemoryBroker::default();
        let pool = pool(&broker, config(5, 2, 3)).await;

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(broker.stats().connects, 2);
    }

    #[tokio::test]
    async fn test_prewarm_failure_is_not_fatal() {
        let broker = MemoryBroker::default();
        broker.fail_next_connects(2);
        let pool = pool(&broker, config(5, 2, 3)).await;
        assert_eq!(pool.stats().idle_connections, 0);
        assert_eq!(pool.stats().errors_total, 2);

        let conn = pool.borrow(Duration::from_secs(1)).await.unwrap();
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_borrow_reuses_idle_connection() {
        let broker = MemoryBroker::default();
        let pool = pool(&broker, config(3, 1, 3)).await;

        let conn = pool.borrow(Duration::from_secs(1)).await.unwrap();
        let id = conn.id();
        assert_eq!(conn.use_count(), 1);
        pool.release(conn).await;

        let conn = pool.borrow(Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.id(), id);
        assert_eq!(conn.use_count(), 2);
        pool.release(conn).await;
        assert_eq!(broker.stats().connects, 1);
    }

    #[tokio::test]
    async fn test_exhausted_fails_fast() {
        let broker = MemoryBroker::default();
        let pool = pool(&broker, config(2, 0, 2)).await;

        let a = pool.borrow(Duration::from_secs(1)).await.unwrap();
        let b = pool.borrow(Duration::from_secs(1)).await.unwrap();

        let started = Instant::now();
        let err = pool.borrow(Duration::from_secs(5)).await.err().unwrap();
        assert!(matches!(err, MqError::PoolExhausted { max: 2 }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_invariant(pool.stats());

        pool.release(a).await;
        pool.release(b).await;
        assert_eq!(pool.stats().idle_connections, 2);
    }

    #[tokio::test]
    async fn test_release_beyond_idle_cap_closes() {
        let broker = MemoryBroker::default();
        let pool = pool(&broker, config(3, 0, 1)).await;

        let a = pool.borrow(Duration::from_secs(1)).await.unwrap();
        let b = pool.borrow(Duration::from_secs(1)).await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.closed_total, 1);
        assert_eq!(broker.stats().open_connections, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_is_closed_on_release() {
        let broker = MemoryBroker::default();
        let pool = pool(&broker, config(3, 0, 3)).await;

        let mut conn = pool.borrow(Duration::from_secs(1)).await.unwrap();
        conn.mark_unhealthy();
        pool.release(conn).await;

        assert_eq!(pool.stats().total_connections, 0);
        assert_eq!(broker.stats().open_connections, 0);
    }

    #[tokio::test]
    async fn test_expired_idle_connection_is_replaced() {
        let broker = MemoryBroker::default();
        let cfg = PoolConfig {
            connection_max_idle_time_ms: 20,
            ..config(3, 1, 3)
        };
        let pool = pool(&broker, cfg).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        let conn = pool.borrow(Duration::from_secs(1)).await.unwrap();
        assert_eq!(broker.stats().connects, 2);
        assert_eq!(pool.stats().closed_total, 1);
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_prune_idle_closes_only_expired() {
        let broker = MemoryBroker::default();
        let cfg = PoolConfig {
            connection_max_idle_time_ms: 200,
            ..config(3, 0, 3)
        };
        let pool = pool(&broker, cfg).await;

        let stale = pool.borrow(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let fresh = pool.borrow(Duration::from_secs(1)).await.unwrap();
        pool.release(stale).await;
        pool.release(fresh).await;
        assert_eq!(pool.shared.prune_idle().await, 0);
        assert_eq!(pool.stats().idle_connections, 2);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(pool.shared.prune_idle().await, 1);
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(broker.stats().open_connections, 1);
        assert_invariant(stats);
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        let broker = MemoryBroker::default();
        let pool = pool(&broker, config(2, 0, 2)).await;
        broker.set_connect_delay(Duration::from_millis(200));

        let err = pool.borrow(Duration::from_millis(20)).await.err().unwrap();
        assert!(matches!(err, MqError::Timeout { .. }));
        // the reserved slot was given back
        assert_eq!(pool.stats().total_connections, 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_keeps_counters_consistent() {
        let broker = MemoryBroker::default();
        let pool = pool(&broker, config(2, 0, 2)).await;

        let conn = pool.borrow(Duration::from_secs(1)).await.unwrap();
        drop(conn);

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_connections, 0);
        assert_eq!(broker.stats().open_connections, 0);
    }

    #[tokio::test]
    async fn test_health_check_retires_failed_connection() {
        let broker = MemoryBroker::default();
        let pool = pool(&broker, config(3, 2, 3)).await;

        pool.health_check(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.stats().idle_connections, 2);

        broker.fail_pings(true);
        assert!(pool.health_check(Duration::from_secs(1)).await.is_err());
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_connections, 1);
    }

    #[tokio::test]
    async fn test_background_health_check_runs() {
        let broker = MemoryBroker::default();
        let cfg = PoolConfig {
            health_check_interval_ms: 20,
            ..config(3, 1, 3)
        };
        let pool = pool(&broker, cfg).await;

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(broker.stats().pings >= 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_borrows() {
        let broker = MemoryBroker::default();
        let pool = pool(&broker, config(3, 2, 3)).await;

        let held = pool.borrow(Duration::from_secs(1)).await.unwrap();
        pool.close().await;
        pool.close().await;

        assert!(pool.is_closed());
        assert!(matches!(
            pool.borrow(Duration::from_secs(1)).await,
            Err(MqError::PoolClosed)
        ));

        pool.release(held).await;
        assert_eq!(pool.stats().total_connections, 0);
        assert_eq!(broker.stats().open_connections, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let broker = MemoryBroker::default();
        let result = ConnectionPool::new(Arc::new(broker), config(2, 3, 3)).await;
        assert!(matches!(result, Err(MqError::ConfigError(_))));
    }
}
