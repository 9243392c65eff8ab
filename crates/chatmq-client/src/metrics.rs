//! Metrics push interface.
//!
//! The producer, consumer and pool push what they observe into a
//! [`MetricsCollector`]. Three implementations ship with the crate:
//!
//! - [`NoopCollector`]: discards everything (the default)
//! - [`InMemoryCollector`]: keeps everything for inspection in tests
//! - [`PrometheusCollector`]: feeds the `chatmq-observability` registry

use crate::connection_pool::PoolStats;
use crate::consumer::ConsumerMetrics;
use crate::producer::ProducerMetrics;
use chatmq_observability::metrics as prom;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Sink for client metrics. Every method defaults to a no-op so implementors
/// only override what they care about.
pub trait MetricsCollector: Send + Sync {
    /// Periodic producer snapshot, keyed by client id.
    fn record_producer_metrics(&self, _client_id: &str, _metrics: &ProducerMetrics) {}

    /// Periodic consumer snapshot, keyed by group id.
    fn record_consumer_metrics(&self, _group_id: &str, _metrics: &ConsumerMetrics) {}

    fn record_pool_stats(&self, _stats: &PoolStats) {}

    fn record_latency(&self, _operation: &str, _latency: Duration) {}

    fn record_throughput(&self, _operation: &str, _messages: u64, _bytes: u64) {}

    /// `code` is [`crate::MqError::code`].
    fn record_error(&self, _operation: &str, _code: &str) {}
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl MetricsCollector for NoopCollector {}

/// Keeps every observation in memory.
#[derive(Debug, Default)]
pub struct InMemoryCollector {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default)]
struct Recorded {
    producers: HashMap<String, ProducerMetrics>,
    consumers: HashMap<String, ConsumerMetrics>,
    pool: Option<PoolStats>,
    latencies: HashMap<String, Vec<Duration>>,
    throughput: HashMap<String, (u64, u64)>,
    errors: HashMap<(String, String), u64>,
}

impl InMemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last producer snapshot for `client_id`.
    pub fn producer_metrics(&self, client_id: &str) -> Option<ProducerMetrics> {
        self.lock().producers.get(client_id).cloned()
    }

    /// Last consumer snapshot for `group_id`.
    pub fn consumer_metrics(&self, group_id: &str) -> Option<ConsumerMetrics> {
        self.lock().consumers.get(group_id).cloned()
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.lock().pool
    }

    pub fn latencies(&self, operation: &str) -> Vec<Duration> {
        self.lock().latencies.get(operation).cloned().unwrap_or_default()
    }

    /// `(messages, bytes)` accumulated for `operation`.
    pub fn throughput(&self, operation: &str) -> (u64, u64) {
        self.lock().throughput.get(operation).copied().unwrap_or((0, 0))
    }

    pub fn error_count(&self, operation: &str, code: &str) -> u64 {
        self.lock()
            .errors
            .get(&(operation.to_string(), code.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsCollector for InMemoryCollector {
    fn record_producer_metrics(&self, client_id: &str, metrics: &ProducerMetrics) {
        self.lock()
            .producers
            .insert(client_id.to_string(), metrics.clone());
    }

    fn record_consumer_metrics(&self, group_id: &str, metrics: &ConsumerMetrics) {
        self.lock()
            .consumers
            .insert(group_id.to_string(), metrics.clone());
    }

    fn record_pool_stats(&self, stats: &PoolStats) {
        self.lock().pool = Some(*stats);
    }

    fn record_latency(&self, operation: &str, latency: Duration) {
        self.lock()
            .latencies
            .entry(operation.to_string())
            .or_default()
            .push(latency);
    }

    fn record_throughput(&self, operation: &str, messages: u64, bytes: u64) {
        let mut recorded = self.lock();
        let entry = recorded.throughput.entry(operation.to_string()).or_default();
        entry.0 += messages;
        entry.1 += bytes;
    }

    fn record_error(&self, operation: &str, code: &str) {
        *self
            .lock()
            .errors
            .entry((operation.to_string(), code.to_string()))
            .or_default() += 1;
    }
}

/// Feeds the global Prometheus registry in `chatmq-observability`.
#[derive(Debug, Clone, Copy)]
pub struct PrometheusCollector;

impl PrometheusCollector {
    /// Registers the metric families on first use.
    pub fn new() -> Self {
        prom::init();
        Self
    }
}

impl Default for PrometheusCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector for PrometheusCollector {
    fn record_producer_metrics(&self, client_id: &str, metrics: &ProducerMetrics) {
        prom::PRODUCER_DROPPED_BATCHES
            .with_label_values(&[client_id])
            .set(metrics.dropped_batches as i64);
        prom::PRODUCER_MESSAGES_PER_SECOND
            .with_label_values(&[client_id])
            .set(metrics.messages_per_sec);
        prom::PRODUCER_AVG_LATENCY
            .with_label_values(&[client_id])
            .set(metrics.avg_latency.as_secs_f64());
    }

    fn record_consumer_metrics(&self, group_id: &str, metrics: &ConsumerMetrics) {
        for (tp, lag) in &metrics.lag {
            let partition = tp.partition.to_string();
            prom::CONSUMER_LAG
                .with_label_values(&[&tp.topic, &partition, group_id])
                .set(*lag);
        }
        for (tp, position) in &metrics.positions {
            let partition = tp.partition.to_string();
            prom::CONSUMER_POSITION
                .with_label_values(&[&tp.topic, &partition, group_id])
                .set(*position);
        }
    }

    fn record_pool_stats(&self, stats: &PoolStats) {
        for (state, value) in [
            ("total", stats.total_connections),
            ("active", stats.active_connections),
            ("idle", stats.idle_connections),
            ("max", stats.max_connections),
        ] {
            prom::POOL_CONNECTIONS
                .with_label_values(&[state])
                .set(value as i64);
        }
        prom::POOL_CONNECTIONS_CREATED.set(stats.created_total as i64);
        prom::POOL_CONNECTIONS_CLOSED.set(stats.closed_total as i64);
        prom::POOL_ERRORS.set(stats.errors_total as i64);
    }

    fn record_latency(&self, operation: &str, latency: Duration) {
        prom::OPERATION_LATENCY
            .with_label_values(&[operation])
            .observe(latency.as_secs_f64());
    }

    fn record_throughput(&self, operation: &str, messages: u64, bytes: u64) {
        prom::MESSAGES_TOTAL
            .with_label_values(&[operation])
            .inc_by(messages);
        prom::BYTES_TOTAL.with_label_values(&[operation]).inc_by(bytes);
    }

    fn record_error(&self, operation: &str, code: &str) {
        prom::ERRORS_TOTAL
            .with_label_values(&[operation, code])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_accumulates() {
        let collector = InMemoryCollector::new();
        collector.record_throughput("produce", 3, 300);
        collector.record_throughput("produce", 2, 50);
        collector.record_latency("produce", Duration::from_millis(4));
        collector.record_error("produce", "TIMEOUT");
        collector.record_error("produce", "TIMEOUT");

        assert_eq!(collector.throughput("produce"), (5, 350));
        assert_eq!(collector.latencies("produce").len(), 1);
        assert_eq!(collector.error_count("produce", "TIMEOUT"), 2);
        assert_eq!(collector.error_count("consume", "TIMEOUT"), 0);
    }

    #[test]
    fn test_in_memory_keeps_last_snapshot() {
        let collector = InMemoryCollector::new();
        let mut stats = PoolStats {
            max_connections: 4,
            ..Default::default()
        };
        collector.record_pool_stats(&stats);
        stats.active_connections = 2;
        collector.record_pool_stats(&stats);

        assert_eq!(collector.pool_stats().unwrap().active_connections, 2);
    }

    #[test]
    fn test_prometheus_collector_feeds_registry() {
        let collector = PrometheusCollector::new();
        collector.record_throughput("unit-produce", 7, 700);
        collector.record_error("unit-produce", "POOL_EXHAUSTED");

        assert_eq!(
            prom::MESSAGES_TOTAL.with_label_values(&["unit-produce"]).get(),
            7
        );
        assert_eq!(
            prom::ERRORS_TOTAL
                .with_label_values(&["unit-produce", "POOL_EXHAUSTED"])
                .get(),
            1
        );
    }

    #[test]
    fn test_noop_accepts_everything() {
        let collector: &dyn MetricsCollector = &NoopCollector;
        collector.record_latency("produce", Duration::from_millis(1));
        collector.record_pool_stats(&PoolStats::default());
    }
}
