use lazy_static::lazy_static;
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Per-operation Metrics (produce, produce_batch, consume, commit, ...)
    // ============================================================================

    /// Messages handled per operation
    pub static ref MESSAGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chatmq_messages_total", "Total messages handled"),
        &["operation"]
    ).expect("metric can be created");

    /// Payload bytes handled per operation
    pub static ref BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chatmq_bytes_total", "Total payload bytes handled"),
        &["operation"]
    ).expect("metric can be created");

    /// Operation latency
    pub static ref OPERATION_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chatmq_operation_latency_seconds", "Operation latency in seconds")
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["operation"]
    ).expect("metric can be created");

    /// Errors by operation and error code
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chatmq_errors_total", "Total errors"),
        &["operation", "error_code"]
    ).expect("metric can be created");

    // ============================================================================
    // Producer Metrics
    // ============================================================================

    /// Batches dropped because the send queue was full
    pub static ref PRODUCER_DROPPED_BATCHES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chatmq_producer_dropped_batches", "Batches dropped on a full send queue"),
        &["client_id"]
    ).expect("metric can be created");

    /// Producer throughput since start
    pub static ref PRODUCER_MESSAGES_PER_SECOND: GaugeVec = GaugeVec::new(
        Opts::new("chatmq_producer_messages_per_second", "Producer throughput in messages per second"),
        &["client_id"]
    ).expect("metric can be created");

    /// Mean acknowledged send latency
    pub static ref PRODUCER_AVG_LATENCY: GaugeVec = GaugeVec::new(
        Opts::new("chatmq_producer_avg_latency_seconds", "Mean send latency in seconds"),
        &["client_id"]
    ).expect("metric can be created");

    // ============================================================================
    // Consumer Metrics
    // ============================================================================

    /// Consumer lag (high watermark minus committed offset)
    pub static ref CONSUMER_LAG: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chatmq_consumer_lag", "Consumer lag in number of messages"),
        &["topic", "partition", "consumer_group"]
    ).expect("metric can be created");

    /// Next offset the consumer will fetch
    pub static ref CONSUMER_POSITION: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chatmq_consumer_position", "Next offset to fetch"),
        &["topic", "partition", "consumer_group"]
    ).expect("metric can be created");

    // ============================================================================
    // Connection Pool Metrics
    // ============================================================================

    /// Pooled connections by state (total, active, idle, max)
    pub static ref POOL_CONNECTIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chatmq_pool_connections", "Pooled broker connections"),
        &["state"]
    ).expect("metric can be created");

    /// Connections dialed since the pool was created
    pub static ref POOL_CONNECTIONS_CREATED: IntGauge = IntGauge::new(
        "chatmq_pool_connections_created",
        "Connections dialed by the pool"
    ).expect("metric can be created");

    /// Connections closed since the pool was created
    pub static ref POOL_CONNECTIONS_CLOSED: IntGauge = IntGauge::new(
        "chatmq_pool_connections_closed",
        "Connections closed by the pool"
    ).expect("metric can be created");

    /// Pool errors (dial failures, exhaustion, failed probes)
    pub static ref POOL_ERRORS: IntGauge = IntGauge::new(
        "chatmq_pool_errors",
        "Connection pool errors"
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        // Per-operation metrics
        REGISTRY
            .register(Box::new(MESSAGES_TOTAL.clone()))
            .expect("messages_total can be registered");
        REGISTRY
            .register(Box::new(BYTES_TOTAL.clone()))
            .expect("bytes_total can be registered");
        REGISTRY
            .register(Box::new(OPERATION_LATENCY.clone()))
            .expect("operation_latency can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("errors_total can be registered");

        // Producer metrics
        REGISTRY
            .register(Box::new(PRODUCER_DROPPED_BATCHES.clone()))
            .expect("producer_dropped_batches can be registered");
        REGISTRY
            .register(Box::new(PRODUCER_MESSAGES_PER_SECOND.clone()))
            .expect("producer_messages_per_second can be registered");
        REGISTRY
            .register(Box::new(PRODUCER_AVG_LATENCY.clone()))
            .expect("producer_avg_latency can be registered");

        // Consumer metrics
        REGISTRY
            .register(Box::new(CONSUMER_LAG.clone()))
            .expect("consumer_lag can be registered");
        REGISTRY
            .register(Box::new(CONSUMER_POSITION.clone()))
            .expect("consumer_position can be registered");

        // Pool metrics
        REGISTRY
            .register(Box::new(POOL_CONNECTIONS.clone()))
            .expect("pool_connections can be registered");
        REGISTRY
            .register(Box::new(POOL_CONNECTIONS_CREATED.clone()))
            .expect("pool_connections_created can be registered");
        REGISTRY
            .register(Box::new(POOL_CONNECTIONS_CLOSED.clone()))
            .expect("pool_connections_closed can be registered");
        REGISTRY
            .register(Box::new(POOL_ERRORS.clone()))
            .expect("pool_errors can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        init();
        // If no panic, registration succeeded and is idempotent
    }

    #[test]
    fn test_operation_counters() {
        MESSAGES_TOTAL.with_label_values(&["test-produce"]).inc_by(3);
        BYTES_TOTAL.with_label_values(&["test-produce"]).inc_by(1024);

        assert_eq!(MESSAGES_TOTAL.with_label_values(&["test-produce"]).get(), 3);
        assert_eq!(BYTES_TOTAL.with_label_values(&["test-produce"]).get(), 1024);
    }

    #[test]
    fn test_error_labels() {
        ERRORS_TOTAL
            .with_label_values(&["test-commit", "OFFSET_COMMIT_FAILED"])
            .inc();

        assert_eq!(
            ERRORS_TOTAL
                .with_label_values(&["test-commit", "OFFSET_COMMIT_FAILED"])
                .get(),
            1
        );
    }

    #[test]
    fn test_consumer_lag() {
        CONSUMER_LAG
            .with_label_values(&["test-topic", "0", "test-group"])
            .set(1000);

        assert_eq!(
            CONSUMER_LAG
                .with_label_values(&["test-topic", "0", "test-group"])
                .get(),
            1000
        );
    }
}
