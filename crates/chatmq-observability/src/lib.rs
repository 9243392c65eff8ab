//! chatmq Observability
//!
//! Prometheus metric families and tracing setup shared by the chatmq client.
//!
//! # Usage
//!
//! ```no_run
//! use chatmq_observability::{exporter, logging, metrics};
//!
//! logging::init("info");
//! metrics::init();
//!
//! // Hand this to whatever HTTP endpoint the host service exposes
//! let body = exporter::encode_text().unwrap();
//! ```

pub mod exporter;
pub mod logging;
pub mod metrics;

pub use exporter::encode_text;
pub use metrics::{init as init_metrics, REGISTRY};

/// Register the metric families and install the fmt subscriber.
pub fn init(log_level: &str) {
    metrics::init();
    logging::init(log_level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_then_export() {
        init("warn");
        init("warn");
        metrics::POOL_ERRORS.inc();
        let text = encode_text().unwrap();
        assert!(text.contains("pool_errors"));
    }
}
