//! One-stop client facade.
//!
//! [`Mq`] turns an [`MqConfig`] into a shared [`ConnectionPool`], one
//! [`Producer`], and any number of [`Consumer`]s, all reporting to the same
//! [`MetricsCollector`]:
//!
//! ```text
//!                     ┌──────────────┐
//!   MqConfig ───────▶ │      Mq      │ ── health() ──▶ HealthRegistry ("broker")
//!                     └──────┬───────┘
//!            ┌───────────────┼────────────────┐
//!            ▼               ▼                ▼
//!        Producer      Consumer(s)      metrics reporter
//!            └───────┬───────┘          (every metrics_interval)
//!                    ▼
//!             ConnectionPool ──▶ BrokerConnector
//! ```
//!
//! `close()` shuts down consumers first, then the producer, then the pool.

use crate::broker::BrokerConnector;
use crate::config::{ConsumerConfig, MqConfig};
use crate::connection_pool::ConnectionPool;
use crate::consumer::Consumer;
use crate::error::{MqError, Result};
use crate::health::{HealthChecker, HealthRegistry, HealthStatus};
use crate::metrics::{MetricsCollector, NoopCollector, PrometheusCollector};
use crate::producer::Producer;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Shared {
    producer: Producer,
    consumers: Mutex<Vec<Consumer>>,
    pool: ConnectionPool,
    collector: Arc<dyn MetricsCollector>,
}

impl Shared {
    async fn report_metrics(&self) {
        self.producer.report_metrics();
        self.collector.record_pool_stats(&self.pool.stats());
        let consumers = self.consumers.lock().await.clone();
        for consumer in consumers {
            consumer.report_metrics().await;
        }
    }
}

/// Client facade over one broker cluster.
pub struct Mq {
    config: MqConfig,
    shared: Arc<Shared>,
    health: HealthRegistry,
    cancel: CancellationToken,
    reporter: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Mq {
    /// Build a client from `config`.
    ///
    /// Metrics go to the Prometheus registry when `monitoring.enable_metrics`
    /// is set, and nowhere otherwise.
    pub async fn connect(config: MqConfig, connector: Arc<dyn BrokerConnector>) -> Result<Self> {
        let collector: Arc<dyn MetricsCollector> = if config.monitoring.enable_metrics {
            Arc::new(PrometheusCollector::new())
        } else {
            Arc::new(NoopCollector)
        };
        Self::with_collector(config, connector, collector).await
    }

    /// Build a client that reports to `collector`.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before anything is dialed
    /// * `connector` - Dials broker connections for the pool
    /// * `collector` - Shared by the pool, producer and every consumer
    pub async fn with_collector(
        config: MqConfig,
        connector: Arc<dyn BrokerConnector>,
        collector: Arc<dyn MetricsCollector>,
    ) -> Result<Self> {
        config.validate()?;

        let pool =
            ConnectionPool::with_collector(connector, config.pool.clone(), Arc::clone(&collector))
                .await?;

        let producer = match Producer::builder()
            .pool(pool.clone())
            .config(config.resolved_producer())
            .performance(config.performance.clone())
            .collector(Arc::clone(&collector))
            .build()
            .await
        {
            Ok(producer) => producer,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        let health = HealthRegistry::new();
        let probe_pool = pool.clone();
        let probe_timeout = config.connection.read_timeout();
        health
            .register("broker", move || {
                let pool = probe_pool.clone();
                async move { pool.health_check(probe_timeout).await }.boxed()
            })
            .await;

        let shared = Arc::new(Shared {
            producer,
            consumers: Mutex::new(Vec::new()),
            pool,
            collector,
        });

        let cancel = CancellationToken::new();
        let reporter = config.monitoring.enable_metrics.then(|| {
            tokio::spawn(metrics_reporter(
                Arc::downgrade(&shared),
                cancel.clone(),
                config.monitoring.metrics_interval(),
            ))
        });

        info!(
            client_id = %config.client_id,
            brokers = ?config.brokers,
            metrics = config.monitoring.enable_metrics,
            "Message queue client ready"
        );

        Ok(Self {
            config,
            shared,
            health,
            cancel,
            reporter: std::sync::Mutex::new(reporter),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MqConfig {
        &self.config
    }

    pub fn producer(&self) -> &Producer {
        &self.shared.producer
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.shared.pool
    }

    /// The registry behind [`Mq::health`]; register extra checks here.
    pub fn health_checker(&self) -> &HealthRegistry {
        &self.health
    }

    /// New consumer for `group_id` using the configured consumer settings.
    pub async fn consumer(&self, group_id: &str) -> Result<Consumer> {
        let mut config = self.config.resolved_consumer();
        config.group_id = group_id.to_string();
        self.consumer_with_config(config).await
    }

    /// New consumer with explicit settings. It is closed by [`Mq::close`].
    pub async fn consumer_with_config(&self, config: ConsumerConfig) -> Result<Consumer> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::ConsumerClosed);
        }
        let consumer = Consumer::builder()
            .pool(self.shared.pool.clone())
            .config(config)
            .collector(Arc::clone(&self.shared.collector))
            .build()
            .await?;
        self.shared.consumers.lock().await.push(consumer.clone());
        Ok(consumer)
    }

    /// Round-trip a ping over a pooled connection.
    pub async fn ping(&self) -> Result<()> {
        self.shared
            .pool
            .health_check(self.config.connection.read_timeout())
            .await
    }

    /// Run every registered health check.
    pub async fn health(&self) -> HealthStatus {
        self.health
            .check_health(self.config.connection.read_timeout())
            .await
    }

    /// Close consumers, then the producer, then the pool. Safe to call more
    /// than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let reporter = self
            .reporter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = reporter {
            let _ = handle.await;
        }

        let consumers: Vec<Consumer> = self.shared.consumers.lock().await.drain(..).collect();
        for consumer in consumers {
            if let Err(e) = consumer.close().await {
                warn!(group_id = %consumer.group_id(), error = %e, "Consumer close failed");
            }
        }
        self.shared.producer.close().await;
        self.shared.pool.close().await;
        info!(client_id = %self.config.client_id, "Message queue client closed");
    }
}

async fn metrics_reporter(shared: Weak<Shared>, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.report_metrics().await;
    }
}
