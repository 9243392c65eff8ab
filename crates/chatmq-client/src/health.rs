//! Named health checks.
//!
//! Components register async probes under a name; [`HealthChecker::check_health`]
//! runs all of them concurrently, each bounded by a timeout, and reports one
//! [`HealthStatus`]. [`crate::Mq`] registers a broker ping probe backed by the
//! connection pool.
//!
//! ```ignore
//! let registry = HealthRegistry::new();
//! let pool = pool.clone();
//! registry
//!     .register("broker", move || {
//!         let pool = pool.clone();
//!         async move { pool.health_check(Duration::from_secs(1)).await }.boxed()
//!     })
//!     .await;
//!
//! let status = registry.check_health(Duration::from_secs(2)).await;
//! assert!(status.overall);
//! ```

use crate::error::{MqError, Result};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// An async probe. `Ok(())` means healthy.
pub type HealthCheckFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Outcome of one named check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Outcome of a full health run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    /// True when every check passed (and vacuously when none are registered).
    pub overall: bool,
    pub checks: BTreeMap<String, HealthCheckResult>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Run every registered check, each bounded by `timeout`.
    async fn check_health(&self, timeout: Duration) -> HealthStatus;

    /// Register (or replace) a check under `name`.
    async fn register_check(&self, name: &str, check: HealthCheckFn);

    async fn unregister_check(&self, name: &str);
}

/// Default [`HealthChecker`]: a name-to-probe map.
#[derive(Default)]
pub struct HealthRegistry {
    checks: RwLock<BTreeMap<String, HealthCheckFn>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience wrapper around [`HealthChecker::register_check`] for closures.
    pub async fn register<F>(&self, name: &str, check: F)
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.register_check(name, Arc::new(check)).await;
    }

    pub async fn names(&self) -> Vec<String> {
        self.checks.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl HealthChecker for HealthRegistry {
    async fn check_health(&self, timeout: Duration) -> HealthStatus {
        // Clone the probes out so a slow check never holds the lock.
        let checks: Vec<(String, HealthCheckFn)> = self
            .checks
            .read()
            .await
            .iter()
            .map(|(name, check)| (name.clone(), Arc::clone(check)))
            .collect();

        let runs = checks.into_iter().map(|(name, check)| async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, check()).await {
                Ok(result) => result,
                Err(_) => Err(MqError::timeout("health check", started.elapsed())),
            };
            let result = HealthCheckResult {
                healthy: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
                duration: started.elapsed(),
            };
            (name, result)
        });
        let checks: BTreeMap<_, _> = join_all(runs).await.into_iter().collect();

        let overall = checks.values().all(|c| c.healthy);
        for (name, result) in checks.iter().filter(|(_, r)| !r.healthy) {
            warn!(check = %name, error = ?result.error, "Health check failed");
        }
        debug!(overall, check_count = checks.len(), "Health check completed");

        HealthStatus {
            overall,
            checks,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }
    }

    async fn register_check(&self, name: &str, check: HealthCheckFn) {
        self.checks.write().await.insert(name.to_string(), check);
        info!(name, "Registered health check");
    }

    async fn unregister_check(&self, name: &str) {
        if self.checks.write().await.remove(name).is_some() {
            info!(name, "Unregistered health check");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let status = registry.check_health(Duration::from_millis(50)).await;
        assert!(status.overall);
        assert!(status.checks.is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_check_fails_overall() {
        let registry = HealthRegistry::new();
        registry.register("ok", || async { Ok(()) }.boxed()).await;
        registry
            .register("broker", || {
                async { Err::<(), _>(MqError::connection("ping", "refused")) }.boxed()
            })
            .await;

        let status = registry.check_health(Duration::from_millis(50)).await;
        assert!(!status.overall);
        assert!(status.checks["ok"].healthy);
        assert!(!status.checks["broker"].healthy);
        assert!(status.checks["broker"].error.as_ref().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_slow_check_times_out() {
        let registry = HealthRegistry::new();
        registry
            .register("slow", || {
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
                .boxed()
            })
            .await;

        let started = Instant::now();
        let status = registry.check_health(Duration::from_millis(30)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!status.checks["slow"].healthy);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = HealthRegistry::new();
        registry.register("a", || async { Ok(()) }.boxed()).await;
        registry.register("b", || async { Ok(()) }.boxed()).await;
        registry.unregister_check("a").await;

        assert_eq!(registry.names().await, vec!["b".to_string()]);
    }
}
