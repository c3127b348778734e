//! Named health probes aggregated per the §3 rule (§4.10).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use parking_lot::Mutex;

use crate::models::{aggregate_health, HealthCheck, HealthStatus};

type Probe = Box<dyn Fn() -> Pin<Box<dyn Future<Output = HealthCheck> + Send>> + Send + Sync>;

pub struct HealthChecker {
    probes: Mutex<HashMap<String, Probe>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            probes: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        probe: impl Fn() -> Pin<Box<dyn Future<Output = HealthCheck> + Send>> + Send + Sync + 'static,
    ) {
        self.probes.lock().insert(name.into(), Box::new(probe));
    }

    pub async fn check_all(&self) -> (HealthStatus, Vec<HealthCheck>) {
        let futures: Vec<_> = {
            let probes = self.probes.lock();
            probes.values().map(|p| p()).collect()
        };
        let mut checks = Vec::with_capacity(futures.len());
        for fut in futures {
            checks.push(fut.await);
        }
        let status = aggregate_health(&checks);
        (status, checks)
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

pub fn timed_check(
    name: impl Into<String>,
    start: Instant,
    status: HealthStatus,
    message: impl Into<String>,
) -> HealthCheck {
    HealthCheck {
        name: name.into(),
        status,
        message: message.into(),
        timestamp: chrono::Utc::now(),
        duration: start.elapsed(),
        metadata: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_healthy_probes_aggregate_to_healthy() {
        let checker = HealthChecker::new();
        checker.register("cache", || {
            Box::pin(async {
                timed_check("cache", Instant::now(), HealthStatus::Healthy, "ok")
            })
        });
        checker.register("persistence", || {
            Box::pin(async {
                timed_check("persistence", Instant::now(), HealthStatus::Healthy, "ok")
            })
        });
        let (status, checks) = checker.check_all().await;
        assert_eq!(status, HealthStatus::Healthy);
        assert_eq!(checks.len(), 2);
    }

    #[tokio::test]
    async fn no_probes_registered_is_healthy() {
        let checker = HealthChecker::new();
        let (status, checks) = checker.check_all().await;
        assert_eq!(status, HealthStatus::Healthy);
        assert!(checks.is_empty());
    }
}
