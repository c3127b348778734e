//! Telemetry (§4.10): logging, metrics, health, and alerting, wired
//! together behind a single handle the Supervisor owns.

mod alerts;
mod health;
mod logger;
mod metrics;

pub use alerts::AlertManager;
pub use health::{timed_check, HealthChecker};
pub use logger::{LogEntry, Logger};
pub use metrics::{MetricCollector, MetricKind, MetricSample};

use std::sync::Arc;

pub struct Telemetry {
    pub logger: Arc<Logger>,
    pub metrics: Arc<MetricCollector>,
    pub health: Arc<HealthChecker>,
    pub alerts: Arc<AlertManager>,
}

impl Telemetry {
    pub fn new(log_ring_capacity: usize) -> Self {
        Self::with_logger(Arc::new(Logger::new(log_ring_capacity)))
    }

    /// Builds telemetry around a `Logger` the caller already installed as
    /// a `tracing_subscriber` layer, so the ring buffer captures real
    /// events rather than only what tests push directly.
    pub fn with_logger(logger: Arc<Logger>) -> Self {
        Self {
            logger,
            metrics: Arc::new(MetricCollector::new()),
            health: Arc::new(HealthChecker::new()),
            alerts: Arc::new(AlertManager::new()),
        }
    }
}
