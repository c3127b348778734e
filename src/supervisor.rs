//! Supervisor (§4.9): owns pipeline lifecycle and dependency-ordered
//! startup/teardown. Grounded on this codebase's main-loop shutdown
//! pattern (broadcast shutdown signal, bounded grace period) generalized
//! into an explicit state machine with reverse-order teardown on failure.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::anomaly::AnomalyDetector;
use crate::cache::{Cache, InMemoryStore};
use crate::changerate::ChangeRateEngine;
use crate::cleaner::Cleaner;
use crate::config::ServiceConfig;
use crate::error::{LifecycleError, TickstreamError};
use crate::models::{Alert, HealthCheck, HealthStatus, Tick};
use crate::persistence::{AsyncPersistence, DataWriter, LoggingWriter};
use crate::receiver::Receiver;
use crate::telemetry::{timed_check, Telemetry};
use crate::validator::Validator;
use crate::workerpool::{Task, WorkerPool};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl LifecycleState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Error => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Stopped,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Error,
        }
    }
}

pub struct PipelineMetrics {
    pub ticks_received: u64,
    pub ticks_valid: u64,
    pub anomalies_detected: u64,
    pub persistence_success: u64,
    pub persistence_failed: u64,
}

/// Event payload flowing through the single-consumer event loop. A full
/// event channel drops the event rather than blocking the producer (§4.9).
pub enum PipelineEvent {
    TickProcessed { symbol: String },
    AnomalyDetected { symbol: String },
    Alert(Alert),
}

pub struct Supervisor {
    config: RwLock<ServiceConfig>,
    state: AtomicU8,
    shutdown: Notify,

    pub telemetry: Arc<Telemetry>,
    pub cache: Arc<Cache>,
    pub persistence: Arc<AsyncPersistence>,
    pub anomaly_detector: Arc<AnomalyDetector>,
    pub change_rate_engine: Arc<ChangeRateEngine>,
    pub validator: Arc<Validator>,
    pub cleaner: Arc<Cleaner>,
    pub receiver: Arc<Receiver>,
    pub worker_pool: Arc<WorkerPool>,

    events_tx: mpsc::Sender<PipelineEvent>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<PipelineEvent>>>,

    ticks_received: std::sync::atomic::AtomicU64,
    ticks_valid: std::sync::atomic::AtomicU64,
    anomalies_detected: std::sync::atomic::AtomicU64,
}

impl Supervisor {
    pub fn new(config: ServiceConfig) -> Arc<Self> {
        Self::with_writer(config, Arc::new(LoggingWriter))
    }

    pub fn with_writer(config: ServiceConfig, writer: Arc<dyn DataWriter>) -> Arc<Self> {
        Self::with_writer_and_telemetry(config, writer, Arc::new(Telemetry::new(1000)))
    }

    /// Use when the caller already built a `Telemetry` around a `Logger`
    /// it installed as a `tracing_subscriber` layer (see `main.rs`), so
    /// the in-memory log ring actually observes emitted events.
    pub fn with_writer_and_telemetry(
        config: ServiceConfig,
        writer: Arc<dyn DataWriter>,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        let cache = Arc::new(Cache::new(
            Arc::new(InMemoryStore::default()),
            config.cache.clone(),
        ));
        let persistence = AsyncPersistence::new(config.persistence.clone(), writer);
        let anomaly_detector = Arc::new(AnomalyDetector::new(config.anomaly_rules.clone()));
        let change_rate_engine = Arc::new(ChangeRateEngine::new(
            config.processor.max_price_change,
            config.processor.data_retention,
        ));
        let validator = Arc::new(Validator::new(Default::default()));
        let cleaner = Arc::new(Cleaner::new(Default::default()));
        let (alerts_tx, mut alerts_rx) = mpsc::unbounded_channel();
        let receiver = Arc::new(Receiver::with_alerts(
            config.receiver.clone(),
            Some(alerts_tx),
        ));
        let worker_pool = Arc::new(WorkerPool::new(
            config.worker_pool_size,
            config.channel_buffer_size,
            Duration::from_secs(30),
            config.max_retries,
            Duration::from_millis(500),
        ));
        let (events_tx, events_rx) = mpsc::channel(config.channel_buffer_size);

        let this = Arc::new(Self {
            config: RwLock::new(config),
            state: AtomicU8::new(LifecycleState::Stopped.as_u8()),
            shutdown: Notify::new(),
            telemetry,
            cache,
            persistence,
            anomaly_detector,
            change_rate_engine,
            validator,
            cleaner,
            receiver,
            worker_pool,
            events_tx,
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
            ticks_received: std::sync::atomic::AtomicU64::new(0),
            ticks_valid: std::sync::atomic::AtomicU64::new(0),
            anomalies_detected: std::sync::atomic::AtomicU64::new(0),
        });

        // Forward receiver-raised alerts (e.g. a source exhausting
        // reconnect attempts) into the alert manager.
        let alert_manager = this.telemetry.alerts.clone();
        tokio::spawn(async move {
            while let Some(alert) = alerts_rx.recv().await {
                let _ = alert_manager.create_alert(alert);
            }
        });

        this.register_health_probes();
        this
    }

    /// Registers the cache/persistence/receiver probes the §4.10 health
    /// aggregation rule runs over; `health_check()` just delegates to them.
    fn register_health_probes(self: &Arc<Self>) {
        let cache = self.cache.clone();
        self.telemetry.health.register("cache", move || {
            let cache = cache.clone();
            Box::pin(async move {
                let start = Instant::now();
                match cache.ping().await {
                    Ok(()) => timed_check("cache", start, HealthStatus::Healthy, "reachable"),
                    Err(e) => timed_check("cache", start, HealthStatus::Unhealthy, e.to_string()),
                }
            })
        });

        let persistence = self.persistence.clone();
        self.telemetry.health.register("persistence", move || {
            let persistence = persistence.clone();
            Box::pin(async move {
                let start = Instant::now();
                if persistence.health_check().await {
                    timed_check("persistence", start, HealthStatus::Healthy, "draining normally")
                } else {
                    timed_check("persistence", start, HealthStatus::Degraded, "queue near capacity")
                }
            })
        });

        let receiver = self.receiver.clone();
        self.telemetry.health.register("receiver", move || {
            let receiver = receiver.clone();
            Box::pin(async move {
                let start = Instant::now();
                let stats = receiver.stats();
                match stats.active_sources {
                    0 => timed_check("receiver", start, HealthStatus::Unhealthy, "no active sources"),
                    n if n < stats.configured_sources => {
                        timed_check("receiver", start, HealthStatus::Degraded, "some sources down")
                    }
                    _ => timed_check("receiver", start, HealthStatus::Healthy, "all sources active"),
                }
            })
        });
    }

    pub fn status(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.status() == LifecycleState::Running
    }

    fn transition(&self, to: LifecycleState) {
        self.state.store(to.as_u8(), Ordering::SeqCst);
    }

    /// Dependency-ordered startup: Cache (already live from `new`),
    /// Persistence, AnomalyDetector/ChangeRateEngine/Validator/Cleaner
    /// (pure, nothing to start), Receiver, WorkerPool, then the health,
    /// metrics, and event loops. On any failure, already-started
    /// components are torn down in reverse order and the state becomes
    /// `Error`.
    pub async fn start(self: &Arc<Self>) -> Result<(), TickstreamError> {
        match self.status() {
            LifecycleState::Running => return Err(LifecycleError::AlreadyRunning.into()),
            LifecycleState::Starting => return Err(LifecycleError::AlreadyStarting.into()),
            _ => {}
        }
        self.transition(LifecycleState::Starting);

        self.persistence.start().await;

        self.worker_pool.start().await;

        if let Err(e) = self.receiver.start().await {
            error!(error = %e, "receiver failed to start, tearing down");
            self.worker_pool.stop().await;
            let _ = self.persistence.stop(Duration::from_secs(5)).await;
            self.transition(LifecycleState::Error);
            return Err(e);
        }

        self.spawn_health_loop();
        self.spawn_metrics_loop();
        self.spawn_event_loop();
        self.spawn_ingest_loop().await;

        self.transition(LifecycleState::Running);
        info!("supervisor running");
        Ok(())
    }

    /// Validate → clean → anomaly/change-rate → cache → persist for one
    /// tick. Submitted to the `WorkerPool` rather than run inline, so a
    /// transient persistence failure gets retried by the pool instead of
    /// being silently swallowed.
    async fn process_tick(&self, tick: Tick) -> Result<(), String> {
        self.ticks_received.fetch_add(1, Ordering::Relaxed);
        let report = self.validator.validate(&tick);
        if !report.is_valid {
            return Ok(());
        }
        let (cleaned, _diff) = self.cleaner.clean(&tick);
        self.ticks_valid.fetch_add(1, Ordering::Relaxed);

        let anomaly = self.anomaly_detector.detect(&cleaned);
        if anomaly.is_anomaly {
            self.anomalies_detected.fetch_add(1, Ordering::Relaxed);
            let _ = self.events_tx.try_send(PipelineEvent::AnomalyDetected {
                symbol: cleaned.symbol.clone(),
            });
        }

        self.change_rate_engine.process_tick(&cleaned);
        let _ = self.cache.set_price(&cleaned).await;

        if let Ok(data) = serde_json::to_value(&cleaned) {
            let item = crate::models::PersistenceItem::new(
                crate::models::PersistenceItemType::Price,
                format!("{}:{}", cleaned.symbol, cleaned.timestamp.timestamp_millis()),
                data,
            );
            self.persistence
                .submit(item)
                .await
                .map_err(|e| e.to_string())?;
        }

        let _ = self.events_tx.try_send(PipelineEvent::TickProcessed {
            symbol: cleaned.symbol.clone(),
        });
        Ok(())
    }

    async fn spawn_ingest_loop(self: &Arc<Self>) {
        let Some(mut ticks) = self.receiver.ticks().await else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                let supervisor = this.clone();
                let tick_for_task = tick.clone();
                let id = format!("tick:{}:{}", tick.symbol, tick.timestamp.timestamp_millis());
                let task = Task::new(id, 0, move || {
                    let supervisor = supervisor.clone();
                    let tick = tick_for_task.clone();
                    Box::pin(async move { supervisor.process_tick(tick).await })
                });
                if let Err(e) = this.worker_pool.submit(task).await {
                    warn!(error = %e, "dropping tick: worker pool queue full");
                }
            }
        });
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let this = self.clone();
        let interval = this.config.read().health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (status, _checks) = this.health_check().await;
                        if status == HealthStatus::Unhealthy {
                            warn!("pipeline health check reports unhealthy");
                        }
                    }
                    _ = this.shutdown.notified() => break,
                }
            }
        });
    }

    fn spawn_metrics_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let metrics = this.get_metrics();
                        this.telemetry.metrics.gauge("ticks_received", metrics.ticks_received as f64);
                        this.telemetry.metrics.gauge("ticks_valid", metrics.ticks_valid as f64);
                        this.telemetry.metrics.gauge("anomalies_detected", metrics.anomalies_detected as f64);
                        this.telemetry.metrics.gauge("persistence_success", metrics.persistence_success as f64);
                        this.telemetry.metrics.gauge("persistence_failed", metrics.persistence_failed as f64);
                    }
                    _ = this.shutdown.notified() => break,
                }
            }
        });
    }

    fn spawn_event_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let Some(mut rx) = this.events_rx.lock().await.take() else {
                return;
            };
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(PipelineEvent::TickProcessed { .. }) => {}
                            Some(PipelineEvent::AnomalyDetected { symbol }) => {
                                info!(symbol, "anomaly event observed");
                            }
                            Some(PipelineEvent::Alert(alert)) => {
                                let _ = this.telemetry.alerts.create_alert(alert);
                            }
                            None => break,
                        }
                    }
                    _ = this.shutdown.notified() => break,
                }
            }
        });
    }

    /// Cancels background loops, stops the receiver and worker pool,
    /// then drains and stops persistence within `grace`. If the deadline
    /// elapses, logs and surfaces the timeout rather than blocking forever.
    pub async fn stop(&self, grace: Duration) -> Result<(), TickstreamError> {
        if self.status() != LifecycleState::Running {
            return Err(LifecycleError::NotRunning.into());
        }
        self.transition(LifecycleState::Stopping);
        self.shutdown.notify_waiters();
        self.receiver.stop().await;
        self.worker_pool.stop().await;

        let result = self.persistence.stop(grace).await;
        self.transition(LifecycleState::Stopped);
        if let Err(e) = &result {
            error!(error = %e, "persistence did not drain within grace period");
        }
        result
    }

    pub async fn health_check(&self) -> (HealthStatus, Vec<HealthCheck>) {
        self.telemetry.health.check_all().await
    }

    pub fn get_metrics(&self) -> PipelineMetrics {
        let persistence_stats = self.persistence.stats();
        PipelineMetrics {
            ticks_received: self.ticks_received.load(Ordering::Relaxed),
            ticks_valid: self.ticks_valid.load(Ordering::Relaxed),
            anomalies_detected: self.anomalies_detected.load(Ordering::Relaxed),
            persistence_success: persistence_stats.success_count,
            persistence_failed: persistence_stats.error_count,
        }
    }

    pub fn update_config(&self, config: ServiceConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> ServiceConfig {
        self.config.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.receiver.data_sources = vec![crate::config::DataSourceConfig {
            name: "fixture".to_string(),
            kind: crate::config::SourceKind::File,
            url: "/nonexistent/fixture.jsonl".to_string(),
        }];
        config
    }

    #[tokio::test]
    async fn starts_and_transitions_to_running() {
        let supervisor = Supervisor::new(test_config());
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.status(), LifecycleState::Running);
        supervisor.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(supervisor.status(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let supervisor = Supervisor::new(test_config());
        supervisor.start().await.unwrap();
        assert!(supervisor.start().await.is_err());
        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_rejected() {
        let supervisor = Supervisor::new(test_config());
        assert!(supervisor.stop(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn health_check_reports_some_status() {
        let supervisor = Supervisor::new(test_config());
        supervisor.start().await.unwrap();
        let (status, checks) = supervisor.health_check().await;
        assert!(!checks.is_empty());
        assert!(matches!(
            status,
            HealthStatus::Healthy | HealthStatus::Degraded | HealthStatus::Unhealthy
        ));
        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }
}
