//! Bounded queue + worker pool batching items to a `DataWriter`, with
//! deduplication, integrity checks, and retry with exponential backoff
//! (§4.7) — the hardest subsystem in the pipeline.
//!
//! Delivery guarantee: at-least-once for items that pass integrity checks
//! and whose errors are retryable; at-most-once for duplicates within the
//! dedup window; best-effort drop for submissions that see a full queue.

mod dedup;
mod integrity;
mod retry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{error, info, warn};

use crate::config::PersistenceConfig;
use crate::error::{PersistenceError, TickstreamError};
use crate::models::{BatchErrorEntry, BatchResult, PersistenceItem};
use crate::performance::{global_queue_registry, LatencyHistogram};

pub use dedup::Deduplicator;
pub use integrity::IntegrityChecker;
pub use retry::RetryManager;

pub use LoggingWriter as DefaultWriter;

/// External writer contract (§6). Errors may carry a retryable flag;
/// absence of the flag is treated as non-retryable (modeled here by
/// returning a plain message and classifying it via `message_is_retryable`).
#[async_trait]
pub trait DataWriter: Send + Sync {
    async fn write(&self, item: &PersistenceItem) -> Result<(), String>;
    async fn write_batch(&self, items: &[PersistenceItem]) -> Result<BatchResult, String>;
    async fn health_check(&self) -> Result<(), String>;
    async fn close(&self) -> Result<(), String>;
}

/// Default `DataWriter` when no external store is configured: logs each
/// batch at info level and always succeeds. Production deployments wire
/// a real store (database, object storage, message bus) behind the same
/// trait; this crate ships no concrete one since the writer contract in
/// §6 names only the interface, not a backend.
pub struct LoggingWriter;

#[async_trait]
impl DataWriter for LoggingWriter {
    async fn write(&self, item: &PersistenceItem) -> Result<(), String> {
        info!(id = %item.id, item_type = ?item.item_type, "persisted item");
        Ok(())
    }

    async fn write_batch(&self, items: &[PersistenceItem]) -> Result<BatchResult, String> {
        info!(count = items.len(), "persisted batch");
        Ok(BatchResult {
            success_count: items.len(),
            error_count: 0,
            durations: Vec::new(),
            errors: Vec::new(),
        })
    }

    async fn health_check(&self) -> Result<(), String> {
        Ok(())
    }

    async fn close(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PersistenceStats {
    pub total_processed: AtomicU64,
    pub success_count: AtomicU64,
    pub error_count: AtomicU64,
    pub retry_count: AtomicU64,
    pub deduplication_count: AtomicU64,
    pub queue_full_count: AtomicU64,
}

pub struct PersistenceStatsSnapshot {
    pub total_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub retry_count: u64,
    pub deduplication_count: u64,
    pub queue_full_count: u64,
    pub avg_process_time: Duration,
    pub min_process_time: Duration,
    pub max_process_time: Duration,
    pub avg_batch_size: f64,
    pub max_batch_size: usize,
    pub memory_usage_bytes: u64,
    pub max_memory_usage_bytes: u64,
}

struct BatchSizeStats {
    total: AtomicU64,
    count: AtomicU64,
    max: AtomicU64,
}

impl Default for BatchSizeStats {
    fn default() -> Self {
        Self {
            total: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }
}

impl BatchSizeStats {
    fn record(&self, size: usize) {
        self.total.fetch_add(size as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(size as u64, Ordering::Relaxed);
    }

    fn avg(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            self.total.load(Ordering::Relaxed) as f64 / count as f64
        }
    }
}

const AVERAGE_ITEM_BYTES: u64 = 512;

pub struct AsyncPersistence {
    config: PersistenceConfig,
    writer: Arc<dyn DataWriter>,
    dedup: Arc<Deduplicator>,
    retry_manager: Arc<RetryManager>,
    tx: AsyncMutex<Option<mpsc::Sender<PersistenceItem>>>,
    stats: Arc<PersistenceStats>,
    process_time: Arc<LatencyHistogram>,
    batch_size_stats: Arc<BatchSizeStats>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    workers_done: Arc<Notify>,
    active_workers: Arc<AtomicU64>,
}

impl AsyncPersistence {
    pub fn new(config: PersistenceConfig, writer: Arc<dyn DataWriter>) -> Arc<Self> {
        let dedup = Arc::new(Deduplicator::new(config.deduplication_window));
        let retry_manager = Arc::new(RetryManager::new(
            config.max_retries,
            config.retry_interval,
            config.retry_backoff,
            config.max_retry_delay,
        ));
        Arc::new(Self {
            config,
            writer,
            dedup,
            retry_manager,
            tx: AsyncMutex::new(None),
            stats: Arc::new(PersistenceStats::default()),
            process_time: Arc::new(LatencyHistogram::new()),
            batch_size_stats: Arc::new(BatchSizeStats::default()),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            workers_done: Arc::new(Notify::new()),
            active_workers: Arc::new(AtomicU64::new(0)),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::channel(self.config.queue_size);
        *self.tx.lock().await = Some(tx);
        let rx = Arc::new(AsyncMutex::new(rx));

        global_queue_registry().register("async_persistence", self.config.queue_size);

        for worker_id in 0..self.config.worker_count {
            let this = self.clone();
            let rx = rx.clone();
            self.active_workers.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                this.worker_loop(worker_id, rx).await;
                if this.active_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
                    this.workers_done.notify_waiters();
                }
            });
        }

        let janitor = self.clone();
        tokio::spawn(async move { janitor.dedup_janitor().await });

        info!(workers = self.config.worker_count, "async persistence started");
    }

    async fn dedup_janitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.dedup.cleanup(),
                _ = self.shutdown.notified() => break,
            }
        }
    }

    /// Submit flow (§4.7): stamp `createdAt`, dedup check, non-blocking
    /// channel send.
    pub async fn submit(&self, mut item: PersistenceItem) -> Result<(), TickstreamError> {
        if item.created_at.timestamp() == 0 {
            item.created_at = Utc::now();
        }

        if self.config.enable_deduplication {
            if self.dedup.is_duplicate(&item) {
                self.stats
                    .deduplication_count
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            self.dedup.add(&item);
        }

        let tx_guard = self.tx.lock().await;
        let tx = tx_guard
            .as_ref()
            .ok_or_else(|| TickstreamError::Lifecycle(crate::error::LifecycleError::NotRunning))?;
        match tx.try_send(item) {
            Ok(()) => {
                let depth = tx.max_capacity() - tx.capacity();
                global_queue_registry().update_depth("async_persistence", depth);
                Ok(())
            }
            Err(_) => {
                self.stats.queue_full_count.fetch_add(1, Ordering::Relaxed);
                Err(TickstreamError::Persistence(PersistenceError::QueueFull))
            }
        }
    }

    pub async fn submit_batch(&self, items: Vec<PersistenceItem>) -> BatchResult {
        let mut result = BatchResult::default();
        for item in items {
            let id = item.id.clone();
            match self.submit(item).await {
                Ok(()) => result.success_count += 1,
                Err(e) => {
                    result.error_count += 1;
                    result.errors.push(BatchErrorEntry {
                        item_id: id,
                        message: e.to_string(),
                        retryable: e.retryable(),
                    });
                }
            }
        }
        result
    }

    async fn worker_loop(
        self: Arc<Self>,
        _worker_id: usize,
        rx: Arc<AsyncMutex<mpsc::Receiver<PersistenceItem>>>,
    ) {
        loop {
            let mut batch = Vec::with_capacity(self.config.batch_size);
            let deadline = tokio::time::sleep(self.config.batch_timeout);
            tokio::pin!(deadline);
            let mut shutting_down = false;

            while batch.len() < self.config.batch_size {
                let mut rx_guard = rx.lock().await;
                tokio::select! {
                    biased;
                    item = rx_guard.recv() => {
                        drop(rx_guard);
                        match item {
                            Some(item) => batch.push(item),
                            None => { shutting_down = true; break; }
                        }
                    }
                    _ = &mut deadline => {
                        drop(rx_guard);
                        break;
                    }
                    _ = self.shutdown.notified() => {
                        drop(rx_guard);
                        shutting_down = true;
                        break;
                    }
                }
            }

            if !batch.is_empty() {
                self.process_batch(batch).await;
            }
            if shutting_down {
                break;
            }
        }
    }

    async fn process_batch(&self, batch: Vec<PersistenceItem>) {
        let started = std::time::Instant::now();
        self.batch_size_stats.record(batch.len());
        self.stats
            .total_processed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        if self.config.enable_integrity_check {
            if let Err(reason) = IntegrityChecker::check_consistency(&batch) {
                warn!(reason, size = batch.len(), "batch failed integrity check, dropping");
                self.stats
                    .error_count
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                return;
            }
            for item in &batch {
                if let Err(reason) = IntegrityChecker::validate_format(item) {
                    warn!(id = %item.id, reason, "item failed format validation, dropping batch");
                    self.stats
                        .error_count
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    return;
                }
            }
        }

        match self.writer.write_batch(&batch).await {
            Ok(result) => {
                self.stats
                    .success_count
                    .fetch_add(result.success_count as u64, Ordering::Relaxed);
                self.stats
                    .error_count
                    .fetch_add(result.error_count as u64, Ordering::Relaxed);
            }
            Err(message) => {
                self.retry_failed_batch(batch, &message).await;
            }
        }

        self.process_time
            .record(started.elapsed().as_micros() as u64);
    }

    async fn retry_failed_batch(&self, batch: Vec<PersistenceItem>, message: &str) {
        for mut item in batch {
            if self.retry_manager.should_retry(item.retry_count, message) {
                item.retry_count += 1;
                self.stats.retry_count.fetch_add(1, Ordering::Relaxed);
                let delay = self.retry_manager.delay_for(item.retry_count);
                let tx = self.tx.lock().await.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(tx) = tx {
                        let _ = tx.send(item).await;
                    }
                });
            } else {
                error!(id = %item.id, message, "item permanently failed to persist");
                self.stats.error_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Polls every 100ms for up to 5s waiting for the queue to drain.
    pub async fn flush(&self) -> Result<(), TickstreamError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let depth = {
                let tx_guard = self.tx.lock().await;
                tx_guard.as_ref().map(|tx| tx.max_capacity() - tx.capacity())
            };
            if depth == Some(0) || depth.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TickstreamError::Lifecycle(
                    crate::error::LifecycleError::ShutdownTimeout,
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn stop(&self, grace: Duration) -> Result<(), TickstreamError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        *self.tx.lock().await = None;
        self.shutdown.notify_waiters();

        let wait = async {
            while self.active_workers.load(Ordering::SeqCst) > 0 {
                self.workers_done.notified().await;
            }
        };
        if tokio::time::timeout(grace, wait).await.is_err() {
            return Err(TickstreamError::Lifecycle(
                crate::error::LifecycleError::ShutdownTimeout,
            ));
        }
        let _ = self.writer.close().await;
        Ok(())
    }

    pub fn queue_usage(&self) -> f64 {
        global_queue_registry()
            .get("async_persistence")
            .map(|s| s.utilization_pct / 100.0)
            .unwrap_or(0.0)
    }

    pub async fn health_check(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.writer.health_check().await.is_ok()
            && self.queue_usage() < 0.9
    }

    pub fn stats(&self) -> PersistenceStatsSnapshot {
        PersistenceStatsSnapshot {
            total_processed: self.stats.total_processed.load(Ordering::Relaxed),
            success_count: self.stats.success_count.load(Ordering::Relaxed),
            error_count: self.stats.error_count.load(Ordering::Relaxed),
            retry_count: self.stats.retry_count.load(Ordering::Relaxed),
            deduplication_count: self.stats.deduplication_count.load(Ordering::Relaxed),
            queue_full_count: self.stats.queue_full_count.load(Ordering::Relaxed),
            avg_process_time: Duration::from_micros(self.process_time.mean() as u64),
            min_process_time: Duration::from_micros(self.process_time.min()),
            max_process_time: Duration::from_micros(self.process_time.max()),
            avg_batch_size: self.batch_size_stats.avg(),
            max_batch_size: self.batch_size_stats.max.load(Ordering::Relaxed) as usize,
            memory_usage_bytes: self.estimated_memory_usage(),
            max_memory_usage_bytes: self.config.max_memory_usage,
        }
    }

    fn estimated_memory_usage(&self) -> u64 {
        let depth = global_queue_registry()
            .get("async_persistence")
            .map(|s| s.current_depth)
            .unwrap_or(0);
        depth as u64 * AVERAGE_ITEM_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PersistenceItemType;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct MockWriter {
        fail_next: StdMutex<bool>,
        written: StdMutex<Vec<PersistenceItem>>,
    }

    impl MockWriter {
        fn new(fail_next: bool) -> Self {
            Self {
                fail_next: StdMutex::new(fail_next),
                written: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DataWriter for MockWriter {
        async fn write(&self, item: &PersistenceItem) -> Result<(), String> {
            self.written.lock().unwrap().push(item.clone());
            Ok(())
        }

        async fn write_batch(&self, items: &[PersistenceItem]) -> Result<BatchResult, String> {
            if *self.fail_next.lock().unwrap() {
                *self.fail_next.lock().unwrap() = false;
                return Err("temporary connection issue".to_string());
            }
            self.written.lock().unwrap().extend(items.iter().cloned());
            Ok(BatchResult {
                success_count: items.len(),
                error_count: 0,
                durations: vec![],
                errors: vec![],
            })
        }

        async fn health_check(&self) -> Result<(), String> {
            Ok(())
        }

        async fn close(&self) -> Result<(), String> {
            Ok(())
        }
    }

    fn item(id: &str) -> PersistenceItem {
        PersistenceItem::new(PersistenceItemType::Price, id, json!({"price": 1}))
    }

    #[tokio::test]
    async fn submit_then_flush_reaches_writer() {
        let writer = Arc::new(MockWriter::new(false));
        let mut config = PersistenceConfig::default();
        config.batch_timeout = Duration::from_millis(20);
        config.worker_count = 1;
        let persistence = AsyncPersistence::new(config, writer.clone());
        persistence.start().await;

        persistence.submit(item("A")).await.unwrap();
        persistence.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(writer.written.lock().unwrap().len(), 1);
        persistence.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_submission_is_collapsed() {
        let writer = Arc::new(MockWriter::new(false));
        let config = PersistenceConfig::default();
        let persistence = AsyncPersistence::new(config, writer);
        persistence.start().await;

        let a = item("X");
        let mut b = item("X");
        b.timestamp = a.timestamp;

        persistence.submit(a).await.unwrap();
        persistence.submit(b).await.unwrap();

        assert_eq!(
            persistence.stats().deduplication_count,
            1,
            "second identical submission should be collapsed"
        );
        persistence.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn queue_full_is_surfaced_to_caller() {
        let writer = Arc::new(MockWriter::new(false));
        let mut config = PersistenceConfig::default();
        config.queue_size = 1;
        config.worker_count = 0;
        let persistence = AsyncPersistence::new(config, writer);
        persistence.start().await;

        persistence.submit(item("A")).await.unwrap();
        let result = persistence.submit(item("B")).await;
        assert!(matches!(
            result,
            Err(TickstreamError::Persistence(PersistenceError::QueueFull))
        ));
        persistence.stop(Duration::from_secs(1)).await.unwrap();
    }
}
