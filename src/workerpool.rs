//! Generic FIFO worker pool usable by any fan-out stage (§4.8). Tasks
//! carry an `id`/`priority` (priority observed but not used for ordering
//! — this pool is strictly FIFO) and a boxed async closure.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

use crate::error::{LifecycleError, TickstreamError};

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

pub struct Task {
    pub id: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub run: Arc<dyn Fn() -> TaskFuture + Send + Sync>,
}

impl Task {
    /// `run` must be callable more than once: a failed task is re-invoked
    /// on retry, not resumed, so it needs fresh captures each attempt.
    pub fn new(
        id: impl Into<String>,
        priority: u8,
        run: impl Fn() -> TaskFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            created_at: Utc::now(),
            run: Arc::new(run),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolStatus {
    Stopped,
    Running,
}

#[derive(Debug, Default)]
pub struct WorkerPoolStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub timed_out: AtomicU64,
}

pub struct WorkerPool {
    max_workers: usize,
    queue_size: usize,
    task_timeout: Duration,
    retry_count: u32,
    retry_delay: Duration,
    tx: AsyncMutex<Option<mpsc::Sender<Task>>>,
    running: AtomicBool,
    stats: Arc<WorkerPoolStats>,
}

impl WorkerPool {
    pub fn new(
        max_workers: usize,
        queue_size: usize,
        task_timeout: Duration,
        retry_count: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            max_workers,
            queue_size,
            task_timeout,
            retry_count,
            retry_delay,
            tx: AsyncMutex::new(None),
            running: AtomicBool::new(false),
            stats: Arc::new(WorkerPoolStats::default()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::channel::<Task>(self.queue_size);
        *self.tx.lock().await = Some(tx);
        let rx = Arc::new(AsyncMutex::new(rx));

        for _ in 0..self.max_workers {
            let this = self.clone();
            let rx = rx.clone();
            tokio::spawn(async move { this.worker_loop(rx).await });
        }
    }

    async fn worker_loop(self: Arc<Self>, rx: Arc<AsyncMutex<mpsc::Receiver<Task>>>) {
        loop {
            let task = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(task) = task else { break };
            self.run_task(task).await;
        }
    }

    async fn run_task(&self, task: Task) {
        let mut attempt: u32 = 0;
        loop {
            let fut = (task.run)();
            match tokio::time::timeout(self.task_timeout, fut).await {
                Ok(Ok(())) => {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(Err(message)) => {
                    if !self.handle_failure(&task.id, message, &mut attempt).await {
                        return;
                    }
                }
                Err(_) => {
                    self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                    if !self
                        .handle_failure(&task.id, "task exceeded taskTimeout".to_string(), &mut attempt)
                        .await
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Returns `true` if the task should be re-run.
    async fn handle_failure(&self, id: &str, message: String, attempt: &mut u32) -> bool {
        if *attempt < self.retry_count {
            *attempt += 1;
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            warn!(id, attempt = *attempt, message, "task failed, will retry");
            tokio::time::sleep(self.retry_delay).await;
            true
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(id, message, "task failed permanently");
            false
        }
    }

    /// Returns a queue-full error rather than blocking.
    pub async fn submit(&self, task: Task) -> Result<(), TickstreamError> {
        let tx_guard = self.tx.lock().await;
        let tx = tx_guard
            .as_ref()
            .ok_or(TickstreamError::Lifecycle(LifecycleError::NotRunning))?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        tx.try_send(task)
            .map_err(|_| TickstreamError::Resource("worker pool queue is full".to_string()))
    }

    pub async fn submit_batch(&self, tasks: Vec<Task>) -> Vec<Result<(), TickstreamError>> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.submit(task).await);
        }
        results
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.tx.lock().await = None;
    }

    pub fn status(&self) -> PoolStatus {
        if self.running.load(Ordering::SeqCst) {
            PoolStatus::Running
        } else {
            PoolStatus::Stopped
        }
    }

    /// No-op while running, per §4.8 — size changes only take effect on
    /// the next `start()`.
    pub fn set_max_workers(&mut self, count: usize) {
        if self.status() == PoolStatus::Stopped {
            self.max_workers = count;
        }
    }

    pub fn set_queue_size(&mut self, size: usize) {
        if self.status() == PoolStatus::Stopped {
            self.queue_size = size;
        }
    }

    pub fn stats(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.stats.submitted.load(Ordering::Relaxed),
            self.stats.completed.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed),
            self.stats.retried.load(Ordering::Relaxed),
            self.stats.timed_out.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn submitted_task_runs() {
        let pool = Arc::new(WorkerPool::new(
            2,
            10,
            Duration::from_secs(1),
            0,
            Duration::from_millis(10),
        ));
        pool.start().await;
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        pool.submit(Task::new("t1", 0, move || {
            let ran2 = ran2.clone();
            Box::pin(async move {
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn queue_full_returns_error_instead_of_blocking() {
        let pool = Arc::new(WorkerPool::new(
            0,
            1,
            Duration::from_secs(1),
            0,
            Duration::from_millis(10),
        ));
        pool.start().await;
        pool.submit(Task::new("t1", 0, || Box::pin(async { Ok(()) })))
            .await
            .unwrap();
        let result = pool
            .submit(Task::new("t2", 0, || Box::pin(async { Ok(()) })))
            .await;
        assert!(result.is_err());
        pool.stop().await;
    }

    #[tokio::test]
    async fn slow_task_times_out() {
        let pool = Arc::new(WorkerPool::new(
            1,
            10,
            Duration::from_millis(20),
            0,
            Duration::from_millis(1),
        ));
        pool.start().await;
        pool.submit(Task::new("slow", 0, || {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let (_, _, failed, _, timed_out) = pool.stats();
        assert_eq!(timed_out, 1);
        assert_eq!(failed, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn failed_task_is_retried_and_eventually_succeeds() {
        let pool = Arc::new(WorkerPool::new(
            1,
            10,
            Duration::from_secs(1),
            2,
            Duration::from_millis(1),
        ));
        pool.start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        pool.submit(Task::new("flaky", 0, move || {
            let attempts2 = attempts2.clone();
            Box::pin(async move {
                let n = attempts2.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(())
                }
            })
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let (_, completed, failed, retried, _) = pool.stats();
        assert_eq!(completed, 1);
        assert_eq!(failed, 0);
        assert_eq!(retried, 2);
        pool.stop().await;
    }
}
