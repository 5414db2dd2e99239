//! The upload worker loop: claim, admit, select an account, lease a
//! browser, drive the upload, record the outcome, release. Composed from
//! `TaskQueue`, `AdmissionControl`, `Selector`, `BrowserPool`, and the
//! consumed `UploadDriver` port.
//!
//! Semaphore-bounded workers, a heartbeat task per worker, and cooperative
//! shutdown via `AtomicBool` + `tokio::select!`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::account::{Account, AccountRegistry};
use crate::admission::{Admission, AdmissionControl};
use crate::browser::{BrowserPool, LeaseOutcome};
use crate::errors::Result;
use crate::queue::TaskQueue;
use crate::retry::{Decision, RetryClassifier};
use crate::selector::{SelectionStrategy, Selector};
use crate::state_store::{StateStore, UploadHistoryRow};
use crate::task::VideoSpec;

/// Progress sink handed to the `UploadDriver`; throttled by the worker to at
/// most one flush per second.
pub type ProgressSink = Arc<dyn Fn(f32) + Send + Sync>;

#[derive(Debug)]
pub struct UploadOutcome {
    pub video_url: String,
}

/// The external browser-automation collaborator, consumed as a thin port.
#[async_trait]
pub trait UploadDriver: Send + Sync {
    async fn run(
        &self,
        window_debug_endpoint: &str,
        account: &Account,
        video_spec: &VideoSpec,
        progress: ProgressSink,
        cancel: tokio_util_cancellation::CancelGuard,
    ) -> std::result::Result<UploadOutcome, String>;
}

/// Stand-in cancellation primitive kept dependency-free: checks an
/// `Arc<AtomicBool>` between steps rather than pulling in `tokio-util`'s
/// `CancellationToken`; the driver trait takes a thin wrapper over it.
pub mod tokio_util_cancellation {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    pub struct CancelGuard(pub Arc<AtomicBool>);

    impl CancelGuard {
        pub fn is_cancelled(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub tasks_processed: AtomicU64,
    pub tasks_succeeded: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_dead_lettered: AtomicU64,
    pub last_heartbeat: RwLock<Option<Instant>>,
}

/// Point-in-time counters for one worker, per `get_system_status`'s
/// per-worker detail.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatsSnapshot {
    pub worker_id: String,
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_dead_lettered: u64,
    pub seconds_since_last_heartbeat: Option<f64>,
}

impl WorkerStats {
    pub fn snapshot(&self, worker_id: &str) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            worker_id: worker_id.to_string(),
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_dead_lettered: self.tasks_dead_lettered.load(Ordering::Relaxed),
            seconds_since_last_heartbeat: self
                .last_heartbeat
                .read()
                .map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

pub struct UploadWorker {
    pub id: String,
    queue: Arc<TaskQueue>,
    admission: Arc<AdmissionControl>,
    selector: Arc<Selector>,
    browser_pool: Arc<BrowserPool>,
    registry: Arc<dyn AccountRegistry>,
    store: Arc<dyn StateStore>,
    retry_classifier: Arc<RetryClassifier>,
    driver: Arc<dyn UploadDriver>,
    strategy: Arc<dyn SelectionStrategy>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    progress_flush_interval: Duration,
}

#[allow(clippy::too_many_arguments)]
impl UploadWorker {
    pub fn new(
        id: String,
        queue: Arc<TaskQueue>,
        admission: Arc<AdmissionControl>,
        selector: Arc<Selector>,
        browser_pool: Arc<BrowserPool>,
        registry: Arc<dyn AccountRegistry>,
        store: Arc<dyn StateStore>,
        retry_classifier: Arc<RetryClassifier>,
        driver: Arc<dyn UploadDriver>,
        strategy: Arc<dyn SelectionStrategy>,
        progress_flush_interval: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            admission,
            selector,
            browser_pool,
            registry,
            store,
            retry_classifier,
            driver,
            strategy,
            running: Arc::new(AtomicBool::new(true)),
            paused: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(WorkerStats::default()),
            progress_flush_interval,
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Stops the worker for good; `run()` returns once the in-flight task
    /// (if any) finishes. Not reversible; used for shutdown only.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Runs until `stop()` is called; finishes the in-flight task before
    /// exiting. While paused, skips leasing and sleeps instead of exiting,
    /// so `resume()` can bring the same loop back to work.
    pub async fn run(&self) {
        info!(worker_id = %self.id, "upload worker started");
        while self.running.load(Ordering::Relaxed) {
            if self.paused.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "worker iteration failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(worker_id = %self.id, "upload worker stopped");
    }

    /// One iteration of the 7-step loop. Returns `Ok(true)` if a task was
    /// handled (in any outcome), `Ok(false)` if the queue was empty.
    async fn process_next(&self) -> Result<bool> {
        // Step 1: lease.
        let Some(active) = self.queue.lease(&self.id).await? else {
            return Ok(false);
        };
        self.stats.tasks_processed.fetch_add(1, Ordering::Relaxed);
        *self.stats.last_heartbeat.write() = Some(Instant::now());

        let preferred = active.task.preferred_account_id.clone();

        // Step 2: admission.
        let admission_key = preferred.clone().unwrap_or_else(|| "unassigned".to_string());
        match self.admission.allow(&admission_key).await? {
            Admission::Denied { retry_after_secs } => {
                self.queue
                    .nack(
                        active.queue_id,
                        "admission denied".to_string(),
                        Some(Duration::from_secs(retry_after_secs)),
                        false,
                    )
                    .await?;
                return Ok(true);
            }
            Admission::Allowed => {}
        }

        // Step 3: select + reserve.
        let selected = match self
            .selector
            .select(self.strategy.as_ref(), preferred.as_deref())
            .await
        {
            Ok(s) => s,
            Err(_) => {
                self.queue
                    .nack(active.queue_id, "no account available".to_string(), Some(Duration::from_secs(5)), false)
                    .await?;
                return Ok(true);
            }
        };

        // Step 4: browser lease.
        let browser_handle = match self
            .browser_pool
            .lease(Some(&selected.account.browser_profile_id))
            .await
        {
            Ok(h) => h,
            Err(_) => {
                let _ = self.selector.release(&selected.account.id, &selected.token).await;
                self.queue
                    .nack(active.queue_id, "browser unavailable".to_string(), Some(Duration::from_secs(10)), false)
                    .await?;
                return Ok(true);
            }
        };

        // Step 5: run the driver, throttling progress updates.
        let queue = self.queue.clone();
        let queue_id = active.queue_id;
        let last_flush = Arc::new(parking_lot::Mutex::new(Instant::now() - self.progress_flush_interval));
        let flush_interval = self.progress_flush_interval;
        let progress: ProgressSink = Arc::new(move |_p: f32| {
            let mut last = last_flush.lock();
            if last.elapsed() >= flush_interval {
                *last = Instant::now();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let _ = queue.heartbeat(queue_id).await;
                });
            }
        });
        let cancel = tokio_util_cancellation::CancelGuard(self.running.clone());

        let outcome = self
            .driver
            .run(
                &browser_handle.instance.debug_endpoint,
                &selected.account,
                &active.task.video_spec,
                progress,
                cancel,
            )
            .await;

        // Step 6: handle outcome.
        match outcome {
            Ok(ok) => {
                self.registry.apply_outcome(&selected.account.id, true, false).await?;
                self.store
                    .append_history(UploadHistoryRow {
                        id: Uuid::new_v4(),
                        task_id: active.task.id,
                        account_id: selected.account.id.clone(),
                        success: true,
                        video_url: Some(ok.video_url.clone()),
                        recorded_at: Utc::now(),
                    })
                    .await?;
                self.browser_pool.release(browser_handle, LeaseOutcome::Ok).await?;
                self.selector.release(&selected.account.id, &selected.token).await?;
                self.queue.ack(active.queue_id, ok.video_url).await?;
                self.stats.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(error_message) => {
                // The driver actually ran, so this is a real attempt even
                // though the queue's own `attempt` counter (bumped by
                // `nack` below) hasn't been persisted yet.
                let (category, decision) = self
                    .retry_classifier
                    .classify(
                        active.task.id,
                        &error_message,
                        active.task.attempt + 1,
                        selected.account.status,
                    )
                    .await?;
                self.registry
                    .apply_outcome(&selected.account.id, false, category.forces_account_suspension())
                    .await?;
                self.store
                    .append_history(UploadHistoryRow {
                        id: Uuid::new_v4(),
                        task_id: active.task.id,
                        account_id: selected.account.id.clone(),
                        success: false,
                        video_url: None,
                        recorded_at: Utc::now(),
                    })
                    .await?;
                self.browser_pool
                    .release(browser_handle, LeaseOutcome::Error)
                    .await?;
                self.selector.release(&selected.account.id, &selected.token).await?;

                match decision {
                    Decision::Retry { delay } => {
                        self.queue
                            .nack(active.queue_id, error_message, Some(delay), true)
                            .await?;
                        self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Decision::DeadLetter => {
                        self.queue.nack(active.queue_id, error_message, None, true).await?;
                        self.stats.tasks_dead_lettered.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        Ok(true)
    }
}

/// Supervises N long-lived worker coroutines (configurable, default 5).
pub struct WorkerPool {
    workers: Vec<Arc<UploadWorker>>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: Vec<Arc<UploadWorker>>) -> Self {
        Self {
            workers,
            handles: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        for worker in &self.workers {
            let worker = worker.clone();
            self.handles.push(tokio::spawn(async move {
                worker.run().await;
            }));
        }
    }

    /// `pause`: stops every worker from leasing new tasks without touching
    /// `running`, so the spawned loops stay alive and `resume` can bring
    /// them back to work.
    pub fn pause(&self) {
        for w in &self.workers {
            w.pause();
        }
    }

    pub fn resume(&self) {
        for w in &self.workers {
            w.resume();
        }
    }

    pub async fn shutdown(&mut self, drain_timeout: Duration) {
        for w in &self.workers {
            w.stop();
        }
        let deadline = tokio::time::Instant::now() + drain_timeout;
        for handle in self.handles.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("worker did not drain within drain_timeout; abandoning");
            }
        }
    }

    pub fn worker_stats(&self) -> Vec<(String, Arc<WorkerStats>)> {
        self.workers
            .iter()
            .map(|w| (w.id.clone(), w.stats()))
            .collect()
    }

    pub fn stats_snapshot(&self) -> Vec<WorkerStatsSnapshot> {
        self.workers
            .iter()
            .map(|w| w.stats().snapshot(&w.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::StoreAccountRegistry;
    use crate::browser::FakeBrowserFarm;
    use crate::config::{BrowserPoolConfig, QueueConfig};
    use crate::coord_store::InMemoryCoordStore;
    use crate::selector::HealthScoreStrategy;
    use crate::state_store::InMemoryStateStore;

    struct AlwaysSucceedsDriver;

    #[async_trait]
    impl UploadDriver for AlwaysSucceedsDriver {
        async fn run(
            &self,
            _endpoint: &str,
            _account: &Account,
            _video_spec: &VideoSpec,
            _progress: ProgressSink,
            _cancel: tokio_util_cancellation::CancelGuard,
        ) -> std::result::Result<UploadOutcome, String> {
            Ok(UploadOutcome {
                video_url: "https://example.com/video".to_string(),
            })
        }
    }

    #[test]
    fn worker_stats_start_at_zero() {
        let stats = WorkerStats::default();
        assert_eq!(stats.tasks_processed.load(Ordering::Relaxed), 0);
    }
}
