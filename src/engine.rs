//! Engine façade: wires every component once and exposes the in-process
//! submission API.
//!
//! A single composition root owns `TaskQueue`, `WorkerPool`, and
//! `HealthMonitor`, and exposes submit/status/pause/resume/shutdown/
//! get_system_status without any component holding a reference back to
//! the `Engine` itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::account::AccountRegistry;
use crate::admission::AdmissionControl;
use crate::browser::BrowserPool;
use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::health::HealthMonitor;
use crate::queue::{QueueCounts, TaskQueue};
use crate::retry::RetryClassifier;
use crate::selector::Selector;
use crate::state_store::StateStore;
use crate::task::{SubmitOptions, Task, TaskView, VideoSpec};
use crate::worker::{UploadDriver, UploadWorker, WorkerPool, WorkerStats, WorkerStatsSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub queue: QueueCounts,
    pub worker_count: usize,
    pub paused: bool,
    pub workers: Vec<WorkerStatsSnapshot>,
}

/// Composition root. Each component holds only its direct dependency as an
/// `Arc<dyn Trait>`; no component references the `Engine` itself, which
/// would otherwise create a reference cycle between the worker pool and
/// its owner.
pub struct Engine {
    queue: Arc<TaskQueue>,
    store: Arc<dyn StateStore>,
    registry: Arc<dyn AccountRegistry>,
    worker_pool: tokio::sync::Mutex<WorkerPool>,
    health_monitor: Arc<HealthMonitor>,
    health_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    reset_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    drain_timeout: Duration,
    paused: AtomicBool,
    shutting_down: AtomicBool,
}

impl Engine {
    /// Wires `StateStore`, `CoordStore`, `BrowserPool`, `AccountRegistry`,
    /// `Selector`, `AdmissionControl`, `TaskQueue`, `RetryClassifier`, N
    /// `UploadWorker`s, and `HealthMonitor`.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        registry: Arc<dyn AccountRegistry>,
        coord: Arc<dyn crate::coord_store::CoordStore>,
        browser_pool: Arc<BrowserPool>,
        driver: Arc<dyn UploadDriver>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(TaskQueue::new(config.queue.clone())?);
        let selector = Arc::new(Selector::new(
            registry.clone(),
            coord.clone(),
            config.worker.min_health_score,
            config.quota.reservation_ttl,
        ));
        let admission = Arc::new(AdmissionControl::new(
            coord.clone(),
            config.quota.global_limit,
            config.quota.global_window,
            config.quota.account_limit,
            config.quota.account_window,
        ));
        let retry_classifier = Arc::new(RetryClassifier::new(store.clone()));
        // HealthScore is the default selection strategy; swapping
        // in `RoundRobinStrategy`/`LeastUsedStrategy` here is the intended
        // hot-swap point.
        let strategy: Arc<dyn crate::selector::SelectionStrategy> =
            Arc::new(crate::selector::HealthScoreStrategy);

        let mut workers = Vec::with_capacity(config.worker.worker_count);
        for i in 0..config.worker.worker_count {
            workers.push(Arc::new(UploadWorker::new(
                format!("worker-{i}"),
                queue.clone(),
                admission.clone(),
                selector.clone(),
                browser_pool.clone(),
                registry.clone(),
                store.clone(),
                retry_classifier.clone(),
                driver.clone(),
                strategy.clone(),
                config.worker.progress_flush_interval,
            )));
        }
        let worker_pool = WorkerPool::new(workers);

        let health_monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            store.clone(),
            config.health_monitor.clone(),
        ));

        Ok(Self {
            queue,
            store,
            registry,
            worker_pool: tokio::sync::Mutex::new(worker_pool),
            health_monitor,
            health_handle: tokio::sync::Mutex::new(None),
            reset_handle: tokio::sync::Mutex::new(None),
            drain_timeout: config.worker.drain_timeout,
            paused: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Starts the worker pool plus the `HealthMonitor` and daily-reset
    /// timers, alongside the N worker coroutines.
    pub async fn start(&self) {
        self.worker_pool.lock().await.start();

        let monitor = self.health_monitor.clone();
        *self.health_handle.lock().await = Some(tokio::spawn(async move {
            monitor.run().await;
        }));

        let registry = self.registry.clone();
        *self.reset_handle.lock().await = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            loop {
                ticker.tick().await;
                if let Err(e) = registry.reset_daily().await {
                    tracing::error!(error = %e, "daily reset failed");
                }
            }
        }));
        info!("engine started");
    }

    /// `submit(video, options) -> TaskHandle`.
    pub async fn submit(&self, video: VideoSpec, options: SubmitOptions) -> Result<Uuid> {
        let task = Task::new(video, options);
        self.store.insert_task(task.clone()).await?;
        self.queue.submit(task).await
    }

    /// `submitBatch([video], options) -> [TaskHandle]`: inserted as one
    /// transactional group so a crash mid-batch never leaves only some
    /// tasks durable.
    pub async fn submit_batch(
        &self,
        videos: Vec<VideoSpec>,
        options: SubmitOptions,
    ) -> Result<Vec<Uuid>> {
        let tx = self.store.begin().await?;
        let tasks: Vec<Task> = videos
            .into_iter()
            .map(|v| Task::new(v, options.clone()))
            .collect();
        for task in &tasks {
            self.store.insert_task(task.clone()).await?;
        }
        self.store.commit(tx).await?;
        self.queue.submit_batch(tasks).await
    }

    /// `status(taskId) -> TaskView`.
    pub async fn status(&self, queue_id: Uuid) -> Result<TaskView> {
        let task = self
            .queue
            .get_by_id(queue_id)
            .await?
            .ok_or_else(|| EngineError::TaskFatal(format!("unknown task {queue_id}")))?;
        Ok(TaskView::from(&task))
    }

    /// Stops workers from acquiring new leases; in-flight uploads finish.
    pub async fn pause(&self) {
        self.worker_pool.lock().await.pause();
        self.paused.store(true, Ordering::Relaxed);
    }

    pub async fn resume(&self) {
        self.worker_pool.lock().await.resume();
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Idempotent; drains within `drain_timeout` before hard-cancelling.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine shutdown initiated");
        if let Some(h) = self.health_handle.lock().await.take() {
            h.abort();
        }
        if let Some(h) = self.reset_handle.lock().await.take() {
            h.abort();
        }
        self.worker_pool
            .lock()
            .await
            .shutdown(self.drain_timeout)
            .await;
        info!("engine shutdown complete");
    }

    pub async fn get_system_status(&self) -> Result<SystemStatus> {
        let queue = self.queue.counts().await?;
        let pool = self.worker_pool.lock().await;
        let workers = pool.stats_snapshot();
        Ok(SystemStatus {
            queue,
            worker_count: workers.len(),
            paused: self.paused.load(Ordering::Relaxed),
            workers,
        })
    }

    pub async fn worker_stats(&self) -> Vec<(String, Arc<WorkerStats>)> {
        self.worker_pool.lock().await.worker_stats()
    }

    pub async fn reclaim_stalled(&self) -> Result<u64> {
        self.queue.reclaim_stalled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, StoreAccountRegistry};
    use crate::browser::{BrowserPool, FakeBrowserFarm};
    use crate::config::{BrowserPoolConfig, EngineConfig, HealthMonitorConfig};
    use crate::coord_store::InMemoryCoordStore;
    use crate::state_store::InMemoryStateStore;
    use async_trait::async_trait;

    fn test_config() -> EngineConfig {
        EngineConfig {
            database_url: "postgres://test".to_string(),
            queue: crate::config::QueueConfig {
                redis_url: "redis://127.0.0.1:6399".to_string(),
                ..Default::default()
            },
            browser_pool: BrowserPoolConfig::default(),
            quota: crate::config::AccountQuotaConfig::default(),
            worker: crate::config::WorkerConfig {
                worker_count: 1,
                ..Default::default()
            },
            health_monitor: HealthMonitorConfig::default(),
            encryption_master_key: vec![0u8; 32],
            log_level: "info".to_string(),
            port: 8080,
        }
    }

    struct NoopDriver;
    #[async_trait]
    impl UploadDriver for NoopDriver {
        async fn run(
            &self,
            _endpoint: &str,
            _account: &Account,
            _video_spec: &VideoSpec,
            _progress: crate::worker::ProgressSink,
            _cancel: crate::worker::tokio_util_cancellation::CancelGuard,
        ) -> std::result::Result<crate::worker::UploadOutcome, String> {
            Ok(crate::worker::UploadOutcome {
                video_url: "https://example.com/v".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn engine_construction_wires_configured_worker_count() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let registry: Arc<dyn AccountRegistry> = Arc::new(StoreAccountRegistry::new(store.clone()));
        let coord: Arc<dyn crate::coord_store::CoordStore> = Arc::new(InMemoryCoordStore::new());
        let (pool, _rx) = BrowserPool::new(BrowserPoolConfig::default(), Arc::new(FakeBrowserFarm));
        let engine = Engine::new(
            test_config(),
            store,
            registry,
            coord,
            Arc::new(pool),
            Arc::new(NoopDriver),
        )
        .unwrap();
        let stats = engine.worker_stats().await;
        assert_eq!(stats.len(), 1);
    }
}
