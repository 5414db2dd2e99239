//! Stand-alone demo of the in-process submission API: wires an `Engine`
//! entirely against in-memory fakes (no Redis/Postgres needed) and submits
//! a handful of uploads, polling `status` until they leave `pending`.
//!
//! Not registered as a `[[example]]` in Cargo.toml; the `TaskQueue` is
//! hard-wired to Redis, so this only illustrates the `Engine` surface. Run
//! it by copying the body into a test with a local Redis available.

use std::sync::Arc;
use std::time::Duration;

use upload_engine::account::{Account, StoreAccountRegistry};
use upload_engine::browser::{BrowserPool, FakeBrowserFarm};
use upload_engine::config::{BrowserPoolConfig, EngineConfig};
use upload_engine::coord_store::InMemoryCoordStore;
use upload_engine::state_store::InMemoryStateStore;
use upload_engine::task::{Privacy, SubmitOptions, VideoSpec};
use upload_engine::worker::{tokio_util_cancellation::CancelGuard, ProgressSink, UploadDriver, UploadOutcome};
use upload_engine::{Account as AccountAlias, AccountRegistry, Engine, StateStore};

struct DemoDriver;

#[async_trait::async_trait]
impl UploadDriver for DemoDriver {
    async fn run(
        &self,
        _endpoint: &str,
        _account: &AccountAlias,
        video_spec: &VideoSpec,
        _progress: ProgressSink,
        _cancel: CancelGuard,
    ) -> Result<UploadOutcome, String> {
        Ok(UploadOutcome {
            video_url: format!("https://example.com/{}", video_spec.title),
        })
    }
}

fn demo_config() -> EngineConfig {
    EngineConfig {
        database_url: "postgres://demo".to_string(),
        queue: Default::default(),
        browser_pool: BrowserPoolConfig::default(),
        quota: Default::default(),
        worker: Default::default(),
        health_monitor: Default::default(),
        encryption_master_key: vec![0u8; 32],
        log_level: "info".to_string(),
        port: 8080,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let registry: Arc<dyn AccountRegistry> = Arc::new(StoreAccountRegistry::new(store.clone()));
    registry
        .create(Account::new(
            "demo@example.com".into(),
            "ciphertext".into(),
            "profile-1".into(),
        ))
        .await?;

    let coord: Arc<dyn upload_engine::CoordStore> = Arc::new(InMemoryCoordStore::new());
    let (browser_pool, mut events) = BrowserPool::new(BrowserPoolConfig::default(), Arc::new(FakeBrowserFarm));
    tokio::spawn(async move { while events.recv().await.is_some() {} });

    let engine = Engine::new(
        demo_config(),
        store,
        registry,
        coord,
        Arc::new(browser_pool),
        Arc::new(DemoDriver),
    )?;
    engine.start().await;

    let queue_id = engine
        .submit(
            VideoSpec {
                path: "/tmp/demo.mp4".into(),
                title: "demo-upload".into(),
                description: "".into(),
                tags: vec![],
                privacy: Privacy::Unlisted,
                thumbnail_path: None,
                playlist: None,
                scheduled_publish_at: None,
            },
            SubmitOptions::default(),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let view = engine.status(queue_id).await?;
    println!("task {} status: {:?}", view.task_id, view.status);

    engine.shutdown().await;
    Ok(())
}
