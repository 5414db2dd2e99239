use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use upload_engine::account::StoreAccountRegistry;
use upload_engine::browser::{BrowserPool, FakeBrowserFarm};
use upload_engine::coord_store::RedisCoordStore;
use upload_engine::state_store::PostgresStateStore;
use upload_engine::worker::{tokio_util_cancellation::CancelGuard, ProgressSink, UploadDriver, UploadOutcome};
use upload_engine::{Account, AccountRegistry, Engine, EngineConfig, StateStore, VideoSpec};

/// Process-boundary overrides; everything else comes from `EngineConfig`/env.
#[derive(Parser)]
#[command(name = "upload-engine")]
#[command(about = "Video upload orchestration engine")]
struct Args {
    #[arg(long, env = "WORKER_COUNT")]
    worker_count: Option<usize>,

    #[arg(long, env = "MIN_HEALTH_SCORE")]
    min_health_score: Option<i32>,

    #[arg(long, env = "DB_POOL_SIZE", default_value = "8")]
    db_pool_size: u32,

    #[arg(long, env = "RUN_MIGRATIONS", default_value = "false")]
    run_migrations: bool,
}

/// The browser-automation driver is consumed as a thin external port; no
/// such implementation ships in this crate, so the binary wires a driver
/// that fails every upload until a real one is plugged in at this seam.
struct UnconfiguredDriver;

#[async_trait::async_trait]
impl UploadDriver for UnconfiguredDriver {
    async fn run(
        &self,
        _window_debug_endpoint: &str,
        _account: &Account,
        _video_spec: &VideoSpec,
        _progress: ProgressSink,
        _cancel: CancelGuard,
    ) -> Result<UploadOutcome, String> {
        Err("no UploadDriver configured for this deployment".to_string())
    }
}

async fn run() -> anyhow::Result<i32> {
    let args = Args::parse();

    let mut config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return Ok(1);
        }
    };
    if let Some(n) = args.worker_count {
        config.worker.worker_count = n;
    }
    if let Some(h) = args.min_health_score {
        config.worker.min_health_score = h;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_count = config.worker.worker_count,
        redis_url = %config.queue.redis_url,
        "starting upload engine"
    );

    let pg_store = PostgresStateStore::connect(&config.database_url, args.db_pool_size).await?;
    if args.run_migrations {
        pg_store.run_migrations().await?;
    }
    let store: Arc<dyn StateStore> = Arc::new(pg_store);

    let registry: Arc<dyn AccountRegistry> = Arc::new(StoreAccountRegistry::new(store.clone()));
    let coord: Arc<dyn upload_engine::CoordStore> =
        Arc::new(RedisCoordStore::new(&config.queue.redis_url)?);
    let (browser_pool, mut pool_events) =
        BrowserPool::new(config.browser_pool.clone(), Arc::new(FakeBrowserFarm));
    tokio::spawn(async move { while pool_events.recv().await.is_some() {} });

    let engine = Arc::new(Engine::new(
        config,
        store,
        registry,
        coord,
        Arc::new(browser_pool),
        Arc::new(UnconfiguredDriver),
    )?);

    engine.start().await;
    tracing::info!("upload engine started");

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                engine.shutdown().await;
                return Ok(2);
            }
            tracing::info!("shutdown signal received");
        }
    }

    engine.shutdown().await;
    tracing::info!("upload engine shutdown complete");
    Ok(0)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "upload engine failed");
            2
        }
    };
    std::process::exit(code);
}
