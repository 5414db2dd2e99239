//! Configuration structs: explicit fields, `Default` impls, `validate()`.
//!
//! Every sub-config is constructible in isolation and validated
//! independently; `EngineConfig` aggregates them and is the only one built
//! from environment variables.

use std::time::Duration;

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_url: String,
    pub queue_high_watermark: usize,
    pub retain_completed: usize,
    pub retain_failed: usize,
    pub stall_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_high_watermark: 10_000,
            retain_completed: 100,
            retain_failed: 1000,
            stall_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_high_watermark == 0 {
            return Err(EngineError::Configuration(
                "queue_high_watermark must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    pub min_instances: usize,
    pub max_instances: usize,
    pub idle_timeout: Duration,
    pub lease_timeout: Duration,
    pub max_error_count: u32,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 20,
            idle_timeout: Duration::from_secs(10 * 60),
            lease_timeout: Duration::from_secs(60),
            max_error_count: 3,
        }
    }
}

impl BrowserPoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_instances > self.max_instances {
            return Err(EngineError::Configuration(
                "min_instances must be <= max_instances".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AccountQuotaConfig {
    pub default_daily_limit: u32,
    pub daily_window: Duration,
    pub global_limit: u32,
    pub global_window: Duration,
    pub account_limit: u32,
    pub account_window: Duration,
    pub reservation_ttl: Duration,
}

impl Default for AccountQuotaConfig {
    fn default() -> Self {
        Self {
            default_daily_limit: 2,
            daily_window: Duration::from_secs(24 * 60 * 60),
            global_limit: 100,
            global_window: Duration::from_secs(60 * 60),
            account_limit: 10,
            account_window: Duration::from_secs(60 * 60),
            reservation_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl AccountQuotaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.account_limit == 0 || self.global_limit == 0 {
            return Err(EngineError::Configuration(
                "rate limits must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub min_health_score: i32,
    pub progress_flush_interval: Duration,
    pub upload_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            min_health_score: 40,
            progress_flush_interval: Duration::from_secs(1),
            upload_timeout: Duration::from_secs(30 * 60),
            drain_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(EngineError::Configuration(
                "worker_count must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    pub health_low_threshold: i32,
    pub error_rate_threshold: f64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            health_low_threshold: 40,
            error_rate_threshold: 0.5,
        }
    }
}

/// Top-level configuration, assembled from environment variables at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub queue: QueueConfig,
    pub browser_pool: BrowserPoolConfig,
    pub quota: AccountQuotaConfig,
    pub worker: WorkerConfig,
    pub health_monitor: HealthMonitorConfig,
    pub encryption_master_key: Vec<u8>,
    pub log_level: String,
    pub port: u16,
}

impl EngineConfig {
    /// Build from environment: `DB_*`, `REDIS_*`, `ENCRYPTION_MASTER_KEY`,
    /// `LOG_LEVEL`, `PORT`.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DB_URL")
            .map_err(|_| EngineError::Configuration("DB_URL not set".into()))?;
        let redis_url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let key_b64 = std::env::var("ENCRYPTION_MASTER_KEY").map_err(|_| {
            EngineError::Configuration("ENCRYPTION_MASTER_KEY not set".into())
        })?;
        let encryption_master_key = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            key_b64.trim(),
        )
        .map_err(|e| {
            EngineError::Configuration(format!("ENCRYPTION_MASTER_KEY not valid base64: {e}"))
        })?;
        if encryption_master_key.len() != 32 {
            return Err(EngineError::Configuration(format!(
                "ENCRYPTION_MASTER_KEY must decode to 32 bytes, got {}",
                encryption_master_key.len()
            )));
        }

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let mut queue = QueueConfig::default();
        queue.redis_url = redis_url;

        let config = Self {
            database_url,
            queue,
            browser_pool: BrowserPoolConfig::default(),
            quota: AccountQuotaConfig::default(),
            worker: WorkerConfig::default(),
            health_monitor: HealthMonitorConfig::default(),
            encryption_master_key,
            log_level,
            port,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.browser_pool.validate()?;
        self.quota.validate()?;
        self.worker.validate()?;
        if self.database_url.is_empty() {
            return Err(EngineError::Configuration("database_url empty".into()));
        }
        Ok(())
    }
}
