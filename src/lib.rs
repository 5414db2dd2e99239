pub mod account;
pub mod admission;
pub mod browser;
pub mod config;
pub mod coord_store;
pub mod engine;
pub mod errors;
pub mod health;
pub mod queue;
pub mod retry;
pub mod selector;
pub mod state;
pub mod state_store;
pub mod task;
pub mod worker;

pub use account::{Account, AccountRegistry, AccountStatus, CandidateFilter, StoreAccountRegistry};
pub use admission::{Admission, AdmissionControl};
pub use browser::{BrowserFarm, BrowserPool, BrowserStatus, LeaseOutcome};
pub use config::EngineConfig;
pub use coord_store::{CoordStore, InMemoryCoordStore, RedisCoordStore};
pub use engine::{Engine, SystemStatus};
pub use errors::{EngineError, Result};
pub use health::{Alert, AlertHandler, AlertKind, HealthMonitor};
pub use queue::{QueueCounts, QueueZone, TaskQueue};
pub use retry::{Decision, ErrorCategory, RetryClassifier};
pub use selector::{SelectionStrategy, Selector, Strategy};
pub use state_store::{InMemoryStateStore, PostgresStateStore, StateStore};
pub use task::{ActiveJob, Privacy, SubmitOptions, Task, TaskStatus, TaskView, VideoSpec};
pub use worker::{UploadDriver, UploadWorker, WorkerPool, WorkerStats, WorkerStatsSnapshot};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::account::{Account, AccountRegistry, AccountStatus};
    pub use crate::config::EngineConfig;
    pub use crate::engine::Engine;
    pub use crate::errors::{EngineError, Result};
    pub use crate::task::{SubmitOptions, Task, TaskStatus, TaskView, VideoSpec};
    pub use async_trait::async_trait;
}
