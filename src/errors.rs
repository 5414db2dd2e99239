//! Engine-wide error type.
//!
//! Domain boundaries (StateStore, CoordStore, BrowserPool, Selector, ...)
//! return `EngineError` so callers can match on failure family; internal
//! plumbing that only needs to propagate uses `anyhow::Result` with
//! `.context(...)` instead.

use thiserror::Error;

/// Result type alias using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Unified error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Retry the operation; the underlying resource is expected to recover
    /// (pool exhaustion, lost connection, coordination op failed closed).
    #[error("transient failure: {0}")]
    Transient(String),

    /// The account itself must be suspended as a result of this failure.
    #[error("account fatal error for {account_id}: {message}")]
    AccountFatal { account_id: String, message: String },

    /// The task cannot succeed regardless of retries; leave the account alone.
    #[error("task fatal error: {0}")]
    TaskFatal(String),

    /// Unrecoverable: the engine should shut down.
    #[error("fatal engine error: {0}")]
    Fatal(String),

    /// No account satisfied the selection filter.
    #[error("no account available")]
    NoAccountAvailable,

    /// `BrowserPool::lease` timed out waiting for a free window.
    #[error("browser unavailable: no window freed within lease timeout")]
    BrowserUnavailable,

    /// `TaskQueue::submit` rejected because the backlog is saturated.
    #[error("queue saturated: {pending_and_delayed} pending+delayed jobs (watermark {watermark})")]
    QueueSaturated {
        pending_and_delayed: usize,
        watermark: usize,
    },

    /// Admission control denied the request; retry after the given delay.
    #[error("admission denied, retry after {retry_after_secs}s")]
    AdmissionDenied { retry_after_secs: u64 },

    /// Configuration failed validation at startup.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the caller should retry the operation in place (as opposed to
    /// surfacing the failure to the task/account/caller).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_)
                | EngineError::NoAccountAvailable
                | EngineError::BrowserUnavailable
                | EngineError::AdmissionDenied { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_admission_denied_are_retryable() {
        assert!(EngineError::Transient("x".into()).is_retryable());
        assert!(EngineError::NoAccountAvailable.is_retryable());
        assert!(EngineError::BrowserUnavailable.is_retryable());
        assert!(EngineError::AdmissionDenied { retry_after_secs: 1 }.is_retryable());
    }

    #[test]
    fn fatal_and_task_fatal_are_not_retryable() {
        assert!(!EngineError::Fatal("x".into()).is_retryable());
        assert!(!EngineError::TaskFatal("x".into()).is_retryable());
        assert!(!EngineError::AccountFatal {
            account_id: "a".into(),
            message: "m".into()
        }
        .is_retryable());
    }
}
