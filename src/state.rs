/*!
# Lifecycle Transition Guards

State machine guards for `Task` and `BrowserInstance` lifecycle: a table of
valid `(from, to)` pairs plus transition metrics, rather than reinventing
the invariant checks inline at every call site.
*/

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::browser::BrowserStatus;
use crate::task::TaskStatus;

/// State transition errors.
#[derive(Error, Debug, Clone)]
pub enum StateTransitionError {
    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },
}

/// Transition metrics for monitoring.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TransitionMetrics {
    pub valid_task_transitions: u64,
    pub invalid_task_transitions: u64,
    pub valid_browser_transitions: u64,
    pub invalid_browser_transitions: u64,
    pub last_invalid_transition: Option<chrono::DateTime<chrono::Utc>>,
}

/// Guards `Task` and `BrowserInstance` status transitions: task status
/// moves monotonically within `pending -> active -> (completed | failed)`,
/// with `failed -> pending` permitted only by retry and `dead` always
/// terminal; a browser window moves between `idle`, `busy`, and `error`.
pub struct StateTransitionGuard {
    task_transitions: HashMap<(TaskStatus, TaskStatus), &'static str>,
    browser_transitions: HashMap<(BrowserStatus, BrowserStatus), &'static str>,
    metrics: Arc<parking_lot::RwLock<TransitionMetrics>>,
}

impl StateTransitionGuard {
    pub fn new() -> Self {
        let mut task_transitions = HashMap::new();
        task_transitions.insert(
            (TaskStatus::Pending, TaskStatus::Active),
            "worker leased the task",
        );
        task_transitions.insert(
            (TaskStatus::Active, TaskStatus::Completed),
            "upload succeeded",
        );
        task_transitions.insert(
            (TaskStatus::Active, TaskStatus::Failed),
            "upload attempt failed",
        );
        task_transitions.insert(
            (TaskStatus::Failed, TaskStatus::Pending),
            "retryable error, attempt < max_attempts",
        );
        task_transitions.insert(
            (TaskStatus::Failed, TaskStatus::Dead),
            "non-retryable error or attempts exhausted",
        );

        let mut browser_transitions = HashMap::new();
        browser_transitions.insert((BrowserStatus::Idle, BrowserStatus::Busy), "leased");
        browser_transitions.insert((BrowserStatus::Busy, BrowserStatus::Idle), "released ok");
        browser_transitions.insert((BrowserStatus::Busy, BrowserStatus::Error), "released error");
        browser_transitions.insert(
            (BrowserStatus::Error, BrowserStatus::Idle),
            "health probe passed, window reused",
        );

        Self {
            task_transitions,
            browser_transitions,
            metrics: Arc::new(parking_lot::RwLock::new(TransitionMetrics::default())),
        }
    }

    pub fn can_transition_task(
        &self,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<(), StateTransitionError> {
        if from == to {
            return Ok(());
        }
        if let Some(reason) = self.task_transitions.get(&(from, to)) {
            let mut m = self.metrics.write();
            m.valid_task_transitions += 1;
            debug!(?from, ?to, reason, "valid task transition");
            Ok(())
        } else {
            let mut m = self.metrics.write();
            m.invalid_task_transitions += 1;
            m.last_invalid_transition = Some(chrono::Utc::now());
            let error = StateTransitionError::InvalidTransition {
                from: format!("{from}"),
                to: format!("{to}"),
                reason: "no valid transition path".to_string(),
            };
            warn!(?from, ?to, %error, "invalid task transition blocked");
            Err(error)
        }
    }

    pub fn can_transition_browser(
        &self,
        from: BrowserStatus,
        to: BrowserStatus,
    ) -> Result<(), StateTransitionError> {
        if from == to {
            return Ok(());
        }
        if let Some(reason) = self.browser_transitions.get(&(from, to)) {
            let mut m = self.metrics.write();
            m.valid_browser_transitions += 1;
            debug!(?from, ?to, reason, "valid browser transition");
            Ok(())
        } else {
            let mut m = self.metrics.write();
            m.invalid_browser_transitions += 1;
            m.last_invalid_transition = Some(chrono::Utc::now());
            let error = StateTransitionError::InvalidTransition {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
                reason: "no valid transition path".to_string(),
            };
            warn!(?from, ?to, %error, "invalid browser transition blocked");
            Err(error)
        }
    }

    pub fn metrics(&self) -> TransitionMetrics {
        self.metrics.read().clone()
    }
}

impl Default for StateTransitionGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_active_is_valid() {
        let guard = StateTransitionGuard::new();
        assert!(guard
            .can_transition_task(TaskStatus::Pending, TaskStatus::Active)
            .is_ok());
    }

    #[test]
    fn pending_to_completed_is_rejected() {
        let guard = StateTransitionGuard::new();
        assert!(guard
            .can_transition_task(TaskStatus::Pending, TaskStatus::Completed)
            .is_err());
    }

    #[test]
    fn dead_is_terminal() {
        let guard = StateTransitionGuard::new();
        assert!(guard
            .can_transition_task(TaskStatus::Dead, TaskStatus::Pending)
            .is_err());
    }

    #[test]
    fn failed_to_pending_retry_path_is_valid() {
        let guard = StateTransitionGuard::new();
        assert!(guard
            .can_transition_task(TaskStatus::Active, TaskStatus::Failed)
            .is_ok());
        assert!(guard
            .can_transition_task(TaskStatus::Failed, TaskStatus::Pending)
            .is_ok());
    }

    #[test]
    fn self_transition_is_a_no_op() {
        let guard = StateTransitionGuard::new();
        assert!(guard
            .can_transition_task(TaskStatus::Active, TaskStatus::Active)
            .is_ok());
    }

    #[test]
    fn browser_error_can_return_to_idle_after_probe() {
        let guard = StateTransitionGuard::new();
        assert!(guard
            .can_transition_browser(BrowserStatus::Busy, BrowserStatus::Error)
            .is_ok());
        assert!(guard
            .can_transition_browser(BrowserStatus::Error, BrowserStatus::Idle)
            .is_ok());
    }

    #[test]
    fn idle_cannot_jump_straight_to_error() {
        let guard = StateTransitionGuard::new();
        assert!(guard
            .can_transition_browser(BrowserStatus::Idle, BrowserStatus::Error)
            .is_err());
    }

    #[test]
    fn invalid_transition_increments_metrics() {
        let guard = StateTransitionGuard::new();
        let _ = guard.can_transition_task(TaskStatus::Pending, TaskStatus::Active);
        let _ = guard.can_transition_task(TaskStatus::Dead, TaskStatus::Active);
        let m = guard.metrics();
        assert_eq!(m.valid_task_transitions, 1);
        assert_eq!(m.invalid_task_transitions, 1);
        assert!(m.last_invalid_transition.is_some());
    }
}
