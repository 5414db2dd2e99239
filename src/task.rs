//! Task: the unit of work submitted to the [`crate::queue::TaskQueue`].
//!
//! Carries the video-upload payload plus the retry/backoff bookkeeping
//! needed to move a task through its lifecycle without consulting any
//! other store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Privacy {
    Private,
    Unlisted,
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSpec {
    pub path: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub privacy: Privacy,
    pub thumbnail_path: Option<String>,
    pub playlist: Option<String>,
    pub scheduled_publish_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Dead,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// Options accepted by `Engine::submit`, per the external-interface contract.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Option<u8>,
    pub preferred_account_id: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub account_id: Option<String>,
    pub preferred_account_id: Option<String>,
    pub video_spec: VideoSpec,
    pub priority: u8,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub progress: f32,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(video_spec: VideoSpec, options: SubmitOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: None,
            preferred_account_id: options.preferred_account_id,
            video_spec,
            priority: options.priority.unwrap_or(5).min(10),
            status: TaskStatus::Pending,
            attempt: 0,
            max_attempts: options.max_attempts.unwrap_or(3),
            scheduled_for: options.scheduled_for,
            result: None,
            error: None,
            progress: 0.0,
            metadata: options.metadata,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map(|t| t <= now).unwrap_or(true)
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::Active;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, result: String) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.progress = 1.0;
        self.completed_at = Some(Utc::now());
    }

    /// Record a failed attempt: stamps the error and moves to `Failed`,
    /// the pivot status between an `active` attempt and its
    /// `pending`/`dead` resolution. Caller decides which resolution via
    /// [`crate::retry::RetryClassifier`].
    pub fn record_failure(&mut self, error: String) {
        self.error = Some(error);
        self.status = TaskStatus::Failed;
    }

    /// Counts a real `UploadDriver::run` invocation. Not called for tasks
    /// nacked before the driver ever ran (admission denial, no account
    /// available, no browser available), so churn on those paths doesn't
    /// eat into `max_attempts`.
    pub fn count_attempt(&mut self) {
        self.attempt += 1;
    }

    /// `failed -> pending`, permitted only when the classifier decided the
    /// error is retryable and `attempt < max_attempts` (enforced by the
    /// caller before invoking this).
    pub fn retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
    }

    /// `failed -> dead` (or `active -> dead` for a non-retryable first
    /// attempt). Terminal.
    pub fn dead_letter(&mut self) {
        self.status = TaskStatus::Dead;
        self.completed_at = Some(Utc::now());
    }

    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds()
    }
}

/// A queue-side view of a leased task: queue-id is distinct from task-id per
/// the external-interface contract (`submit` returns a queue-id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveJob {
    pub queue_id: Uuid,
    pub task: Task,
    pub leased_by: String,
    pub leased_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub attempt: u32,
    pub progress: f32,
    pub error: Option<String>,
    pub result: Option<String>,
}

impl From<&Task> for TaskView {
    fn from(t: &Task) -> Self {
        Self {
            task_id: t.id,
            status: t.status,
            attempt: t.attempt,
            progress: t.progress,
            error: t.error.clone(),
            result: t.result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VideoSpec {
        VideoSpec {
            path: "/tmp/x.mp4".into(),
            title: "t".into(),
            description: "d".into(),
            tags: vec![],
            privacy: Privacy::Private,
            thumbnail_path: None,
            playlist: None,
            scheduled_publish_at: None,
        }
    }

    #[test]
    fn new_task_is_pending_with_zero_attempts() {
        let t = Task::new(spec(), SubmitOptions::default());
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempt, 0);
        assert_eq!(t.priority, 5);
    }

    #[test]
    fn priority_is_clamped_to_ten() {
        let t = Task::new(
            spec(),
            SubmitOptions {
                priority: Some(250),
                ..Default::default()
            },
        );
        assert_eq!(t.priority, 10);
    }

    #[test]
    fn start_sets_active_without_touching_attempt() {
        let mut t = Task::new(spec(), SubmitOptions::default());
        t.start();
        assert_eq!(t.status, TaskStatus::Active);
        assert_eq!(t.attempt, 0);
        assert!(t.started_at.is_some());
    }

    #[test]
    fn count_attempt_only_moves_on_explicit_call() {
        let mut t = Task::new(spec(), SubmitOptions::default());
        t.start();
        t.count_attempt();
        assert_eq!(t.attempt, 1);
    }
}
