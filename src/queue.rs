//! Durable, priority-ordered task queue.
//!
//! Redis sorted sets per zone (`pending/active/delayed/completed/failed/
//! dead`), a `SETNX`-style lease for claiming work, and a lease reclaim
//! sweep for workers that die mid-task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::errors::{EngineError, Result};
use crate::state::StateTransitionGuard;
use crate::task::{ActiveJob, Task, TaskStatus};

const PENDING_ZSET: &str = "queue:pending";
const DELAYED_ZSET: &str = "queue:delayed";
const COMPLETED_ZSET: &str = "queue:completed";
// `failed` is a transient task status, not a durable zone: `nack` always
// moves a task straight from `active` into either `delayed` (retry) or
// `dead` (no retry), so nothing ever lands or lingers here. The zset and
// the `failed` count it backs exist to keep `QueueCounts` shaped like the
// full status enum; it reads 0 in every deployment.
const FAILED_ZSET: &str = "queue:failed";
const DEAD_ZSET: &str = "queue:dead";
const TASK_HASH_PREFIX: &str = "queue:task:";
const ACTIVE_HASH_PREFIX: &str = "queue:active:";
const LEASE_PREFIX: &str = "queue:lease:";

/// The six status zones a task can be inspected in, distinct from
/// `TaskStatus`: a `Pending` task sits in either `PENDING_ZSET` (ready now)
/// or `DELAYED_ZSET` (`scheduled_for` hasn't arrived yet), and `Active`
/// has no zset of its own; it's tracked via the active-job hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueZone {
    Pending,
    Active,
    Delayed,
    Completed,
    Failed,
    Dead,
}

impl QueueZone {
    fn zset_name(&self) -> &'static str {
        match self {
            QueueZone::Pending => PENDING_ZSET,
            QueueZone::Delayed => DELAYED_ZSET,
            QueueZone::Completed => COMPLETED_ZSET,
            QueueZone::Failed => FAILED_ZSET,
            QueueZone::Dead => DEAD_ZSET,
            QueueZone::Active => unreachable!("active has no zset; handled by caller"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueCounts {
    pub pending: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

pub struct TaskQueue {
    client: redis::Client,
    config: QueueConfig,
    cache: Arc<RwLock<HashMap<Uuid, Task>>>,
    transitions: StateTransitionGuard,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
            transitions: StateTransitionGuard::new(),
        })
    }

    /// Logs (without blocking) a status change that violates the task
    /// lifecycle invariant; the call sites below are the only places task
    /// status changes, so a violation here means a logic bug upstream.
    fn check_transition(&self, from: TaskStatus, to: TaskStatus) {
        if let Err(e) = self.transitions.can_transition_task(from, to) {
            warn!(%e, "task status transition violated lifecycle invariant");
        }
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Transient(format!("redis connection failed: {e}")))
    }

    /// `submit(task)`: persist and enqueue; returns a queue-id distinct
    /// from the task-id.
    pub async fn submit(&self, task: Task) -> Result<Uuid> {
        let counts = self.counts().await?;
        if (counts.pending + counts.delayed) as usize >= self.config.queue_high_watermark {
            return Err(EngineError::QueueSaturated {
                pending_and_delayed: (counts.pending + counts.delayed) as usize,
                watermark: self.config.queue_high_watermark,
            });
        }

        let queue_id = Uuid::new_v4();
        let payload = serde_json::to_string(&task)?;
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(format!("{TASK_HASH_PREFIX}{queue_id}"))
            .arg(&payload)
            .ignore();

        if let Some(scheduled) = task.scheduled_for {
            pipe.cmd("ZADD")
                .arg(DELAYED_ZSET)
                .arg(scheduled.timestamp())
                .arg(queue_id.to_string())
                .ignore();
        } else {
            // priority 0..=10, higher first: score so ZREVRANGE pops highest
            // priority first, ties broken by submission order (older first).
            let score = (task.priority as f64) * 1e13 - (Utc::now().timestamp_millis() as f64);
            pipe.cmd("ZADD")
                .arg(PENDING_ZSET)
                .arg(score)
                .arg(queue_id.to_string())
                .ignore();
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        self.cache.write().await.insert(queue_id, task);
        Ok(queue_id)
    }

    pub async fn submit_batch(&self, tasks: Vec<Task>) -> Result<Vec<Uuid>> {
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push(self.submit(task).await?);
        }
        Ok(ids)
    }

    /// Moves scheduled/delayed entries whose time has arrived into `pending`.
    pub async fn process_delayed(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp();
        let ready: Vec<String> = conn.zrangebyscore(DELAYED_ZSET, "-inf", now).await?;
        for id in &ready {
            let payload: Option<String> = conn.get(format!("{TASK_HASH_PREFIX}{id}")).await?;
            let score = payload
                .as_ref()
                .and_then(|p| serde_json::from_str::<Task>(p).ok())
                .map(|t| (t.priority as f64) * 1e13 - (Utc::now().timestamp_millis() as f64))
                .unwrap_or(0.0);

            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("ZREM")
                .arg(DELAYED_ZSET)
                .arg(id)
                .ignore()
                .cmd("ZADD")
                .arg(PENDING_ZSET)
                .arg(score)
                .arg(id)
                .ignore();
            pipe.query_async::<_, ()>(&mut conn).await?;
        }
        Ok(ready.len() as u64)
    }

    /// `lease(workerId) -> Option<ActiveJob>`: pops the highest-priority
    /// ready job, moves it to `active`.
    pub async fn lease(&self, worker_id: &str) -> Result<Option<ActiveJob>> {
        self.process_delayed().await?;
        let mut conn = self.conn().await?;

        let top: Vec<String> = conn.zrevrange(PENDING_ZSET, 0, 0).await?;
        let Some(queue_id_str) = top.into_iter().next() else {
            return Ok(None);
        };
        let queue_id: Uuid = queue_id_str
            .parse()
            .map_err(|_| EngineError::Fatal("corrupt queue id".into()))?;

        let lease_key = format!("{LEASE_PREFIX}{queue_id}");
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&lease_key)
            .arg(worker_id)
            .arg("NX")
            .arg("EX")
            .arg(300)
            .query_async(&mut conn)
            .await?;
        if acquired.is_none() {
            // Someone else grabbed it between ZREVRANGE and SETNX; caller
            // retries on its own next iteration.
            return Ok(None);
        }

        let removed: i64 = conn.zrem(PENDING_ZSET, &queue_id_str).await?;
        if removed == 0 {
            conn.del::<_, ()>(&lease_key).await?;
            return Ok(None);
        }

        let payload: Option<String> = conn.get(format!("{TASK_HASH_PREFIX}{queue_id}")).await?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let mut task: Task = serde_json::from_str(&payload)?;
        self.check_transition(task.status, TaskStatus::Active);
        task.start();

        let now = Utc::now();
        let active = ActiveJob {
            queue_id,
            task: task.clone(),
            leased_by: worker_id.to_string(),
            leased_at: now,
            last_heartbeat: now,
        };
        let active_payload = serde_json::to_string(&active)?;
        conn.set::<_, _, ()>(format!("{ACTIVE_HASH_PREFIX}{queue_id}"), &active_payload)
            .await?;
        conn.set::<_, _, ()>(
            format!("{TASK_HASH_PREFIX}{queue_id}"),
            serde_json::to_string(&task)?,
        )
        .await?;
        self.cache.write().await.insert(queue_id, task);

        Ok(Some(active))
    }

    pub async fn heartbeat(&self, queue_id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.get(format!("{ACTIVE_HASH_PREFIX}{queue_id}")).await?;
        if let Some(payload) = payload {
            let mut active: ActiveJob = serde_json::from_str(&payload)?;
            active.last_heartbeat = Utc::now();
            conn.set::<_, _, ()>(
                format!("{ACTIVE_HASH_PREFIX}{queue_id}"),
                serde_json::to_string(&active)?,
            )
            .await?;
        }
        Ok(())
    }

    /// `ack(jobId, result)`: moves the job to `completed`, applying
    /// retention.
    pub async fn ack(&self, queue_id: Uuid, result: String) -> Result<()> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.get(format!("{TASK_HASH_PREFIX}{queue_id}")).await?;
        let Some(payload) = payload else {
            return Ok(()); // already completed: ack is a no-op.
        };
        let mut task: Task = serde_json::from_str(&payload)?;
        if task.status == TaskStatus::Completed {
            return Ok(());
        }
        self.check_transition(task.status, TaskStatus::Completed);
        task.complete(result);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(format!("{ACTIVE_HASH_PREFIX}{queue_id}"))
            .ignore()
            .cmd("DEL")
            .arg(format!("{LEASE_PREFIX}{queue_id}"))
            .ignore()
            .cmd("SET")
            .arg(format!("{TASK_HASH_PREFIX}{queue_id}"))
            .arg(serde_json::to_string(&task)?)
            .ignore()
            .cmd("ZADD")
            .arg(COMPLETED_ZSET)
            .arg(Utc::now().timestamp())
            .arg(queue_id.to_string())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        self.cache.write().await.insert(queue_id, task);
        self.trim_zone(COMPLETED_ZSET, self.config.retain_completed).await?;
        Ok(())
    }

    /// `nack(jobId, errorInfo, retryDelay?, attempted)`: re-queues to
    /// `delayed` with the given delay, or moves to `dead`. `attempted` must
    /// be `true` only when `UploadDriver::run` was actually invoked for this
    /// lease. Admission/selection/browser-lease nacks pass `false` so a
    /// task churning on those doesn't burn through `max_attempts` without
    /// ever reaching the driver.
    pub async fn nack(
        &self,
        queue_id: Uuid,
        error: String,
        retry_delay: Option<Duration>,
        attempted: bool,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.get(format!("{TASK_HASH_PREFIX}{queue_id}")).await?;
        let Some(payload) = payload else {
            return Ok(());
        };
        let mut task: Task = serde_json::from_str(&payload)?;
        self.check_transition(task.status, TaskStatus::Failed);
        if attempted {
            task.count_attempt();
        }
        task.record_failure(error);

        conn.del::<_, ()>(format!("{ACTIVE_HASH_PREFIX}{queue_id}")).await?;
        conn.del::<_, ()>(format!("{LEASE_PREFIX}{queue_id}")).await?;

        match retry_delay {
            Some(delay) => {
                self.check_transition(task.status, TaskStatus::Pending);
                task.retry();
                let when =
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                task.scheduled_for = Some(when);
                conn.set::<_, _, ()>(
                    format!("{TASK_HASH_PREFIX}{queue_id}"),
                    serde_json::to_string(&task)?,
                )
                .await?;
                conn.zadd::<_, _, _, ()>(DELAYED_ZSET, queue_id.to_string(), when.timestamp())
                    .await?;
            }
            None => {
                self.check_transition(task.status, TaskStatus::Dead);
                task.dead_letter();
                conn.set::<_, _, ()>(
                    format!("{TASK_HASH_PREFIX}{queue_id}"),
                    serde_json::to_string(&task)?,
                )
                .await?;
                conn.zadd::<_, _, _, ()>(DEAD_ZSET, queue_id.to_string(), Utc::now().timestamp())
                    .await?;
            }
        }
        self.cache.write().await.insert(queue_id, task);
        if retry_delay.is_none() {
            self.trim_zone(DEAD_ZSET, self.config.retain_failed).await?;
        }
        Ok(())
    }

    async fn trim_zone(&self, zset: &str, retain: usize) -> Result<()> {
        let mut conn = self.conn().await?;
        let count: usize = conn.zcard(zset).await?;
        if count > retain {
            let to_remove = count - retain;
            conn.zremrangebyrank::<_, ()>(zset, 0, to_remove as isize - 1).await?;
        }
        Ok(())
    }

    pub async fn get_by_id(&self, queue_id: Uuid) -> Result<Option<Task>> {
        if let Some(task) = self.cache.read().await.get(&queue_id).cloned() {
            return Ok(Some(task));
        }
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.get(format!("{TASK_HASH_PREFIX}{queue_id}")).await?;
        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }

    /// `peek(zone, limit)`: the most recent tasks currently sitting in
    /// `zone`, without leasing or mutating anything. Used to inspect the
    /// dead-letter queue and the other zones from outside the worker loop.
    pub async fn peek(&self, zone: QueueZone, limit: usize) -> Result<Vec<Task>> {
        let mut conn = self.conn().await?;

        if zone == QueueZone::Active {
            let keys: Vec<String> = conn.keys(format!("{ACTIVE_HASH_PREFIX}*")).await?;
            let mut tasks = Vec::with_capacity(limit.min(keys.len()));
            for key in keys.into_iter().take(limit) {
                let payload: Option<String> = conn.get(&key).await?;
                let Some(payload) = payload else { continue };
                let active: ActiveJob = serde_json::from_str(&payload)?;
                tasks.push(active.task);
            }
            return Ok(tasks);
        }

        let zset = zone.zset_name();
        let top = limit.max(1) - 1;
        let ids: Vec<String> = conn.zrevrange(zset, 0, top as isize).await?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let payload: Option<String> = conn.get(format!("{TASK_HASH_PREFIX}{id}")).await?;
            if let Some(payload) = payload {
                tasks.push(serde_json::from_str(&payload)?);
            }
        }
        Ok(tasks)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.conn().await?;
        let active_keys: Vec<String> = conn.keys(format!("{ACTIVE_HASH_PREFIX}*")).await?;
        Ok(QueueCounts {
            pending: conn.zcard(PENDING_ZSET).await?,
            active: active_keys.len() as u64,
            delayed: conn.zcard(DELAYED_ZSET).await?,
            completed: conn.zcard(COMPLETED_ZSET).await?,
            // Always 0; see the comment on `FAILED_ZSET`.
            failed: conn.zcard(FAILED_ZSET).await?,
            dead: conn.zcard(DEAD_ZSET).await?,
        })
    }

    /// Stalled-job detection: an `active` job with no heartbeat for
    /// `stall_timeout` is reclaimed to `pending` with attempt unchanged.
    pub async fn reclaim_stalled(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.keys(format!("{ACTIVE_HASH_PREFIX}*")).await?;
        let mut reclaimed = 0u64;
        let now = Utc::now();

        for key in keys {
            let payload: Option<String> = conn.get(&key).await?;
            let Some(payload) = payload else { continue };
            let active: ActiveJob = serde_json::from_str(&payload)?;
            let stalled = (now - active.last_heartbeat)
                .to_std()
                .map(|d| d > self.config.stall_timeout)
                .unwrap_or(false);
            if !stalled {
                continue;
            }

            warn!(queue_id = %active.queue_id, worker_id = %active.leased_by, "reclaiming stalled task");
            let score = (active.task.priority as f64) * 1e13 - (now.timestamp_millis() as f64);
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("DEL")
                .arg(&key)
                .ignore()
                .cmd("DEL")
                .arg(format!("{LEASE_PREFIX}{}", active.queue_id))
                .ignore()
                .cmd("ZADD")
                .arg(PENDING_ZSET)
                .arg(score)
                .arg(active.queue_id.to_string())
                .ignore();
            pipe.query_async::<_, ()>(&mut conn).await?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pure scheduling math that doesn't require a live Redis instance;
    // `TaskQueue` itself is exercised against a local Redis in the
    // integration tests.
    #[test]
    fn priority_score_ordering_prefers_higher_priority() {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let high = 8.0 * 1e13 - now_ms;
        let low = 2.0 * 1e13 - now_ms;
        assert!(high > low);
    }
}
