//! Durable backing store: accounts, tasks, browser instances, history, errors.
//!
//! One `Result`-returning async trait per concern, with the transaction
//! lifecycle (`begin`/`commit`/`rollback` around an opaque transaction
//! handle) idempotent on commit and rolling back automatically if the
//! handle is dropped without either.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::account::{Account, AccountStatus, CandidateFilter};
use crate::errors::{EngineError, Result};
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadHistoryRow {
    pub id: Uuid,
    pub task_id: Uuid,
    pub account_id: String,
    pub success: bool,
    pub video_url: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadErrorRow {
    pub id: Uuid,
    pub task_id: Uuid,
    pub category: String,
    pub attempt: u32,
    pub message_excerpt: String,
    pub recorded_at: DateTime<Utc>,
}

/// Opaque transaction handle, kept object-safe since `StateStore` is used
/// behind `Arc<dyn StateStore>` throughout the engine.
pub enum StoreTx {
    Memory,
    Postgres {
        id: String,
        inner: Option<sqlx::Transaction<'static, sqlx::Postgres>>,
        committed: bool,
    },
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn begin(&self) -> Result<StoreTx>;
    async fn commit(&self, tx: StoreTx) -> Result<()>;
    async fn rollback(&self, tx: StoreTx) -> Result<()>;

    async fn insert_account(&self, account: Account) -> Result<()>;
    async fn get_account(&self, id: &str) -> Result<Option<Account>>;
    async fn get_account_tx(&self, tx: &mut StoreTx, id: &str) -> Result<Option<Account>>;
    async fn update_account_tx(&self, tx: &mut StoreTx, account: &Account) -> Result<()>;
    async fn list_accounts(&self) -> Result<Vec<Account>>;
    async fn reset_daily_counts(&self) -> Result<u64>;

    /// Atomically claim a candidate row so two concurrent selectors never
    /// both pick it; the Postgres adapter uses `SELECT ... FOR UPDATE SKIP
    /// LOCKED`, the in-memory adapter a plain mutex (single-process only).
    async fn select_one_for_update_skip_locked(
        &self,
        filter: CandidateFilter,
    ) -> Result<Option<Account>>;

    async fn insert_task(&self, task: Task) -> Result<()>;
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;
    async fn update_task(&self, task: &Task) -> Result<()>;

    async fn append_history(&self, row: UploadHistoryRow) -> Result<()>;
    async fn append_error(&self, row: UploadErrorRow) -> Result<()>;

    /// History rows for one account recorded at or after `since`, used by
    /// `HealthMonitor`'s 24h failure-ratio alert.
    async fn history_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UploadHistoryRow>>;
}

/// In-memory implementation used in tests and single-process deployments
/// without a Postgres instance.
pub struct InMemoryStateStore {
    accounts: Arc<DashMap<String, Account>>,
    tasks: Arc<DashMap<Uuid, Task>>,
    history: Arc<RwLock<Vec<UploadHistoryRow>>>,
    errors: Arc<RwLock<Vec<UploadErrorRow>>>,
    select_lock: Arc<tokio::sync::Mutex<()>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            accounts: Arc::new(DashMap::new()),
            tasks: Arc::new(DashMap::new()),
            history: Arc::new(RwLock::new(Vec::new())),
            errors: Arc::new(RwLock::new(Vec::new())),
            select_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn begin(&self) -> Result<StoreTx> {
        Ok(StoreTx::Memory)
    }

    async fn commit(&self, _tx: StoreTx) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, _tx: StoreTx) -> Result<()> {
        Ok(())
    }

    async fn insert_account(&self, account: Account) -> Result<()> {
        self.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.get(id).map(|a| a.clone()))
    }

    async fn get_account_tx(&self, _tx: &mut StoreTx, id: &str) -> Result<Option<Account>> {
        self.get_account(id).await
    }

    async fn update_account_tx(&self, _tx: &mut StoreTx, account: &Account) -> Result<()> {
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.accounts.iter().map(|e| e.value().clone()).collect())
    }

    async fn reset_daily_counts(&self) -> Result<u64> {
        let mut n = 0u64;
        for mut entry in self.accounts.iter_mut() {
            entry.value_mut().daily_upload_count = 0;
            n += 1;
        }
        Ok(n)
    }

    async fn select_one_for_update_skip_locked(
        &self,
        filter: CandidateFilter,
    ) -> Result<Option<Account>> {
        let _guard = self.select_lock.lock().await;
        let mut candidates: Vec<Account> = self
            .accounts
            .iter()
            .map(|e| e.value().clone())
            .filter(|a| {
                filter.status.map(|s| s == a.status).unwrap_or(true)
                    && filter
                        .min_health_score
                        .map(|m| a.health_score >= m)
                        .unwrap_or(true)
                    && (!filter.has_available_uploads || a.has_available_uploads())
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.health_score
                .cmp(&a.health_score)
                .then(a.daily_upload_count.cmp(&b.daily_upload_count))
        });
        Ok(candidates.into_iter().next())
    }

    async fn insert_task(&self, task: Task) -> Result<()> {
        self.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn append_history(&self, row: UploadHistoryRow) -> Result<()> {
        self.history.write().push(row);
        Ok(())
    }

    async fn append_error(&self, row: UploadErrorRow) -> Result<()> {
        self.errors.write().push(row);
        Ok(())
    }

    async fn history_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UploadHistoryRow>> {
        Ok(self
            .history
            .read()
            .iter()
            .filter(|h| h.account_id == account_id && h.recorded_at >= since)
            .cloned()
            .collect())
    }
}

/// Postgres-backed implementation. Pool sized to `worker_count + 2` so
/// every worker can hold a connection during a transaction while leaving
/// headroom for the health monitor and daily reset tasks.
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(database_url)
            .await
            .map_err(|e| EngineError::Transient(format!("failed to connect to database: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Fatal(format!("migration failed: {e}")))?;
        Ok(())
    }

    fn map_driver_err(e: sqlx::Error) -> EngineError {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                EngineError::Transient(e.to_string())
            }
            _ => EngineError::Fatal(e.to_string()),
        }
    }

    fn row_to_account(row: &sqlx::postgres::PgRow) -> Result<Account> {
        let status_str: String = row.try_get("status").map_err(Self::map_driver_err)?;
        let status = match status_str.as_str() {
            "active" => AccountStatus::Active,
            "limited" => AccountStatus::Limited,
            "suspended" => AccountStatus::Suspended,
            _ => AccountStatus::Error,
        };
        Ok(Account {
            id: row.try_get("id").map_err(Self::map_driver_err)?,
            email: row.try_get("email").map_err(Self::map_driver_err)?,
            encrypted_credentials: row
                .try_get("encrypted_credentials")
                .map_err(Self::map_driver_err)?,
            browser_profile_id: row
                .try_get("browser_profile_id")
                .map_err(Self::map_driver_err)?,
            status,
            daily_upload_count: row
                .try_get::<i32, _>("daily_upload_count")
                .map_err(Self::map_driver_err)? as u32,
            daily_upload_limit: row
                .try_get::<i32, _>("daily_upload_limit")
                .map_err(Self::map_driver_err)? as u32,
            last_upload_time: row
                .try_get("last_upload_time")
                .map_err(Self::map_driver_err)?,
            health_score: row.try_get("health_score").map_err(Self::map_driver_err)?,
            metadata: row.try_get("metadata").map_err(Self::map_driver_err)?,
        })
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task> {
        let status_str: String = row.try_get("status").map_err(Self::map_driver_err)?;
        let status = match status_str.as_str() {
            "pending" => TaskStatus::Pending,
            "active" => TaskStatus::Active,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Dead,
        };
        let video_data: serde_json::Value =
            row.try_get("video_data").map_err(Self::map_driver_err)?;
        let video_spec = serde_json::from_value(video_data)?;
        Ok(Task {
            id: row.try_get("id").map_err(Self::map_driver_err)?,
            account_id: row.try_get("account_id").map_err(Self::map_driver_err)?,
            // Not persisted: once a task is claimed its account is fixed via
            // `account_id`, so the original preference is no longer needed.
            preferred_account_id: None,
            video_spec,
            priority: row.try_get::<i16, _>("priority").map_err(Self::map_driver_err)? as u8,
            status,
            attempt: row.try_get::<i32, _>("attempt").map_err(Self::map_driver_err)? as u32,
            max_attempts: row
                .try_get::<i32, _>("max_attempts")
                .map_err(Self::map_driver_err)? as u32,
            scheduled_for: row
                .try_get("scheduled_for")
                .map_err(Self::map_driver_err)?,
            result: row.try_get("result").map_err(Self::map_driver_err)?,
            error: row.try_get("error").map_err(Self::map_driver_err)?,
            // Not persisted: in-flight progress lives on the worker's
            // `ProgressSink` and is only ever read back via the queue's own
            // in-memory mirror, not a fresh row read.
            progress: 0.0,
            metadata: None,
            created_at: row.try_get("created_at").map_err(Self::map_driver_err)?,
            started_at: None,
            completed_at: None,
        })
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    #[instrument(skip(self))]
    async fn begin(&self) -> Result<StoreTx> {
        let tx = self.pool.begin().await.map_err(|e| {
            error!("failed to begin transaction: {e}");
            Self::map_driver_err(e)
        })?;
        let id = Uuid::new_v4().to_string();
        debug!(transaction_id = %id, "transaction started");
        Ok(StoreTx::Postgres {
            id,
            inner: Some(tx),
            committed: false,
        })
    }

    async fn commit(&self, tx: StoreTx) -> Result<()> {
        match tx {
            StoreTx::Memory => Ok(()),
            StoreTx::Postgres {
                id,
                mut inner,
                committed,
            } => {
                if committed {
                    warn!(transaction_id = %id, "transaction already committed");
                    return Ok(());
                }
                if let Some(t) = inner.take() {
                    t.commit().await.map_err(Self::map_driver_err)?;
                }
                Ok(())
            }
        }
    }

    async fn rollback(&self, tx: StoreTx) -> Result<()> {
        match tx {
            StoreTx::Memory => Ok(()),
            StoreTx::Postgres { mut inner, .. } => {
                if let Some(t) = inner.take() {
                    t.rollback().await.map_err(Self::map_driver_err)?;
                }
                Ok(())
            }
        }
    }

    async fn insert_account(&self, account: Account) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (id, email, encrypted_credentials, browser_profile_id, \
             status, daily_upload_count, daily_upload_limit, last_upload_time, health_score, metadata) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(&account.id)
        .bind(&account.email)
        .bind(&account.encrypted_credentials)
        .bind(&account.browser_profile_id)
        .bind(account.status.to_string())
        .bind(account.daily_upload_count as i32)
        .bind(account.daily_upload_limit as i32)
        .bind(account.last_upload_time)
        .bind(account.health_score)
        .bind(&account.metadata)
        .execute(&self.pool)
        .await
        .map_err(Self::map_driver_err)?;
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_driver_err)?;
        row.as_ref().map(Self::row_to_account).transpose()
    }

    async fn get_account_tx(&self, tx: &mut StoreTx, id: &str) -> Result<Option<Account>> {
        if let StoreTx::Postgres { inner: Some(t), .. } = tx {
            let row = sqlx::query("SELECT * FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut **t)
                .await
                .map_err(Self::map_driver_err)?;
            row.as_ref().map(Self::row_to_account).transpose()
        } else {
            self.get_account(id).await
        }
    }

    async fn update_account_tx(&self, tx: &mut StoreTx, account: &Account) -> Result<()> {
        let query = sqlx::query(
            "UPDATE accounts SET status=$2, daily_upload_count=$3, last_upload_time=$4, \
             health_score=$5 WHERE id=$1",
        )
        .bind(&account.id)
        .bind(account.status.to_string())
        .bind(account.daily_upload_count as i32)
        .bind(account.last_upload_time)
        .bind(account.health_score);

        if let StoreTx::Postgres { inner: Some(t), .. } = tx {
            query.execute(&mut **t).await.map_err(Self::map_driver_err)?;
        } else {
            query
                .execute(&self.pool)
                .await
                .map_err(Self::map_driver_err)?;
        }
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts")
            .fetch_all(&self.pool)
            .await
            .map_err(Self::map_driver_err)?;
        rows.iter().map(Self::row_to_account).collect()
    }

    async fn reset_daily_counts(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE accounts SET daily_upload_count = 0")
            .execute(&self.pool)
            .await
            .map_err(Self::map_driver_err)?;
        Ok(result.rows_affected())
    }

    async fn select_one_for_update_skip_locked(
        &self,
        filter: CandidateFilter,
    ) -> Result<Option<Account>> {
        let status = filter.status.map(|s| s.to_string());
        let row = sqlx::query(
            "SELECT * FROM accounts \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::int IS NULL OR health_score >= $2) \
               AND ($3 = false OR daily_upload_count < daily_upload_limit) \
             ORDER BY health_score DESC, daily_upload_count ASC \
             FOR UPDATE SKIP LOCKED LIMIT 1",
        )
        .bind(status)
        .bind(filter.min_health_score)
        .bind(filter.has_available_uploads)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_driver_err)?;
        row.as_ref().map(Self::row_to_account).transpose()
    }

    async fn insert_task(&self, task: Task) -> Result<()> {
        let video_data = serde_json::to_value(&task.video_spec)?;
        sqlx::query(
            "INSERT INTO upload_tasks (id, account_id, video_data, priority, status, attempt, \
             max_attempts, scheduled_for, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
        )
        .bind(task.id)
        .bind(&task.account_id)
        .bind(video_data)
        .bind(task.priority as i16)
        .bind(task.status.to_string())
        .bind(task.attempt as i32)
        .bind(task.max_attempts as i32)
        .bind(task.scheduled_for)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .map_err(Self::map_driver_err)?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM upload_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_driver_err)?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "UPDATE upload_tasks SET status=$2, attempt=$3, result=$4, error=$5 WHERE id=$1",
        )
        .bind(task.id)
        .bind(task.status.to_string())
        .bind(task.attempt as i32)
        .bind(&task.result)
        .bind(&task.error)
        .execute(&self.pool)
        .await
        .map_err(Self::map_driver_err)?;
        Ok(())
    }

    async fn append_history(&self, row: UploadHistoryRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO upload_history (id, task_id, account_id, success, video_url, recorded_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(row.id)
        .bind(row.task_id)
        .bind(&row.account_id)
        .bind(row.success)
        .bind(&row.video_url)
        .bind(row.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(Self::map_driver_err)?;
        Ok(())
    }

    async fn append_error(&self, row: UploadErrorRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO upload_errors (id, task_id, category, attempt, message_excerpt, recorded_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(row.id)
        .bind(row.task_id)
        .bind(&row.category)
        .bind(row.attempt as i32)
        .bind(&row.message_excerpt)
        .bind(row.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(Self::map_driver_err)?;
        Ok(())
    }

    async fn history_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UploadHistoryRow>> {
        let rows = sqlx::query(
            "SELECT id, task_id, account_id, success, video_url, recorded_at \
             FROM upload_history WHERE account_id = $1 AND recorded_at >= $2",
        )
        .bind(account_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_driver_err)?;

        rows.iter()
            .map(|row| {
                Ok(UploadHistoryRow {
                    id: row.try_get("id").map_err(Self::map_driver_err)?,
                    task_id: row.try_get("task_id").map_err(Self::map_driver_err)?,
                    account_id: row.try_get("account_id").map_err(Self::map_driver_err)?,
                    success: row.try_get("success").map_err(Self::map_driver_err)?,
                    video_url: row.try_get("video_url").map_err(Self::map_driver_err)?,
                    recorded_at: row.try_get("recorded_at").map_err(Self::map_driver_err)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reset_daily_zeros_all_counts() {
        let store = InMemoryStateStore::new();
        let mut a = Account::new("a@x.com".into(), "c".into(), "p1".into());
        a.daily_upload_count = 4;
        store.insert_account(a).await.unwrap();

        let n = store.reset_daily_counts().await.unwrap();
        assert_eq!(n, 1);
        let accounts = store.list_accounts().await.unwrap();
        assert_eq!(accounts[0].daily_upload_count, 0);
    }

    #[tokio::test]
    async fn select_one_for_update_skip_locked_filters_and_orders() {
        let store = InMemoryStateStore::new();
        let mut healthy = Account::new("h@x.com".into(), "c".into(), "p1".into());
        healthy.health_score = 90;
        let mut weak = Account::new("w@x.com".into(), "c".into(), "p2".into());
        weak.health_score = 10;
        store.insert_account(weak).await.unwrap();
        store.insert_account(healthy.clone()).await.unwrap();

        let picked = store
            .select_one_for_update_skip_locked(CandidateFilter {
                status: None,
                min_health_score: Some(50),
                has_available_uploads: true,
            })
            .await
            .unwrap();
        assert_eq!(picked.unwrap().id, healthy.id);
    }
}
