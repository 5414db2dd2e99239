//! Account record and the registry that owns its lifecycle.
//!
//! `AccountRegistry::apply_outcome` is the health-scoring state machine; it
//! is the one place that mutates `health_score` and `status`, run inside a
//! single `StateStore` transaction so the read-modify-write can't race with
//! a concurrent outcome on the same account.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::state_store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Active,
    Limited,
    Suspended,
    Error,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccountStatus::Active => "active",
            AccountStatus::Limited => "limited",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub encrypted_credentials: String,
    pub browser_profile_id: String,
    pub status: AccountStatus,
    pub daily_upload_count: u32,
    pub daily_upload_limit: u32,
    pub last_upload_time: Option<DateTime<Utc>>,
    pub health_score: i32,
    pub metadata: serde_json::Value,
}

impl Account {
    pub fn new(email: String, encrypted_credentials: String, browser_profile_id: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            encrypted_credentials,
            browser_profile_id,
            status: AccountStatus::Active,
            daily_upload_count: 0,
            daily_upload_limit: 2,
            last_upload_time: None,
            health_score: 100,
            metadata: serde_json::Value::Null,
        }
    }

    /// healthScore < 30 implies status=suspended.
    pub fn enforce_health_invariant(&mut self) {
        if self.health_score < 30 {
            self.status = AccountStatus::Suspended;
        }
    }

    pub fn has_available_uploads(&self) -> bool {
        self.daily_upload_count < self.daily_upload_limit
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    pub status: Option<AccountStatus>,
    pub min_health_score: Option<i32>,
    pub has_available_uploads: bool,
}

/// Health delta applied on a successful vs failed upload.
const HEALTH_DELTA_SUCCESS: i32 = 2;
const HEALTH_DELTA_FAILURE: i32 = -10;

#[async_trait]
pub trait AccountRegistry: Send + Sync {
    async fn create(&self, account: Account) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Account>>;
    async fn candidates(&self, filter: CandidateFilter) -> Result<Vec<Account>>;
    /// `success=false` with `force_suspend=true` applies the non-retryable
    /// "account_suspended" category override regardless of the health-score
    /// delta alone.
    async fn apply_outcome(&self, account_id: &str, success: bool, force_suspend: bool)
        -> Result<Account>;
    async fn reset_daily(&self) -> Result<u64>;
    async fn trigger_recovery(&self, account_id: &str) -> Result<Account>;
}

/// `StateStore`-backed registry: every mutation goes through one transaction.
pub struct StoreAccountRegistry {
    store: Arc<dyn StateStore>,
}

impl StoreAccountRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AccountRegistry for StoreAccountRegistry {
    async fn create(&self, account: Account) -> Result<()> {
        self.store.insert_account(account).await
    }

    async fn get(&self, id: &str) -> Result<Option<Account>> {
        self.store.get_account(id).await
    }

    async fn candidates(&self, filter: CandidateFilter) -> Result<Vec<Account>> {
        let mut accounts = self.store.list_accounts().await?;
        accounts.retain(|a| {
            filter.status.map(|s| s == a.status).unwrap_or(true)
                && filter
                    .min_health_score
                    .map(|m| a.health_score >= m)
                    .unwrap_or(true)
                && (!filter.has_available_uploads || a.has_available_uploads())
        });
        accounts.sort_by(|a, b| {
            b.health_score
                .cmp(&a.health_score)
                .then(a.daily_upload_count.cmp(&b.daily_upload_count))
        });
        Ok(accounts)
    }

    async fn apply_outcome(
        &self,
        account_id: &str,
        success: bool,
        force_suspend: bool,
    ) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let mut account = match self.store.get_account_tx(&mut tx, account_id).await? {
            Some(a) => a,
            None => {
                self.store.rollback(tx).await?;
                return Err(crate::errors::EngineError::TaskFatal(format!(
                    "unknown account {account_id}"
                )));
            }
        };

        let delta = if success {
            HEALTH_DELTA_SUCCESS
        } else {
            HEALTH_DELTA_FAILURE
        };
        account.health_score = (account.health_score + delta).clamp(0, 100);
        account.daily_upload_count += 1;
        account.last_upload_time = Some(Utc::now());
        account.enforce_health_invariant();
        if force_suspend {
            account.status = AccountStatus::Suspended;
        }

        self.store.update_account_tx(&mut tx, &account).await?;
        self.store.commit(tx).await?;
        Ok(account)
    }

    async fn reset_daily(&self) -> Result<u64> {
        self.store.reset_daily_counts().await
    }

    async fn trigger_recovery(&self, account_id: &str) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let mut account = match self.store.get_account_tx(&mut tx, account_id).await? {
            Some(a) => a,
            None => {
                self.store.rollback(tx).await?;
                return Err(crate::errors::EngineError::TaskFatal(format!(
                    "unknown account {account_id}"
                )));
            }
        };
        account.health_score = 70;
        account.status = AccountStatus::Active;
        account.daily_upload_count = 0;
        self.store.update_account_tx(&mut tx, &account).await?;
        self.store.commit(tx).await?;
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::InMemoryStateStore;

    fn make_account() -> Account {
        Account::new("a@example.com".into(), "ciphertext".into(), "profile-1".into())
    }

    #[tokio::test]
    async fn apply_outcome_success_raises_health_and_caps_at_100() {
        let store = Arc::new(InMemoryStateStore::new());
        let registry = StoreAccountRegistry::new(store.clone());
        let account = make_account();
        let id = account.id.clone();
        registry.create(account).await.unwrap();

        let updated = registry.apply_outcome(&id, true, false).await.unwrap();
        assert_eq!(updated.health_score, 100);
        assert_eq!(updated.daily_upload_count, 1);
    }

    #[tokio::test]
    async fn apply_outcome_failure_below_30_suspends() {
        let store = Arc::new(InMemoryStateStore::new());
        let registry = StoreAccountRegistry::new(store.clone());
        let mut account = make_account();
        account.health_score = 35;
        let id = account.id.clone();
        registry.create(account).await.unwrap();

        let updated = registry.apply_outcome(&id, false, false).await.unwrap();
        assert_eq!(updated.health_score, 25);
        assert_eq!(updated.status, AccountStatus::Suspended);
    }

    #[tokio::test]
    async fn force_suspend_overrides_health_based_status() {
        let store = Arc::new(InMemoryStateStore::new());
        let registry = StoreAccountRegistry::new(store.clone());
        let account = make_account();
        let id = account.id.clone();
        registry.create(account).await.unwrap();

        let updated = registry.apply_outcome(&id, false, true).await.unwrap();
        assert_eq!(updated.status, AccountStatus::Suspended);
        assert_eq!(updated.health_score, 90);
    }

    #[tokio::test]
    async fn trigger_recovery_resets_health_status_and_count() {
        let store = Arc::new(InMemoryStateStore::new());
        let registry = StoreAccountRegistry::new(store.clone());
        let mut account = make_account();
        account.health_score = 10;
        account.status = AccountStatus::Suspended;
        account.daily_upload_count = 5;
        let id = account.id.clone();
        registry.create(account).await.unwrap();

        let recovered = registry.trigger_recovery(&id).await.unwrap();
        assert_eq!(recovered.health_score, 70);
        assert_eq!(recovered.status, AccountStatus::Active);
        assert_eq!(recovered.daily_upload_count, 0);
    }
}
