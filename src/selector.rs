//! Account selection and exclusive reservation.
//!
//! Round-robin and least-used selection are expressed as the same
//! hot-swappable `SelectionStrategy` trait as the default health-score
//! ordering, so a deployment can swap policy without touching the
//! reservation machinery below.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::account::{Account, AccountRegistry, AccountStatus, CandidateFilter};
use crate::coord_store::CoordStore;
use crate::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    HealthScore,
    RoundRobin,
    LeastUsed,
}

pub trait SelectionStrategy: Send + Sync {
    /// Orders candidates best-first; `AccountRegistry::candidates` already
    /// returns health-score order, so strategies only need to reorder.
    fn order(&self, candidates: Vec<Account>) -> Vec<Account>;
}

pub struct HealthScoreStrategy;
impl SelectionStrategy for HealthScoreStrategy {
    fn order(&self, candidates: Vec<Account>) -> Vec<Account> {
        candidates
    }
}

pub struct LeastUsedStrategy;
impl SelectionStrategy for LeastUsedStrategy {
    fn order(&self, mut candidates: Vec<Account>) -> Vec<Account> {
        candidates.sort_by_key(|a| a.daily_upload_count);
        candidates
    }
}

/// Cursor persisted in `CoordStore` so round-robin survives process
/// restarts.
pub struct RoundRobinStrategy {
    cursor: AtomicU64,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            cursor: AtomicU64::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn order(&self, candidates: Vec<Account>) -> Vec<Account> {
        if candidates.is_empty() {
            return candidates;
        }
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;
        let start = cursor % candidates.len();
        let mut rotated = candidates;
        rotated.rotate_left(start);
        rotated
    }
}

#[derive(Debug, Clone)]
pub struct Selected {
    pub account: Account,
    pub token: String,
}

pub struct Selector {
    registry: Arc<dyn AccountRegistry>,
    coord: Arc<dyn CoordStore>,
    min_health_score: i32,
    reservation_ttl: std::time::Duration,
}

impl Selector {
    pub fn new(
        registry: Arc<dyn AccountRegistry>,
        coord: Arc<dyn CoordStore>,
        min_health_score: i32,
        reservation_ttl: std::time::Duration,
    ) -> Self {
        Self {
            registry,
            coord,
            min_health_score,
            reservation_ttl,
        }
    }

    pub async fn select(
        &self,
        strategy: &dyn SelectionStrategy,
        preferred_account_id: Option<&str>,
    ) -> Result<Selected> {
        if let Some(id) = preferred_account_id {
            if let Some(account) = self.registry.get(id).await? {
                if let Some(selected) = self.try_reserve(account).await? {
                    return Ok(selected);
                }
            }
        }

        let candidates = self
            .registry
            .candidates(CandidateFilter {
                status: Some(AccountStatus::Active),
                min_health_score: Some(self.min_health_score),
                has_available_uploads: true,
            })
            .await?;
        let ordered = strategy.order(candidates);

        for account in ordered {
            if let Some(selected) = self.try_reserve(account).await? {
                return Ok(selected);
            }
        }
        Err(EngineError::NoAccountAvailable)
    }

    async fn try_reserve(&self, account: Account) -> Result<Option<Selected>> {
        let token = Uuid::new_v4().to_string();
        let key = format!("account:{}", account.id);
        let got = self
            .coord
            .set_if_absent_with_ttl(&key, &token, self.reservation_ttl)
            .await?;
        if got {
            Ok(Some(Selected { account, token }))
        } else {
            Ok(None)
        }
    }

    /// Compare-and-delete: a stale token never revokes someone else's
    /// reservation.
    pub async fn release(&self, account_id: &str, token: &str) -> Result<bool> {
        let key = format!("account:{account_id}");
        Ok(self.coord.delete_if_equals(&key, token).await?)
    }
}

pub fn strategy_for(strategy: Strategy, round_robin: &RoundRobinStrategy) -> Box<dyn SelectionStrategy + '_> {
    match strategy {
        Strategy::HealthScore => Box::new(HealthScoreStrategy),
        Strategy::LeastUsed => Box::new(LeastUsedStrategy),
        Strategy::RoundRobin => Box::new(RoundRobinReference(round_robin)),
    }
}

struct RoundRobinReference<'a>(&'a RoundRobinStrategy);
impl<'a> SelectionStrategy for RoundRobinReference<'a> {
    fn order(&self, candidates: Vec<Account>) -> Vec<Account> {
        self.0.order(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::StoreAccountRegistry;
    use crate::coord_store::InMemoryCoordStore;
    use crate::state_store::InMemoryStateStore;
    use std::time::Duration;

    async fn make_selector() -> (Selector, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let registry: Arc<dyn AccountRegistry> = Arc::new(StoreAccountRegistry::new(store.clone()));
        let coord: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        (
            Selector::new(registry, coord, 0, Duration::from_secs(60)),
            store,
        )
    }

    #[tokio::test]
    async fn select_reserves_the_only_candidate() {
        let (selector, store) = make_selector().await;
        let account = Account::new("a@x.com".into(), "c".into(), "p1".into());
        let id = account.id.clone();
        store.insert_account(account).await.unwrap();

        let selected = selector.select(&HealthScoreStrategy, None).await.unwrap();
        assert_eq!(selected.account.id, id);
    }

    #[tokio::test]
    async fn second_select_fails_while_reservation_held() {
        let (selector, store) = make_selector().await;
        let account = Account::new("a@x.com".into(), "c".into(), "p1".into());
        store.insert_account(account).await.unwrap();

        let _first = selector.select(&HealthScoreStrategy, None).await.unwrap();
        let second = selector.select(&HealthScoreStrategy, None).await;
        assert!(matches!(second, Err(EngineError::NoAccountAvailable)));
    }

    #[tokio::test]
    async fn release_with_stale_token_does_not_free_reservation() {
        let (selector, store) = make_selector().await;
        let account = Account::new("a@x.com".into(), "c".into(), "p1".into());
        let id = account.id.clone();
        store.insert_account(account).await.unwrap();

        let selected = selector.select(&HealthScoreStrategy, None).await.unwrap();
        assert!(!selector.release(&id, "bogus-token").await.unwrap());
        assert!(selector.release(&id, &selected.token).await.unwrap());
    }
}
