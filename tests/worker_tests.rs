//! Cross-module scenario tests composing `AccountRegistry`, `Selector`,
//! `AdmissionControl`, and `RetryClassifier` against in-memory fakes.
//! `TaskQueue`/`BrowserPool` are hard-wired to Redis and exercised only
//! against a live instance, so these scenarios stop short of the queue.

use std::sync::Arc;
use std::time::Duration;

use upload_engine::account::{Account, AccountRegistry, AccountStatus, StoreAccountRegistry};
use upload_engine::admission::{Admission, AdmissionControl};
use upload_engine::coord_store::InMemoryCoordStore;
use upload_engine::errors::EngineError;
use upload_engine::retry::{Decision, RetryClassifier};
use upload_engine::selector::{HealthScoreStrategy, Selector};
use upload_engine::state_store::InMemoryStateStore;

async fn registry_and_store() -> (Arc<InMemoryStateStore>, Arc<dyn AccountRegistry>) {
    let store = Arc::new(InMemoryStateStore::new());
    let registry: Arc<dyn AccountRegistry> = Arc::new(StoreAccountRegistry::new(store.clone()));
    (store, registry)
}

/// Scenario 1: happy path, one account, one task, success.
#[tokio::test]
async fn scenario_happy_path_caps_health_score_and_records_success() {
    let (_store, registry) = registry_and_store().await;
    let account = Account::new("a@x.com".into(), "c".into(), "p1".into());
    let id = account.id.clone();
    registry.create(account).await.unwrap();

    let coord: Arc<dyn upload_engine::coord_store::CoordStore> = Arc::new(InMemoryCoordStore::new());
    let selector = Selector::new(registry.clone(), coord, 0, Duration::from_secs(60));
    let selected = selector.select(&HealthScoreStrategy, None).await.unwrap();
    assert_eq!(selected.account.id, id);

    let updated = registry.apply_outcome(&id, true, false).await.unwrap();
    assert_eq!(updated.health_score, 100); // capped, was already 100
    assert_eq!(updated.daily_upload_count, 1);

    assert!(selector.release(&id, &selected.token).await.unwrap());
}

/// Scenario 2: mutual exclusion, four concurrent selection attempts for
/// the same account, only one succeeds until released.
#[tokio::test]
async fn scenario_mutual_exclusion_only_one_selector_holds_the_account() {
    let (_store, registry) = registry_and_store().await;
    let account = Account::new("a@x.com".into(), "c".into(), "p1".into());
    registry.create(account).await.unwrap();

    let coord: Arc<dyn upload_engine::coord_store::CoordStore> = Arc::new(InMemoryCoordStore::new());
    let selector = Arc::new(Selector::new(registry, coord, 0, Duration::from_secs(60)));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let selector = selector.clone();
        handles.push(tokio::spawn(async move {
            selector.select(&HealthScoreStrategy, None).await
        }));
    }
    let mut ok = 0;
    let mut denied = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::NoAccountAvailable) => denied += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(denied, 3);
}

/// Scenario 3: retryable failure, network error retries at 30s, second
/// attempt succeeds, health settles at 100-10+2=92.
#[tokio::test]
async fn scenario_retryable_failure_then_success_nets_expected_health_score() {
    let (store, registry) = registry_and_store().await;
    let account = Account::new("a@x.com".into(), "c".into(), "p1".into());
    let id = account.id.clone();
    registry.create(account).await.unwrap();

    let classifier = RetryClassifier::new(store.clone() as Arc<dyn upload_engine::state_store::StateStore>);
    let (category, decision) = classifier
        .classify(uuid::Uuid::new_v4(), "ETIMEDOUT talking to upload endpoint", 1, AccountStatus::Active)
        .await
        .unwrap();
    assert_eq!(category, upload_engine::retry::ErrorCategory::NetworkError);
    assert_eq!(decision, Decision::Retry { delay: Duration::from_secs(30) });

    let after_failure = registry.apply_outcome(&id, false, category.forces_account_suspension()).await.unwrap();
    assert_eq!(after_failure.health_score, 90);

    let after_success = registry.apply_outcome(&id, true, false).await.unwrap();
    assert_eq!(after_success.health_score, 92);
    assert_eq!(after_success.status, AccountStatus::Active);
}

/// Scenario 4: non-retryable failure, "account suspended" forces
/// suspension regardless of the arithmetic health delta.
#[tokio::test]
async fn scenario_account_suspended_message_forces_suspension() {
    let (store, registry) = registry_and_store().await;
    let account = Account::new("a@x.com".into(), "c".into(), "p1".into());
    let id = account.id.clone();
    registry.create(account).await.unwrap();

    let classifier = RetryClassifier::new(store as Arc<dyn upload_engine::state_store::StateStore>);
    let (category, decision) = classifier
        .classify(uuid::Uuid::new_v4(), "account suspended for ToS violation", 1, AccountStatus::Active)
        .await
        .unwrap();
    assert_eq!(decision, Decision::DeadLetter);
    assert!(category.forces_account_suspension());

    let updated = registry
        .apply_outcome(&id, false, category.forces_account_suspension())
        .await
        .unwrap();
    assert_eq!(updated.health_score, 90); // -10 alone would not suspend
    assert_eq!(updated.status, AccountStatus::Suspended);
}

/// Scenario 5: daily limit, third submission can't select until
/// `reset_daily` runs.
#[tokio::test]
async fn scenario_daily_limit_blocks_until_reset() {
    let (_store, registry) = registry_and_store().await;
    let mut account = Account::new("a@x.com".into(), "c".into(), "p1".into());
    account.daily_upload_limit = 2;
    let id = account.id.clone();
    registry.create(account).await.unwrap();

    let coord: Arc<dyn upload_engine::coord_store::CoordStore> = Arc::new(InMemoryCoordStore::new());
    let selector = Selector::new(registry.clone(), coord.clone(), 0, Duration::from_secs(60));

    for _ in 0..2 {
        let selected = selector.select(&HealthScoreStrategy, None).await.unwrap();
        registry.apply_outcome(&id, true, false).await.unwrap();
        selector.release(&id, &selected.token).await.unwrap();
    }

    let third = selector.select(&HealthScoreStrategy, None).await;
    assert!(matches!(third, Err(EngineError::NoAccountAvailable)));

    registry.reset_daily().await.unwrap();
    let after_reset = selector.select(&HealthScoreStrategy, None).await.unwrap();
    assert_eq!(after_reset.account.id, id);
}

/// Admission control composes ahead of selection: both counters increment
/// unconditionally and a denial does not roll back.
#[tokio::test]
async fn admission_denial_does_not_roll_back_counters() {
    let coord: Arc<dyn upload_engine::coord_store::CoordStore> = Arc::new(InMemoryCoordStore::new());
    let admission = AdmissionControl::new(
        coord.clone(),
        100,
        Duration::from_secs(3600),
        1,
        Duration::from_secs(3600),
    );

    assert!(matches!(admission.allow("a").await.unwrap(), Admission::Allowed));
    assert!(matches!(admission.allow("a").await.unwrap(), Admission::Denied { .. }));
    // The counter kept incrementing through the denial.
    assert_eq!(coord.get("quota:acct:a").await.unwrap(), Some("2".to_string()));
}
