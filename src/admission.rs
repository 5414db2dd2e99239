//! Global and per-account rate gating ahead of selection.
//!
//! Fixed-window counters on `CoordStore` (first-increment-sets-TTL). A
//! deliberate trade-off against a sliding window: simpler to reason about
//! and cheap to implement on top of a plain key-value TTL store, at the
//! cost of allowing a burst at window boundaries.

use std::sync::Arc;
use std::time::Duration;

use crate::coord_store::CoordStore;
use crate::errors::Result;

pub enum Admission {
    Allowed,
    Denied { retry_after_secs: u64 },
}

pub struct AdmissionControl {
    coord: Arc<dyn CoordStore>,
    global_limit: u32,
    global_window: Duration,
    account_limit: u32,
    account_window: Duration,
}

impl AdmissionControl {
    pub fn new(
        coord: Arc<dyn CoordStore>,
        global_limit: u32,
        global_window: Duration,
        account_limit: u32,
        account_window: Duration,
    ) -> Self {
        Self {
            coord,
            global_limit,
            global_window,
            account_limit,
            account_window,
        }
    }

    /// Increments both counters unconditionally; does not roll back on
    /// denial, so a burst of denied requests still consumes quota budget.
    pub async fn allow(&self, account_id: &str) -> Result<Admission> {
        let global_key = "quota:global".to_string();
        let account_key = format!("quota:acct:{account_id}");

        let global_count = self.coord.incr(&global_key, self.global_window).await?;
        let account_count = self.coord.incr(&account_key, self.account_window).await?;

        if global_count as u32 > self.global_limit {
            let retry_after = self
                .coord
                .ttl_secs(&global_key)
                .await?
                .unwrap_or(self.global_window.as_secs());
            return Ok(Admission::Denied {
                retry_after_secs: retry_after,
            });
        }
        if account_count as u32 > self.account_limit {
            let retry_after = self
                .coord
                .ttl_secs(&account_key)
                .await?
                .unwrap_or(self.account_window.as_secs());
            return Ok(Admission::Denied {
                retry_after_secs: retry_after,
            });
        }
        Ok(Admission::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord_store::InMemoryCoordStore;

    #[tokio::test]
    async fn allows_until_per_account_limit_exceeded() {
        let coord: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let admission = AdmissionControl::new(
            coord,
            100,
            Duration::from_secs(3600),
            2,
            Duration::from_secs(3600),
        );

        assert!(matches!(admission.allow("a").await.unwrap(), Admission::Allowed));
        assert!(matches!(admission.allow("a").await.unwrap(), Admission::Allowed));
        assert!(matches!(
            admission.allow("a").await.unwrap(),
            Admission::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn global_limit_denies_even_under_account_limit() {
        let coord: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let admission = AdmissionControl::new(
            coord,
            1,
            Duration::from_secs(3600),
            100,
            Duration::from_secs(3600),
        );

        assert!(matches!(admission.allow("a").await.unwrap(), Admission::Allowed));
        assert!(matches!(
            admission.allow("b").await.unwrap(),
            Admission::Denied { .. }
        ));
    }
}
