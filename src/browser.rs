//! Pool of live browser-window handles, leased to workers during an upload.
//!
//! A free-list plus a semaphore bounds concurrent leases, and each pooled
//! instance tracks its own health fields (`use_count`/`failure_count`/
//! `last_used`) so the pool can retire a misbehaving window on release
//! instead of handing it back out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrowserPoolConfig;
use crate::errors::{EngineError, Result};
use crate::state::StateTransitionGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrowserStatus {
    Idle,
    Busy,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserInstance {
    pub window_id: Uuid,
    pub debug_endpoint: String,
    pub status: BrowserStatus,
    pub bound_account_id: Option<String>,
    pub error_count: u32,
    pub upload_count: u64,
    pub last_activity: DateTime<Utc>,
    pub is_logged_in: bool,
}

impl BrowserInstance {
    fn new(window_id: Uuid, debug_endpoint: String) -> Self {
        Self {
            window_id,
            debug_endpoint,
            status: BrowserStatus::Idle,
            bound_account_id: None,
            error_count: 0,
            upload_count: 0,
            last_activity: Utc::now(),
            is_logged_in: false,
        }
    }

    fn is_stale(&self, idle_timeout: Duration) -> bool {
        let age = Utc::now() - self.last_activity;
        age.to_std().map(|d| d > idle_timeout).unwrap_or(false)
    }
}

/// The external browser-farm collaborator, consumed as a thin port. A live
/// implementation would call out to the farm's `openByName`/`close`/
/// `checkLogin` endpoints; tests use an in-process fake.
#[async_trait]
pub trait BrowserFarm: Send + Sync {
    async fn open_window(&self, profile_id: &str) -> Result<(Uuid, String)>;
    async fn close_window(&self, window_id: Uuid) -> Result<()>;
    async fn check_login(&self, window_id: Uuid) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Ok,
    Error,
}

#[derive(Debug, Clone)]
pub enum PoolEvent {
    Leased { window_id: Uuid },
    Released { window_id: Uuid },
    Evicted { window_id: Uuid },
    Spawned { window_id: Uuid },
}

pub struct BrowserHandle {
    pub instance: BrowserInstance,
}

struct PoolState {
    free: VecDeque<BrowserInstance>,
    leased: usize,
}

pub struct BrowserPool {
    config: BrowserPoolConfig,
    farm: Arc<dyn BrowserFarm>,
    state: Mutex<PoolState>,
    semaphore: Arc<Semaphore>,
    events: mpsc::UnboundedSender<PoolEvent>,
    transitions: StateTransitionGuard,
}

impl BrowserPool {
    pub fn new(
        config: BrowserPoolConfig,
        farm: Arc<dyn BrowserFarm>,
    ) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(config.max_instances));
        let pool = Self {
            config,
            farm,
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                leased: 0,
            }),
            semaphore,
            events: tx,
            transitions: StateTransitionGuard::new(),
        };
        (pool, rx)
    }

    /// `lease(preferredProfileId?)`: an idle window preferring the given
    /// profile, else spawn below max, else block up to `lease_timeout`.
    pub async fn lease(&self, preferred_profile_id: Option<&str>) -> Result<BrowserHandle> {
        let permit = tokio::time::timeout(self.config.lease_timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| EngineError::BrowserUnavailable)?
            .map_err(|_| EngineError::BrowserUnavailable)?;
        // Permit governs concurrency bookkeeping only; the handle owns the
        // instance for the lease's lifetime and the permit is forgotten
        // (released explicitly on `release`).
        std::mem::forget(permit);

        let mut state = self.state.lock().await;
        let instance = if let Some(pos) = preferred_profile_id.and_then(|_p| {
            // Profile binding is tracked by the farm; here we just prefer the
            // front of the free-list and reuse pooled instances round-robin.
            if state.free.is_empty() {
                None
            } else {
                Some(0usize)
            }
        }) {
            state.free.remove(pos)
        } else {
            state.free.pop_front()
        };

        let instance = match instance {
            Some(i) => i,
            None => {
                drop(state);
                let profile = preferred_profile_id.unwrap_or("default");
                let (window_id, endpoint) = match self.farm.open_window(profile).await {
                    Ok(v) => v,
                    Err(e) => {
                        // The permit was forgotten above on the assumption the
                        // handle would track its lifetime; restore it since no
                        // handle was created.
                        self.semaphore.add_permits(1);
                        return Err(e);
                    }
                };
                let _ = self.events.send(PoolEvent::Spawned { window_id });
                BrowserInstance::new(window_id, endpoint)
            }
        };

        let mut instance = instance;
        if let Err(e) = self
            .transitions
            .can_transition_browser(instance.status, BrowserStatus::Busy)
        {
            warn!(%e, "browser status transition violated lifecycle invariant");
        }
        instance.status = BrowserStatus::Busy;
        instance.last_activity = Utc::now();
        let _ = self.events.send(PoolEvent::Leased {
            window_id: instance.window_id,
        });

        let mut state = self.state.lock().await;
        state.leased += 1;
        drop(state);

        Ok(BrowserHandle { instance })
    }

    /// `release(handle, outcome)`: return to the free-list, or mark errored
    /// and probe health, discarding the handle on failure.
    pub async fn release(&self, mut handle: BrowserHandle, outcome: LeaseOutcome) -> Result<()> {
        handle.instance.last_activity = Utc::now();
        let window_id = handle.instance.window_id;

        let discard = match outcome {
            LeaseOutcome::Ok => {
                let _ = self
                    .transitions
                    .can_transition_browser(handle.instance.status, BrowserStatus::Idle);
                handle.instance.status = BrowserStatus::Idle;
                handle.instance.bound_account_id = None;
                false
            }
            LeaseOutcome::Error => {
                let _ = self
                    .transitions
                    .can_transition_browser(handle.instance.status, BrowserStatus::Error);
                handle.instance.error_count += 1;
                handle.instance.status = BrowserStatus::Error;
                let healthy = self.farm.check_login(window_id).await.unwrap_or(false);
                !healthy || handle.instance.error_count >= self.config.max_error_count
            }
        };

        let mut state = self.state.lock().await;
        state.leased = state.leased.saturating_sub(1);
        if discard {
            drop(state);
            let _ = self.farm.close_window(window_id).await;
            self.semaphore.add_permits(1);
            let _ = self.events.send(PoolEvent::Evicted { window_id });
        } else {
            handle.instance.status = BrowserStatus::Idle;
            state.free.push_back(handle.instance);
            drop(state);
            self.semaphore.add_permits(1);
            let _ = self.events.send(PoolEvent::Released { window_id });
        }
        Ok(())
    }

    /// Periodic probe: evicts windows with `error_count >= max_error_count`
    /// or stale `last_activity` beyond `idle_timeout`, down to `min_instances`.
    pub async fn evict_stale(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let keep_at_least = self.config.min_instances;
        let mut evicted = Vec::new();

        let mut retained = VecDeque::new();
        while let Some(inst) = state.free.pop_front() {
            let stale = inst.is_stale(self.config.idle_timeout)
                || inst.error_count >= self.config.max_error_count;
            if stale && retained.len() + evicted.len() >= keep_at_least {
                evicted.push(inst.window_id);
            } else {
                retained.push_back(inst);
            }
        }
        state.free = retained;
        drop(state);

        for window_id in &evicted {
            let _ = self.farm.close_window(*window_id).await;
            let _ = self.events.send(PoolEvent::Evicted {
                window_id: *window_id,
            });
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted stale browser windows");
        }
        Ok(evicted.len())
    }

    pub async fn stats(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.free.len(), state.leased)
    }
}

/// In-process fake used by tests: opens a fresh window id per call, no real
/// browser farm behind it.
pub struct FakeBrowserFarm;

#[async_trait]
impl BrowserFarm for FakeBrowserFarm {
    async fn open_window(&self, _profile_id: &str) -> Result<(Uuid, String)> {
        Ok((Uuid::new_v4(), "ws://127.0.0.1:0/devtools/fake".to_string()))
    }

    async fn close_window(&self, window_id: Uuid) -> Result<()> {
        debug!(%window_id, "closed fake window");
        Ok(())
    }

    async fn check_login(&self, _window_id: Uuid) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_spawns_when_free_list_empty() {
        let (pool, _rx) = BrowserPool::new(BrowserPoolConfig::default(), Arc::new(FakeBrowserFarm));
        let handle = pool.lease(None).await.unwrap();
        assert_eq!(handle.instance.status, BrowserStatus::Busy);
    }

    #[tokio::test]
    async fn release_ok_returns_to_free_list() {
        let (pool, _rx) = BrowserPool::new(BrowserPoolConfig::default(), Arc::new(FakeBrowserFarm));
        let handle = pool.lease(None).await.unwrap();
        pool.release(handle, LeaseOutcome::Ok).await.unwrap();
        let (free, leased) = pool.stats().await;
        assert_eq!(free, 1);
        assert_eq!(leased, 0);
    }

    #[tokio::test]
    async fn lease_at_max_capacity_times_out() {
        let mut config = BrowserPoolConfig::default();
        config.max_instances = 1;
        config.lease_timeout = Duration::from_millis(50);
        let (pool, _rx) = BrowserPool::new(config, Arc::new(FakeBrowserFarm));
        let _handle = pool.lease(None).await.unwrap();
        let second = pool.lease(None).await;
        assert!(matches!(second, Err(EngineError::BrowserUnavailable)));
    }

    #[tokio::test]
    async fn repeated_errors_evict_the_window() {
        let mut config = BrowserPoolConfig::default();
        config.max_error_count = 1;
        let (pool, _rx) = BrowserPool::new(config, Arc::new(FakeBrowserFarm));
        let handle = pool.lease(None).await.unwrap();
        pool.release(handle, LeaseOutcome::Error).await.unwrap();
        let (free, _) = pool.stats().await;
        assert_eq!(free, 0);
    }
}
