//! Coordination store: reservations and rate counters.
//!
//! The Redis adapter uses a multiplexed connection and pipelined commands
//! for reservation compare-and-swap and rate-counter increments; the
//! in-memory adapter is a single-process substitute backed by a `DashMap`
//! plus a sweep task that expires entries past their TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;

use crate::errors::{EngineError, Result};

#[async_trait]
pub trait CoordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Returns `true` if this call created the key (it was absent).
    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    /// Increments `key`, setting `ttl` only on the increment that created it.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    /// Compare-and-delete: removes `key` only if its current value equals
    /// `expected`, used by `Selector::release`. Returns whether it deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;
    /// Remaining TTL in seconds, used to compute admission retry-after.
    async fn ttl_secs(&self, key: &str) -> Result<Option<u64>>;
}

pub struct RedisCoordStore {
    client: redis::Client,
}

impl RedisCoordStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Transient(format!("redis connection failed: {e}")))
    }
}

#[async_trait]
impl CoordStore for RedisCoordStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn().await?;
        let (value, was_new): (i64, bool) = redis::pipe()
            .atomic()
            .cmd("EXISTS")
            .arg(key)
            .cmd("INCR")
            .arg(key)
            .query_async::<_, (i64, i64)>(&mut conn)
            .await
            .map(|(existed, value)| (value, existed == 0))?;
        if was_new {
            conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64).await?;
        }
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.keys(format!("{prefix}*")).await?)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        // Lua script guarantees the read-compare-delete is atomic.
        let script = redis::Script::new(
            r"
            if redis.call('get', KEYS[1]) == ARGV[1] then
                return redis.call('del', KEYS[1])
            else
                return 0
            end
            ",
        );
        let deleted: i64 = script.key(key).arg(expected).invoke_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn ttl_secs(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn().await?;
        let ttl: i64 = conn.ttl(key).await?;
        Ok(if ttl > 0 { Some(ttl as u64) } else { None })
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Single-process `CoordStore`. A background sweep task purges expired
/// entries; reads also check expiry lazily so correctness never depends on
/// sweep timing.
pub struct InMemoryCoordStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl InMemoryCoordStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Spawns the sweep task; returns a handle the caller can drop to detach.
    /// The task is a fire-and-forget `tokio::spawn` that keeps running for
    /// the store's lifetime either way.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                entries.retain(|_, e| e.expires_at > now);
            }
        })
    }

    fn live(&self, key: &str) -> Option<String> {
        match self.entries.get(key) {
            Some(e) if e.expires_at > Instant::now() => Some(e.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for InMemoryCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordStore for InMemoryCoordStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live(key))
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        if self.live(key).is_some() {
            return Ok(false);
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.value = "0".to_string();
            entry.expires_at = now + ttl;
        }
        let next: i64 = entry.value.parse().unwrap_or(0) + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut e) = self.entries.get_mut(key) {
            e.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        match self.entries.get(key) {
            Some(e) if e.value == expected && e.expires_at > Instant::now() => {
                drop(e);
                self.entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl_secs(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.entries.get(key).and_then(|e| {
            let now = Instant::now();
            if e.expires_at > now {
                Some((e.expires_at - now).as_secs())
            } else {
                None
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let store = InMemoryCoordStore::new();
        assert!(store
            .set_if_absent_with_ttl("account:a", "tok1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent_with_ttl("account:a", "tok2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_if_equals_rejects_stale_token() {
        let store = InMemoryCoordStore::new();
        store
            .set_if_absent_with_ttl("account:a", "tok1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!store.delete_if_equals("account:a", "wrong").await.unwrap());
        assert!(store.delete_if_equals("account:a", "tok1").await.unwrap());
    }

    #[tokio::test]
    async fn incr_resets_after_ttl_expiry() {
        let store = InMemoryCoordStore::new();
        let v1 = store.incr("quota:global", Duration::from_millis(20)).await.unwrap();
        assert_eq!(v1, 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let v2 = store.incr("quota:global", Duration::from_secs(60)).await.unwrap();
        assert_eq!(v2, 1);
    }
}
