//! Lock & rate store (spec §4.A): a distributed mutex and a fixed-window
//! counter, both backed by a shared key/value store with TTL and atomic
//! compare-and-delete.
//!
//! Grounded on `original_source/utils/cache.py` (`DistributedLock`,
//! `RateLimiter`) — the Lua scripts below are a direct port of that file's
//! `release()`/`is_allowed()` scripts. [`RedisLockStore`] is the production
//! adapter; [`FakeLockStore`] is the in-memory stand-in used by the
//! property tests in spec §8 and by orchestrator/connector unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockStoreError {
    #[error("lock store transport error: {0}")]
    Transport(String),
}

impl From<redis::RedisError> for LockStoreError {
    fn from(err: redis::RedisError) -> Self {
        LockStoreError::Transport(err.to_string())
    }
}

/// Contract for the distributed lock + rate limit substrate (spec §4.A).
///
/// Implementations MUST make `acquire_lock`/`release_lock` atomic
/// round-trips (a single server-side script, not a read-then-write), and
/// MUST fail open on `rate_incr` / fail closed (contention) on
/// `acquire_lock` when the backing store is unreachable — see spec §4.A
/// "Failure semantics".
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomic set-if-absent-with-expiry. `true` on acquisition, `false` on
    /// contention (including when the store itself is unreachable).
    async fn acquire_lock(&self, key: &str, owner_token: &str, ttl: Duration) -> bool;

    /// Atomic compare-and-delete: deletes `key` iff its current value is
    /// `owner_token`. Never raises; a failed release is logged by the
    /// caller and the lock is left to expire via TTL.
    async fn release_lock(&self, key: &str, owner_token: &str) -> Result<bool, LockStoreError>;

    /// Atomic increment-and-set-expiry-on-first-hit. Returns the
    /// post-increment count, or `1` (fail-open / "allow") if the store is
    /// unreachable.
    async fn rate_incr(&self, key: &str, window: Duration) -> i64;

    /// Administrative sweep: delete every key with the given prefix.
    /// Used by `ConnectorService::cleanup_all_locks` (spec §4.F /
    /// SPEC_FULL.md §B.4) on service startup/shutdown.
    async fn scan_and_delete(&self, prefix: &str) -> Result<u64, LockStoreError>;
}

/// `key:{source}:{source_id}:{platform}:{operation}` as described in
/// spec §3 LockEntry / RateCounter, minus the `lock:`/`rate_limit:` tag
/// which each store method applies itself.
pub fn gate_key(source: &str, source_id: &str, platform: &str, operation: &str) -> String {
    format!("{source}:{source_id}:{platform}:{operation}")
}

/// Redis-backed [`LockStore`]. Lua scripts ported from
/// `original_source/utils/cache.py`'s `DistributedLock.release` and
/// `RateLimiter.is_allowed`.
pub struct RedisLockStore {
    conn: ConnectionManager,
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const RATE_INCR_SCRIPT: &str = r#"
local current = redis.call('incr', KEYS[1])
if current == 1 then
    redis.call('expire', KEYS[1], ARGV[1])
end
return current
"#;

impl RedisLockStore {
    pub async fn connect(redis_url: &str) -> Result<Self, LockStoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn acquire_lock(&self, key: &str, owner_token: &str, ttl: Duration) -> bool {
        let full_key = format!("lock:{key}");
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<bool> = redis::cmd("SET")
            .arg(&full_key)
            .arg(owner_token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| v.is_some());
        match result {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(error = %e, key = %full_key, "lock store unreachable, treating as contention");
                false
            }
        }
    }

    async fn release_lock(&self, key: &str, owner_token: &str) -> Result<bool, LockStoreError> {
        let full_key = format!("lock:{key}");
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let deleted: i64 = script
            .key(&full_key)
            .arg(owner_token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn rate_incr(&self, key: &str, window: Duration) -> i64 {
        let full_key = format!("rate_limit:{key}");
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RATE_INCR_SCRIPT);
        let result: redis::RedisResult<i64> = script
            .key(&full_key)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, key = %full_key, "rate store unreachable, failing open");
                1
            }
        }
    }

    async fn scan_and_delete(&self, prefix: &str) -> Result<u64, LockStoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut deleted = 0u64;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let _: () = conn.del(&keys).await?;
                deleted += keys.len() as u64;
            }
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(deleted)
    }
}

#[derive(Default)]
struct FakeEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory [`LockStore`] used by tests (spec §9 "External LLM agent
/// boundary" / §4.C "can be stubbed in tests" apply the same principle to
/// the lock store). Expiry is checked lazily on access, matching Redis's
/// own lazy-expiry semantics closely enough for the invariants in spec §8.
#[derive(Default, Clone)]
pub struct FakeLockStore {
    locks: Arc<Mutex<HashMap<String, FakeEntry>>>,
    counters: Arc<Mutex<HashMap<String, FakeEntry>>>,
}

impl FakeLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &FakeEntry) -> bool {
        entry.expires_at.is_none_or(|exp| exp > Instant::now())
    }
}

#[async_trait]
impl LockStore for FakeLockStore {
    async fn acquire_lock(&self, key: &str, owner_token: &str, ttl: Duration) -> bool {
        let full_key = format!("lock:{key}");
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(&full_key) {
            if Self::is_live(existing) {
                return false;
            }
        }
        locks.insert(
            full_key,
            FakeEntry {
                value: owner_token.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        true
    }

    async fn release_lock(&self, key: &str, owner_token: &str) -> Result<bool, LockStoreError> {
        let full_key = format!("lock:{key}");
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(&full_key) {
            if Self::is_live(existing) && existing.value == owner_token {
                locks.remove(&full_key);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn rate_incr(&self, key: &str, window: Duration) -> i64 {
        let full_key = format!("rate_limit:{key}");
        let mut counters = self.counters.lock();
        let entry = counters.entry(full_key).or_default();
        if !Self::is_live(entry) {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }
        let count: i64 = entry.value.parse().unwrap_or(0);
        let next = count + 1;
        entry.value = next.to_string();
        if entry.expires_at.is_none() {
            entry.expires_at = Some(Instant::now() + window);
        }
        next
    }

    async fn scan_and_delete(&self, prefix: &str) -> Result<u64, LockStoreError> {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|k, _| !k.starts_with(prefix));
        Ok((before - locks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = FakeLockStore::new();
        assert!(store.acquire_lock("k", "a", Duration::from_secs(5)).await);
        assert!(!store.acquire_lock("k", "b", Duration::from_secs(5)).await);
        assert!(store.release_lock("k", "a").await.unwrap());
        assert!(store.acquire_lock("k", "b", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn release_never_deletes_another_owners_lock() {
        let store = FakeLockStore::new();
        store.acquire_lock("k", "a", Duration::from_secs(5)).await;
        assert!(!store.release_lock("k", "someone-else").await.unwrap());
        assert!(!store.acquire_lock("k", "b", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn rate_counter_admits_up_to_max_requests() {
        let store = FakeLockStore::new();
        let window = Duration::from_secs(60);
        let mut admitted = 0;
        for _ in 0..5 {
            if store.rate_incr("rk", window).await <= 3 {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired_without_release() {
        let store = FakeLockStore::new();
        assert!(
            store
                .acquire_lock("k", "a", Duration::from_millis(1))
                .await
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.acquire_lock("k", "b", Duration::from_secs(5)).await);
    }
}
