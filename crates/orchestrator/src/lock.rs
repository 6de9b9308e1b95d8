//! Distributed mutex with TTL expiry.
//!
//! Holding a lock only grants the right to run the associated task. Expiry is
//! the liveness mechanism; `release` exists for clean shutdown.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use trade_engine_core::Clock;

const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Set-if-absent with expiry. Returns false when another holder owns `key`.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Extends the expiry of a lock this holder owns. False when it was lost.
    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` if this holder owns it.
    async fn release(&self, key: &str) -> Result<bool>;

    /// Whether anyone currently holds `key`.
    async fn is_held(&self, key: &str) -> Result<bool>;

    /// Holder identity written as the lock value.
    fn value(&self) -> &str;
}

/// `host:pid` of the current process.
#[must_use]
pub fn process_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}:{}", std::process::id())
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis-backed lock: `SET key holder NX PX ttl`.
pub struct RedisLock {
    conn: MultiplexedConnection,
    holder: String,
}

impl RedisLock {
    /// # Errors
    /// Returns an error if the client cannot be created or the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self::new(conn, process_identity()))
    }

    #[must_use]
    pub fn new(conn: MultiplexedConnection, holder: String) -> Self {
        Self { conn, holder }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&self.holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET NX failed for {key}"))?;
        Ok(reply.is_some())
    }

    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = Script::new(RENEW_SCRIPT)
            .key(key)
            .arg(&self.holder)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("lock renew failed for {key}"))?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(&self.holder)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("lock release failed for {key}"))?;
        Ok(deleted == 1)
    }

    async fn is_held(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("EXISTS failed for {key}"))?;
        Ok(exists > 0)
    }

    fn value(&self) -> &str {
        &self.holder
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Lock state shared by every [`MemoryLock`] in a process, standing in for Redis.
#[derive(Clone, Default)]
pub struct LockTable {
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, ignoring expired entries.
    #[must_use]
    pub fn holder(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        self.entries
            .lock()
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.holder.clone())
    }
}

/// In-process lock driven by an injected clock.
pub struct MemoryLock {
    table: LockTable,
    clock: Arc<dyn Clock>,
    holder: String,
}

impl MemoryLock {
    pub fn new(table: LockTable, clock: Arc<dyn Clock>, holder: impl Into<String>) -> Self {
        Self {
            table,
            clock,
            holder: holder.into(),
        }
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
        i64::try_from(ttl_millis(ttl))
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .with_context(|| format!("lock ttl {ttl:?} is out of range"))
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl)?;
        let mut entries = self.table.entries.lock();
        if entries.get(key).is_some_and(|e| e.expires_at > now) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            LockEntry {
                holder: self.holder.clone(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl)?;
        let mut entries = self.table.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.holder == self.holder && entry.expires_at > now => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str) -> Result<bool> {
        let mut entries = self.table.entries.lock();
        if entries.get(key).is_some_and(|e| e.holder == self.holder) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn is_held(&self, key: &str) -> Result<bool> {
        Ok(self.table.holder(key, self.clock.now()).is_some())
    }

    fn value(&self) -> &str {
        &self.holder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use trade_engine_core::ManualClock;

    fn pair() -> (MemoryLock, MemoryLock, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let table = LockTable::new();
        let a = MemoryLock::new(table.clone(), Arc::new(clock.clone()), "host-a:1");
        let b = MemoryLock::new(table, Arc::new(clock.clone()), "host-b:2");
        (a, b, clock)
    }

    #[tokio::test]
    async fn only_one_holder_until_expiry() {
        let (a, b, clock) = pair();
        let ttl = Duration::from_secs(30);

        assert!(a.acquire("tick-publisher:acct:EUR_USD", ttl).await.unwrap());
        assert!(!b.acquire("tick-publisher:acct:EUR_USD", ttl).await.unwrap());
        assert!(b.is_held("tick-publisher:acct:EUR_USD").await.unwrap());

        clock.advance(chrono::Duration::seconds(31));
        assert!(!a.is_held("tick-publisher:acct:EUR_USD").await.unwrap());
        assert!(b.acquire("tick-publisher:acct:EUR_USD", ttl).await.unwrap());
        assert!(!a.renew("tick-publisher:acct:EUR_USD", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn renew_extends_and_release_requires_ownership() {
        let (a, b, clock) = pair();
        let ttl = Duration::from_secs(30);
        assert!(a.acquire("k", ttl).await.unwrap());

        clock.advance(chrono::Duration::seconds(20));
        assert!(a.renew("k", ttl).await.unwrap());
        clock.advance(chrono::Duration::seconds(20));
        assert!(a.is_held("k").await.unwrap());

        assert!(!b.release("k").await.unwrap());
        assert!(a.release("k").await.unwrap());
        assert!(!a.is_held("k").await.unwrap());
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_an_error() {
        let (a, b, _clock) = pair();
        assert!(a.acquire("k", Duration::MAX).await.is_err());
        assert!(!b.is_held("k").await.unwrap());

        assert!(a.acquire("k", Duration::from_secs(30)).await.unwrap());
        assert!(a.renew("k", Duration::from_secs(u64::MAX / 1_000)).await.is_err());
        assert!(a.is_held("k").await.unwrap());
    }

    #[test]
    fn process_identity_includes_pid() {
        let id = process_identity();
        assert!(id.ends_with(&format!(":{}", std::process::id())));
    }
}
