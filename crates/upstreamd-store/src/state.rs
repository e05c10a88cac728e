//! The raw key-value capability seam.
//!
//! Everything the control plane needs from its shared store fits in six
//! operations; keeping the trait this small is what makes the backends
//! swappable and the rest of the crate testable without a running Redis.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use upstreamd_common::error::{ControlError, Result};

/// Capability set over the shared key-value store.
///
/// All values are serialized strings; TTLs are mandatory on writes so no
/// category of key can outlive its contract.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Set-if-absent with TTL; returns whether the write happened.
    async fn put_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remaining TTL, `None` when the key is absent or has expired.
    async fn ttl_of(&self, key: &str) -> Result<Option<Duration>>;

    async fn ping(&self) -> Result<()>;
}

fn store_err(e: redis::RedisError) -> ControlError {
    ControlError::Store(e.to_string())
}

/// Redis-backed implementation used in production deployments.
///
/// The connection manager reconnects transparently; individual command
/// failures surface as [`ControlError::Store`] and are absorbed by the
/// typed facade.
#[derive(Clone)]
pub struct RedisStore {
    connection: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let connection = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(store_err)?;
        debug!(url, "connected to shared state store");
        Ok(Self { connection })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.set_ex(key, value, ttl.as_secs()).await.map_err(store_err)
    }

    async fn put_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(set.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await.map_err(store_err)?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn
            .keys(format!("{prefix}*"))
            .await
            .map_err(store_err)?;
        Ok(keys)
    }

    async fn ttl_of(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection.clone();
        let ttl: i64 = conn.ttl(key).await.map_err(store_err)?;
        // -2 = missing key, -1 = no expiry set
        if ttl < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_secs(ttl as u64)))
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

/// In-process implementation with explicit TTL bookkeeping.
///
/// Used by every test in the workspace and as the degraded single-instance
/// backend when Redis is unreachable at boot.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entry: &MemoryEntry) -> Option<String> {
        if entry.expires_at > Instant::now() {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Test hook: expire a key immediately without deleting it.
    pub fn force_expire(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).and_then(Self::live_value))
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let alive = entries.get(key).and_then(Self::live_value).is_some();
        if alive {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && Self::live_value(entry).is_some())
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn ttl_of(&self, key: &str) -> Result<Option<Duration>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .and_then(|entry| entry.expires_at.checked_duration_since(Instant::now())))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
