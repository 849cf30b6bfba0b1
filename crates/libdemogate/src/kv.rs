use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use redis::AsyncCommands;
use tokio::sync::RwLock;

/// Durable key-value store with per-key TTLs.
///
/// Production uses Redis; `memory://` selects an in-process backend with
/// the same TTL semantics for tests and local development.
#[derive(Clone)]
pub enum Kv {
    Redis(redis::aio::ConnectionManager),
    Memory(Arc<RwLock<HashMap<String, MemoryEntry>>>),
}

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl Kv {
    /// Connect to the store named by `url`. Fails fast when Redis is
    /// unreachable so a misconfigured broker never starts serving.
    pub async fn connect(url: &str) -> Result<Self> {
        if url.starts_with("memory://") {
            return Ok(Kv::Memory(Arc::new(RwLock::new(HashMap::new()))));
        }
        let client = redis::Client::open(url).context("invalid kv url")?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .context("kv store unreachable")?;
        Ok(Kv::Redis(manager))
    }

    /// In-memory store for unit tests.
    pub fn memory() -> Self {
        Kv::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            Kv::Redis(manager) => {
                let mut conn = manager.clone();
                let value: Option<String> =
                    conn.get(key).await.context("kv get failed")?;
                Ok(value)
            }
            Kv::Memory(map) => {
                let now = Instant::now();
                let mut map = map.write().await;
                match map.get(key) {
                    Some(entry) if entry.expired_at(now) => {
                        map.remove(key);
                        Ok(None)
                    }
                    Some(entry) => Ok(Some(entry.value.clone())),
                    None => Ok(None),
                }
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        match self {
            Kv::Redis(manager) => {
                let mut conn = manager.clone();
                match ttl {
                    Some(ttl) => {
                        let secs = ttl.as_secs().max(1);
                        conn.set_ex::<_, _, ()>(key, value, secs)
                            .await
                            .context("kv set_ex failed")?;
                    }
                    None => {
                        conn.set::<_, _, ()>(key, value)
                            .await
                            .context("kv set failed")?;
                    }
                }
                Ok(())
            }
            Kv::Memory(map) => {
                let entry = MemoryEntry {
                    value: value.to_string(),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                };
                map.write().await.insert(key.to_string(), entry);
                Ok(())
            }
        }
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        match self {
            Kv::Redis(manager) => {
                let mut conn = manager.clone();
                conn.del::<_, ()>(key).await.context("kv del failed")?;
                Ok(())
            }
            Kv::Memory(map) => {
                map.write().await.remove(key);
                Ok(())
            }
        }
    }

    /// Remaining TTL for `key`; `None` when the key is missing or has no
    /// expiry.
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        match self {
            Kv::Redis(manager) => {
                let mut conn = manager.clone();
                let secs: i64 = conn.ttl(key).await.context("kv ttl failed")?;
                if secs < 0 {
                    Ok(None)
                } else {
                    Ok(Some(Duration::from_secs(secs as u64)))
                }
            }
            Kv::Memory(map) => {
                let now = Instant::now();
                let map = map.read().await;
                Ok(map
                    .get(key)
                    .filter(|entry| !entry.expired_at(now))
                    .and_then(|entry| entry.expires_at)
                    .map(|deadline| deadline.saturating_duration_since(now)))
            }
        }
    }

    /// All keys matching a glob pattern. Only used by operator queries;
    /// the hot path never scans.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        match self {
            Kv::Redis(manager) => {
                let mut conn = manager.clone();
                let mut keys = Vec::new();
                let mut cursor: u64 = 0;
                loop {
                    let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn)
                        .await
                        .context("kv scan failed")?;
                    keys.extend(batch);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Ok(keys)
            }
            Kv::Memory(map) => {
                let prefix = pattern.trim_end_matches('*');
                let now = Instant::now();
                let map = map.read().await;
                Ok(map
                    .iter()
                    .filter(|(_, entry)| !entry.expired_at(now))
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, _)| key.clone())
                    .collect())
            }
        }
    }
}

impl MemoryEntry {
    fn expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}
