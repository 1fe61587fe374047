use crate::config::CacheConfig;
use anyhow::Result;
use moka::future::Cache;
use moka::Expiry;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Upper bound on how long anything lives in the in-process tier.
const MEMORY_MAX_TTL: Duration = Duration::from_secs(3600);

/// Keys fetched per `SCAN` round trip while invalidating.
const SCAN_BATCH: usize = 500;

/// Builds a stable fingerprint for one logical call.
///
/// Same scope, partition, positional args and keyword args (in any order)
/// always give the same key; the readable prefix exists only so patterns like
/// `explorer:bitcoin:*` can be invalidated.
#[derive(Debug, Clone)]
pub struct CacheKey {
    scope: String,
    partition: Option<String>,
    args: Vec<String>,
    kwargs: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            partition: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn arg(mut self, value: impl Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.kwargs.insert(name.into(), value.to_string());
        self
    }

    pub fn fingerprint(&self) -> String {
        let mut canonical = self.args.join("\u{1f}");
        for (name, value) in &self.kwargs {
            canonical.push('\u{1e}');
            canonical.push_str(name);
            canonical.push('=');
            canonical.push_str(value);
        }
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, canonical.as_bytes()).simple();
        match &self.partition {
            Some(p) => format!("{}:{}:{}", self.scope, p, digest),
            None => format!("{}:{}", self.scope, digest),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    ttl: Duration,
}

/// Each entry lives for its own TTL; a rewrite restarts the clock.
struct EntryTtl;

impl Expiry<String, CacheEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl.min(MEMORY_MAX_TTL))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl.min(MEMORY_MAX_TTL))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub status: String,
    pub redis: bool,
    pub memory_entries: u64,
}

/// Two-tier TTL cache. Losing either tier only costs speed: reads miss and
/// writes are skipped, so callers fall through to the upstream.
pub struct CacheService {
    redis: Option<redis::aio::ConnectionManager>,
    memory: Option<Cache<String, CacheEntry>>,
    prefix: String,
}

impl CacheService {
    pub async fn new(config: &CacheConfig) -> Self {
        if !config.enabled {
            tracing::info!("Response cache disabled, running pass-through");
            return Self::disabled();
        }

        let redis = match config.redis_url.as_deref() {
            None => None,
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match client.get_connection_manager().await {
                    Ok(conn) => {
                        tracing::info!("Redis connected successfully");
                        Some(conn)
                    }
                    Err(e) => {
                        tracing::warn!("Redis connection failed: {}, using memory cache only", e);
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!("Redis client creation failed: {}, using memory cache only", e);
                    None
                }
            },
        };

        Self {
            redis,
            memory: Some(Self::memory_tier()),
            prefix: config.prefix.clone(),
        }
    }

    pub fn memory_only(prefix: impl Into<String>) -> Self {
        Self {
            redis: None,
            memory: Some(Self::memory_tier()),
            prefix: prefix.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            redis: None,
            memory: None,
            prefix: String::new(),
        }
    }

    fn memory_tier() -> Cache<String, CacheEntry> {
        Cache::builder()
            .max_capacity(10_000)
            .expire_after(EntryTtl)
            .build()
    }

    pub fn is_enabled(&self) -> bool {
        self.memory.is_some() || self.redis.is_some()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let key = self.full_key(key);

        if let Some(memory) = &self.memory {
            if let Some(entry) = memory.get(&key).await {
                if let Ok(value) = serde_json::from_str(&entry.value) {
                    tracing::debug!("Memory cache hit for key: {}", key);
                    return Some(value);
                }
            }
        }

        if let Some(mut redis) = self.redis.clone() {
            match redis.get::<_, Option<String>>(&key).await {
                Ok(Some(cached)) => {
                    if let Ok(value) = serde_json::from_str(&cached) {
                        // Backfill memory with whatever lifetime Redis has left.
                        if let (Some(memory), Ok(ttl_ms)) =
                            (&self.memory, redis.pttl::<_, i64>(&key).await)
                        {
                            if ttl_ms > 0 {
                                let entry = CacheEntry {
                                    value: cached,
                                    ttl: Duration::from_millis(ttl_ms as u64),
                                };
                                memory.insert(key.clone(), entry).await;
                            }
                        }
                        tracing::debug!("Redis cache hit for key: {}", key);
                        return Some(value);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Redis get error: {}", e),
            }
        }

        tracing::debug!("Cache miss for key: {}", key);
        None
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        if !self.is_enabled() || ttl.is_zero() {
            return Ok(());
        }
        let key = self.full_key(key);
        let serialized = serde_json::to_string(value)?;

        if let Some(memory) = &self.memory {
            let entry = CacheEntry {
                value: serialized.clone(),
                ttl,
            };
            memory.insert(key.clone(), entry).await;
        }

        if let Some(mut redis) = self.redis.clone() {
            let ttl_ms = ttl.as_millis().max(1) as u64;
            if let Err(e) = redis.pset_ex::<_, _, ()>(&key, serialized, ttl_ms).await {
                tracing::warn!("Redis set error: {}", e);
            } else {
                tracing::debug!("Cached key: {} with TTL: {}ms", key, ttl_ms);
            }
        }

        Ok(())
    }

    /// Removes every key matching a glob pattern (`*` wildcards only).
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let full_pattern = self.full_key(pattern);
        let mut removed = 0;

        if let Some(memory) = &self.memory {
            let matching: Vec<String> = memory
                .iter()
                .filter(|(k, _)| glob_match(&full_pattern, k))
                .map(|(k, _)| k.as_ref().clone())
                .collect();
            for key in matching {
                memory.invalidate(&key).await;
                removed += 1;
            }
        }

        if let Some(mut redis) = self.redis.clone() {
            match scan_delete(&mut redis, &full_pattern).await {
                Ok(n) => removed = removed.max(n),
                Err(e) => tracing::warn!("Error invalidating pattern {}: {}", pattern, e),
            }
        }

        removed
    }

    pub async fn clear_all(&self) -> usize {
        self.invalidate("*").await
    }

    pub async fn ping(&self) -> bool {
        if let Some(mut redis) = self.redis.clone() {
            redis::cmd("PING")
                .query_async::<_, String>(&mut redis)
                .await
                .is_ok()
        } else {
            false
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let memory_entries = match &self.memory {
            Some(memory) => {
                memory.run_pending_tasks().await;
                memory.entry_count()
            }
            None => 0,
        };
        let redis = self.ping().await;
        let status = match (self.is_enabled(), redis) {
            (false, _) => "disabled",
            (true, true) => "connected",
            (true, false) => "memory-only",
        };
        CacheStats {
            status: status.to_string(),
            redis,
            memory_entries,
        }
    }
}

/// Walks the keyspace with `SCAN` and deletes matches batch by batch.
async fn scan_delete(
    redis: &mut redis::aio::ConnectionManager,
    pattern: &str,
) -> redis::RedisResult<usize> {
    let mut cursor: u64 = 0;
    let mut removed = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .cursor_arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(redis)
            .await?;
        if !keys.is_empty() {
            removed += redis.del::<_, usize>(keys).await?;
        }
        if next == 0 {
            return Ok(removed);
        }
        cursor = next;
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }

    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}
