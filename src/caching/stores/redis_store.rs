//! # Redis Cache Store
//!
//! Redis-backed cache store. Each entry is kept as three pieces of data under the
//! configured key prefix:
//!
//! - `{prefix}{key}`: the value, with a millisecond TTL
//! - `{prefix}__keytags:{key}`: the entry's tags, expiring with the value
//! - `{prefix}__tag:{tag}`: the keys written with a tag, as a sorted set scored by
//!   each key's expiry time. Expired members are pruned on every write to the tag,
//!   and the set itself expires with its longest-lived member.
//!
//! Tag invalidation reads the members and then, in one transaction, deletes those
//! entries and removes exactly those members. A key tagged between the two steps
//! keeps its index entry.
//!
//! Operations make a single attempt bounded by `operation_timeout`. Retrying and
//! outage handling are left to [`super::ResilientStore`].

use super::{CacheSetOptions, CacheStore, CacheStoreStats, StoredEntry};
use crate::caching::{CacheError, CacheResult};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, RedisResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Extends `KEYS[1]`'s expiry to `ARGV[1]` milliseconds unless it already lives longer
const EXTEND_EXPIRY: &str = r#"
local ttl = tonumber(ARGV[1])
local current = redis.call('PTTL', KEYS[1])
if current == -1 or current < ttl then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return 0
"#;

/// Redis cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisCacheConfig {
    /// Redis connection URL
    pub url: String,

    /// Connection timeout
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Upper bound for a single command or transaction
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Key prefix for all cache entries
    pub key_prefix: String,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_millis(250),
            key_prefix: "tiering:cache:".to_string(),
        }
    }
}

/// Redis cache implementation
pub struct RedisCache {
    /// Configuration
    config: RedisCacheConfig,

    /// Redis connection manager, cloned per operation
    connection_manager: ConnectionManager,

    /// Statistics counters
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    connection_errors: AtomicU64,
    timeouts: AtomicU64,
}

impl RedisCache {
    /// Create a new Redis cache
    pub async fn new(config: RedisCacheConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str())?;

        let connection_manager =
            tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
                .await
                .map_err(|_| CacheError::Timeout)??;

        info!("Redis cache connected to {}", config.url);

        Ok(Self {
            config,
            connection_manager,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    /// Get the full cache key with prefix
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn keytags_key(&self, key: &str) -> String {
        format!("{}__keytags:{}", self.config.key_prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}__tag:{}", self.config.key_prefix, tag)
    }

    fn is_internal_key(&self, full_key: &str) -> bool {
        full_key[self.config.key_prefix.len().min(full_key.len())..].starts_with("__")
    }

    /// Run one Redis operation under the operation timeout
    async fn execute<T, F>(&self, operation: F) -> CacheResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.operation_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!("Redis operation failed: {}", e);
                self.connection_errors.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Redis(e))
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Timeout)
            }
        }
    }

    async fn scan_prefix(&self) -> CacheResult<Vec<String>> {
        let pattern = format!("{}*", self.config.key_prefix);
        let mut conn = self.connection_manager.clone();

        self.execute(async move {
            let mut cursor = 0u64;
            let mut all_keys = Vec::new();

            loop {
                let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(1000)
                    .query_async(&mut conn)
                    .await?;

                all_keys.extend(keys);

                if new_cursor == 0 {
                    break;
                }
                cursor = new_cursor;
            }

            Ok(all_keys)
        })
        .await
    }

    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn lookup(&self, key: &str) -> CacheResult<Option<StoredEntry>> {
        let full_key = self.full_key(key);
        let keytags_key = self.keytags_key(key);
        let mut conn = self.connection_manager.clone();

        let (value, tags, pttl): (Option<Vec<u8>>, Vec<String>, i64) = self
            .execute(async move {
                redis::pipe()
                    .cmd("GET")
                    .arg(&full_key)
                    .cmd("SMEMBERS")
                    .arg(&keytags_key)
                    .cmd("PTTL")
                    .arg(&full_key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        match value {
            // PTTL is -2 when the key vanished between GET and PTTL
            Some(value) if pttl != -2 => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Redis cache hit for key: {}", key);
                Ok(Some(StoredEntry {
                    value,
                    tags: tags.into_iter().collect::<BTreeSet<_>>(),
                    ttl: Duration::from_millis(pttl.max(0) as u64),
                }))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Redis cache miss for key: {}", key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], options: &CacheSetOptions) -> CacheResult<()> {
        let full_key = self.full_key(key);
        let keytags_key = self.keytags_key(key);

        if options.ttl.is_zero() {
            let mut conn = self.connection_manager.clone();
            return self
                .execute(async move {
                    redis::cmd("DEL")
                        .arg(&full_key)
                        .arg(&keytags_key)
                        .query_async::<_, ()>(&mut conn)
                        .await
                })
                .await;
        }

        let ttl_ms = options.ttl.as_millis().max(1) as u64;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(&full_key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .cmd("DEL")
            .arg(&keytags_key)
            .ignore();

        if !options.tags.is_empty() {
            pipe.cmd("SADD")
                .arg(&keytags_key)
                .arg(options.tags.iter().collect::<Vec<_>>())
                .ignore()
                .cmd("PEXPIRE")
                .arg(&keytags_key)
                .arg(ttl_ms)
                .ignore();
            let now_ms = chrono::Utc::now().timestamp_millis();
            let expires_at = now_ms + ttl_ms as i64;
            for tag in &options.tags {
                let tag_key = self.tag_key(tag);
                pipe.cmd("ZADD")
                    .arg(&tag_key)
                    .arg(expires_at)
                    .arg(key)
                    .ignore()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(&tag_key)
                    .arg("-inf")
                    .arg(now_ms)
                    .ignore()
                    .cmd("EVAL")
                    .arg(EXTEND_EXPIRY)
                    .arg(1)
                    .arg(&tag_key)
                    .arg(ttl_ms)
                    .ignore();
            }
        }

        let mut conn = self.connection_manager.clone();
        self.execute(async move { pipe.query_async::<_, ()>(&mut conn).await })
            .await?;

        debug!("Set Redis cache key: {} with TTL: {:?}", key, options.ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key);
        let keytags_key = self.keytags_key(key);
        let mut conn = self.connection_manager.clone();

        let (deleted_count,): (i64,) = self
            .execute(async move {
                redis::pipe()
                    .atomic()
                    .cmd("DEL")
                    .arg(&full_key)
                    .cmd("DEL")
                    .arg(&keytags_key)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let was_deleted = deleted_count > 0;
        if was_deleted {
            debug!("Deleted Redis cache key: {}", key);
        }
        Ok(was_deleted)
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> CacheResult<usize> {
        if tags.is_empty() {
            return Ok(0);
        }

        let tag_keys: Vec<String> = tags.iter().map(|tag| self.tag_key(tag)).collect();
        let mut read = redis::pipe();
        for tag_key in &tag_keys {
            read.cmd("ZRANGE").arg(tag_key).arg(0).arg(-1);
        }
        let mut conn = self.connection_manager.clone();
        let memberships: Vec<Vec<String>> = self
            .execute(async move { read.query_async(&mut conn).await })
            .await?;

        let members: BTreeSet<&String> = memberships.iter().flatten().collect();
        if members.is_empty() {
            return Ok(0);
        }

        let value_keys: Vec<String> = members.iter().map(|key| self.full_key(key)).collect();
        let keytags_keys: Vec<String> = members.iter().map(|key| self.keytags_key(key)).collect();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(&value_keys)
            .cmd("DEL")
            .arg(&keytags_keys)
            .ignore();
        // Only the members read above; keys tagged since then stay indexed
        for (tag_key, tag_members) in tag_keys.iter().zip(&memberships) {
            if !tag_members.is_empty() {
                pipe.cmd("ZREM").arg(tag_key).arg(tag_members).ignore();
            }
        }

        let mut conn = self.connection_manager.clone();
        let (removed,): (i64,) = self
            .execute(async move { pipe.query_async(&mut conn).await })
            .await?;

        let removed = removed.max(0) as usize;
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        debug!("Invalidated {} Redis entries for tags {:?}", removed, tags);
        Ok(removed)
    }

    async fn clear(&self) -> CacheResult<()> {
        let keys = self.scan_prefix().await?;

        if !keys.is_empty() {
            let mut conn = self.connection_manager.clone();
            let deleted_count: i64 = self
                .execute(async move { redis::cmd("DEL").arg(&keys).query_async(&mut conn).await })
                .await?;

            info!("Cleared {} keys from Redis cache", deleted_count);
        }

        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        let mut conn = self.connection_manager.clone();
        let info: String = self
            .execute(async move {
                redis::cmd("INFO")
                    .arg("memory")
                    .query_async(&mut conn)
                    .await
            })
            .await
            .unwrap_or_default();

        // Parse memory usage from Redis INFO output
        let memory_usage = info
            .lines()
            .find(|line| line.starts_with("used_memory:"))
            .and_then(|line| line.split(':').nth(1))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let entries = self
            .scan_prefix()
            .await
            .map(|keys| keys.iter().filter(|key| !self.is_internal_key(key)).count())
            .unwrap_or(0);

        Ok(CacheStoreStats {
            entries,
            memory_usage,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: 0,        // Redis handles eviction internally
            expired_cleanups: 0, // Redis handles TTL cleanup internally
            invalidations: self.invalidations.load(Ordering::Relaxed),
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let mut conn = self.connection_manager.clone();
        let result = self
            .execute(async move { redis::cmd("PING").query_async::<_, String>(&mut conn).await })
            .await;

        match result {
            Ok(response) => Ok(response == "PONG"),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Connects to `TIERING_TEST_REDIS_URL` (default `redis://127.0.0.1:6379`)
    async fn setup_redis_cache(prefix: &str) -> RedisCache {
        let url = std::env::var("TIERING_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let config = RedisCacheConfig {
            url,
            key_prefix: format!("tiering:test:{}:{}:", prefix, uuid::Uuid::new_v4()),
            ..Default::default()
        };

        RedisCache::new(config).await.unwrap()
    }

    #[test]
    fn test_key_layout() {
        let config = RedisCacheConfig::default();
        let prefix = config.key_prefix.clone();
        let full = format!("{}tier:GET:/users", prefix);
        let internal = format!("{}__tag:users", prefix);
        assert!(!full[prefix.len()..].starts_with("__"));
        assert!(internal[prefix.len()..].starts_with("__"));
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_basic_operations() {
        let cache = setup_redis_cache("basic").await;
        let options = CacheSetOptions::new(Duration::from_secs(60));

        cache.set("test_key", b"test_value", &options).await.unwrap();
        assert_eq!(cache.get("test_key").await.unwrap(), Some(b"test_value".to_vec()));
        assert!(cache.exists("test_key").await.unwrap());

        assert!(cache.delete("test_key").await.unwrap());
        assert!(!cache.exists("test_key").await.unwrap());
        cache.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_ttl_expiration() {
        let cache = setup_redis_cache("ttl").await;

        cache
            .set("expire_test", b"expire_value", &CacheSetOptions::new(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(cache.exists("expire_test").await.unwrap());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.get("expire_test").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_invalidate_by_tags() {
        let cache = setup_redis_cache("tags").await;
        let options = CacheSetOptions::new(Duration::from_secs(60));

        cache.set("a", b"1", &options.clone().with_tags(["users"])).await.unwrap();
        cache.set("b", b"2", &options.clone().with_tags(["users", "admin"])).await.unwrap();
        cache.set("c", b"3", &options.clone().with_tags(["health"])).await.unwrap();

        let entry = cache.lookup("b").await.unwrap().unwrap();
        assert!(entry.tags.contains("admin"));
        assert!(entry.ttl <= Duration::from_secs(60));

        assert_eq!(cache.invalidate_by_tags(&["users".to_string()]).await.unwrap(), 2);
        assert!(!cache.exists("a").await.unwrap());
        assert!(!cache.exists("b").await.unwrap());
        assert!(cache.exists("c").await.unwrap());
        cache.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_tag_index_survives_invalidation_and_prunes_expired_keys() {
        let cache = setup_redis_cache("tag_index").await;
        let users = ["users".to_string()];
        let tag_key = cache.tag_key("users");
        let mut conn = cache.connection_manager.clone();

        cache
            .set("short", b"1", &CacheSetOptions::new(Duration::from_millis(100)).with_tags(["users"]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        cache
            .set("long", b"2", &CacheSetOptions::new(Duration::from_secs(60)).with_tags(["users"]))
            .await
            .unwrap();

        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(&tag_key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(members, vec!["long".to_string()]);
        let pttl: i64 = redis::cmd("PTTL").arg(&tag_key).query_async(&mut conn).await.unwrap();
        assert!(pttl > 0 && pttl <= 60_000);

        assert_eq!(cache.invalidate_by_tags(&users).await.unwrap(), 1);

        // A key written again after an invalidation can still be invalidated
        cache
            .set("long", b"3", &CacheSetOptions::new(Duration::from_secs(60)).with_tags(["users"]))
            .await
            .unwrap();
        assert_eq!(cache.invalidate_by_tags(&users).await.unwrap(), 1);
        assert!(!cache.exists("long").await.unwrap());
        cache.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_health_check() {
        let cache = setup_redis_cache("health").await;
        assert!(cache.health_check().await.unwrap());
    }
}
