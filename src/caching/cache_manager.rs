//! # Cache Manager
//!
//! The cache manager coordinates the in-memory level and an optional remote level
//! and exposes both through the [`CacheStore`] trait, so callers never need to know
//! whether the cache is memory-only or hybrid.
//!
//! Reads check memory first. A remote hit is copied into memory with its tags and
//! remaining TTL. Writes, deletes and tag invalidations go to both levels. The remote
//! level is always wrapped in a [`ResilientStore`], so an unreachable backend
//! behaves like an empty one.

use super::stores::{
    InMemoryCache, InMemoryCacheConfig, RedisCache, RedisCacheConfig, ResilientStore,
    ResilientStoreConfig,
};
use super::{CacheError, CacheResult, CacheSetOptions, CacheStore, CacheStoreStats, StoredEntry};
use crate::observability::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// In-memory cache configuration
    pub memory: InMemoryCacheConfig,

    /// Enable the Redis level
    pub redis_enabled: bool,

    /// Redis cache configuration
    pub redis: RedisCacheConfig,

    /// How long a failing remote backend is skipped before it is probed again
    #[serde(with = "humantime_serde")]
    pub outage_cooldown: Duration,

    /// Maximum cache key length
    pub max_key_length: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: InMemoryCacheConfig::default(),
            redis_enabled: false,
            redis: RedisCacheConfig::default(),
            outage_cooldown: Duration::from_secs(5),
            max_key_length: 1024,
        }
    }
}

/// Level that served a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelHit {
    Memory,
    Remote,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered by either level
    pub hits: u64,

    /// Lookups answered by neither level
    pub misses: u64,

    /// Cache hit ratio
    pub hit_ratio: f64,

    /// Hits served from memory
    pub memory_hits: u64,

    /// Hits served from the remote level
    pub remote_hits: u64,

    /// Mean lookup latency in microseconds
    pub average_lookup_latency_us: f64,

    /// Memory store statistics
    pub memory: CacheStoreStats,

    /// Remote store statistics, when a remote level is configured
    pub remote: Option<CacheStoreStats>,

    /// Statistics collection start time
    pub start_time: chrono::DateTime<chrono::Utc>,
}

/// Multi-level cache manager
pub struct CacheManager {
    /// Configuration
    config: CacheConfig,

    /// In-memory cache
    memory: Arc<InMemoryCache>,

    /// Remote cache behind its breaker
    remote: Option<Arc<dyn CacheStore>>,

    /// Background expiry sweep for the memory level
    sweeper: JoinHandle<()>,

    memory_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    lookup_nanos: AtomicU64,
    start_time: chrono::DateTime<chrono::Utc>,
}

impl CacheManager {
    /// Create a new cache manager
    ///
    /// When Redis is enabled but unreachable at startup the manager runs memory-only
    /// and logs a warning.
    pub async fn new(config: CacheConfig) -> CacheResult<Self> {
        let remote: Option<Arc<dyn CacheStore>> = if config.redis_enabled {
            match RedisCache::new(config.redis.clone()).await {
                Ok(redis) => {
                    info!("Redis cache level enabled at {}", config.redis.url);
                    Some(Arc::new(ResilientStore::new(
                        redis,
                        ResilientStoreConfig {
                            outage_cooldown: config.outage_cooldown,
                            ..Default::default()
                        },
                    )))
                }
                Err(e) => {
                    warn!(
                        url = %config.redis.url,
                        error = %e,
                        "Redis unavailable at startup, running with the memory level only"
                    );
                    None
                }
            }
        } else {
            None
        };

        Self::build(config, remote)
    }

    /// Create a hybrid manager over a caller-supplied remote store
    pub fn with_remote<S>(config: CacheConfig, remote: S) -> CacheResult<Self>
    where
        S: CacheStore + 'static,
    {
        let remote = ResilientStore::new(
            remote,
            ResilientStoreConfig {
                outage_cooldown: config.outage_cooldown,
                ..Default::default()
            },
        );
        Self::build(config, Some(Arc::new(remote)))
    }

    fn build(config: CacheConfig, remote: Option<Arc<dyn CacheStore>>) -> CacheResult<Self> {
        if config.max_key_length == 0 {
            return Err(CacheError::Configuration {
                message: "max_key_length must be greater than zero".to_string(),
            });
        }

        let memory = Arc::new(InMemoryCache::new(config.memory.clone())?);
        let sweeper = memory.start_cleanup_task();
        info!(
            "Cache manager initialized with max {} memory entries{}",
            config.memory.max_entries,
            if remote.is_some() { " and a remote level" } else { "" }
        );

        Ok(Self {
            config,
            memory,
            remote,
            sweeper,
            memory_hits: AtomicU64::new(0),
            remote_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lookup_nanos: AtomicU64::new(0),
            start_time: chrono::Utc::now(),
        })
    }

    /// Look up a key and report which level answered
    pub async fn lookup_with_level(
        &self,
        key: &str,
    ) -> CacheResult<Option<(StoredEntry, LevelHit)>> {
        self.validate_key(key)?;
        let start = Instant::now();
        let result = self.lookup_levels(key).await;
        self.lookup_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);

        match &result {
            Ok(Some((_, LevelHit::Memory))) => self.memory_hits.fetch_add(1, Ordering::Relaxed),
            Ok(Some((_, LevelHit::Remote))) => self.remote_hits.fetch_add(1, Ordering::Relaxed),
            _ => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn lookup_levels(&self, key: &str) -> CacheResult<Option<(StoredEntry, LevelHit)>> {
        if let Some(entry) = self.memory.lookup(key).await? {
            debug!("Cache hit in memory for key: {}", key);
            return Ok(Some((entry, LevelHit::Memory)));
        }

        let Some(remote) = &self.remote else {
            return Ok(None);
        };

        match remote.lookup(key).await? {
            Some(entry) => {
                debug!("Cache hit in remote level for key: {}", key);
                if !entry.ttl.is_zero() {
                    let options = CacheSetOptions {
                        ttl: entry.ttl,
                        tags: entry.tags.clone(),
                    };
                    if let Err(e) = self.memory.set(key, &entry.value, &options).await {
                        debug!("Could not promote key {} to memory: {}", key, e);
                    }
                }
                Ok(Some((entry, LevelHit::Remote)))
            }
            None => Ok(None),
        }
    }

    /// Aggregate statistics over both levels
    pub async fn cache_stats(&self) -> CacheStats {
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let remote_hits = self.remote_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hits = memory_hits + remote_hits;
        let lookups = hits + misses;

        let memory = self.memory.stats().await.unwrap_or_default();
        let remote = match &self.remote {
            Some(remote) => Some(remote.stats().await.unwrap_or_default()),
            None => None,
        };

        CacheStats {
            hits,
            misses,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            memory_hits,
            remote_hits,
            average_lookup_latency_us: if lookups == 0 {
                0.0
            } else {
                self.lookup_nanos.load(Ordering::Relaxed) as f64 / lookups as f64 / 1_000.0
            },
            memory,
            remote,
            start_time: self.start_time,
        }
    }

    /// Get cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Validate cache key
    fn validate_key(&self, key: &str) -> CacheResult<()> {
        if key.is_empty() {
            return Err(CacheError::KeyGeneration {
                message: "Cache key cannot be empty".to_string(),
            });
        }

        if key.len() > self.config.max_key_length {
            return Err(CacheError::KeyGeneration {
                message: format!(
                    "Cache key length {} exceeds maximum {}",
                    key.len(),
                    self.config.max_key_length
                ),
            });
        }

        Ok(())
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[async_trait]
impl CacheStore for CacheManager {
    fn name(&self) -> &'static str {
        if self.remote.is_some() {
            "hybrid"
        } else {
            "memory"
        }
    }

    async fn lookup(&self, key: &str) -> CacheResult<Option<StoredEntry>> {
        Ok(self.lookup_with_level(key).await?.map(|(entry, _)| entry))
    }

    async fn set(&self, key: &str, value: &[u8], options: &CacheSetOptions) -> CacheResult<()> {
        self.validate_key(key)?;

        let memory_result = self.memory.set(key, value, options).await;
        if let Some(remote) = &self.remote {
            remote.set(key, value, options).await?;
        }
        memory_result?;

        debug!("Cached key: {} with TTL: {:?}", key, options.ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.validate_key(key)?;

        let mut deleted = self.memory.delete(key).await?;
        if let Some(remote) = &self.remote {
            deleted |= remote.delete(key).await?;
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.validate_key(key)?;

        if self.memory.exists(key).await? {
            return Ok(true);
        }
        match &self.remote {
            Some(remote) => remote.exists(key).await,
            None => Ok(false),
        }
    }

    /// Returns the number of removed entries summed over both levels
    async fn invalidate_by_tags(&self, tags: &[String]) -> CacheResult<usize> {
        if tags.is_empty() {
            return Ok(0);
        }

        let mut removed = self.memory.invalidate_by_tags(tags).await?;
        if let Some(remote) = &self.remote {
            removed += remote.invalidate_by_tags(tags).await?;
        }

        metrics::record_invalidation(removed);
        debug!("Invalidated {} entries for tags {:?}", removed, tags);
        Ok(removed)
    }

    async fn clear(&self) -> CacheResult<()> {
        self.memory.clear().await?;
        if let Some(remote) = &self.remote {
            remote.clear().await?;
        }

        info!("All cache levels cleared");
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        let stats = self.cache_stats().await;
        Ok(CacheStoreStats {
            entries: stats.memory.entries,
            memory_usage: stats.memory.memory_usage,
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.memory.evictions,
            expired_cleanups: stats.memory.expired_cleanups,
            invalidations: stats.memory.invalidations
                + stats.remote.map(|r| r.invalidations).unwrap_or(0),
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let mut healthy = true;

        if !self.memory.health_check().await? {
            healthy = false;
            warn!("Memory cache health check failed");
        }

        if let Some(remote) = &self.remote {
            if !remote.health_check().await? {
                healthy = false;
                warn!("Remote cache health check failed");
            }
        }

        Ok(healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::resilient::tests::FlakyStore;

    fn options(ttl_secs: u64) -> CacheSetOptions {
        CacheSetOptions::new(Duration::from_secs(ttl_secs))
    }

    #[tokio::test]
    async fn test_cache_manager_creation() {
        let cache_manager = CacheManager::new(CacheConfig::default()).await.unwrap();
        assert!(!cache_manager.has_remote());
        assert_eq!(cache_manager.name(), "memory");
    }

    #[tokio::test]
    async fn test_cache_operations() {
        let cache_manager = CacheManager::new(CacheConfig::default()).await.unwrap();

        cache_manager.set("test_key", b"test_value", &options(60)).await.unwrap();
        assert_eq!(
            cache_manager.get("test_key").await.unwrap(),
            Some(b"test_value".to_vec())
        );
        assert!(cache_manager.exists("test_key").await.unwrap());

        assert!(cache_manager.delete("test_key").await.unwrap());
        assert!(!cache_manager.exists("test_key").await.unwrap());
    }

    #[tokio::test]
    async fn test_key_validation() {
        let config = CacheConfig {
            max_key_length: 10,
            ..Default::default()
        };
        let cache_manager = CacheManager::new(config).await.unwrap();

        assert!(cache_manager.get("").await.is_err());
        assert!(cache_manager.get(&"a".repeat(20)).await.is_err());
    }

    #[tokio::test]
    async fn test_remote_hit_is_promoted_with_tags_and_ttl() {
        tokio::time::pause();
        let remote = Arc::new(InMemoryCache::new(InMemoryCacheConfig::default()).unwrap());
        remote
            .set("k", b"v", &options(10).with_tags(["users"]))
            .await
            .unwrap();
        let cache_manager = CacheManager::with_remote(CacheConfig::default(), remote.clone()).unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        let (entry, level) = cache_manager.lookup_with_level("k").await.unwrap().unwrap();
        assert_eq!(level, LevelHit::Remote);
        assert_eq!(entry.value, b"v".to_vec());

        let (_, level) = cache_manager.lookup_with_level("k").await.unwrap().unwrap();
        assert_eq!(level, LevelHit::Memory);

        // Promoted copy keeps the remaining TTL rather than a fresh window
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache_manager.lookup_with_level("k").await.unwrap().is_none());

        // and its tags
        remote.set("k", b"v", &options(60).with_tags(["users"])).await.unwrap();
        cache_manager.lookup_with_level("k").await.unwrap();
        assert_eq!(
            cache_manager.invalidate_by_tags(&["users".to_string()]).await.unwrap(),
            2
        );
        assert!(cache_manager.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_outage_degrades_to_memory_only() {
        tokio::time::pause();
        let (flaky, failing) = FlakyStore::new();
        let cache_manager = CacheManager::with_remote(CacheConfig::default(), flaky).unwrap();
        failing.store(true, Ordering::Relaxed);

        cache_manager.set("k", b"v", &options(60)).await.unwrap();
        assert_eq!(cache_manager.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache_manager.get("missing").await.unwrap(), None);
        assert_eq!(
            cache_manager.invalidate_by_tags(&["x".to_string()]).await.unwrap(),
            0
        );
        assert!(!cache_manager.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let cache_manager = CacheManager::new(CacheConfig::default()).await.unwrap();

        cache_manager.set("key1", b"value1", &options(60)).await.unwrap();
        cache_manager.get("key1").await.unwrap(); // Hit
        cache_manager.get("key2").await.unwrap(); // Miss

        let stats = cache_manager.cache_stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.hit_ratio, 0.5);
        assert_eq!(stats.memory.entries, 1);
        assert!(stats.remote.is_none());
    }

    #[tokio::test]
    async fn test_invalidation_during_outage_holds_after_recovery() {
        tokio::time::pause();
        let (flaky, failing) = FlakyStore::new();
        let cache_manager = CacheManager::with_remote(CacheConfig::default(), flaky).unwrap();
        cache_manager
            .set("tier:GET:/users", b"old-users", &options(60).with_tags(["users"]))
            .await
            .unwrap();

        failing.store(true, Ordering::Relaxed);
        cache_manager
            .invalidate_by_tags(&["users".to_string()])
            .await
            .unwrap();

        failing.store(false, Ordering::Relaxed);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache_manager.get("tier:GET:/users").await.unwrap(), None);
        assert!(cache_manager.lookup_with_level("tier:GET:/users").await.unwrap().is_none());
    }
}
