//! # Cache Stores Module
//!
//! Store implementations behind the [`CacheStore`] trait: in-memory, Redis, and a
//! resilient wrapper that turns backend outages into misses.

pub mod memory;
pub mod redis_store;
pub mod resilient;

pub use memory::{InMemoryCache, InMemoryCacheConfig};
pub use redis_store::{RedisCache, RedisCacheConfig};
pub use resilient::{BackendState, ResilientStore, ResilientStoreConfig};

use super::CacheResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Options for [`CacheStore::set`]
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSetOptions {
    /// Time to live; a zero TTL stores nothing
    pub ttl: Duration,

    /// Tags used for bulk invalidation
    pub tags: BTreeSet<String>,
}

impl CacheSetOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Cache entry with metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached value
    pub value: Vec<u8>,

    /// Tags attached when the entry was written
    pub tags: BTreeSet<String>,

    /// When the entry was created
    pub created_at: Instant,

    /// When the entry stops being readable
    pub expires_at: Instant,

    /// Number of times this entry has been read
    pub access_count: u64,

    /// Size estimate of the entry in bytes
    pub size: usize,
}

impl CacheEntry {
    /// Create a new cache entry starting its TTL window now
    pub fn new(value: Vec<u8>, options: &CacheSetOptions) -> Self {
        let now = Instant::now();
        let size = value.len()
            + options.tags.iter().map(|tag| tag.len()).sum::<usize>()
            + std::mem::size_of::<Self>();

        Self {
            value,
            tags: options.tags.clone(),
            created_at: now,
            expires_at: now + options.ttl,
            access_count: 0,
            size,
        }
    }

    /// Expired entries are never returned
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn mark_accessed(&mut self) {
        self.access_count += 1;
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.created_at)
    }

    /// Time until expiration
    pub fn ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|tag| self.tags.contains(tag))
    }
}

/// A live entry as returned by [`CacheStore::lookup`]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    pub tags: BTreeSet<String>,
    /// Remaining time to live
    pub ttl: Duration,
}

/// Trait for cache store implementations
///
/// Implementations must never return an expired entry and must make
/// `invalidate_by_tags` atomic with respect to concurrent reads of the same key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short identifier used in logs and metrics
    fn name(&self) -> &'static str;

    /// Get a live entry with its tags and remaining TTL
    async fn lookup(&self, key: &str) -> CacheResult<Option<StoredEntry>>;

    /// Get a value from the cache
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.lookup(key).await?.map(|entry| entry.value))
    }

    /// Set a value, replacing any existing entry and starting a new TTL window
    async fn set(&self, key: &str, value: &[u8], options: &CacheSetOptions) -> CacheResult<()>;

    /// Delete a value from the cache
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Check if a live key exists in the cache
    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.lookup(key).await?.is_some())
    }

    /// Remove every entry carrying at least one of `tags`, returning how many were removed
    async fn invalidate_by_tags(&self, tags: &[String]) -> CacheResult<usize>;

    /// Clear all entries from the cache
    async fn clear(&self) -> CacheResult<()>;

    /// Get cache statistics
    async fn stats(&self) -> CacheResult<CacheStoreStats>;

    /// Perform health check
    async fn health_check(&self) -> CacheResult<bool>;
}

#[async_trait]
impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn lookup(&self, key: &str) -> CacheResult<Option<StoredEntry>> {
        (**self).lookup(key).await
    }

    async fn set(&self, key: &str, value: &[u8], options: &CacheSetOptions) -> CacheResult<()> {
        (**self).set(key, value, options).await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        (**self).delete(key).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        (**self).exists(key).await
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> CacheResult<usize> {
        (**self).invalidate_by_tags(tags).await
    }

    async fn clear(&self) -> CacheResult<()> {
        (**self).clear().await
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        (**self).stats().await
    }

    async fn health_check(&self) -> CacheResult<bool> {
        (**self).health_check().await
    }
}

/// Cache store statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStoreStats {
    /// Number of entries
    pub entries: usize,

    /// Estimated memory usage in bytes
    pub memory_usage: usize,

    /// Number of hits
    pub hits: u64,

    /// Number of misses
    pub misses: u64,

    /// Number of evictions under capacity pressure
    pub evictions: u64,

    /// Number of expired entries cleaned up
    pub expired_cleanups: u64,

    /// Number of entries removed by tag invalidation
    pub invalidations: u64,
}

impl CacheStoreStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}
