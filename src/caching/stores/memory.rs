//! # In-Memory Cache Store
//!
//! In-memory cache with LRU eviction, TTL support, tag-based invalidation and an
//! optional background sweep of expired entries.
//!
//! All mutable state sits behind one lock so that a read sees an entry either fully
//! present or fully removed, including while a tag invalidation is in progress.
//! Recency is tracked with a logical clock rather than wall time, which makes the
//! eviction order a pure function of the access history.

use super::{CacheEntry, CacheSetOptions, CacheStore, CacheStoreStats, StoredEntry};
use crate::caching::{CacheError, CacheResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// In-memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Maximum number of entries
    pub max_entries: usize,

    /// Maximum memory usage in bytes
    pub max_memory_bytes: usize,

    /// Interval of the background sweep for expired entries
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10000,
            max_memory_bytes: 100 * 1024 * 1024, // 100MB
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    recency: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Slot>,
    /// recency tick -> key, oldest first
    lru: BTreeMap<u64, String>,
    /// tag -> keys carrying it
    tag_index: HashMap<String, HashSet<String>>,
    memory_usage: usize,
    clock: u64,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &str) {
        let tick = self.tick();
        if let Some(slot) = self.entries.get_mut(key) {
            self.lru.remove(&slot.recency);
            slot.recency = tick;
            self.lru.insert(tick, key.to_string());
        }
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.remove(&key);
        let tick = self.tick();
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.memory_usage += entry.size;
        self.lru.insert(tick, key.clone());
        self.entries.insert(key, Slot { entry, recency: tick });
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.lru.remove(&slot.recency);
        for tag in &slot.entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        self.memory_usage = self.memory_usage.saturating_sub(slot.entry.size);
        Some(slot.entry)
    }

    fn expired_keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn least_recent_key(&self) -> Option<String> {
        self.lru.values().next().cloned()
    }
}

/// In-memory cache implementation
pub struct InMemoryCache {
    /// Configuration
    config: InMemoryCacheConfig,

    /// Entries, recency order and tag index
    state: Mutex<State>,

    /// Atomic counters for statistics
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_cleanups: AtomicU64,
    invalidations: AtomicU64,
}

impl InMemoryCache {
    /// Create a new in-memory cache
    pub fn new(config: InMemoryCacheConfig) -> CacheResult<Self> {
        if config.max_entries == 0 || config.max_memory_bytes == 0 {
            return Err(CacheError::Configuration {
                message: "In-memory cache limits must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            config,
            state: Mutex::new(State::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_cleanups: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        })
    }

    /// Spawn the periodic sweep of expired entries
    ///
    /// The task holds only a weak reference and ends once the cache is dropped.
    pub fn start_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let cleanup_interval = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.cleanup_expired_entries();
                    }
                    None => break,
                }
            }
        })
    }

    /// Remove every expired entry, returning how many were removed
    pub fn cleanup_expired_entries(&self) -> usize {
        let mut state = self.state.lock();
        let mut cleaned_count = 0;
        let mut freed_memory = 0;

        for key in state.expired_keys() {
            if let Some(entry) = state.remove(&key) {
                freed_memory += entry.size;
                cleaned_count += 1;
            }
        }
        drop(state);

        if cleaned_count > 0 {
            self.expired_cleanups
                .fetch_add(cleaned_count as u64, Ordering::Relaxed);
            debug!(
                "Cleaned up {} expired cache entries, freed {} bytes",
                cleaned_count, freed_memory
            );
        }
        cleaned_count
    }

    /// Evict until the cache is back within its limits
    ///
    /// Expired entries go first; after that the least recently used entry is evicted.
    fn evict_if_needed(&self, state: &mut State) {
        if !self.over_capacity(state) {
            return;
        }

        let mut expired = 0;
        for key in state.expired_keys() {
            if state.remove(&key).is_some() {
                expired += 1;
            }
        }
        if expired > 0 {
            self.expired_cleanups.fetch_add(expired, Ordering::Relaxed);
        }

        let mut evicted_count = 0;
        while self.over_capacity(state) {
            let Some(key) = state.least_recent_key() else {
                break;
            };
            state.remove(&key);
            evicted_count += 1;
        }

        if evicted_count > 0 {
            self.evictions.fetch_add(evicted_count, Ordering::Relaxed);
            info!("Evicted {} LRU cache entries", evicted_count);
        }
    }

    fn over_capacity(&self, state: &State) -> bool {
        state.entries.len() > self.config.max_entries
            || state.memory_usage > self.config.max_memory_bytes
    }

    pub fn config(&self) -> &InMemoryCacheConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn lookup(&self, key: &str) -> CacheResult<Option<StoredEntry>> {
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            Some(slot) => slot.entry.is_expired(),
            None => {
                drop(state);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if expired {
            state.remove(key);
            drop(state);
            self.expired_cleanups.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        state.touch(key);
        let stored = state.entries.get_mut(key).map(|slot| {
            slot.entry.mark_accessed();
            StoredEntry {
                value: slot.entry.value.clone(),
                tags: slot.entry.tags.clone(),
                ttl: slot.entry.ttl(),
            }
        });
        drop(state);

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(stored)
    }

    async fn set(&self, key: &str, value: &[u8], options: &CacheSetOptions) -> CacheResult<()> {
        let mut state = self.state.lock();

        if options.ttl.is_zero() {
            state.remove(key);
            return Ok(());
        }

        let entry = CacheEntry::new(value.to_vec(), options);
        if entry.size > self.config.max_memory_bytes {
            // The previous value must not outlive a failed overwrite
            state.remove(key);
            return Err(CacheError::Store {
                message: format!(
                    "Entry of {} bytes exceeds the memory ceiling of {} bytes",
                    entry.size, self.config.max_memory_bytes
                ),
            });
        }

        state.insert(key.to_string(), entry);
        self.evict_if_needed(&mut state);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.state.lock().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let state = self.state.lock();
        Ok(state
            .entries
            .get(key)
            .map(|slot| !slot.entry.is_expired())
            .unwrap_or(false))
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> CacheResult<usize> {
        let mut state = self.state.lock();

        let keys: HashSet<String> = tags
            .iter()
            .filter_map(|tag| state.tag_index.get(tag))
            .flat_map(|keys| keys.iter().cloned())
            .collect();

        let mut removed = 0;
        for key in &keys {
            if state.remove(key).is_some() {
                removed += 1;
            }
        }
        drop(state);

        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!("Invalidated {} in-memory entries for tags {:?}", removed, tags);
        Ok(removed)
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut state = self.state.lock();
        let entry_count = state.entries.len();
        *state = State::default();
        drop(state);

        info!("Cleared {} entries from in-memory cache", entry_count);
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        let (entries, memory_usage) = {
            let state = self.state.lock();
            (state.entries.len(), state.memory_usage)
        };

        Ok(CacheStoreStats {
            entries,
            memory_usage,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.expired_cleanups.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let test_key = "__health_check__";
        let test_value = b"health_check_value";

        self.set(test_key, test_value, &CacheSetOptions::new(Duration::from_secs(1)))
            .await?;
        let retrieved = self.get(test_key).await?;
        self.delete(test_key).await?;

        Ok(retrieved == Some(test_value.to_vec()))
    }
}
