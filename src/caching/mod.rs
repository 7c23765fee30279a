//! # Caching System Module
//!
//! Response cache used by the tiered dispatcher. It supports an in-memory store, a
//! Redis store and a hybrid of the two behind one [`CacheStore`] trait, with TTL
//! expiry, LRU eviction and tag-based invalidation.
//!
//! ## Architecture
//! 1. **Cache Stores**: in-memory and Redis implementations of [`CacheStore`]
//! 2. **Resilient Store**: wraps a remote store so outages degrade to cache misses
//! 3. **Cache Manager**: coordinates the memory (L1) and remote (L2) levels
//! 4. **Key Generator**: direct and layered keys derived from a request
//! 5. **Invalidation**: per-route tag rules and tag-based invalidation events
//! 6. **Response Cache**: serialization of responses and the caching handler wrapper
//! 7. **Warm-up**: background pre-population at startup
//!
//! ## Usage Example
//! ```rust,no_run
//! use std::time::Duration;
//! use tiered_gateway::caching::{CacheConfig, CacheManager, CacheSetOptions, CacheStore};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = CacheManager::new(CacheConfig::default()).await?;
//!
//! let options = CacheSetOptions::new(Duration::from_secs(300)).with_tags(["users"]);
//! cache.set("tier:GET:/users", b"[]", &options).await?;
//!
//! assert!(cache.get("tier:GET:/users").await?.is_some());
//! cache.invalidate_by_tags(&["users".to_string()]).await?;
//! assert!(cache.get("tier:GET:/users").await?.is_none());
//! # Ok(())
//! # }
//! ```

pub mod cache_manager;
pub mod invalidation;
pub mod key_generator;
pub mod response_cache;
pub mod stores;
pub mod warmup;

pub use cache_manager::{CacheConfig, CacheManager, CacheStats, LevelHit};
pub use invalidation::{
    InvalidationEvent, InvalidationManager, RouteCachePolicy, RouteCacheRule, TagSnapshot,
};
pub use key_generator::CacheKeyGenerator;
pub use response_cache::{CachedResponse, CachingHandler, CacheWritePlan};
pub use stores::{
    CacheEntry, CacheSetOptions, CacheStore, CacheStoreStats, InMemoryCache, RedisCache,
    ResilientStore, StoredEntry,
};
pub use warmup::{CacheWarmer, WarmupConfig, WarmupHandle, WarmupReport};

use crate::core::error::GatewayError;

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {message}")]
    Store { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Key generation error: {message}")]
    KeyGeneration { message: String },

    #[error("Cache configuration error: {message}")]
    Configuration { message: String },

    #[error("Cache operation timeout")]
    Timeout,

    #[error("Cache not available")]
    Unavailable,
}

impl From<CacheError> for GatewayError {
    fn from(err: CacheError) -> Self {
        GatewayError::internal(format!("Cache error: {}", err))
    }
}
