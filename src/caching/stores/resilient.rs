//! Outage handling for remote cache stores.
//!
//! [`ResilientStore`] wraps a store with a small circuit breaker. The first failed
//! operation marks the backend degraded; while degraded every operation answers as a
//! miss (or a no-op for writes) without touching the backend. Once `outage_cooldown`
//! has passed a single probe operation is let through, and a successful probe restores
//! normal operation. State transitions are logged once each, never per request.
//!
//! Tag invalidations that could not reach the backend are remembered and replayed
//! before the next operation that is let through, so entries invalidated during an
//! outage are never served again once the backend is back. When more tags pile up
//! than `max_pending_invalidations`, the replay clears the backend instead.

use super::{CacheSetOptions, CacheStore, CacheStoreStats, StoredEntry};
use crate::caching::{CacheError, CacheResult};
use crate::observability::metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilientStoreConfig {
    /// How long a degraded backend is left alone before a probe
    #[serde(with = "humantime_serde")]
    pub outage_cooldown: Duration,

    /// Invalidated tags remembered during an outage before falling back to a clear
    pub max_pending_invalidations: usize,
}

impl Default for ResilientStoreConfig {
    fn default() -> Self {
        Self {
            outage_cooldown: Duration::from_secs(5),
            max_pending_invalidations: 1024,
        }
    }
}

/// Invalidations the backend has not seen yet
#[derive(Debug, Default)]
struct PendingInvalidations {
    tags: BTreeSet<String>,
    /// Too many tags, or a skipped `clear`: the whole backend must go
    clear: bool,
}

impl PendingInvalidations {
    fn is_empty(&self) -> bool {
        self.tags.is_empty() && !self.clear
    }

    fn add_tags(&mut self, tags: impl IntoIterator<Item = String>, limit: usize) {
        if self.clear {
            return;
        }
        self.tags.extend(tags);
        if self.tags.len() > limit {
            self.require_clear();
        }
    }

    fn require_clear(&mut self) {
        self.tags.clear();
        self.clear = true;
    }

    fn merge(&mut self, other: PendingInvalidations, limit: usize) {
        if other.clear {
            self.require_clear();
        } else {
            self.add_tags(other.tags, limit);
        }
    }
}

/// Backend health as seen by the breaker
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackendState {
    Healthy,
    /// Failing since `since`; calls short-circuit until the cooldown passes
    Degraded { since: Instant },
    /// One probe is in flight
    Probing { started: Instant },
}

impl BackendState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, BackendState::Healthy)
    }
}

pub struct ResilientStore<S> {
    inner: S,
    config: ResilientStoreConfig,
    state: Mutex<BackendState>,
    pending: Mutex<PendingInvalidations>,
    failures: AtomicU64,
    short_circuited: AtomicU64,
}

impl<S: CacheStore> ResilientStore<S> {
    pub fn new(inner: S, config: ResilientStoreConfig) -> Self {
        metrics::set_backend_degraded(inner.name(), false);
        Self {
            inner,
            config,
            state: Mutex::new(BackendState::Healthy),
            pending: Mutex::new(PendingInvalidations::default()),
            failures: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of backend operations that failed
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Number of operations answered without contacting the backend
    pub fn short_circuited(&self) -> u64 {
        self.short_circuited.load(Ordering::Relaxed)
    }

    /// Tags whose invalidation the backend has not seen yet
    pub fn pending_invalidations(&self) -> usize {
        self.pending.lock().tags.len()
    }

    fn remember_tags(&self, tags: &[String]) {
        self.pending
            .lock()
            .add_tags(tags.iter().cloned(), self.config.max_pending_invalidations);
    }

    fn remember_clear(&self) {
        self.pending.lock().require_clear();
    }

    /// Apply invalidations missed during an outage; false if the backend failed
    async fn replay_pending(&self) -> bool {
        let pending = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return true;
            }
            std::mem::take(&mut *pending)
        };

        let result = if pending.clear {
            self.inner.clear().await
        } else {
            let tags: Vec<String> = pending.tags.iter().cloned().collect();
            self.inner.invalidate_by_tags(&tags).await.map(|_| ())
        };

        match result {
            Ok(()) => {
                info!(
                    backend = self.inner.name(),
                    tags = pending.tags.len(),
                    cleared = pending.clear,
                    "Replayed invalidations missed during the outage"
                );
                true
            }
            Err(e) => {
                self.pending
                    .lock()
                    .merge(pending, self.config.max_pending_invalidations);
                self.on_failure("replay_invalidations", &e);
                false
            }
        }
    }

    /// Decide whether an operation may reach the backend
    fn admit(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let cooldown = self.config.outage_cooldown;

        let admitted = match *state {
            BackendState::Healthy => true,
            BackendState::Degraded { since } | BackendState::Probing { started: since }
                if now.saturating_duration_since(since) >= cooldown =>
            {
                // A probe that never reported back counts as abandoned
                *state = BackendState::Probing { started: now };
                true
            }
            BackendState::Degraded { .. } | BackendState::Probing { .. } => false,
        };
        drop(state);

        if !admitted {
            self.short_circuited.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if state.is_healthy() {
            return;
        }
        *state = BackendState::Healthy;
        drop(state);

        info!(backend = self.inner.name(), "Cache backend recovered");
        metrics::set_backend_degraded(self.inner.name(), false);
    }

    fn on_failure(&self, operation: &'static str, error: &CacheError) {
        self.failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        let was_healthy = state.is_healthy();
        *state = BackendState::Degraded {
            since: Instant::now(),
        };
        drop(state);

        if was_healthy {
            warn!(
                backend = self.inner.name(),
                operation,
                error = %error,
                cooldown = ?self.config.outage_cooldown,
                "Cache backend unavailable, serving without it"
            );
            metrics::set_backend_degraded(self.inner.name(), true);
        }
    }

    /// Run an operation through the breaker, substituting `fallback` when the
    /// backend is skipped or fails
    async fn guarded<T, F>(&self, operation: &'static str, fallback: T, call: F) -> T
    where
        F: std::future::Future<Output = CacheResult<T>>,
    {
        if !self.admit() || !self.replay_pending().await {
            return fallback;
        }

        match call.await {
            Ok(value) => {
                self.on_success();
                value
            }
            Err(e) => {
                self.on_failure(operation, &e);
                fallback
            }
        }
    }
}

#[async_trait]
impl<S: CacheStore> CacheStore for ResilientStore<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn lookup(&self, key: &str) -> CacheResult<Option<StoredEntry>> {
        Ok(self.guarded("lookup", None, self.inner.lookup(key)).await)
    }

    async fn set(&self, key: &str, value: &[u8], options: &CacheSetOptions) -> CacheResult<()> {
        self.guarded("set", (), self.inner.set(key, value, options))
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.guarded("delete", false, self.inner.delete(key)).await)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.guarded("exists", false, self.inner.exists(key)).await)
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> CacheResult<usize> {
        let removed = self
            .guarded("invalidate_by_tags", None, async {
                self.inner.invalidate_by_tags(tags).await.map(Some)
            })
            .await;
        Ok(removed.unwrap_or_else(|| {
            self.remember_tags(tags);
            0
        }))
    }

    async fn clear(&self) -> CacheResult<()> {
        let cleared = self
            .guarded("clear", false, async { self.inner.clear().await.map(|_| true) })
            .await;
        if !cleared {
            self.remember_clear();
        }
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        Ok(self
            .guarded("stats", CacheStoreStats::default(), self.inner.stats())
            .await)
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(self.guarded("health_check", false, self.inner.health_check()).await)
    }
}
