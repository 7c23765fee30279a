//! # Pre-Compiled Route Cache
//!
//! Learned per-route state. Every completed request feeds its latency into the
//! [`RoutePattern`] of its normalized `METHOD:template` key; once a route has been
//! observed `optimization_threshold` times its tier is (re)assigned after every
//! outcome.
//!
//! ## Statistics
//! - streaming mean over every sample
//! - p95 and mean over a ring of the last `stats_window` latencies
//!
//! ## Tier assignment
//! A route is UltraFast only when it is a GET route without observed side effects,
//! its windowed p95 is under `ultra_fast_threshold_ms` and `p95 / mean` is below
//! `max_variance_ratio`. Safe routes under `fast_threshold_ms` are Fast; everything
//! else is Standard.
//!
//! ## Concurrency
//! The table is a [`DashMap`] of `Arc<RoutePattern>`. Statistics sit behind a
//! per-route mutex, while the assigned tier lives in an `AtomicU8` so readers never
//! observe a half-written tier. Lost statistic updates under heavy contention are
//! acceptable; the tier is always one of the three valid values.
//!
//! The table holds at most `max_compiled_routes` patterns. Recency is a logical
//! clock bumped on every recorded outcome, so eviction order depends only on the
//! order outcomes were recorded.

use axum::http::Method;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::types::{RequestClassification, Tier};
use crate::caching::key_generator::CacheKeyGenerator;
use crate::caching::response_cache::CachedResponse;
use crate::caching::CacheStore;
use crate::core::config::OptimizationConfig;
use crate::core::error::OptimizationError;
use crate::core::profiler::percentile;
use crate::core::types::{GatewayResponse, RequestDescriptor};
use crate::observability::metrics;

const UNASSIGNED: u8 = u8::MAX;

/// Precomputed shortcut for a stable UltraFast route
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledRoute {
    pub route_key: String,
    pub tier: Tier,
    pub compiled_at: chrono::DateTime<chrono::Utc>,
}

/// A response served through a compiled shortcut
#[derive(Debug, Clone)]
pub struct OptimizedResponse {
    pub route: CompiledRoute,
    /// Direct key the response was read from
    pub key: String,
    pub response: GatewayResponse,
}

/// What a completed request contributes to its route's statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteOutcome {
    pub latency: Duration,
    pub cache_hit: bool,
    /// The request could have changed server state (unsafe method or a body)
    pub side_effects: bool,
}

/// Point-in-time view used by the classifier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteView {
    pub sample_count: u64,
    pub assigned_tier: Option<Tier>,
    pub window_len: usize,
    pub high_variance: bool,
    pub has_side_effects: bool,
}

/// Full learned state of one route, for statistics endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutePatternSnapshot {
    pub route_key: String,
    pub sample_count: u64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub window_mean_ms: f64,
    pub assigned_tier: Option<Tier>,
    pub high_variance: bool,
    pub has_side_effects: bool,
    /// Consecutive outcomes since the tier last changed
    pub stable_for: u32,
    pub cache_hits: u64,
    /// Outcomes classified UltraFast that were not served from cache
    pub fallthroughs: u64,
    pub compiled: Option<CompiledRoute>,
}

#[derive(Debug)]
struct RouteStats {
    sample_count: u64,
    mean_ms: f64,
    window: VecDeque<f64>,
    p95_ms: f64,
    window_mean_ms: f64,
    high_variance: bool,
    has_side_effects: bool,
    cache_hits: u64,
    fallthroughs: u64,
    compiled: Option<CompiledRoute>,
}

impl RouteStats {
    fn new(window: usize) -> Self {
        Self {
            sample_count: 0,
            mean_ms: 0.0,
            window: VecDeque::with_capacity(window),
            p95_ms: 0.0,
            window_mean_ms: 0.0,
            high_variance: false,
            has_side_effects: false,
            cache_hits: 0,
            fallthroughs: 0,
            compiled: None,
        }
    }

    fn push(&mut self, latency_ms: f64, capacity: usize, max_variance_ratio: f64) {
        self.sample_count += 1;
        self.mean_ms += (latency_ms - self.mean_ms) / self.sample_count as f64;

        if self.window.len() >= capacity {
            self.window.pop_front();
        }
        self.window.push_back(latency_ms);

        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        self.p95_ms = percentile(&sorted, 0.95);
        self.window_mean_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        self.high_variance =
            self.window_mean_ms > 0.0 && self.p95_ms / self.window_mean_ms >= max_variance_ratio;
    }
}

/// Learned statistics for one `METHOD:template` route
#[derive(Debug)]
pub struct RoutePattern {
    route_key: String,
    method: Method,
    tier: AtomicU8,
    stable_for: AtomicU32,
    last_observed: AtomicU64,
    stats: Mutex<RouteStats>,
}

impl RoutePattern {
    fn new(route_key: &str, window: usize) -> Self {
        let method = route_key
            .split_once(':')
            .and_then(|(method, _)| Method::from_bytes(method.as_bytes()).ok())
            .unwrap_or(Method::GET);

        Self {
            route_key: route_key.to_string(),
            method,
            tier: AtomicU8::new(UNASSIGNED),
            stable_for: AtomicU32::new(0),
            last_observed: AtomicU64::new(0),
            stats: Mutex::new(RouteStats::new(window)),
        }
    }

    pub fn route_key(&self) -> &str {
        &self.route_key
    }

    /// Last decided tier, `None` until the learning threshold is reached
    pub fn assigned_tier(&self) -> Option<Tier> {
        match self.tier.load(Ordering::Acquire) {
            UNASSIGNED => None,
            value => Some(Tier::from_u8(value)),
        }
    }

    fn snapshot(&self) -> RoutePatternSnapshot {
        let stats = self.stats.lock();
        RoutePatternSnapshot {
            route_key: self.route_key.clone(),
            sample_count: stats.sample_count,
            mean_latency_ms: stats.mean_ms,
            p95_latency_ms: stats.p95_ms,
            window_mean_ms: stats.window_mean_ms,
            assigned_tier: self.assigned_tier(),
            high_variance: stats.high_variance,
            has_side_effects: stats.has_side_effects,
            stable_for: self.stable_for.load(Ordering::Relaxed),
            cache_hits: stats.cache_hits,
            fallthroughs: stats.fallthroughs,
            compiled: stats.compiled.clone(),
        }
    }
}

/// Bounded table of learned route patterns
pub struct RouteCache {
    config: OptimizationConfig,
    key_generator: CacheKeyGenerator,
    patterns: DashMap<String, Arc<RoutePattern>>,
    clock: AtomicU64,
    evictions: AtomicU64,
}

impl RouteCache {
    pub fn new(config: OptimizationConfig) -> Self {
        Self::with_key_generator(config, CacheKeyGenerator::default())
    }

    pub fn with_key_generator(config: OptimizationConfig, key_generator: CacheKeyGenerator) -> Self {
        Self {
            config,
            key_generator,
            patterns: DashMap::new(),
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Classifier view of a route, `None` when the route has never been observed
    pub fn lookup(&self, route_key: &str) -> Option<RouteView> {
        let pattern = self.patterns.get(route_key)?.value().clone();
        let stats = pattern.stats.lock();
        Some(RouteView {
            sample_count: stats.sample_count,
            assigned_tier: pattern.assigned_tier(),
            window_len: stats.window.len(),
            high_variance: stats.high_variance,
            has_side_effects: stats.has_side_effects,
        })
    }

    /// Lock-free read of a route's assigned tier
    pub fn assigned_tier(&self, route_key: &str) -> Option<Tier> {
        self.patterns
            .get(route_key)
            .and_then(|pattern| pattern.assigned_tier())
    }

    /// Feed a completed request back into its route's statistics
    ///
    /// Returns the route's assigned tier after the update.
    pub fn record_outcome(
        &self,
        route_key: &str,
        classification: &RequestClassification,
        outcome: RouteOutcome,
    ) -> Option<Tier> {
        let pattern = self.pattern_for(route_key);
        pattern
            .last_observed
            .store(self.clock.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Relaxed);

        let mut stats = pattern.stats.lock();
        stats.push(
            outcome.latency.as_secs_f64() * 1_000.0,
            self.config.stats_window.max(1),
            self.config.max_variance_ratio,
        );
        stats.has_side_effects |= outcome.side_effects;
        if outcome.cache_hit {
            stats.cache_hits += 1;
        } else if classification.tier == Tier::UltraFast {
            stats.fallthroughs += 1;
        }

        if stats.sample_count < self.config.optimization_threshold {
            return None;
        }

        let tier = self.assign_tier(&pattern.method, &stats);
        let previous = pattern.tier.swap(tier.as_u8(), Ordering::AcqRel);
        if previous == tier.as_u8() {
            pattern.stable_for.fetch_add(1, Ordering::Relaxed);
        } else {
            pattern.stable_for.store(1, Ordering::Relaxed);
            debug!(
                route = %route_key,
                tier = %tier,
                p95_ms = stats.p95_ms,
                samples = stats.sample_count,
                "Route tier assigned"
            );
        }

        if tier == Tier::UltraFast {
            if stats.compiled.is_none() {
                stats.compiled = Some(CompiledRoute {
                    route_key: route_key.to_string(),
                    tier,
                    compiled_at: chrono::Utc::now(),
                });
            }
        } else {
            stats.compiled = None;
        }

        Some(tier)
    }

    fn assign_tier(&self, method: &Method, stats: &RouteStats) -> Tier {
        let safe = matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS);
        if !safe {
            return Tier::Standard;
        }

        if *method == Method::GET
            && !stats.has_side_effects
            && !stats.high_variance
            && stats.p95_ms < self.config.ultra_fast_threshold_ms
        {
            Tier::UltraFast
        } else if stats.p95_ms < self.config.fast_threshold_ms {
            Tier::Fast
        } else {
            Tier::Standard
        }
    }

    fn pattern_for(&self, route_key: &str) -> Arc<RoutePattern> {
        if let Some(pattern) = self.patterns.get(route_key) {
            return pattern.value().clone();
        }

        let pattern = self
            .patterns
            .entry(route_key.to_string())
            .or_insert_with(|| Arc::new(RoutePattern::new(route_key, self.config.stats_window)))
            .value()
            .clone();

        while self.patterns.len() > self.config.max_compiled_routes {
            if !self.evict_least_recent(route_key) {
                break;
            }
        }
        metrics::set_learned_routes(self.patterns.len());
        pattern
    }

    fn evict_least_recent(&self, keep: &str) -> bool {
        let victim = self
            .patterns
            .iter()
            .filter(|entry| entry.key() != keep)
            .min_by_key(|entry| {
                (
                    entry.value().last_observed.load(Ordering::Relaxed),
                    entry.key().clone(),
                )
            })
            .map(|entry| entry.key().clone());

        match victim {
            Some(key) => {
                self.patterns.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(route = %key, "Evicted least recently observed route");
                true
            }
            None => false,
        }
    }

    /// Compiled shortcut for a request, resolved against the store
    ///
    /// Returns a response only when the route is compiled, has kept its tier for
    /// `stability_window` outcomes and a fresh direct entry exists.
    pub async fn get_optimized_handler<S>(
        &self,
        request: &RequestDescriptor,
        store: &S,
    ) -> Result<Option<OptimizedResponse>, OptimizationError>
    where
        S: CacheStore + ?Sized,
    {
        let Some(route) = self.compiled_route(&CacheKeyGenerator::route_key(request)) else {
            return Ok(None);
        };

        self.resolve(route, self.key_generator.direct_key(request), store)
            .await
    }

    /// Read a compiled route's direct entry under `key`
    pub async fn resolve<S>(
        &self,
        route: CompiledRoute,
        key: String,
        store: &S,
    ) -> Result<Option<OptimizedResponse>, OptimizationError>
    where
        S: CacheStore + ?Sized,
    {
        let Some(payload) = store.get(&key).await? else {
            return Ok(None);
        };

        let response = CachedResponse::decode(&payload)
            .and_then(CachedResponse::into_response)
            .map_err(|e| OptimizationError::CorruptCachedResponse(e.to_string()))?;

        Ok(Some(OptimizedResponse {
            route,
            key,
            response,
        }))
    }

    /// The route's compiled shortcut, if it is currently stable
    pub fn compiled_route(&self, route_key: &str) -> Option<CompiledRoute> {
        let pattern = self.patterns.get(route_key)?.value().clone();
        if pattern.stable_for.load(Ordering::Relaxed) < self.config.stability_window {
            return None;
        }
        let stats = pattern.stats.lock();
        stats.compiled.clone()
    }

    /// Every learned route, sorted by key
    pub fn snapshot(&self) -> Vec<RoutePatternSnapshot> {
        let patterns: Vec<Arc<RoutePattern>> = self
            .patterns
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut snapshots: Vec<_> = patterns.iter().map(|pattern| pattern.snapshot()).collect();
        snapshots.sort_by(|a, b| a.route_key.cmp(&b.route_key));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Forget every learned route
    pub fn clear(&self) {
        self.patterns.clear();
        metrics::set_learned_routes(0);
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }
}
