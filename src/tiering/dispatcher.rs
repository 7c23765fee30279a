//! # Tiered Dispatcher
//!
//! Drives a classified request through its execution tier:
//!
//! ```text
//! Classified -> UltraFast | Fast | Standard -> Completed
//!                    \         \
//!                     +-> Fast  +-> Standard   (fall through)
//! ```
//!
//! Each optimized tier is attempted by a function returning
//! `Result<Handled, Fallthrough>`. A cache miss moves the request one tier down;
//! an [`OptimizationError`] moves it straight to the standard path and is counted.
//! Errors from the caller's handler or middleware are never absorbed and are
//! returned unchanged.
//!
//! - **UltraFast** runs the security stage while resolving the route's compiled
//!   shortcut against its direct cache key.
//! - **Fast** runs the security stage and the layered cache lookup concurrently; on
//!   a miss it continues to the handler with a response-caching decorator.
//! - **Standard** runs every middleware stage, the layered lookup at the cache
//!   stage, and the handler.
//!
//! On completion every request records a profiler sample and feeds its latency back
//! into the route cache. Successful mutating requests invalidate the tags configured
//! for their route before the response is returned. Cache writes are spawned on a
//! [`TaskTracker`] and never delay the response.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument};

use super::classifier::{is_safe_method, RequestClassifier};
use super::route_cache::{RouteCache, RouteOutcome, RoutePatternSnapshot};
use super::types::{CacheLevel, CacheStrategy, RequestClassification, Tier};
use crate::caching::cache_manager::{CacheManager, CacheStats, LevelHit};
use crate::caching::invalidation::{
    InvalidationEvent, InvalidationManager, RouteCachePolicy, TagSnapshot,
};
use crate::caching::key_generator::CacheKeyGenerator;
use crate::caching::response_cache::{
    CachedResponse, CachingHandler, CacheWritePlan, CACHE_STATUS_HEADER,
};
use crate::caching::{CacheSetOptions, CacheStore, StoredEntry};
use crate::core::config::{TierTtlConfig, TieringConfig};
use crate::core::error::{GatewayResult, OptimizationError};
use crate::core::handler::Handler;
use crate::core::profiler::{MeasurementHandle, PerformanceProfiler};
use crate::core::types::{GatewayResponse, RequestDescriptor};
use crate::middleware::pipeline::MiddlewarePipeline;
use crate::middleware::stage::{MiddlewareStage, StageSet};
use crate::observability::metrics;

/// A tier attempt that produced a response
#[derive(Debug)]
struct Handled {
    response: GatewayResponse,
    cache_level: CacheLevel,
    tier: Tier,
    /// Produced by a middleware instead of the handler or the cache
    short_circuit: bool,
}

impl Handled {
    fn hit(response: GatewayResponse, cache_level: CacheLevel, tier: Tier) -> Self {
        Self {
            response,
            cache_level,
            tier,
            short_circuit: false,
        }
    }

    fn miss(response: GatewayResponse, tier: Tier) -> Self {
        Self::hit(response, CacheLevel::Miss, tier)
    }

    fn short_circuit(response: GatewayResponse, tier: Tier) -> Self {
        Self {
            short_circuit: true,
            ..Self::miss(response, tier)
        }
    }
}

/// Why an optimized tier could not answer
#[derive(Debug)]
enum Fallthrough {
    CacheMiss,
    NotCacheable,
    Optimization(OptimizationError),
}

impl Fallthrough {
    fn as_str(&self) -> &'static str {
        match self {
            Fallthrough::CacheMiss => "cache_miss",
            Fallthrough::NotCacheable => "not_cacheable",
            Fallthrough::Optimization(_) => "optimization_error",
        }
    }
}

type TierAttempt = Result<Handled, Fallthrough>;

struct DispatchContext {
    request: RequestDescriptor,
    classification: RequestClassification,
    policy: RouteCachePolicy,
    /// Generations of the policy tags when the request started
    tags_seen: TagSnapshot,
    route_key: String,
    handle: MeasurementHandle,
    /// Request-phase stages already run
    completed: StageSet,
    /// The layered cache was already consulted
    layered_checked: bool,
    side_effects: bool,
}

impl DispatchContext {
    fn new(
        request: RequestDescriptor,
        classification: RequestClassification,
        policy: RouteCachePolicy,
        tags_seen: TagSnapshot,
        handle: MeasurementHandle,
    ) -> Self {
        Self {
            route_key: CacheKeyGenerator::route_key(&request),
            tags_seen,
            side_effects: !is_safe_method(&request.method) || request.has_body(),
            request,
            classification,
            policy,
            handle,
            completed: StageSet::empty(),
            layered_checked: false,
        }
    }

    fn caches(&self) -> bool {
        self.classification.cache_strategy != CacheStrategy::None
    }
}

/// Latency percentiles over the profiler's sample window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Share of completed requests served from each cache level
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheHitRates {
    pub overall: f64,
    pub l1: f64,
    pub l2: f64,
    pub l3: f64,
    pub by_tier: BTreeMap<Tier, f64>,
}

/// Optimization statistics exposed to monitoring endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationStats {
    /// Requests per classified tier
    pub tier_counts: BTreeMap<Tier, u64>,
    pub fallthroughs: u64,
    /// Classification failures plus failures inside optimized paths
    pub optimization_failures: u64,
    pub cache_hit_rates: CacheHitRates,
    pub latency_percentiles: LatencyPercentiles,
    pub target_achievement_rate: f64,
    pub learned_routes: usize,
    pub routes: Vec<RoutePatternSnapshot>,
    pub cache: CacheStats,
}

#[derive(Default)]
struct DispatchCounters {
    tiers: [AtomicU64; 3],
    /// Indexed L1, L2, L3, Miss
    levels: [AtomicU64; 4],
    fallthroughs: AtomicU64,
    optimization_failures: AtomicU64,
}

fn level_index(level: CacheLevel) -> usize {
    match level {
        CacheLevel::L1 => 0,
        CacheLevel::L2 => 1,
        CacheLevel::L3 => 2,
        CacheLevel::Miss => 3,
    }
}

/// Request stages a tier runs, in order
fn stages_for(tier: Tier) -> StageSet {
    RequestClassification::skip_set_for(tier).complement()
}

/// Tiered execution dispatcher
pub struct TieredDispatcher {
    ttl: TierTtlConfig,
    store: Arc<CacheManager>,
    route_cache: Arc<RouteCache>,
    classifier: RequestClassifier,
    profiler: Arc<PerformanceProfiler>,
    pipeline: Arc<MiddlewarePipeline>,
    invalidation: Arc<InvalidationManager>,
    key_generator: CacheKeyGenerator,
    writes: TaskTracker,
    counters: DispatchCounters,
    profiler_sweeper: JoinHandle<()>,
}

impl TieredDispatcher {
    /// Build a dispatcher with its own cache manager and an empty middleware pipeline
    pub async fn from_config(config: &TieringConfig) -> GatewayResult<Self> {
        let store = Arc::new(CacheManager::new(config.cache.clone()).await?);
        Self::new(config, store, Arc::new(MiddlewarePipeline::new()))
    }

    /// Build a dispatcher over an existing cache manager and pipeline
    ///
    /// Must be called inside a tokio runtime; the profiler's handle sweeper is
    /// spawned here.
    pub fn new(
        config: &TieringConfig,
        store: Arc<CacheManager>,
        pipeline: Arc<MiddlewarePipeline>,
    ) -> GatewayResult<Self> {
        let invalidation = Arc::new(InvalidationManager::new(&config.routes)?);
        let route_cache = Arc::new(RouteCache::new(config.optimization.clone()));
        let classifier = RequestClassifier::new(route_cache.clone(), invalidation.clone());

        let ultra_fast_target =
            Duration::from_secs_f64(config.optimization.ultra_fast_threshold_ms / 1_000.0);
        let profiler = Arc::new(PerformanceProfiler::new(
            config.profiler.clone(),
            ultra_fast_target,
        ));
        let profiler_sweeper = profiler.start_sweeper();

        Ok(Self {
            ttl: config.ttl.clone(),
            store,
            route_cache,
            classifier,
            profiler,
            pipeline,
            invalidation,
            key_generator: CacheKeyGenerator::default(),
            writes: TaskTracker::new(),
            counters: DispatchCounters::default(),
            profiler_sweeper,
        })
    }

    /// Classify a request without dispatching it
    pub fn classify(&self, request: &RequestDescriptor) -> RequestClassification {
        self.classifier.classify(request)
    }

    /// Classify and dispatch a request
    #[instrument(
        level = "debug",
        skip(self, request, handler),
        fields(request_id = %request.id, method = %request.method, path = %request.path)
    )]
    pub async fn dispatch(
        &self,
        request: RequestDescriptor,
        handler: Arc<dyn Handler>,
    ) -> GatewayResult<GatewayResponse> {
        let handle = self.profiler.start_measurement(&request);
        let started = Instant::now();
        let (classification, policy) = self.classifier.classify_with_policy(&request);
        self.profiler
            .mark_classification(handle, classification.tier, started.elapsed());

        let tags_seen = self.invalidation.snapshot(&policy.tags);
        self.execute(
            DispatchContext::new(request, classification, policy, tags_seen, handle),
            handler,
        )
        .await
    }

    /// Dispatch a request under a classification computed by the caller
    pub async fn dispatch_classified(
        &self,
        request: RequestDescriptor,
        classification: RequestClassification,
        handler: Arc<dyn Handler>,
    ) -> GatewayResult<GatewayResponse> {
        let handle = self.profiler.start_measurement(&request);
        self.profiler
            .mark_classification(handle, classification.tier, Duration::ZERO);
        let policy = self.invalidation.policy_for(&request);

        let tags_seen = self.invalidation.snapshot(&policy.tags);
        self.execute(
            DispatchContext::new(request, classification, policy, tags_seen, handle),
            handler,
        )
        .await
    }

    async fn execute(
        &self,
        mut ctx: DispatchContext,
        handler: Arc<dyn Handler>,
    ) -> GatewayResult<GatewayResponse> {
        self.counters.tiers[ctx.classification.tier.index()].fetch_add(1, Ordering::Relaxed);

        let result = match self.run_tiers(&mut ctx, &handler).await {
            Ok(handled) => self.finish(&ctx, handled).await,
            Err(e) => Err(e),
        };

        self.complete(&ctx, &result).await;
        result.map(|handled| handled.response)
    }

    async fn run_tiers(
        &self,
        ctx: &mut DispatchContext,
        handler: &Arc<dyn Handler>,
    ) -> GatewayResult<Handled> {
        let mut tier = ctx.classification.tier;
        loop {
            let attempt = match tier {
                Tier::UltraFast => self.try_ultra_fast(ctx).await?,
                Tier::Fast => self.try_fast(ctx, handler).await?,
                Tier::Standard => return self.run_standard(ctx, handler).await,
            };

            match attempt {
                Ok(handled) => return Ok(handled),
                Err(reason) => {
                    let next = match reason {
                        Fallthrough::Optimization(ref e) => {
                            self.record_optimization_failure(e);
                            Tier::Standard
                        }
                        _ => tier.downgrade(),
                    };
                    debug!(
                        request_id = %ctx.request.id,
                        from = %tier,
                        to = %next,
                        reason = reason.as_str(),
                        "Falling through"
                    );
                    self.counters.fallthroughs.fetch_add(1, Ordering::Relaxed);
                    metrics::record_fallthrough(tier, next);
                    tier = next;
                }
            }
        }
    }

    async fn try_ultra_fast(&self, ctx: &mut DispatchContext) -> GatewayResult<TierAttempt> {
        if ctx.classification.cache_strategy != CacheStrategy::Direct {
            return Ok(Err(Fallthrough::NotCacheable));
        }

        let compiled = self.route_cache.compiled_route(&ctx.route_key);
        let key = self.key_generator.direct_key(&ctx.request);
        let looked_up = compiled.is_some();
        let started = Instant::now();

        let (security, lookup) = tokio::join!(
            self.run_request_phase(ctx, StageSet::only(MiddlewareStage::Security)),
            async {
                match compiled {
                    Some(route) => self.route_cache.resolve(route, key, &*self.store).await,
                    None => Ok(None),
                }
            }
        );
        let lookup_time = started.elapsed();

        if let Some(response) = security? {
            return Ok(Ok(Handled::short_circuit(response, Tier::UltraFast)));
        }

        match lookup {
            Ok(Some(hit)) => {
                self.mark_lookup(ctx, CacheLevel::L1, lookup_time);
                Ok(Ok(Handled::hit(hit.response, CacheLevel::L1, Tier::UltraFast)))
            }
            Ok(None) => {
                if looked_up {
                    self.mark_lookup(ctx, CacheLevel::Miss, lookup_time);
                }
                Ok(Err(Fallthrough::CacheMiss))
            }
            Err(e) => Ok(Err(Fallthrough::Optimization(e))),
        }
    }

    async fn try_fast(
        &self,
        ctx: &mut DispatchContext,
        handler: &Arc<dyn Handler>,
    ) -> GatewayResult<TierAttempt> {
        let layered = ctx.caches() && !ctx.layered_checked;
        let key = self.key_generator.layered_key(&ctx.request);
        let started = Instant::now();

        let (security, lookup) = tokio::join!(
            self.run_request_phase(ctx, StageSet::only(MiddlewareStage::Security)),
            async {
                if layered {
                    self.store.lookup_with_level(&key).await
                } else {
                    Ok(None)
                }
            }
        );
        let lookup_time = started.elapsed();

        if let Some(response) = security? {
            return Ok(Ok(Handled::short_circuit(response, Tier::Fast)));
        }

        if layered {
            ctx.layered_checked = true;
            match lookup {
                Ok(Some((entry, level))) => {
                    return Ok(self
                        .serve_layered_hit(ctx, entry, level, lookup_time, Tier::Fast)
                        .map_err(Fallthrough::Optimization));
                }
                Ok(None) => self.mark_lookup(ctx, CacheLevel::Miss, lookup_time),
                Err(e) => return Ok(Err(Fallthrough::Optimization(e.into()))),
            }
        }

        if let Some(response) = self.run_request_phase(ctx, stages_for(Tier::Fast)).await? {
            return Ok(Ok(Handled::short_circuit(response, Tier::Fast)));
        }

        let response = self.call_handler(ctx, handler).await?;
        Ok(Ok(Handled::miss(response, Tier::Fast)))
    }

    async fn run_standard(
        &self,
        ctx: &mut DispatchContext,
        handler: &Arc<dyn Handler>,
    ) -> GatewayResult<Handled> {
        let before_cache: StageSet = [MiddlewareStage::PreRequest, MiddlewareStage::Security]
            .into_iter()
            .collect();
        for stages in [before_cache, StageSet::only(MiddlewareStage::Cache)] {
            if let Some(response) = self.run_request_phase(ctx, stages).await? {
                return Ok(Handled::short_circuit(response, Tier::Standard));
            }
        }

        if ctx.caches() && !ctx.layered_checked {
            ctx.layered_checked = true;
            let key = self.key_generator.layered_key(&ctx.request);
            let started = Instant::now();
            match self.store.lookup_with_level(&key).await {
                Ok(Some((entry, level))) => {
                    match self.serve_layered_hit(ctx, entry, level, started.elapsed(), Tier::Standard)
                    {
                        Ok(handled) => return Ok(handled),
                        Err(e) => self.record_optimization_failure(&e),
                    }
                }
                Ok(None) => self.mark_lookup(ctx, CacheLevel::Miss, started.elapsed()),
                Err(e) => self.record_optimization_failure(&e.into()),
            }
        }

        if let Some(response) = self.run_request_phase(ctx, stages_for(Tier::Standard)).await? {
            return Ok(Handled::short_circuit(response, Tier::Standard));
        }

        let response = self.call_handler(ctx, handler).await?;
        Ok(Handled::miss(response, Tier::Standard))
    }

    /// Run the request phase of `stages` not yet run for this request
    async fn run_request_phase(
        &self,
        ctx: &mut DispatchContext,
        stages: StageSet,
    ) -> GatewayResult<Option<GatewayResponse>> {
        let pending: StageSet = stages
            .iter()
            .filter(|stage| !ctx.completed.contains(*stage))
            .collect();
        if pending.is_empty() {
            return Ok(None);
        }
        for stage in pending.iter() {
            ctx.completed.insert(stage);
        }
        self.pipeline
            .run_request_stages(&mut ctx.request, pending)
            .await
    }

    fn serve_layered_hit(
        &self,
        ctx: &DispatchContext,
        entry: StoredEntry,
        level: LevelHit,
        lookup_time: Duration,
        tier: Tier,
    ) -> Result<Handled, OptimizationError> {
        let response = CachedResponse::decode(&entry.value)
            .and_then(CachedResponse::into_response)
            .map_err(|e| OptimizationError::CorruptCachedResponse(e.to_string()))?;

        let cache_level = match level {
            LevelHit::Memory => CacheLevel::L2,
            LevelHit::Remote => CacheLevel::L3,
        };
        self.mark_lookup(ctx, cache_level, lookup_time);

        let ultra_fast_route = ctx.classification.tier == Tier::UltraFast
            || self.route_cache.assigned_tier(&ctx.route_key) == Some(Tier::UltraFast);
        if ultra_fast_route && !entry.ttl.is_zero() {
            let plan = CacheWritePlan::new(
                vec![self.key_generator.direct_key(&ctx.request)],
                CacheSetOptions {
                    ttl: entry.ttl,
                    tags: entry.tags,
                },
            )
            .guarded_by(ctx.tags_seen.clone());
            let store = self.store.clone();
            let value = entry.value;
            self.writes
                .spawn(async move { plan.write(&*store, &value).await });
        }

        Ok(Handled::hit(response, cache_level, tier))
    }

    async fn call_handler(
        &self,
        ctx: &DispatchContext,
        handler: &Arc<dyn Handler>,
    ) -> GatewayResult<GatewayResponse> {
        let handler: Arc<dyn Handler> = if ctx.caches() {
            Arc::new(CachingHandler::new(
                handler.clone(),
                self.store.clone(),
                self.write_plan(ctx),
                self.writes.clone(),
            ))
        } else {
            handler.clone()
        };

        let started = Instant::now();
        let result = handler.call(ctx.request.clone()).await;
        self.profiler.mark_handler(ctx.handle, started.elapsed());
        result
    }

    fn write_plan(&self, ctx: &DispatchContext) -> CacheWritePlan {
        let mut keys = vec![self.key_generator.layered_key(&ctx.request)];
        if ctx.classification.tier == Tier::UltraFast {
            keys.push(self.key_generator.direct_key(&ctx.request));
        }

        let ttl = ctx
            .policy
            .ttl
            .unwrap_or_else(|| self.ttl.for_tier(ctx.classification.tier));
        CacheWritePlan::new(
            keys,
            CacheSetOptions::new(ttl).with_tags(ctx.policy.tags.iter().cloned()),
        )
        .guarded_by(ctx.tags_seen.clone())
    }

    /// Response phase and cache status header
    async fn finish(&self, ctx: &DispatchContext, mut handled: Handled) -> GatewayResult<Handled> {
        if !handled.short_circuit {
            self.pipeline
                .run_response_stages(&ctx.request, &mut handled.response, stages_for(handled.tier))
                .await?;
        }

        let status = if handled.cache_level.is_hit() { "HIT" } else { "MISS" };
        handled.response.set_header(CACHE_STATUS_HEADER, status);
        Ok(handled)
    }

    async fn complete(&self, ctx: &DispatchContext, result: &GatewayResult<Handled>) {
        let status = match result {
            Ok(handled) => handled.response.status,
            Err(e) => e.status_code(),
        };

        if !is_safe_method(&ctx.request.method)
            && status.as_u16() < 400
            && !ctx.policy.invalidate_on.is_empty()
        {
            if let Err(e) = self
                .invalidation
                .invalidate(
                    &*self.store,
                    &ctx.policy.invalidate_on,
                    Some(ctx.route_key.clone()),
                )
                .await
            {
                self.record_optimization_failure(&e.into());
            }
        }

        let cache_level = match result {
            Ok(handled) => handled.cache_level,
            Err(_) => CacheLevel::Miss,
        };
        self.counters.levels[level_index(cache_level)].fetch_add(1, Ordering::Relaxed);

        let latency = self
            .profiler
            .complete_measurement(ctx.handle, status.as_u16())
            .map(|sample| Duration::from_secs_f64(sample.total_time_ms / 1_000.0))
            .unwrap_or_else(|| ctx.request.received_at.elapsed());

        self.route_cache.record_outcome(
            &ctx.route_key,
            &ctx.classification,
            RouteOutcome {
                latency,
                cache_hit: cache_level.is_hit(),
                side_effects: ctx.side_effects,
            },
        );
    }

    fn mark_lookup(&self, ctx: &DispatchContext, level: CacheLevel, duration: Duration) {
        self.profiler
            .mark_cache_operation(ctx.handle, level.is_hit(), level, duration);
        metrics::record_cache_lookup(level);
    }

    fn record_optimization_failure(&self, error: &OptimizationError) {
        self.counters
            .optimization_failures
            .fetch_add(1, Ordering::Relaxed);
        let kind = match error {
            OptimizationError::Cache(_) => "cache",
            OptimizationError::Classification(_) => "classification",
            OptimizationError::CorruptCachedResponse(_) => "corrupt_cached_response",
        };
        metrics::record_optimization_failure(kind);
        debug!(error = %error, "Optimization failed, continuing on the standard path");
    }

    /// Tier counts, failure counts, hit rates and latency percentiles
    pub async fn get_optimization_stats(&self) -> OptimizationStats {
        let profiler = self.profiler.get_stats();
        let levels: Vec<u64> = self
            .counters
            .levels
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .collect();
        let completed: u64 = levels.iter().sum();
        let share = |count: u64| {
            if completed == 0 {
                0.0
            } else {
                count as f64 / completed as f64
            }
        };

        OptimizationStats {
            tier_counts: Tier::ALL
                .iter()
                .map(|&tier| {
                    (
                        tier,
                        self.counters.tiers[tier.index()].load(Ordering::Relaxed),
                    )
                })
                .collect(),
            fallthroughs: self.counters.fallthroughs.load(Ordering::Relaxed),
            optimization_failures: self.counters.optimization_failures.load(Ordering::Relaxed)
                + self.classifier.failures(),
            cache_hit_rates: CacheHitRates {
                overall: share(levels[0] + levels[1] + levels[2]),
                l1: share(levels[0]),
                l2: share(levels[1]),
                l3: share(levels[2]),
                by_tier: profiler
                    .tiers
                    .iter()
                    .map(|(tier, stats)| (*tier, stats.hit_rate))
                    .collect(),
            },
            latency_percentiles: LatencyPercentiles {
                mean_ms: profiler.mean_ms,
                p50_ms: profiler.p50_ms,
                p95_ms: profiler.p95_ms,
                p99_ms: profiler.p99_ms,
            },
            target_achievement_rate: profiler.target_achievement_rate,
            learned_routes: self.route_cache.len(),
            routes: self.route_cache.snapshot(),
            cache: self.store.cache_stats().await,
        }
    }

    /// Wait for every spawned cache write to finish
    pub async fn flush_pending_writes(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    /// Subscribe to tag invalidation events
    pub fn subscribe_invalidations(&self) -> tokio::sync::broadcast::Receiver<InvalidationEvent> {
        self.invalidation.subscribe()
    }

    pub fn store(&self) -> &Arc<CacheManager> {
        &self.store
    }

    pub fn route_cache(&self) -> &Arc<RouteCache> {
        &self.route_cache
    }

    pub fn profiler(&self) -> &Arc<PerformanceProfiler> {
        &self.profiler
    }

    pub fn pipeline(&self) -> &Arc<MiddlewarePipeline> {
        &self.pipeline
    }
}

impl Drop for TieredDispatcher {
    fn drop(&mut self) {
        self.profiler_sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::invalidation::RouteCacheRule;
    use crate::core::error::GatewayError;
    use crate::middleware::pipeline::{Middleware, MiddlewareResult};
    use async_trait::async_trait;
    use axum::http::{Method, StatusCode};
    use std::sync::atomic::AtomicUsize;

    async fn dispatcher(config: TieringConfig) -> TieredDispatcher {
        TieredDispatcher::from_config(&config).await.unwrap()
    }

    fn counting_handler(calls: &Arc<AtomicUsize>, body: &'static str) -> Arc<dyn Handler> {
        let calls = calls.clone();
        Arc::new(move |_request: RequestDescriptor| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                GatewayResult::Ok(GatewayResponse::text(StatusCode::OK, body))
            }
        })
    }

    async fn get(
        dispatcher: &TieredDispatcher,
        path: &str,
        handler: &Arc<dyn Handler>,
    ) -> GatewayResponse {
        let response = dispatcher
            .dispatch(RequestDescriptor::new(Method::GET, path), handler.clone())
            .await
            .unwrap();
        dispatcher.flush_pending_writes().await;
        response
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_cache() {
        let dispatcher = dispatcher(TieringConfig::default()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(&calls, "ok");

        let first = get(&dispatcher, "/health", &handler).await;
        assert_eq!(first.header("x-cache"), Some("MISS"));

        let second = get(&dispatcher, "/health", &handler).await;
        assert_eq!(second.header("x-cache"), Some("HIT"));
        assert_eq!(second.body, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ultra_fast_route_reaches_the_direct_key() {
        // A frozen clock makes every handler run take 0ms, well under the target
        tokio::time::pause();
        let dispatcher = dispatcher(TieringConfig::default()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(&calls, "ok");

        for _ in 0..8 {
            get(&dispatcher, "/health", &handler).await;
        }
        assert_eq!(
            dispatcher.route_cache().assigned_tier("GET:/health"),
            Some(Tier::UltraFast)
        );
        assert!(dispatcher.store().exists("ultra:GET:/health").await.unwrap());

        let response = get(&dispatcher, "/health", &handler).await;
        assert_eq!(response.header("x-cache"), Some("HIT"));
        assert_eq!(response.body, "ok");

        let sample = dispatcher.profiler().recent_samples(1).remove(0);
        assert_eq!(sample.tier, Tier::UltraFast);
        assert_eq!(sample.cache_level, CacheLevel::L1);

        let stats = dispatcher.get_optimization_stats().await;
        assert!(stats.cache_hit_rates.l1 > 0.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ultra_fast_miss_falls_through_and_completes() {
        tokio::time::pause();
        let dispatcher = dispatcher(TieringConfig::default()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(&calls, "ok");
        for _ in 0..8 {
            get(&dispatcher, "/health", &handler).await;
        }
        let fallthroughs = dispatcher.get_optimization_stats().await.fallthroughs;

        dispatcher.store().delete("ultra:GET:/health").await.unwrap();
        dispatcher.store().delete("tier:GET:/health").await.unwrap();

        let request = RequestDescriptor::new(Method::GET, "/health");
        assert_eq!(dispatcher.classify(&request).tier, Tier::UltraFast);
        let response = get(&dispatcher, "/health", &handler).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header("x-cache"), Some("MISS"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let sample = dispatcher.profiler().recent_samples(1).remove(0);
        assert_eq!(sample.cache_level, CacheLevel::Miss);
        let stats = dispatcher.get_optimization_stats().await;
        assert_eq!(stats.fallthroughs, fallthroughs + 1);
        assert_eq!(stats.optimization_failures, 0);

        // The fast path wrote the response back under the direct key
        get(&dispatcher, "/health", &handler).await;
        let sample = dispatcher.profiler().recent_samples(1).remove(0);
        assert_eq!(sample.cache_level, CacheLevel::L1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_errors_pass_through_unchanged() {
        let dispatcher = dispatcher(TieringConfig::default()).await;
        let handler: Arc<dyn Handler> = Arc::new(|_request: RequestDescriptor| async {
            Err::<GatewayResponse, _>(GatewayError::handler(StatusCode::NOT_FOUND, "no such user"))
        });

        let err = dispatcher
            .dispatch(RequestDescriptor::new(Method::GET, "/users/9"), handler)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::handler(StatusCode::NOT_FOUND, "no such user"));
        dispatcher.flush_pending_writes().await;
        assert!(!dispatcher.store().exists("tier:GET:/users/9").await.unwrap());
    }

    #[tokio::test]
    async fn test_mutation_invalidates_configured_tags() {
        let mut config = TieringConfig::default();
        config.routes = vec![RouteCacheRule::new("/users")
            .method("POST")
            .invalidate_on(["users"])];
        let dispatcher = dispatcher(config).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(&calls, "[]");

        get(&dispatcher, "/users", &handler).await;
        assert!(dispatcher.store().exists("tier:GET:/users").await.unwrap());

        let created = dispatcher
            .dispatch(RequestDescriptor::new(Method::POST, "/users").with_body("{}"), handler.clone())
            .await
            .unwrap();
        assert_eq!(created.header("x-cache"), Some("MISS"));
        assert!(!dispatcher.store().exists("tier:GET:/users").await.unwrap());

        let after = get(&dispatcher, "/users", &handler).await;
        assert_eq!(after.header("x-cache"), Some("MISS"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_downgrades_and_counts() {
        let dispatcher = dispatcher(TieringConfig::default()).await;
        dispatcher
            .store()
            .set(
                "tier:GET:/report",
                b"not a response",
                &CacheSetOptions::new(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let response = get(&dispatcher, "/report", &counting_handler(&calls, "fresh")).await;

        assert_eq!(response.body, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.get_optimization_stats().await.optimization_failures, 1);
    }

    #[derive(Debug)]
    struct ApiKey;

    #[async_trait]
    impl Middleware for ApiKey {
        fn name(&self) -> &str {
            "api_key"
        }

        fn stage(&self) -> MiddlewareStage {
            MiddlewareStage::Security
        }

        async fn process_request(
            &self,
            request: &mut RequestDescriptor,
        ) -> GatewayResult<MiddlewareResult> {
            match request.header("x-api-key") {
                Some(_) => Ok(MiddlewareResult::Continue),
                None => Err(GatewayError::authz("missing api key")),
            }
        }
    }

    #[tokio::test]
    async fn test_security_runs_even_for_cached_responses() {
        let store = Arc::new(CacheManager::new(Default::default()).await.unwrap());
        let pipeline = Arc::new(MiddlewarePipeline::with_middleware(vec![Arc::new(ApiKey)]));
        let dispatcher = TieredDispatcher::new(&TieringConfig::default(), store, pipeline).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(&calls, "secret");

        let authorized =
            || RequestDescriptor::new(Method::GET, "/reports").with_header("x-api-key", "k");
        for _ in 0..5 {
            dispatcher.dispatch(authorized(), handler.clone()).await.unwrap();
            dispatcher.flush_pending_writes().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = dispatcher
            .dispatch(RequestDescriptor::new(Method::GET, "/reports"), handler.clone())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::authz("missing api key"));
    }

    #[tokio::test]
    async fn test_stats_report_tiers_and_hits() {
        let dispatcher = dispatcher(TieringConfig::default()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(&calls, "ok");

        for _ in 0..4 {
            get(&dispatcher, "/health", &handler).await;
        }

        let stats = dispatcher.get_optimization_stats().await;
        assert_eq!(stats.tier_counts.values().sum::<u64>(), 4);
        assert!(stats.tier_counts[&Tier::Standard] >= 1);
        assert!((stats.cache_hit_rates.overall - 0.75).abs() < 1e-9);
        assert_eq!(stats.learned_routes, 1);
        assert_eq!(stats.optimization_failures, 0);

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("tierCounts").is_some());
        assert!(json.get("latencyPercentiles").is_some());
    }
}
