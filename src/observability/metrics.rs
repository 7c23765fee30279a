//! # Metrics
//!
//! Metric names and recording helpers for the tiering layer. Recording goes through the
//! `metrics` facade, so it is a no-op until a recorder is installed; the server binary
//! installs the Prometheus exporter with [`install_prometheus_recorder`].

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};
use crate::middleware::stage::MiddlewareStage;
use crate::tiering::types::{CacheLevel, Tier};

pub const REQUESTS_TOTAL: &str = "tiering_requests_total";
pub const REQUEST_DURATION: &str = "tiering_request_duration_seconds";
pub const CLASSIFICATIONS_TOTAL: &str = "tiering_classifications_total";
pub const FALLTHROUGHS_TOTAL: &str = "tiering_fallthroughs_total";
pub const OPTIMIZATION_FAILURES_TOTAL: &str = "tiering_optimization_failures_total";
pub const CACHE_LOOKUPS_TOTAL: &str = "tiering_cache_lookups_total";
pub const CACHE_INVALIDATIONS_TOTAL: &str = "tiering_cache_invalidations_total";
pub const LEARNED_ROUTES: &str = "tiering_learned_routes";
pub const BACKEND_DEGRADED: &str = "tiering_cache_backend_degraded";
pub const MIDDLEWARE_DURATION: &str = "tiering_middleware_duration_seconds";

/// Latency buckets in seconds, biased toward the sub-millisecond tiers
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Install the Prometheus recorder and return a handle for rendering scrapes
pub fn install_prometheus_recorder() -> GatewayResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION.to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| GatewayError::internal(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("Failed to install metrics recorder: {}", e)))
}

pub fn record_classification(tier: Tier) {
    counter!(CLASSIFICATIONS_TOTAL, "tier" => tier.as_str()).increment(1);
}

pub fn record_request(tier: Tier, cache_level: CacheLevel, duration: Duration) {
    counter!(REQUESTS_TOTAL, "tier" => tier.as_str(), "cache" => cache_level.as_str())
        .increment(1);
    histogram!(REQUEST_DURATION, "tier" => tier.as_str()).record(duration.as_secs_f64());
}

pub fn record_fallthrough(from: Tier, to: Tier) {
    counter!(FALLTHROUGHS_TOTAL, "from" => from.as_str(), "to" => to.as_str()).increment(1);
}

pub fn record_optimization_failure(kind: &'static str) {
    counter!(OPTIMIZATION_FAILURES_TOTAL, "kind" => kind).increment(1);
}

pub fn record_cache_lookup(level: CacheLevel) {
    counter!(CACHE_LOOKUPS_TOTAL, "level" => level.as_str()).increment(1);
}

pub fn record_invalidation(keys: usize) {
    counter!(CACHE_INVALIDATIONS_TOTAL).increment(keys as u64);
}

pub fn set_learned_routes(count: usize) {
    gauge!(LEARNED_ROUTES).set(count as f64);
}

pub fn set_backend_degraded(backend: &'static str, degraded: bool) {
    gauge!(BACKEND_DEGRADED, "backend" => backend).set(if degraded { 1.0 } else { 0.0 });
}

pub fn record_middleware(stage: MiddlewareStage, phase: &'static str, duration: Duration) {
    histogram!(MIDDLEWARE_DURATION, "stage" => stage.as_str(), "phase" => phase)
        .record(duration.as_secs_f64());
}
