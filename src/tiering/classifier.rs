//! # Request Classifier
//!
//! Assigns every request an execution tier, a cache strategy and the middleware
//! stages it may skip, based on what the route cache has learned about its route.
//!
//! Classification is a pure read of learned state: calling [`RequestClassifier::classify`]
//! twice on the same descriptor without recording an outcome in between yields the
//! same result. A wrong classification only costs latency, since the dispatcher falls
//! through to a slower tier whenever an optimized path cannot answer.

use axum::http::Method;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::route_cache::{RouteCache, RouteView};
use super::types::{CacheStrategy, RequestClassification, Tier};
use crate::caching::invalidation::{InvalidationManager, RouteCachePolicy};
use crate::caching::key_generator::CacheKeyGenerator;
use crate::core::error::OptimizationError;
use crate::core::types::RequestDescriptor;
use crate::observability::metrics;

/// Confidence for routes without learned statistics
pub const COLD_CONFIDENCE: f64 = 0.5;

/// Confidence multiplier applied when the variance rule fired
const HIGH_VARIANCE_PENALTY: f64 = 0.8;

/// Request classifier backed by the learned route table
pub struct RequestClassifier {
    route_cache: Arc<RouteCache>,
    invalidation: Arc<InvalidationManager>,
    failures: AtomicU64,
}

impl RequestClassifier {
    pub fn new(route_cache: Arc<RouteCache>, invalidation: Arc<InvalidationManager>) -> Self {
        Self {
            route_cache,
            invalidation,
            failures: AtomicU64::new(0),
        }
    }

    /// Classify a request
    ///
    /// Never fails: a descriptor that cannot be classified gets the standard tier
    /// with caching disabled, and the failure is counted.
    pub fn classify(&self, request: &RequestDescriptor) -> RequestClassification {
        self.classify_with_policy(request).0
    }

    /// Classify a request and return the route cache policy it was classified under
    pub fn classify_with_policy(
        &self,
        request: &RequestDescriptor,
    ) -> (RequestClassification, RouteCachePolicy) {
        match self.try_classify(request) {
            Ok(result) => result,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_optimization_failure("classification");
                debug!(request_id = %request.id, error = %e, "Falling back to the standard tier");
                (
                    RequestClassification::standard(CacheStrategy::None, 0.0),
                    RouteCachePolicy {
                        cacheable: false,
                        tags: Default::default(),
                        invalidate_on: Vec::new(),
                        ttl: None,
                    },
                )
            }
        }
    }

    /// Classification without the standard-tier fallback
    pub fn try_classify(
        &self,
        request: &RequestDescriptor,
    ) -> Result<(RequestClassification, RouteCachePolicy), OptimizationError> {
        validate(request)?;

        let policy = self.invalidation.policy_for(request);
        let cacheable = is_cacheable_method(&request.method)
            && policy.cacheable
            && !request.forbids_caching();

        if !is_safe_method(&request.method) {
            let classification = RequestClassification::standard(CacheStrategy::None, 1.0);
            metrics::record_classification(classification.tier);
            return Ok((classification, policy));
        }

        let route_key = CacheKeyGenerator::route_key(request);
        let threshold = self.route_cache.config().optimization_threshold;
        let learned = self
            .route_cache
            .lookup(&route_key)
            .filter(|view| view.sample_count >= threshold)
            .and_then(|view| view.assigned_tier.map(|tier| (tier, view)));

        let classification = match learned {
            Some((tier, view)) => self.learned(request, tier, &view, cacheable),
            None => RequestClassification::standard(
                if cacheable {
                    CacheStrategy::Layered
                } else {
                    CacheStrategy::None
                },
                COLD_CONFIDENCE,
            ),
        };

        metrics::record_classification(classification.tier);
        Ok((classification, policy))
    }

    fn learned(
        &self,
        request: &RequestDescriptor,
        learned: Tier,
        view: &RouteView,
        cacheable: bool,
    ) -> RequestClassification {
        let mut tier = learned;
        if tier == Tier::UltraFast
            && (request.method != Method::GET || request.has_body() || !cacheable)
        {
            tier = Tier::Fast;
        }

        let cache_strategy = match (tier, cacheable) {
            (_, false) => CacheStrategy::None,
            (Tier::UltraFast, true) => CacheStrategy::Direct,
            (Tier::Fast | Tier::Standard, true) => CacheStrategy::Layered,
        };

        RequestClassification {
            tier,
            confidence: self.confidence(view),
            cache_strategy,
            skip_middleware: RequestClassification::skip_set_for(tier),
        }
    }

    fn confidence(&self, view: &RouteView) -> f64 {
        let window = self.route_cache.config().stats_window.max(1) as f64;
        let filled = (view.sample_count as f64).min(window) / window;
        let mut confidence = COLD_CONFIDENCE + 0.5 * filled;
        if view.high_variance {
            confidence *= HIGH_VARIANCE_PENALTY;
        }
        confidence.clamp(0.0, 1.0)
    }

    /// Descriptors that could not be classified so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn route_cache(&self) -> &Arc<RouteCache> {
        &self.route_cache
    }
}

fn validate(request: &RequestDescriptor) -> Result<(), OptimizationError> {
    if !request.path.starts_with('/') {
        return Err(OptimizationError::Classification(format!(
            "path must start with '/': {:?}",
            request.path
        )));
    }
    if request.path.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(OptimizationError::Classification(format!(
            "path contains whitespace or control characters: {:?}",
            request.path
        )));
    }
    Ok(())
}

/// Methods that never change server state
pub fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Methods whose responses may be cached
pub fn is_cacheable_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::invalidation::RouteCacheRule;
    use crate::core::config::OptimizationConfig;
    use crate::middleware::stage::MiddlewareStage;
    use crate::tiering::route_cache::RouteOutcome;
    use std::time::Duration;

    fn classifier(rules: &[RouteCacheRule]) -> RequestClassifier {
        RequestClassifier::new(
            Arc::new(RouteCache::new(OptimizationConfig::default())),
            Arc::new(InvalidationManager::new(rules).unwrap()),
        )
    }

    fn learn(classifier: &RequestClassifier, route_key: &str, latency_us: u64, times: usize) {
        let classification = RequestClassification::standard(CacheStrategy::Layered, 0.5);
        for _ in 0..times {
            classifier.route_cache().record_outcome(
                route_key,
                &classification,
                RouteOutcome {
                    latency: Duration::from_micros(latency_us),
                    cache_hit: false,
                    side_effects: false,
                },
            );
        }
    }

    #[test]
    fn test_cold_route_is_standard_layered() {
        let classifier = classifier(&[]);
        let classification = classifier.classify(&RequestDescriptor::new(Method::GET, "/health"));

        assert_eq!(classification.tier, Tier::Standard);
        assert_eq!(classification.cache_strategy, CacheStrategy::Layered);
        assert_eq!(classification.confidence, COLD_CONFIDENCE);
        assert!(classification.skip_middleware.is_empty());
    }

    #[test]
    fn test_learned_fast_get_is_ultra_fast() {
        let classifier = classifier(&[]);
        learn(&classifier, "GET:/health", 100, 1);

        let classification = classifier.classify(&RequestDescriptor::new(Method::GET, "/health"));
        assert_eq!(classification.tier, Tier::UltraFast);
        assert_eq!(classification.cache_strategy, CacheStrategy::Direct);
        assert!(classification
            .skip_middleware
            .contains(MiddlewareStage::PreRequest));
        assert!(!classification
            .skip_middleware
            .contains(MiddlewareStage::Security));
        assert!((classification.confidence - 0.525).abs() < 1e-9);
    }

    #[test]
    fn test_route_template_groups_ids() {
        let classifier = classifier(&[]);
        learn(&classifier, "GET:/users/:id", 2_000, 1);

        let classification =
            classifier.classify(&RequestDescriptor::new(Method::GET, "/users/42"));
        assert_eq!(classification.tier, Tier::Fast);
        assert_eq!(classification.cache_strategy, CacheStrategy::Layered);
    }

    #[test]
    fn test_mutations_are_never_ultra_fast() {
        let classifier = classifier(&[]);
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            learn(&classifier, &format!("{}:/users", method), 100, 5);
            let classification = classifier.classify(&RequestDescriptor::new(method, "/users"));
            assert_eq!(classification.tier, Tier::Standard);
            assert_eq!(classification.cache_strategy, CacheStrategy::None);
        }

        let extension = Method::from_bytes(b"PURGE").unwrap();
        let classification = classifier.classify(&RequestDescriptor::new(extension, "/users"));
        assert_eq!(classification.tier, Tier::Standard);
    }

    #[test]
    fn test_head_is_capped_at_fast() {
        let classifier = classifier(&[]);
        learn(&classifier, "HEAD:/health", 100, 3);

        let classification = classifier.classify(&RequestDescriptor::new(Method::HEAD, "/health"));
        assert_eq!(classification.tier, Tier::Fast);
        assert_eq!(classification.cache_strategy, CacheStrategy::Layered);
    }

    #[test]
    fn test_no_cache_request_is_never_ultra_fast() {
        let classifier = classifier(&[]);
        learn(&classifier, "GET:/health", 100, 3);

        let request =
            RequestDescriptor::new(Method::GET, "/health").with_header("cache-control", "no-cache");
        let classification = classifier.classify(&request);
        assert_eq!(classification.tier, Tier::Fast);
        assert_eq!(classification.cache_strategy, CacheStrategy::None);
    }

    #[test]
    fn test_request_body_blocks_ultra_fast() {
        let classifier = classifier(&[]);
        learn(&classifier, "GET:/search", 100, 3);

        let request = RequestDescriptor::new(Method::GET, "/search").with_body("{}");
        assert_eq!(classifier.classify(&request).tier, Tier::Fast);
    }

    #[test]
    fn test_non_cacheable_rule_disables_caching() {
        let classifier = classifier(&[RouteCacheRule::new("/session").not_cacheable()]);
        let classification = classifier.classify(&RequestDescriptor::new(Method::GET, "/session"));
        assert_eq!(classification.cache_strategy, CacheStrategy::None);
    }

    #[test]
    fn test_high_variance_lowers_confidence() {
        let classifier = classifier(&[]);
        learn(&classifier, "GET:/spiky", 100, 17);
        learn(&classifier, "GET:/spiky", 900, 3);

        let classification = classifier.classify(&RequestDescriptor::new(Method::GET, "/spiky"));
        assert_eq!(classification.tier, Tier::Fast);
        assert!((classification.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let classifier = classifier(&[]);
        learn(&classifier, "GET:/users", 3_000, 4);

        let request = RequestDescriptor::new(Method::GET, "/users").with_query("page", "1");
        let first = classifier.classify(&request);
        let second = classifier.classify(&request);
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_descriptor_falls_back_and_counts() {
        let classifier = classifier(&[]);
        let classification = classifier.classify(&RequestDescriptor::new(Method::GET, "health"));

        assert_eq!(classification.tier, Tier::Standard);
        assert_eq!(classification.cache_strategy, CacheStrategy::None);
        assert_eq!(classifier.failures(), 1);
        assert!(classifier
            .try_classify(&RequestDescriptor::new(Method::GET, "/a b"))
            .is_err());
    }
}
