//! # Tiering Benchmarks
//!
//! Hot paths of the tiering layer: classification, key generation, cache lookups
//! and cached dispatch.

use axum::http::{Method, StatusCode};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use tiered_gateway::caching::cache_manager::{CacheConfig, CacheManager};
use tiered_gateway::caching::key_generator::CacheKeyGenerator;
use tiered_gateway::caching::stores::{CacheSetOptions, CacheStore};
use tiered_gateway::tiering::TieredDispatcher;
use tiered_gateway::{GatewayResponse, GatewayResult, Handler, RequestDescriptor, TieringConfig};

fn backend() -> Arc<dyn Handler> {
    Arc::new(|_request: RequestDescriptor| async {
        GatewayResult::Ok(GatewayResponse::text(StatusCode::OK, "ok"))
    })
}

/// Classification of cold and learned routes
fn benchmark_classification(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dispatcher = rt
        .block_on(TieredDispatcher::from_config(&TieringConfig::default()))
        .unwrap();
    let handler = backend();
    rt.block_on(async {
        for _ in 0..5 {
            dispatcher
                .dispatch(RequestDescriptor::new(Method::GET, "/health"), handler.clone())
                .await
                .unwrap();
        }
        dispatcher.flush_pending_writes().await;
    });

    let mut group = c.benchmark_group("classification");
    for path in ["/health", "/cold/route"] {
        let request = RequestDescriptor::new(Method::GET, path);
        group.bench_with_input(BenchmarkId::new("classify", path), &request, |b, request| {
            b.iter(|| black_box(dispatcher.classify(request)))
        });
    }
    group.finish();
}

/// Cache key derivation with and without a query string
fn benchmark_key_generation(c: &mut Criterion) {
    let generator = CacheKeyGenerator::default();
    let plain = RequestDescriptor::new(Method::GET, "/users/42");
    let with_query = RequestDescriptor::new(Method::GET, "/users")
        .with_query("page", "2")
        .with_query("limit", "50")
        .with_query("sort", "name");

    let mut group = c.benchmark_group("key_generation");
    group.bench_function("direct_key", |b| {
        b.iter(|| black_box(generator.direct_key(&plain)))
    });
    group.bench_function("layered_key_with_query", |b| {
        b.iter(|| black_box(generator.layered_key(&with_query)))
    });
    group.bench_function("route_key_template", |b| {
        b.iter(|| black_box(CacheKeyGenerator::route_key(&plain)))
    });
    group.finish();
}

/// Memory-level lookups through the cache manager
fn benchmark_cache_lookup(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cache = rt
        .block_on(CacheManager::new(CacheConfig::default()))
        .unwrap();
    rt.block_on(
        cache.set(
            "tier:GET:/health",
            b"cached response",
            &CacheSetOptions::new(Duration::from_secs(300)).with_tags(["health"]),
        ),
    )
    .unwrap();

    let mut group = c.benchmark_group("cache_lookup");
    group.bench_function("hit", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(cache.lookup_with_level("tier:GET:/health").await) })
    });
    group.bench_function("miss", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(cache.lookup_with_level("tier:GET:/absent").await) })
    });
    group.finish();
}

/// Full dispatch of a request answered from cache
fn benchmark_cached_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dispatcher = rt
        .block_on(TieredDispatcher::from_config(&TieringConfig::default()))
        .unwrap();
    let handler = backend();

    c.bench_function("dispatch_cached_get", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                dispatcher
                    .dispatch(RequestDescriptor::new(Method::GET, "/health"), handler.clone())
                    .await,
            )
        })
    });
}

criterion_group!(
    benches,
    benchmark_classification,
    benchmark_key_generation,
    benchmark_cache_lookup,
    benchmark_cached_dispatch
);
criterion_main!(benches);
