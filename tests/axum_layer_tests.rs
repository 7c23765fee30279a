//! The tiering layer in front of an axum router

use axum::body::Body;
use axum::extract::Path;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

use tiered_gateway::caching::invalidation::RouteCacheRule;
use tiered_gateway::caching::CacheStore;
use tiered_gateway::gateway::integration::{with_tiering, RouterHandler};
use tiered_gateway::tiering::TieredDispatcher;
use tiered_gateway::{Handler, RequestDescriptor, TieringConfig};

struct TestApp {
    router: Router,
    dispatcher: Arc<TieredDispatcher>,
    calls: Arc<AtomicUsize>,
}

impl TestApp {
    async fn new(config: TieringConfig) -> Self {
        let dispatcher = Arc::new(TieredDispatcher::from_config(&config).await.unwrap());
        let calls = Arc::new(AtomicUsize::new(0));

        let health_calls = calls.clone();
        let user_calls = calls.clone();
        let create_calls = calls.clone();
        let app = Router::new()
            .route(
                "/health",
                get(move || {
                    health_calls.fetch_add(1, Ordering::SeqCst);
                    async { "ok" }
                }),
            )
            .route(
                "/users",
                get(|| async { "[\"ada\"]" }).post(move |body: String| {
                    create_calls.fetch_add(1, Ordering::SeqCst);
                    async move { (StatusCode::CREATED, body) }
                }),
            )
            .route(
                "/users/:id",
                get(move |Path(id): Path<u32>| {
                    user_calls.fetch_add(1, Ordering::SeqCst);
                    async move { format!("user {}", id) }
                }),
            );

        Self {
            router: with_tiering(app, dispatcher.clone(), &config.server),
            dispatcher,
            calls,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        let response = self.router.clone().oneshot(request).await.unwrap();
        self.dispatcher.flush_pending_writes().await;
        response
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn cache_status(response: &Response) -> &str {
    response
        .headers()
        .get("x-cache")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

#[tokio::test]
async fn repeated_get_is_served_without_the_route() {
    let app = TestApp::new(TieringConfig::default()).await;

    let first = app.get("/health").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(cache_status(&first), "MISS");
    assert_eq!(body_string(first).await, "ok");

    let second = app.get("/health").await;
    assert_eq!(cache_status(&second), "HIT");
    assert_eq!(
        second.headers().get("content-type").unwrap(),
        "text/plain; charset=utf-8"
    );
    assert_eq!(body_string(second).await, "ok");

    assert_eq!(app.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn matched_path_parameters_group_routes() {
    let app = TestApp::new(TieringConfig::default()).await;

    let response = app.get("/users/7").await;
    assert_eq!(body_string(response).await, "user 7");
    app.get("/users/8").await;

    let routes = app.dispatcher.route_cache().snapshot();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].route_key, "GET:/users/:id");
    assert_eq!(routes[0].sample_count, 2);
}

#[tokio::test]
async fn post_body_reaches_the_route_and_invalidates() {
    let mut config = TieringConfig::default();
    config.routes = vec![RouteCacheRule::new("/users")
        .method("POST")
        .invalidate_on(["users"])];
    let app = TestApp::new(config).await;

    app.get("/users/1").await;
    assert_eq!(cache_status(&app.get("/users/1").await), "HIT");

    let created = app
        .send(
            Request::post("/users")
                .body(Body::from("grace"))
                .unwrap(),
        )
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    assert_eq!(cache_status(&created), "MISS");
    assert_eq!(body_string(created).await, "grace");

    assert_eq!(cache_status(&app.get("/users/1").await), "MISS");
}

#[tokio::test]
async fn unknown_routes_are_not_cached() {
    let app = TestApp::new(TieringConfig::default()).await;

    let response = app.get("/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!app
        .dispatcher
        .store()
        .exists("tier:GET:/nope")
        .await
        .unwrap());
}

#[tokio::test]
async fn stats_endpoint_reports_tier_counts() {
    let app = TestApp::new(TieringConfig::default()).await;
    app.get("/health").await;
    app.get("/health").await;

    let response = app.get("/_tiering/stats").await;
    assert_eq!(response.status(), StatusCode::OK);
    let stats: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();

    let total: u64 = stats["tierCounts"]
        .as_object()
        .unwrap()
        .values()
        .map(|count| count.as_u64().unwrap())
        .sum();
    assert_eq!(total, 2);
    assert_eq!(stats["learnedRoutes"], 1);
    assert!(stats["cacheHitRates"]["overall"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn warm_up_handler_fills_the_cache() {
    let app = TestApp::new(TieringConfig::default()).await;
    let warm = RouterHandler::new(app.router.clone());

    let response = warm
        .call(RequestDescriptor::new(axum::http::Method::GET, "/health"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    app.dispatcher.flush_pending_writes().await;

    assert_eq!(cache_status(&app.get("/health").await), "HIT");
    assert_eq!(app.calls.load(Ordering::SeqCst), 1);
}
