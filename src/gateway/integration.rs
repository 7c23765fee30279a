//! # Axum Integration
//!
//! Puts the tiered dispatcher in front of an axum router. The layer buffers the
//! request body, converts the request into a [`RequestDescriptor`], and hands the
//! rest of the axum stack to the dispatcher as the downstream [`Handler`]. Requests
//! answered from cache never reach the inner routes.
//!
//! ```rust,no_run
//! use axum::{routing::get, Router};
//! use std::sync::Arc;
//! use tiered_gateway::core::config::TieringConfig;
//! use tiered_gateway::gateway::integration::with_tiering;
//! use tiered_gateway::tiering::TieredDispatcher;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TieringConfig::default();
//! let dispatcher = Arc::new(TieredDispatcher::from_config(&config).await?);
//! let app = Router::new().route("/health", get(|| async { "ok" }));
//! let app = with_tiering(app, dispatcher, &config.server);
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{MatchedPath, Request, State};
use axum::http::request::Parts;
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use std::sync::Arc;
use tower::ServiceExt;
use tracing::warn;

use crate::core::config::ServerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::handler::Handler;
use crate::core::types::{GatewayResponse, RequestDescriptor};
use crate::tiering::dispatcher::{OptimizationStats, TieredDispatcher};

/// State for [`tiering_middleware`]
#[derive(Clone)]
pub struct TieringLayerState {
    pub dispatcher: Arc<TieredDispatcher>,
    pub max_body_size: usize,
}

impl TieringLayerState {
    pub fn new(dispatcher: Arc<TieredDispatcher>, max_body_size: usize) -> Self {
        Self {
            dispatcher,
            max_body_size,
        }
    }
}

/// Axum middleware routing every request through the tiered dispatcher
///
/// Use with [`axum::middleware::from_fn_with_state`].
pub async fn tiering_middleware(
    State(state): State<TieringLayerState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return GatewayError::validation("body", "unreadable or too large").into_response();
        }
    };

    let mut descriptor = RequestDescriptor::from_uri(parts.method.clone(), &parts.uri);
    descriptor.headers = parts.headers.clone();
    descriptor.body = body;
    if let Some(matched) = parts.extensions.get::<MatchedPath>() {
        descriptor
            .params
            .extend(path_params(matched.as_str(), &descriptor.path));
    }

    let downstream: Arc<dyn Handler> = Arc::new(Downstream {
        remainder: Mutex::new(Some((next, parts))),
    });

    match state.dispatcher.dispatch(descriptor, downstream).await {
        Ok(response) => response.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Named segments of a matched route template, e.g. `id` for `/users/:id`
fn path_params(template: &str, path: &str) -> Vec<(String, String)> {
    template
        .split('/')
        .zip(path.split('/'))
        .filter_map(|(pattern, segment)| {
            pattern
                .strip_prefix(':')
                .map(|name| (name.to_string(), segment.to_string()))
        })
        .collect()
}

/// The rest of the axum stack, runnable once
struct Downstream {
    remainder: Mutex<Option<(Next, Parts)>>,
}

#[async_trait]
impl Handler for Downstream {
    async fn call(&self, request: RequestDescriptor) -> GatewayResult<GatewayResponse> {
        let Some((next, mut parts)) = self.remainder.lock().take() else {
            return Err(GatewayError::internal("downstream service already invoked"));
        };

        // Middleware may have rewritten headers
        parts.headers = request.headers;
        let response = next
            .run(Request::from_parts(parts, Body::from(request.body)))
            .await;

        buffer_response(response).await
    }
}

/// Handler that sends descriptors through an axum router
///
/// Used for cache warm-up, so warm-up requests take the same path as client traffic.
#[derive(Clone)]
pub struct RouterHandler {
    router: Router,
}

impl RouterHandler {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Handler for RouterHandler {
    async fn call(&self, request: RequestDescriptor) -> GatewayResult<GatewayResponse> {
        let uri = match request.canonical_query() {
            Some(query) => format!("{}?{}", request.path, query),
            None => request.path.clone(),
        };

        let mut http_request = axum::http::Request::builder()
            .method(request.method)
            .uri(&uri)
            .body(Body::from(request.body))
            .map_err(|e| GatewayError::validation("uri", format!("{}: {}", uri, e)))?;
        *http_request.headers_mut() = request.headers;

        let response = self.router.clone().oneshot(http_request).await?;
        buffer_response(response).await
    }
}

async fn buffer_response(response: Response) -> GatewayResult<GatewayResponse> {
    let (parts, body) = response.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| GatewayError::internal(format!("Failed to read response body: {}", e)))?;
    Ok(GatewayResponse::new(parts.status, parts.headers, body))
}

/// Optimization statistics as JSON
pub async fn optimization_stats(
    State(dispatcher): State<Arc<TieredDispatcher>>,
) -> Json<OptimizationStats> {
    Json(dispatcher.get_optimization_stats().await)
}

/// Router serving [`optimization_stats`] at `path`
pub fn stats_router(dispatcher: Arc<TieredDispatcher>, path: &str) -> Router {
    Router::new()
        .route(path, get(optimization_stats))
        .with_state(dispatcher)
}

/// Wrap every route of `app` in the tiering layer and add the statistics endpoint
pub fn with_tiering(app: Router, dispatcher: Arc<TieredDispatcher>, config: &ServerConfig) -> Router {
    let state = TieringLayerState::new(dispatcher.clone(), config.max_body_size);
    app.layer(from_fn_with_state(state, tiering_middleware))
        .merge(stats_router(dispatcher, &config.stats_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_params_follow_the_template() {
        assert_eq!(
            path_params("/users/:id/posts/:post", "/users/7/posts/12"),
            vec![
                ("id".to_string(), "7".to_string()),
                ("post".to_string(), "12".to_string())
            ]
        );
        assert!(path_params("/health", "/health").is_empty());
    }
}
