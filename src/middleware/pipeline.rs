//! # Middleware Pipeline
//!
//! Stage-bound middleware chain driven by the tiered dispatcher.
//!
//! Every [`Middleware`] declares the [`MiddlewareStage`] it belongs to. The pipeline
//! keeps its middleware sorted by stage and then by priority, so running "the
//! security stage only" or "everything except the optional stages" is a filter over
//! one ordered list. Request processing runs in stage order and may short-circuit
//! with a response; response processing runs in reverse.
//!
//! Errors returned by middleware belong to the caller and are propagated unchanged.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::stage::{MiddlewareStage, StageSet};
use crate::core::error::GatewayResult;
use crate::core::types::{GatewayResponse, RequestDescriptor};
use crate::observability::metrics;

/// Core middleware trait
#[async_trait]
pub trait Middleware: Send + Sync + fmt::Debug {
    /// Get the middleware name for identification and logging
    fn name(&self) -> &str;

    /// Stage this middleware runs in
    fn stage(&self) -> MiddlewareStage;

    /// Get the middleware priority within its stage (lower numbers execute first)
    fn priority(&self) -> i32 {
        100
    }

    /// Process the request before the handler runs
    ///
    /// Return [`MiddlewareResult::ShortCircuit`] to answer the request without
    /// running later middleware or the handler.
    async fn process_request(
        &self,
        _request: &mut RequestDescriptor,
    ) -> GatewayResult<MiddlewareResult> {
        Ok(MiddlewareResult::Continue)
    }

    /// Process the response before it's returned to the client
    async fn process_response(
        &self,
        _request: &RequestDescriptor,
        _response: &mut GatewayResponse,
    ) -> GatewayResult<()> {
        Ok(())
    }
}

/// Outcome of request-phase processing
#[derive(Debug)]
pub enum MiddlewareResult {
    /// Continue with the next middleware
    Continue,
    /// Answer the request with this response
    ShortCircuit(GatewayResponse),
}

/// Ordered middleware chain
#[derive(Default)]
pub struct MiddlewarePipeline {
    /// Middleware sorted by `(stage, priority)`
    middleware: Arc<RwLock<Vec<Arc<dyn Middleware>>>>,
}

impl MiddlewarePipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pipeline from a list of middleware
    pub fn with_middleware(middleware: Vec<Arc<dyn Middleware>>) -> Self {
        let mut middleware = middleware;
        sort(&mut middleware);
        Self {
            middleware: Arc::new(RwLock::new(middleware)),
        }
    }

    /// Run the request phase of every middleware whose stage is in `stages`
    ///
    /// Returns `Some(response)` when a middleware short-circuited.
    #[instrument(level = "debug", skip(self, request), fields(request_id = %request.id))]
    pub async fn run_request_stages(
        &self,
        request: &mut RequestDescriptor,
        stages: StageSet,
    ) -> GatewayResult<Option<GatewayResponse>> {
        let middleware = self.middleware.read().await;

        for instance in middleware.iter().filter(|m| stages.contains(m.stage())) {
            let start = Instant::now();
            let result = instance.process_request(request).await;
            metrics::record_middleware(instance.stage(), "request", start.elapsed());

            match result? {
                MiddlewareResult::Continue => {}
                MiddlewareResult::ShortCircuit(response) => {
                    debug!(
                        middleware = instance.name(),
                        status = response.status.as_u16(),
                        "Middleware short-circuited the request"
                    );
                    return Ok(Some(response));
                }
            }
        }

        Ok(None)
    }

    /// Run the response phase of every middleware whose stage is in `stages`, in reverse
    #[instrument(level = "debug", skip(self, request, response), fields(request_id = %request.id))]
    pub async fn run_response_stages(
        &self,
        request: &RequestDescriptor,
        response: &mut GatewayResponse,
        stages: StageSet,
    ) -> GatewayResult<()> {
        let middleware = self.middleware.read().await;

        for instance in middleware
            .iter()
            .rev()
            .filter(|m| stages.contains(m.stage()))
        {
            let start = Instant::now();
            let result = instance.process_response(request, response).await;
            metrics::record_middleware(instance.stage(), "response", start.elapsed());
            result?;
        }

        Ok(())
    }

    /// Add middleware, keeping the chain ordered
    pub async fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        let mut list = self.middleware.write().await;
        info!(
            "Adding middleware '{}' to the {} stage",
            middleware.name(),
            middleware.stage()
        );
        list.push(middleware);
        sort(&mut list);
    }

    /// Remove middleware by name
    pub async fn remove_middleware(&self, name: &str) -> bool {
        let mut list = self.middleware.write().await;
        match list.iter().position(|m| m.name() == name) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Names of the active middleware in execution order
    pub async fn get_active_middleware(&self) -> Vec<String> {
        let list = self.middleware.read().await;
        list.iter().map(|m| m.name().to_string()).collect()
    }

    /// Stages with at least one registered middleware
    pub async fn populated_stages(&self) -> StageSet {
        let list = self.middleware.read().await;
        list.iter().map(|m| m.stage()).collect()
    }
}

fn sort(middleware: &mut [Arc<dyn Middleware>]) {
    middleware.sort_by_key(|m| (m.stage(), m.priority()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GatewayError;
    use axum::http::{Method, StatusCode};
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Recording {
        name: &'static str,
        stage: MiddlewareStage,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
        reject: bool,
    }

    impl Recording {
        fn new(
            name: &'static str,
            stage: MiddlewareStage,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Self {
            Self {
                name,
                stage,
                priority: 100,
                log: log.clone(),
                reject: false,
            }
        }
    }

    #[async_trait]
    impl Middleware for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn stage(&self) -> MiddlewareStage {
            self.stage
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn process_request(
            &self,
            request: &mut RequestDescriptor,
        ) -> GatewayResult<MiddlewareResult> {
            self.log.lock().push(format!("req:{}", self.name));
            if self.reject {
                return Err(GatewayError::authz("missing api key"));
            }
            if self.name == "short" {
                return Ok(MiddlewareResult::ShortCircuit(GatewayResponse::text(
                    StatusCode::TOO_MANY_REQUESTS,
                    "slow down",
                )));
            }
            request.params.insert(self.name.to_string(), "seen".to_string());
            Ok(MiddlewareResult::Continue)
        }

        async fn process_response(
            &self,
            _request: &RequestDescriptor,
            _response: &mut GatewayResponse,
        ) -> GatewayResult<()> {
            self.log.lock().push(format!("resp:{}", self.name));
            Ok(())
        }
    }

    fn pipeline(log: &Arc<Mutex<Vec<String>>>) -> MiddlewarePipeline {
        let mut first_security = Recording::new("auth", MiddlewareStage::Security, log);
        first_security.priority = 10;
        MiddlewarePipeline::with_middleware(vec![
            Arc::new(Recording::new("timing", MiddlewareStage::Performance, log)),
            Arc::new(Recording::new("acl", MiddlewareStage::Security, log)),
            Arc::new(Recording::new("request_id", MiddlewareStage::PreRequest, log)),
            Arc::new(first_security),
        ])
    }

    #[tokio::test]
    async fn test_stage_then_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline(&log);
        let mut request = RequestDescriptor::new(Method::GET, "/users");

        let response = pipeline
            .run_request_stages(&mut request, StageSet::all())
            .await
            .unwrap();
        assert!(response.is_none());
        assert_eq!(request.params.len(), 4);

        let mut response = GatewayResponse::text(StatusCode::OK, "ok");
        pipeline
            .run_response_stages(&request, &mut response, StageSet::all())
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "req:request_id",
                "req:auth",
                "req:acl",
                "req:timing",
                "resp:timing",
                "resp:acl",
                "resp:auth",
                "resp:request_id",
            ]
        );
    }

    #[tokio::test]
    async fn test_stage_filter_runs_security_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline(&log);
        let mut request = RequestDescriptor::new(Method::GET, "/users");

        pipeline
            .run_request_stages(&mut request, StageSet::only(MiddlewareStage::Security))
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["req:auth", "req:acl"]);
    }

    #[tokio::test]
    async fn test_short_circuit_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline(&log);
        pipeline
            .add_middleware(Arc::new(Recording::new(
                "short",
                MiddlewareStage::Security,
                &log,
            )))
            .await;

        let mut request = RequestDescriptor::new(Method::GET, "/users");
        let response = pipeline
            .run_request_stages(&mut request, StageSet::all())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(!log.lock().contains(&"req:timing".to_string()));
    }

    #[tokio::test]
    async fn test_errors_propagate_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rejecting = Recording::new("deny", MiddlewareStage::Security, &log);
        rejecting.reject = true;
        let pipeline = MiddlewarePipeline::with_middleware(vec![Arc::new(rejecting)]);

        let mut request = RequestDescriptor::new(Method::GET, "/admin");
        let err = pipeline
            .run_request_stages(&mut request, StageSet::all())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::authz("missing api key"));
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new();
        assert!(pipeline.populated_stages().await.is_empty());

        pipeline
            .add_middleware(Arc::new(Recording::new("acl", MiddlewareStage::Security, &log)))
            .await;
        assert_eq!(pipeline.get_active_middleware().await, vec!["acl".to_string()]);
        assert!(pipeline.populated_stages().await.contains(MiddlewareStage::Security));

        assert!(pipeline.remove_middleware("acl").await);
        assert!(!pipeline.remove_middleware("acl").await);
    }
}
