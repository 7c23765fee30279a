//! # Cache Warm-up
//!
//! Pre-populates the cache at startup by issuing GET requests for configured paths
//! through a caller-supplied handler, normally one that dispatches through the
//! tiering layer. Warm-up runs in the background: [`CacheWarmer::start`] returns
//! immediately and failures are logged as warnings, never propagated.

use crate::core::handler::Handler;
use crate::core::types::RequestDescriptor;
use axum::http::{Method, Uri};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    /// GET paths (optionally with a query string) requested at startup
    pub paths: Vec<String>,

    /// Maximum warm-up requests in flight
    pub concurrency: usize,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            concurrency: 4,
        }
    }
}

/// Outcome of a warm-up run
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmupReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// `(path, reason)` for every path that did not produce a successful response
    pub failed: Vec<(String, String)>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Handle to a running warm-up
pub struct WarmupHandle {
    task: JoinHandle<WarmupReport>,
}

impl WarmupHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for warm-up to finish
    pub async fn wait(self) -> WarmupReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                warn!("Cache warm-up task ended abnormally: {}", e);
                WarmupReport::default()
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

pub struct CacheWarmer {
    config: WarmupConfig,
}

impl CacheWarmer {
    pub fn new(config: WarmupConfig) -> Self {
        Self { config }
    }

    /// Spawn warm-up requests in the background
    pub fn start(self, handler: Arc<dyn Handler>) -> WarmupHandle {
        let task = tokio::spawn(async move { self.run(handler).await });
        WarmupHandle { task }
    }

    async fn run(self, handler: Arc<dyn Handler>) -> WarmupReport {
        let start = Instant::now();
        let mut report = WarmupReport {
            attempted: self.config.paths.len(),
            ..Default::default()
        };
        if self.config.paths.is_empty() {
            return report;
        }

        info!(
            paths = self.config.paths.len(),
            concurrency = self.config.concurrency,
            "Starting cache warm-up"
        );

        let mut requests = Vec::with_capacity(self.config.paths.len());
        for path in self.config.paths {
            match path.parse::<Uri>() {
                Ok(uri) => requests.push((path, uri)),
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping invalid warm-up path");
                    report.failed.push((path, format!("invalid path: {}", e)));
                }
            }
        }

        let mut outcomes = stream::iter(requests)
            .map(|(path, uri)| {
                let handler = handler.clone();
                async move {
                    let request = RequestDescriptor::from_uri(Method::GET, &uri);
                    let outcome = match handler.call(request).await {
                        Ok(response) if response.is_success() => Ok(()),
                        Ok(response) => Err(format!("status {}", response.status)),
                        Err(e) => Err(e.to_string()),
                    };
                    (path, outcome)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some((path, outcome)) = outcomes.next().await {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err(reason) => {
                    warn!(path = %path, reason = %reason, "Cache warm-up request failed");
                    report.failed.push((path, reason));
                }
            }
        }

        report.elapsed = start.elapsed();
        info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            elapsed = ?report.elapsed,
            "Cache warm-up finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{GatewayError, GatewayResult};
    use crate::core::types::GatewayResponse;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(paths: &[&str], concurrency: usize) -> WarmupConfig {
        WarmupConfig {
            paths: paths.iter().map(|path| path.to_string()).collect(),
            concurrency,
        }
    }

    #[tokio::test]
    async fn test_warmup_reports_successes_and_failures() {
        let handler: Arc<dyn Handler> = Arc::new(|request: RequestDescriptor| async move {
            match request.path.as_str() {
                "/health" => Ok(GatewayResponse::text(StatusCode::OK, "ok")),
                "/missing" => Ok(GatewayResponse::text(StatusCode::NOT_FOUND, "")),
                _ => Err(GatewayError::internal("boom")),
            }
        });

        let report = CacheWarmer::new(config(&["/health", "/missing", "/broken"], 2))
            .start(handler)
            .wait()
            .await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed.len(), 2);
    }

    #[tokio::test]
    async fn test_warmup_returns_before_requests_finish() {
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let released = Arc::new(tokio::sync::Mutex::new(Some(released)));
        let handler: Arc<dyn Handler> = Arc::new(move |_request: RequestDescriptor| {
            let released = released.clone();
            async move {
                if let Some(rx) = released.lock().await.take() {
                    let _ = rx.await;
                }
                GatewayResult::Ok(GatewayResponse::text(StatusCode::OK, "ok"))
            }
        });

        let handle = CacheWarmer::new(config(&["/slow"], 1)).start(handler);
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        release.send(()).unwrap();
        assert_eq!(handle.wait().await.succeeded, 1);
    }

    #[tokio::test]
    async fn test_warmup_respects_concurrency_and_query() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn Handler> = {
            let (in_flight, peak) = (in_flight.clone(), peak.clone());
            Arc::new(move |request: RequestDescriptor| {
                let (in_flight, peak) = (in_flight.clone(), peak.clone());
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    assert_eq!(request.query.get("page").map(String::as_str), Some("1"));
                    GatewayResult::Ok(GatewayResponse::text(StatusCode::OK, "ok"))
                }
            })
        };

        let paths: Vec<String> = (0..8).map(|i| format!("/items/{}?page=1", i)).collect();
        let report = CacheWarmer::new(WarmupConfig {
            paths,
            concurrency: 2,
        })
        .start(handler)
        .wait()
        .await;

        assert_eq!(report.succeeded, 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
