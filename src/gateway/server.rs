//! # HTTP Server
//!
//! Serves an application router behind the tiering layer using axum on a tokio
//! `TcpListener`. The optimization statistics endpoint and, when a Prometheus
//! recorder is installed, the scrape endpoint are mounted outside the layer.
//!
//! On shutdown (Ctrl-C) the server stops accepting connections, drains in-flight
//! requests and flushes pending cache writes.

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::integration::with_tiering;
use crate::core::config::ServerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::tiering::dispatcher::TieredDispatcher;

/// HTTP server wrapping an application router in the tiering layer
pub struct GatewayServer {
    config: ServerConfig,
    app: Router,
    dispatcher: Arc<TieredDispatcher>,
}

impl GatewayServer {
    /// Create a server for `app`
    pub fn new(
        config: ServerConfig,
        app: Router,
        dispatcher: Arc<TieredDispatcher>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        let mut app = with_tiering(app, dispatcher.clone(), &config);

        if let Some(handle) = prometheus {
            app = app.route(
                &config.metrics_path,
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        Self {
            config,
            app,
            dispatcher,
        }
    }

    /// Socket address the server binds to
    pub fn bind_addr(&self) -> GatewayResult<SocketAddr> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        addr.parse()
            .map_err(|e| GatewayError::config(format!("Invalid bind address {}: {}", addr, e)))
    }

    /// The complete router, including the tiering layer
    pub fn router(&self) -> Router {
        self.app.clone()
    }

    /// Serve until Ctrl-C, then flush pending cache writes
    pub async fn start(self) -> GatewayResult<()> {
        let addr = self.bind_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind gateway server to {}: {}", addr, e))
        })?;

        info!("Tiered gateway listening on {}", addr);
        info!(
            "Optimization statistics at {}, metrics at {}",
            self.config.stats_path, self.config.metrics_path
        );

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;

        info!("Flushing pending cache writes");
        self.dispatcher.flush_pending_writes().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!("Failed to listen for the shutdown signal: {}", e),
    }
}
