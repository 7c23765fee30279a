//! # Tiered Gateway - Main Entry Point
//!
//! Runs a small demo application behind the tiering layer.
//!
//! ```text
//! tiered-gateway [CONFIG_FILE]
//! ```
//!
//! The configuration file (YAML, or TOML/JSON by extension) may also be given in
//! `TIERING_CONFIG`. Without one, defaults plus `TIERING_*` environment overrides are
//! used. Cache warm-up runs in the background; the server accepts requests
//! immediately.
//!
//! ## Demo routes
//!
//! - `GET /health`
//! - `GET /users`, `POST /users`
//! - `GET /users/:id`
//!
//! With a route rule such as
//!
//! ```yaml
//! routes:
//!   - path: /users
//!     method: POST
//!     invalidate_on: [users]
//! ```
//!
//! creating a user invalidates every cached `/users` response.

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use tiered_gateway::caching::warmup::CacheWarmer;
use tiered_gateway::gateway::integration::RouterHandler;
use tiered_gateway::gateway::server::GatewayServer;
use tiered_gateway::observability::{init_logging, install_prometheus_recorder};
use tiered_gateway::tiering::TieredDispatcher;
use tiered_gateway::TieringConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TIERING_CONFIG").ok());
    let config = match config_path {
        Some(path) => TieringConfig::load_from_file(&path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => TieringConfig::from_env().context("Invalid environment configuration")?,
    };

    init_logging(&config.logging)?;
    info!("Starting tiered gateway v{}", env!("CARGO_PKG_VERSION"));

    let prometheus = install_prometheus_recorder()?;
    let dispatcher = Arc::new(
        TieredDispatcher::from_config(&config)
            .await
            .context("Failed to initialize the cache")?,
    );

    let server = GatewayServer::new(
        config.server.clone(),
        demo_app(),
        dispatcher,
        Some(prometheus),
    );

    let warmup = CacheWarmer::new(config.warmup.clone())
        .start(Arc::new(RouterHandler::new(server.router())));
    tokio::spawn(async move {
        let report = warmup.wait().await;
        if report.attempted > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed.len(),
                "Cache warm-up finished"
            );
        }
    });

    server.start().await?;
    info!("Tiered gateway stopped");
    Ok(())
}

type Users = Arc<RwLock<Vec<String>>>;

#[derive(Deserialize)]
struct NewUser {
    name: String,
}

fn demo_app() -> Router {
    let users: Users = Arc::new(RwLock::new(vec!["ada".to_string(), "grace".to_string()]));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/users", get(list_users).post(create_user))
        .route("/users/:id", get(get_user))
        .with_state(users)
}

async fn list_users(State(users): State<Users>) -> Json<Vec<String>> {
    Json(users.read().await.clone())
}

async fn create_user(
    State(users): State<Users>,
    Json(user): Json<NewUser>,
) -> (StatusCode, Json<usize>) {
    let mut users = users.write().await;
    users.push(user.name);
    (StatusCode::CREATED, Json(users.len() - 1))
}

async fn get_user(
    State(users): State<Users>,
    Path(id): Path<usize>,
) -> Result<Json<String>, StatusCode> {
    users
        .read()
        .await
        .get(id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
