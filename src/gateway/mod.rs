// Axum layer and statistics endpoint
pub mod integration;

// Listener and graceful shutdown
pub mod server;

pub use integration::{tiering_middleware, with_tiering, RouterHandler, TieringLayerState};
pub use server::GatewayServer;
