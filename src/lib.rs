//! # Tiered Gateway - Core Library Crate
//!
//! Adaptive request classification and tiered response caching for HTTP gateways.
//!
//! Every request is classified from what has been learned about its route and
//! dispatched through one of three execution tiers:
//!
//! - **UltraFast**: mandatory security checks plus a direct cache read for routes
//!   whose responses are cached, fast and stable
//! - **Fast**: security checks and a layered cache lookup run concurrently
//! - **Standard**: the full middleware pipeline and the downstream handler
//!
//! A tier that cannot answer falls through to the next slower one. Observed
//! latencies flow back into the route table, so routes move between tiers as their
//! behavior changes.
//!
//! ## Module Layout
//!
//! - `core`: errors, configuration, request/response descriptors, the downstream
//!   handler trait and the performance profiler
//! - `caching`: cache stores (memory, Redis), the two-level cache manager, keys,
//!   tag invalidation, response caching and warm-up
//! - `tiering`: the classifier, the learned route table and the dispatcher
//! - `middleware`: the stage-bound middleware pipeline
//! - `gateway`: the axum layer and HTTP server
//! - `observability`: logging and metrics

/// Errors, configuration, descriptors, handler trait and profiler
pub mod core;

/// Cache stores, cache manager, keys, invalidation and warm-up
pub mod caching;

/// Classification, learned routes and tiered dispatch
pub mod tiering;

/// Stage-bound middleware pipeline
pub mod middleware;

/// Axum integration and HTTP server
pub mod gateway;

/// Structured logging and Prometheus metrics
pub mod observability;

// Re-export commonly used types so users can write `use tiered_gateway::GatewayError`

/// Main error type and result alias
pub use core::error::{GatewayError, GatewayResult};

/// Top-level configuration
pub use core::config::TieringConfig;

/// Descriptors exchanged with the surrounding server
pub use core::types::{GatewayResponse, RequestDescriptor};

/// Downstream handler abstraction
pub use core::handler::Handler;

/// Primary entry points
pub use gateway::server::GatewayServer;
pub use tiering::{RequestClassification, Tier, TieredDispatcher};
