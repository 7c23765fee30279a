//! # Tiered Execution
//!
//! Requests are classified into one of three tiers from what has been learned
//! about their route, then dispatched through the matching execution path:
//!
//! | Tier      | Middleware run           | Cache read                    |
//! |-----------|--------------------------|-------------------------------|
//! | UltraFast | security                 | direct key of a compiled route|
//! | Fast      | security, cache, post    | layered key, concurrently     |
//! | Standard  | every stage              | layered key at the cache stage|
//!
//! A tier that cannot answer falls through to the next slower one, so a stale or
//! wrong classification never changes what the client receives.

pub mod classifier;
pub mod dispatcher;
pub mod route_cache;
pub mod types;

pub use classifier::RequestClassifier;
pub use dispatcher::{OptimizationStats, TieredDispatcher};
pub use route_cache::{CompiledRoute, OptimizedResponse, RouteCache, RouteOutcome};
pub use types::{CacheLevel, CacheStrategy, RequestClassification, Tier};
