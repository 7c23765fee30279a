pub mod pipeline;
pub mod stage;

pub use pipeline::{Middleware, MiddlewarePipeline, MiddlewareResult};
pub use stage::{MiddlewareStage, StageSet};
