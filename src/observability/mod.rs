// Observability configuration
pub mod config;

// Structured logging
pub mod logging;

// Metric names and recording helpers
pub mod metrics;

pub use config::{LogConfig, LogFormat};
pub use logging::init_logging;
pub use metrics::install_prometheus_recorder;
