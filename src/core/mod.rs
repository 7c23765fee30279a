// Configuration loading and validation
pub mod config;

// Error types and HTTP status mapping
pub mod error;

// Downstream handler abstraction
pub mod handler;

// Per-request timing and aggregate latency statistics
pub mod profiler;

// Request and response descriptors
pub mod types;
