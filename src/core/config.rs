//! # Configuration Management
//!
//! Configuration for the tiering layer is a single [`TieringConfig`] tree loaded from a
//! YAML, TOML or JSON file. Every section has defaults, so an empty file (or no file at
//! all) yields a working setup. Environment variables of the form `TIERING_<FIELD>`
//! override file values and the result is validated before use.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::caching::cache_manager::CacheConfig;
use crate::caching::invalidation::RouteCacheRule;
use crate::caching::warmup::WarmupConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::profiler::ProfilerConfig;
use crate::observability::config::{LogConfig, LogFormat};
use crate::tiering::types::Tier;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// Listener settings for the bundled server binary
    pub server: ServerConfig,

    /// Classification and route learning thresholds
    pub optimization: OptimizationConfig,

    /// Cache TTL per tier
    pub ttl: TierTtlConfig,

    /// Cache store settings
    pub cache: CacheConfig,

    /// Performance profiler settings
    pub profiler: ProfilerConfig,

    /// Per-route cache rules (tags, invalidation, TTL overrides)
    pub routes: Vec<RouteCacheRule>,

    /// Startup cache warm-up
    pub warmup: WarmupConfig,

    /// Logging output
    pub logging: LogConfig,
}

/// Server listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Path of the optimization statistics endpoint
    pub stats_path: String,
    /// Path of the Prometheus scrape endpoint
    pub metrics_path: String,
    /// Largest request body buffered for classification, in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            stats_path: "/_tiering/stats".to_string(),
            metrics_path: "/metrics".to_string(),
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Thresholds driving classification and route learning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    /// Observed requests before a route's learned tier is trusted
    pub optimization_threshold: u64,

    /// Upper bound on learned route patterns
    pub max_compiled_routes: usize,

    /// p95 latency below which a GET route may be UltraFast
    pub ultra_fast_threshold_ms: f64,

    /// p95 latency below which a route may be Fast
    pub fast_threshold_ms: f64,

    /// Latency samples kept per route for p95 estimation
    pub stats_window: usize,

    /// Routes with `p95 / mean` at or above this ratio are never UltraFast
    pub max_variance_ratio: f64,

    /// Consecutive outcomes without a tier flip before a compiled shortcut is used
    pub stability_window: u32,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            optimization_threshold: 1,
            max_compiled_routes: 1000,
            ultra_fast_threshold_ms: 1.0,
            fast_threshold_ms: 5.0,
            stats_window: 20,
            max_variance_ratio: 2.0,
            stability_window: 3,
        }
    }
}

/// Default cache TTL for each tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTtlConfig {
    #[serde(with = "humantime_serde")]
    pub ultra_fast: Duration,
    #[serde(with = "humantime_serde")]
    pub fast: Duration,
    #[serde(with = "humantime_serde")]
    pub standard: Duration,
}

impl TierTtlConfig {
    pub fn for_tier(&self, tier: Tier) -> Duration {
        match tier {
            Tier::UltraFast => self.ultra_fast,
            Tier::Fast => self.fast,
            Tier::Standard => self.standard,
        }
    }
}

impl Default for TierTtlConfig {
    fn default() -> Self {
        Self {
            ultra_fast: Duration::from_secs(60 * 60),
            fast: Duration::from_secs(30 * 60),
            standard: Duration::from_secs(5 * 60),
        }
    }
}

impl TieringConfig {
    /// Load configuration from a file, picking the format by extension
    ///
    /// `.json` and `.toml` are parsed as such; anything else is treated as YAML.
    /// Environment overrides are applied and the result validated.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let mut config = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str::<TieringConfig>(&content)?,
            Some("toml") => toml::from_str::<TieringConfig>(&content)?,
            _ => serde_yaml::from_str::<TieringConfig>(&content)?,
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> GatewayResult<Self> {
        let mut config = TieringConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TIERING_*` environment variables
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from `(name, value)` pairs; unknown names are ignored
    pub fn apply_overrides<I>(&mut self, vars: I) -> GatewayResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            match name.as_str() {
                "TIERING_SERVER_PORT" => self.server.port = parse_var(&name, &value)?,
                "TIERING_SERVER_BIND_ADDRESS" => self.server.bind_address = value,
                "TIERING_OPTIMIZATION_THRESHOLD" => {
                    self.optimization.optimization_threshold = parse_var(&name, &value)?
                }
                "TIERING_MAX_COMPILED_ROUTES" => {
                    self.optimization.max_compiled_routes = parse_var(&name, &value)?
                }
                "TIERING_ULTRA_FAST_THRESHOLD_MS" => {
                    self.optimization.ultra_fast_threshold_ms = parse_var(&name, &value)?
                }
                "TIERING_FAST_THRESHOLD_MS" => {
                    self.optimization.fast_threshold_ms = parse_var(&name, &value)?
                }
                "TIERING_TTL_ULTRA_FAST" => self.ttl.ultra_fast = parse_duration_var(&name, &value)?,
                "TIERING_TTL_FAST" => self.ttl.fast = parse_duration_var(&name, &value)?,
                "TIERING_TTL_STANDARD" => self.ttl.standard = parse_duration_var(&name, &value)?,
                "TIERING_CACHE_MAX_ENTRIES" => {
                    self.cache.memory.max_entries = parse_var(&name, &value)?
                }
                "TIERING_REDIS_URL" => {
                    self.cache.redis.url = value;
                    self.cache.redis_enabled = true;
                }
                "TIERING_LOG_LEVEL" => self.logging.level = value,
                "TIERING_LOG_FORMAT" => {
                    self.logging.format = match value.to_ascii_lowercase().as_str() {
                        "json" => LogFormat::Json,
                        "text" => LogFormat::Text,
                        other => {
                            return Err(GatewayError::config(format!(
                                "Invalid TIERING_LOG_FORMAT: {}",
                                other
                            )))
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();
        let optimization = &self.optimization;

        if optimization.optimization_threshold == 0 {
            errors.push("optimization.optimization_threshold must be at least 1".to_string());
        }
        if optimization.max_compiled_routes == 0 {
            errors.push("optimization.max_compiled_routes must be greater than 0".to_string());
        }
        if optimization.ultra_fast_threshold_ms <= 0.0 {
            errors.push("optimization.ultra_fast_threshold_ms must be positive".to_string());
        }
        if optimization.fast_threshold_ms < optimization.ultra_fast_threshold_ms {
            errors.push(
                "optimization.fast_threshold_ms must not be below ultra_fast_threshold_ms"
                    .to_string(),
            );
        }
        if optimization.stats_window == 0 {
            errors.push("optimization.stats_window must be greater than 0".to_string());
        }
        if optimization.max_variance_ratio <= 1.0 {
            errors.push("optimization.max_variance_ratio must be greater than 1.0".to_string());
        }
        if self.server.max_body_size == 0 {
            errors.push("server.max_body_size must be greater than 0".to_string());
        }

        for (tier, ttl) in [
            (Tier::UltraFast, self.ttl.ultra_fast),
            (Tier::Fast, self.ttl.fast),
            (Tier::Standard, self.ttl.standard),
        ] {
            if ttl.is_zero() {
                errors.push(format!("ttl.{} must be positive", tier));
            }
        }

        if self.cache.memory.max_entries == 0 {
            errors.push("cache.memory.max_entries must be greater than 0".to_string());
        }
        if self.cache.memory.max_memory_bytes == 0 {
            errors.push("cache.memory.max_memory_bytes must be greater than 0".to_string());
        }
        if self.profiler.sample_capacity == 0 {
            errors.push("profiler.sample_capacity must be greater than 0".to_string());
        }
        if self.profiler.max_active_measurements == 0 {
            errors.push("profiler.max_active_measurements must be greater than 0".to_string());
        }

        for (index, rule) in self.routes.iter().enumerate() {
            if !rule.path.starts_with('/') {
                errors.push(format!("routes[{}].path must start with '/'", index));
            }
        }

        if self.warmup.concurrency == 0 {
            errors.push("warmup.concurrency must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(errors.join("; ")))
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> GatewayResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid {}: {}", name, e)))
}

fn parse_duration_var(name: &str, value: &str) -> GatewayResult<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| GatewayError::config(format!("Invalid {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = TieringConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.optimization.optimization_threshold, 1);
        assert_eq!(config.optimization.max_compiled_routes, 1000);
        assert_eq!(config.ttl.for_tier(Tier::UltraFast), Duration::from_secs(3600));
        assert_eq!(config.ttl.for_tier(Tier::Fast), Duration::from_secs(1800));
        assert_eq!(config.ttl.for_tier(Tier::Standard), Duration::from_secs(300));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = TieringConfig::default();
        config.optimization.optimization_threshold = 0;
        config.optimization.fast_threshold_ms = 0.5;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("optimization_threshold"));
        assert!(err.contains("fast_threshold_ms"));
    }

    #[test]
    fn test_overrides() {
        let mut config = TieringConfig::default();
        config
            .apply_overrides(vec![
                ("TIERING_FAST_THRESHOLD_MS".to_string(), "8".to_string()),
                ("TIERING_TTL_STANDARD".to_string(), "90s".to_string()),
                ("TIERING_REDIS_URL".to_string(), "redis://cache:6379".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ])
            .unwrap();

        assert_eq!(config.optimization.fast_threshold_ms, 8.0);
        assert_eq!(config.ttl.standard, Duration::from_secs(90));
        assert!(config.cache.redis_enabled);
        assert_eq!(config.cache.redis.url, "redis://cache:6379");
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = TieringConfig::default();
        let result = config.apply_overrides(vec![(
            "TIERING_MAX_COMPILED_ROUTES".to_string(),
            "lots".to_string(),
        )]);
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
optimization:
  optimization_threshold: 3
ttl:
  fast: 10m
routes:
  - path: /users
    method: POST
    invalidate_on: [users]
"#
        )
        .unwrap();

        let config = TieringConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.optimization.optimization_threshold, 3);
        assert_eq!(config.ttl.fast, Duration::from_secs(600));
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].invalidate_on, vec!["users".to_string()]);
        assert_eq!(config.optimization.max_compiled_routes, 1000);
    }

    #[tokio::test]
    async fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[optimization]
max_compiled_routes = 16

[server]
port = 9000
"#
        )
        .unwrap();

        let config = TieringConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.optimization.max_compiled_routes, 16);
        assert_eq!(config.server.port, 9000);
    }
}
