//! # Performance Profiler Module
//!
//! Records a timing breakdown for every request handled by the tiering layer
//! (classification overhead, cache lookup time, handler time) and aggregates it into
//! latency percentiles, per-tier cache hit rates and the UltraFast target
//! achievement rate.
//!
//! Measurements are tracked in a bounded handle table. A handle that is started but
//! never completed, for instance because the client went away, expires after
//! `handle_ttl` and is removed by the sweeper. Completed samples are kept in a
//! fixed-capacity ring buffer; the oldest sample is dropped first.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::core::types::RequestDescriptor;
use crate::observability::metrics;
use crate::tiering::types::{CacheLevel, Tier};

/// Performance profiler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Completed samples retained for percentile computation
    pub sample_capacity: usize,

    /// Maximum measurements in flight
    pub max_active_measurements: usize,

    /// Age after which an uncompleted measurement is discarded
    #[serde(with = "humantime_serde")]
    pub handle_ttl: Duration,

    /// Interval of the expired handle sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Latency target for UltraFast requests; defaults to the UltraFast threshold
    pub ultra_fast_target_ms: Option<f64>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            sample_capacity: 10_000,
            max_active_measurements: 10_000,
            handle_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            ultra_fast_target_ms: None,
        }
    }
}

/// Handle to an in-flight measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeasurementHandle(u64);

impl MeasurementHandle {
    /// Handle that is not tracked; every operation on it is a no-op
    pub const UNTRACKED: MeasurementHandle = MeasurementHandle(0);

    pub fn is_tracked(self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug)]
struct ActiveMeasurement {
    request_id: String,
    started_at: Instant,
    tier: Tier,
    classification_time: Duration,
    cache_hit: bool,
    cache_level: CacheLevel,
    cache_time: Duration,
    handler_time: Duration,
}

/// One completed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub request_id: String,
    pub tier: Tier,
    pub total_time_ms: f64,
    pub classification_time_ms: f64,
    pub cache_time_ms: f64,
    pub handler_time_ms: f64,
    pub cache_hit: bool,
    pub cache_level: CacheLevel,
    pub status: u16,
}

/// Counters for one tier over the profiler's lifetime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub hit_rate: f64,
}

/// Aggregate profiler statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilerStats {
    pub total_requests: u64,
    /// Samples currently in the ring buffer
    pub window_samples: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub tiers: BTreeMap<Tier, TierStats>,
    /// Fraction of UltraFast requests that finished under the UltraFast target
    pub target_achievement_rate: f64,
    pub active_measurements: usize,
    pub expired_measurements: u64,
    pub rejected_measurements: u64,
}

#[derive(Debug, Default)]
struct TierCounters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
}

/// Performance profiler for the tiering layer
pub struct PerformanceProfiler {
    config: ProfilerConfig,
    ultra_fast_target: Duration,
    next_handle: AtomicU64,
    active: DashMap<u64, ActiveMeasurement>,
    samples: Mutex<VecDeque<PerformanceSample>>,
    tiers: [TierCounters; 3],
    ultra_fast_on_target: AtomicU64,
    total_requests: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
}

impl PerformanceProfiler {
    /// Create a profiler; `ultra_fast_target` applies when the config sets none
    pub fn new(config: ProfilerConfig, ultra_fast_target: Duration) -> Self {
        let ultra_fast_target = config
            .ultra_fast_target_ms
            .map(|ms| Duration::from_secs_f64(ms.max(0.0) / 1_000.0))
            .unwrap_or(ultra_fast_target);

        Self {
            samples: Mutex::new(VecDeque::with_capacity(config.sample_capacity.min(1024))),
            config,
            ultra_fast_target,
            next_handle: AtomicU64::new(1),
            active: DashMap::new(),
            tiers: Default::default(),
            ultra_fast_on_target: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Begin measuring a request
    ///
    /// When the handle table is full even after dropping expired handles, the
    /// request is not measured and [`MeasurementHandle::UNTRACKED`] is returned.
    pub fn start_measurement(&self, request: &RequestDescriptor) -> MeasurementHandle {
        if self.active.len() >= self.config.max_active_measurements {
            self.sweep_expired();
            if self.active.len() >= self.config.max_active_measurements {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return MeasurementHandle::UNTRACKED;
            }
        }

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            id,
            ActiveMeasurement {
                request_id: request.id.clone(),
                started_at: request.received_at,
                tier: Tier::Standard,
                classification_time: Duration::ZERO,
                cache_hit: false,
                cache_level: CacheLevel::Miss,
                cache_time: Duration::ZERO,
                handler_time: Duration::ZERO,
            },
        );
        MeasurementHandle(id)
    }

    /// Record the tier a request was classified into and what it cost
    pub fn mark_classification(&self, handle: MeasurementHandle, tier: Tier, duration: Duration) {
        if let Some(mut measurement) = self.active.get_mut(&handle.0) {
            measurement.tier = tier;
            measurement.classification_time += duration;
        }
    }

    /// Record one cache lookup; the first hit determines the reported level
    pub fn mark_cache_operation(
        &self,
        handle: MeasurementHandle,
        hit: bool,
        level: CacheLevel,
        duration: Duration,
    ) {
        if let Some(mut measurement) = self.active.get_mut(&handle.0) {
            measurement.cache_time += duration;
            if hit && !measurement.cache_hit {
                measurement.cache_hit = true;
                measurement.cache_level = level;
            }
        }
    }

    /// Record time spent in the downstream handler
    pub fn mark_handler(&self, handle: MeasurementHandle, duration: Duration) {
        if let Some(mut measurement) = self.active.get_mut(&handle.0) {
            measurement.handler_time += duration;
        }
    }

    /// Finish a measurement, returning the recorded sample
    ///
    /// Returns `None` for untracked or expired handles.
    pub fn complete_measurement(
        &self,
        handle: MeasurementHandle,
        status: u16,
    ) -> Option<PerformanceSample> {
        let (_, measurement) = self.active.remove(&handle.0)?;
        let total = measurement.started_at.elapsed();

        let sample = PerformanceSample {
            request_id: measurement.request_id,
            tier: measurement.tier,
            total_time_ms: as_millis(total),
            classification_time_ms: as_millis(measurement.classification_time),
            cache_time_ms: as_millis(measurement.cache_time),
            handler_time_ms: as_millis(measurement.handler_time),
            cache_hit: measurement.cache_hit,
            cache_level: measurement.cache_level,
            status,
        };

        self.record_sample(sample.clone(), total);
        Some(sample)
    }

    fn record_sample(&self, sample: PerformanceSample, total: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let counters = &self.tiers[sample.tier.index()];
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if sample.cache_hit {
            counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        if sample.tier == Tier::UltraFast && total < self.ultra_fast_target {
            self.ultra_fast_on_target.fetch_add(1, Ordering::Relaxed);
        }

        metrics::record_request(sample.tier, sample.cache_level, total);

        let mut samples = self.samples.lock();
        if samples.len() >= self.config.sample_capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Drop measurements older than `handle_ttl`, returning how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.config.handle_ttl;
        let before = self.active.len();
        self.active
            .retain(|_, measurement| measurement.started_at.elapsed() < ttl);
        let removed = before.saturating_sub(self.active.len());

        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Discarded {} abandoned measurements", removed);
        }
        removed
    }

    /// Spawn the periodic sweep of abandoned measurements
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let profiler: Weak<Self> = Arc::downgrade(self);
        let sweep_interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                match profiler.upgrade() {
                    Some(profiler) => {
                        profiler.sweep_expired();
                    }
                    None => break,
                }
            }
        })
    }

    /// Aggregate statistics
    #[instrument(level = "debug", skip(self))]
    pub fn get_stats(&self) -> ProfilerStats {
        let mut latencies: Vec<f64> = {
            let samples = self.samples.lock();
            samples.iter().map(|sample| sample.total_time_ms).collect()
        };
        latencies.sort_by(|a, b| a.total_cmp(b));

        let mean_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let tiers = Tier::ALL
            .iter()
            .map(|&tier| {
                let counters = &self.tiers[tier.index()];
                let requests = counters.requests.load(Ordering::Relaxed);
                let cache_hits = counters.cache_hits.load(Ordering::Relaxed);
                (
                    tier,
                    TierStats {
                        requests,
                        cache_hits,
                        hit_rate: ratio(cache_hits, requests),
                    },
                )
            })
            .collect();

        let ultra_fast_requests = self.tiers[Tier::UltraFast.index()]
            .requests
            .load(Ordering::Relaxed);

        ProfilerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            window_samples: latencies.len(),
            mean_ms,
            p50_ms: percentile(&latencies, 0.50),
            p95_ms: percentile(&latencies, 0.95),
            p99_ms: percentile(&latencies, 0.99),
            tiers,
            target_achievement_rate: ratio(
                self.ultra_fast_on_target.load(Ordering::Relaxed),
                ultra_fast_requests,
            ),
            active_measurements: self.active.len(),
            expired_measurements: self.expired.load(Ordering::Relaxed),
            rejected_measurements: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Most recent samples, newest last
    pub fn recent_samples(&self, limit: usize) -> Vec<PerformanceSample> {
        let samples = self.samples.lock();
        let skip = samples.len().saturating_sub(limit);
        samples.iter().skip(skip).cloned().collect()
    }

    pub fn active_measurements(&self) -> usize {
        self.active.len()
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }
}

fn as_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Nearest-rank percentile over sorted values
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
