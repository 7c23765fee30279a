//! Classification vocabulary shared by the classifier, route cache, dispatcher and profiler.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::middleware::stage::StageSet;

/// Execution tier assigned to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    UltraFast,
    Fast,
    Standard,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::UltraFast, Tier::Fast, Tier::Standard];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::UltraFast => "ultra_fast",
            Tier::Fast => "fast",
            Tier::Standard => "standard",
        }
    }

    /// Encoding used for lock-free storage in an `AtomicU8`
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Tier::UltraFast => 0,
            Tier::Fast => 1,
            Tier::Standard => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Tier::UltraFast,
            1 => Tier::Fast,
            _ => Tier::Standard,
        }
    }

    /// The next less aggressive tier
    pub fn downgrade(self) -> Tier {
        match self {
            Tier::UltraFast => Tier::Fast,
            Tier::Fast | Tier::Standard => Tier::Standard,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.as_u8() as usize
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the response cache participates for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Never read or write the cache
    None,
    /// Single direct key, served without running the handler
    Direct,
    /// Layered key checked in memory then the remote store
    Layered,
}

/// Where a response was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheLevel {
    /// Direct (`ultra:`) entry
    L1,
    /// Layered entry found in the in-memory store
    L2,
    /// Layered entry found in the remote store
    L3,
    Miss,
}

impl CacheLevel {
    pub fn is_hit(self) -> bool {
        !matches!(self, CacheLevel::Miss)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheLevel::L1 => "l1",
            CacheLevel::L2 => "l2",
            CacheLevel::L3 => "l3",
            CacheLevel::Miss => "miss",
        }
    }
}

/// Per-request classification result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestClassification {
    pub tier: Tier,
    /// In `[0, 1]`
    pub confidence: f64,
    pub cache_strategy: CacheStrategy,
    pub skip_middleware: StageSet,
}

impl RequestClassification {
    /// Classification used for unknown routes and whenever classification fails
    pub fn standard(cache_strategy: CacheStrategy, confidence: f64) -> Self {
        Self {
            tier: Tier::Standard,
            confidence,
            cache_strategy,
            skip_middleware: StageSet::empty(),
        }
    }

    /// Skip set implied by a tier
    pub fn skip_set_for(tier: Tier) -> StageSet {
        match tier {
            Tier::UltraFast => StageSet::all_but_mandatory(),
            Tier::Fast => StageSet::optional(),
            Tier::Standard => StageSet::empty(),
        }
    }
}
