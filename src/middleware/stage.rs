//! Middleware stages known to the tiering layer.
//!
//! Stages are a closed set so that "skip this part of the chain" is a bit test
//! instead of a string comparison.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stage of the full middleware sequence, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareStage {
    PreRequest,
    Security,
    Cache,
    Performance,
    PostResponse,
}

impl MiddlewareStage {
    /// All stages in the order the standard path runs them
    pub const ALL: [MiddlewareStage; 5] = [
        MiddlewareStage::PreRequest,
        MiddlewareStage::Security,
        MiddlewareStage::Cache,
        MiddlewareStage::Performance,
        MiddlewareStage::PostResponse,
    ];

    /// Stages the fast path is allowed to drop
    pub fn is_optional(self) -> bool {
        matches!(self, MiddlewareStage::PreRequest | MiddlewareStage::Performance)
    }

    /// The only stage no tier may skip
    pub fn is_mandatory(self) -> bool {
        matches!(self, MiddlewareStage::Security)
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MiddlewareStage::PreRequest => "pre_request",
            MiddlewareStage::Security => "security",
            MiddlewareStage::Cache => "cache",
            MiddlewareStage::Performance => "performance",
            MiddlewareStage::PostResponse => "post_response",
        }
    }
}

impl fmt::Display for MiddlewareStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact set of [`MiddlewareStage`]s
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageSet(u8);

impl StageSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        MiddlewareStage::ALL.into_iter().collect()
    }

    /// A set holding exactly one stage
    pub fn only(stage: MiddlewareStage) -> Self {
        let mut set = StageSet::empty();
        set.insert(stage);
        set
    }

    /// Every stage except the mandatory security check
    pub fn all_but_mandatory() -> Self {
        MiddlewareStage::ALL
            .into_iter()
            .filter(|stage| !stage.is_mandatory())
            .collect()
    }

    /// Only the stages the fast path may drop
    pub fn optional() -> Self {
        MiddlewareStage::ALL
            .into_iter()
            .filter(|stage| stage.is_optional())
            .collect()
    }

    pub fn insert(&mut self, stage: MiddlewareStage) {
        self.0 |= stage.bit();
    }

    pub fn remove(&mut self, stage: MiddlewareStage) {
        self.0 &= !stage.bit();
    }

    pub fn contains(&self, stage: MiddlewareStage) -> bool {
        self.0 & stage.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Stages not in this set
    pub fn complement(&self) -> Self {
        Self(!self.0 & StageSet::all().0)
    }

    pub fn iter(&self) -> impl Iterator<Item = MiddlewareStage> + '_ {
        MiddlewareStage::ALL
            .into_iter()
            .filter(move |stage| self.contains(*stage))
    }
}

impl FromIterator<MiddlewareStage> for StageSet {
    fn from_iter<I: IntoIterator<Item = MiddlewareStage>>(iter: I) -> Self {
        let mut set = StageSet::empty();
        for stage in iter {
            set.insert(stage);
        }
        set
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for StageSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for StageSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let stages = Vec::<MiddlewareStage>::deserialize(deserializer)?;
        Ok(stages.into_iter().collect())
    }
}
