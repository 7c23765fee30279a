//! # Cache Invalidation Module
//!
//! Per-route cache rules and tag-based invalidation.
//!
//! A [`RouteCacheRule`] matches requests by path pattern and optional method and
//! contributes tags, a TTL override, a cacheability flag and the tags a successful
//! request invalidates. [`InvalidationManager`] resolves the rules for a request into
//! a [`RouteCachePolicy`] and performs invalidations, broadcasting an
//! [`InvalidationEvent`] to any subscribers.
//!
//! Every invalidation first bumps a generation counter for each of its tags. A
//! response produced before the invalidation carries a [`TagSnapshot`] taken when
//! the request started, and its pending cache write is dropped once the snapshot is
//! stale.
//!
//! Path patterns use `:name` for a single segment and a trailing `*` for any suffix,
//! e.g. `/users/:id` or `/static/*`.

use super::key_generator::CacheKeyGenerator;
use super::{CacheError, CacheResult, CacheStore};
use crate::core::types::RequestDescriptor;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Cache behavior for requests matching a path pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteCacheRule {
    /// Path pattern (`/users`, `/users/:id`, `/static/*`)
    pub path: String,

    /// Restrict the rule to one method; `None` matches any method
    pub method: Option<String>,

    /// Extra tags attached to cached responses
    pub tags: Vec<String>,

    /// Tags invalidated after a successful request matching this rule
    pub invalidate_on: Vec<String>,

    /// TTL override for cached responses
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Whether responses may be cached at all
    pub cacheable: bool,
}

impl Default for RouteCacheRule {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            method: None,
            tags: Vec::new(),
            invalidate_on: Vec::new(),
            ttl: None,
            cacheable: true,
        }
    }
}

impl RouteCacheRule {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn invalidate_on<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidate_on.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn not_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

/// Resolved cache behavior for one request
#[derive(Debug, Clone, PartialEq)]
pub struct RouteCachePolicy {
    pub cacheable: bool,
    /// Tags for the cached response, including the default path tag
    pub tags: BTreeSet<String>,
    pub invalidate_on: Vec<String>,
    pub ttl: Option<Duration>,
}

/// Emitted after every invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub tags: Vec<String>,
    /// Entries removed across all cache levels
    pub removed: usize,
    /// Route key of the request that triggered the invalidation, if any
    pub trigger: Option<String>,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Number of generation slots tags are hashed into
const GENERATION_SLOTS: usize = 1024;

/// Invalidation generations per tag
///
/// Tags hash into a fixed set of slots, so two tags may share a counter. A shared
/// slot only drops a write that was still valid.
#[derive(Debug)]
pub struct TagGenerations {
    slots: Box<[AtomicU64]>,
}

impl TagGenerations {
    pub fn new() -> Self {
        Self {
            slots: (0..GENERATION_SLOTS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn slot(&self, tag: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        tag.hash(&mut hasher);
        (hasher.finish() % self.slots.len() as u64) as usize
    }

    /// Advance the generation of every tag
    pub fn bump<'a, I>(&self, tags: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            self.slots[self.slot(tag)].fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Record the current generation of every tag
    pub fn snapshot<'a, I>(self: &Arc<Self>, tags: I) -> TagSnapshot
    where
        I: IntoIterator<Item = &'a String>,
    {
        let seen = tags
            .into_iter()
            .map(|tag| {
                let slot = self.slot(tag);
                (slot, self.slots[slot].load(Ordering::SeqCst))
            })
            .collect();
        TagSnapshot {
            generations: self.clone(),
            seen,
        }
    }
}

impl Default for TagGenerations {
    fn default() -> Self {
        Self::new()
    }
}

/// Tag generations observed at one point in time
#[derive(Debug, Clone)]
pub struct TagSnapshot {
    generations: Arc<TagGenerations>,
    seen: Vec<(usize, u64)>,
}

impl TagSnapshot {
    /// No tag in the snapshot was invalidated since it was taken
    pub fn is_current(&self) -> bool {
        self.seen
            .iter()
            .all(|(slot, generation)| self.generations.slots[*slot].load(Ordering::SeqCst) == *generation)
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: RouteCacheRule,
    pattern: Regex,
}

impl CompiledRule {
    fn compile(rule: RouteCacheRule) -> CacheResult<Self> {
        let mut source = String::from("^");
        let path = rule.path.trim_end_matches('/');

        for segment in path.split('/').skip(1) {
            source.push('/');
            if segment == "*" {
                source.push_str(".*");
            } else if segment.starts_with(':') {
                source.push_str("[^/]+");
            } else {
                source.push_str(&regex::escape(segment));
            }
        }
        if path.is_empty() {
            source.push('/');
        }
        source.push_str("/?$");

        let pattern = Regex::new(&source).map_err(|e| CacheError::Configuration {
            message: format!("Invalid route pattern {}: {}", rule.path, e),
        })?;
        Ok(Self { rule, pattern })
    }

    fn matches(&self, request: &RequestDescriptor) -> bool {
        let method_matches = self
            .rule
            .method
            .as_deref()
            .map(|method| method.eq_ignore_ascii_case(request.method.as_str()))
            .unwrap_or(true);

        method_matches && self.pattern.is_match(&request.path)
    }
}

/// Cache invalidation manager
pub struct InvalidationManager {
    rules: Vec<CompiledRule>,

    generations: Arc<TagGenerations>,

    /// Event broadcaster
    event_sender: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationManager {
    /// Create a new invalidation manager from route rules
    pub fn new(rules: &[RouteCacheRule]) -> CacheResult<Self> {
        let rules = rules
            .iter()
            .cloned()
            .map(CompiledRule::compile)
            .collect::<CacheResult<Vec<_>>>()?;
        let (event_sender, _) = broadcast::channel(1000);

        info!("Invalidation manager loaded {} route cache rules", rules.len());
        Ok(Self {
            rules,
            generations: Arc::new(TagGenerations::new()),
            event_sender,
        })
    }

    /// Subscribe to invalidation events
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.event_sender.subscribe()
    }

    /// Current generations of `tags`, checked before a deferred cache write lands
    pub fn snapshot<'a, I>(&self, tags: I) -> TagSnapshot
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.generations.snapshot(tags)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Merge every rule matching the request
    ///
    /// Tags and invalidation tags accumulate, the first TTL override wins, and a
    /// single non-cacheable rule makes the request non-cacheable.
    pub fn policy_for(&self, request: &RequestDescriptor) -> RouteCachePolicy {
        let mut policy = RouteCachePolicy {
            cacheable: true,
            tags: CacheKeyGenerator::default_tag(&request.path)
                .into_iter()
                .collect(),
            invalidate_on: Vec::new(),
            ttl: None,
        };

        for compiled in self.rules.iter().filter(|rule| rule.matches(request)) {
            let rule = &compiled.rule;
            policy.cacheable &= rule.cacheable;
            policy.tags.extend(rule.tags.iter().cloned());
            for tag in &rule.invalidate_on {
                if !policy.invalidate_on.contains(tag) {
                    policy.invalidate_on.push(tag.clone());
                }
            }
            if policy.ttl.is_none() {
                policy.ttl = rule.ttl;
            }
        }

        policy
    }

    /// Invalidate every entry carrying one of `tags` and notify subscribers
    pub async fn invalidate<S>(
        &self,
        store: &S,
        tags: &[String],
        trigger: Option<String>,
    ) -> CacheResult<usize>
    where
        S: CacheStore + ?Sized,
    {
        if tags.is_empty() {
            return Ok(0);
        }

        // Bumped before the store is touched so a write racing this call either
        // sees the new generation or lands before the entries are removed
        self.generations.bump(tags);
        let removed = store.invalidate_by_tags(tags).await?;
        debug!(?tags, removed, trigger = trigger.as_deref(), "Invalidated cache tags");

        // No subscribers is fine
        let _ = self.event_sender.send(InvalidationEvent {
            tags: tags.to_vec(),
            removed,
            trigger,
            at: chrono::Utc::now(),
        });

        Ok(removed)
    }
}
