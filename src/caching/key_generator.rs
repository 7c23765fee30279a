//! # Cache Key Generator
//!
//! Derives the three keys the tiering layer works with from a [`RequestDescriptor`]:
//!
//! - the **direct key** `ultra:{METHOD}:{path}`, read by the UltraFast path
//! - the **layered key** `tier:{METHOD}:{path}`, read by the Fast and Standard paths
//! - the **route key** `{METHOD}:{template}`, naming a learned route pattern
//!
//! Both cache keys carry the sorted query string when there is one, since two
//! requests differing only in their query must never share a cached response.
//! Query strings longer than `max_query_length` are replaced by their SHA-256 digest.

use crate::core::types::RequestDescriptor;
use sha2::{Digest, Sha256};

pub const DIRECT_PREFIX: &str = "ultra";
pub const LAYERED_PREFIX: &str = "tier";

/// Cache key generator
#[derive(Debug, Clone)]
pub struct CacheKeyGenerator {
    max_query_length: usize,
}

impl Default for CacheKeyGenerator {
    fn default() -> Self {
        Self::new(128)
    }
}

impl CacheKeyGenerator {
    pub fn new(max_query_length: usize) -> Self {
        Self { max_query_length }
    }

    /// Key of the single-lookup entry served by the UltraFast path
    pub fn direct_key(&self, request: &RequestDescriptor) -> String {
        self.cache_key(DIRECT_PREFIX, request)
    }

    /// Key of the entry checked in memory and then the remote store
    pub fn layered_key(&self, request: &RequestDescriptor) -> String {
        self.cache_key(LAYERED_PREFIX, request)
    }

    fn cache_key(&self, prefix: &str, request: &RequestDescriptor) -> String {
        let mut key = format!("{}:{}:{}", prefix, request.method, request.path);
        if let Some(query) = request.canonical_query() {
            key.push('?');
            if query.len() > self.max_query_length {
                key.push_str("sha256=");
                key.push_str(&hex::encode(Sha256::digest(query.as_bytes())));
            } else {
                key.push_str(&query);
            }
        }
        key
    }

    /// Normalized `METHOD:template` key of the route a request belongs to
    pub fn route_key(request: &RequestDescriptor) -> String {
        format!("{}:{}", request.method, Self::route_template(request))
    }

    /// Path template with parameter segments replaced by placeholders
    ///
    /// A segment equal to a router parameter becomes `:name` (the alphabetically
    /// first name when several parameters share the value). Otherwise purely numeric
    /// and UUID-shaped segments become `:id`.
    pub fn route_template(request: &RequestDescriptor) -> String {
        if request.path.is_empty() || request.path == "/" {
            return "/".to_string();
        }

        let mut params: Vec<(&String, &String)> = request.params.iter().collect();
        params.sort();

        let segments: Vec<String> = request
            .path
            .split('/')
            .map(|segment| {
                if segment.is_empty() {
                    return String::new();
                }
                if let Some((name, _)) = params.iter().find(|(_, value)| value.as_str() == segment)
                {
                    return format!(":{}", name);
                }
                if is_identifier_segment(segment) {
                    return ":id".to_string();
                }
                segment.to_string()
            })
            .collect();

        segments.join("/")
    }

    /// Tag every cached response carries: its first path segment
    pub fn default_tag(path: &str) -> Option<String> {
        path.split('/')
            .find(|segment| !segment.is_empty())
            .map(|segment| segment.to_string())
    }
}

fn is_identifier_segment(segment: &str) -> bool {
    segment.bytes().all(|b| b.is_ascii_digit()) || uuid::Uuid::parse_str(segment).is_ok()
}
