//! # Response Cache
//!
//! Storage format for cached responses and the handler decorator that persists a
//! response once the real handler has produced it.
//!
//! Writes are fire-and-forget: they run on a [`TaskTracker`] so the response is
//! returned without waiting for the cache, and a failed write is only logged. A
//! write guarded by a [`TagSnapshot`] is dropped if one of its tags was invalidated
//! after the snapshot was taken, and undone if the invalidation raced the write.

use super::invalidation::TagSnapshot;
use super::{CacheError, CacheResult, CacheSetOptions, CacheStore};
use crate::core::error::GatewayResult;
use crate::core::handler::Handler;
use crate::core::types::{GatewayResponse, RequestDescriptor};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Header set on every response the tiering layer handled
pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Headers never stored with a cached response
const UNCACHED_HEADERS: &[&str] = &[
    CACHE_STATUS_HEADER,
    "connection",
    "keep-alive",
    "transfer-encoding",
    "set-cookie",
    "date",
];

/// Serialized form of a cached response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub cached_at: chrono::DateTime<chrono::Utc>,
}

impl CachedResponse {
    pub fn from_response(response: &GatewayResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .filter(|(name, _)| !UNCACHED_HEADERS.contains(&name.as_str()))
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.to_string(), value.to_string()))
                })
                .collect(),
            body: response.body.to_vec(),
            cached_at: chrono::Utc::now(),
        }
    }

    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> CacheResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn into_response(self) -> CacheResult<GatewayResponse> {
        let status = StatusCode::from_u16(self.status).map_err(|e| CacheError::Store {
            message: format!("Invalid cached status code: {}", e),
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), HeaderValue::from_str(&value))
            {
                headers.append(name, value);
            }
        }

        Ok(GatewayResponse::new(status, headers, self.body))
    }
}

/// Whether a handler response may be stored
///
/// Only successful responses are cached, and a response can opt out with
/// `cache-control: no-store` or `private`.
pub fn is_storable(response: &GatewayResponse) -> bool {
    if !response.is_success() {
        return false;
    }
    response
        .header("cache-control")
        .map(|value| {
            let value = value.to_ascii_lowercase();
            !(value.contains("no-store") || value.contains("private"))
        })
        .unwrap_or(true)
}

/// Which keys a response is written under, and with what TTL and tags
#[derive(Debug, Clone)]
pub struct CacheWritePlan {
    pub keys: Vec<String>,
    pub options: CacheSetOptions,
    guard: Option<TagSnapshot>,
}

impl CacheWritePlan {
    pub fn new(keys: Vec<String>, options: CacheSetOptions) -> Self {
        Self {
            keys,
            options,
            guard: None,
        }
    }

    /// Only write while no tag in `snapshot` has been invalidated
    pub fn guarded_by(mut self, snapshot: TagSnapshot) -> Self {
        self.guard = Some(snapshot);
        self
    }

    fn is_current(&self) -> bool {
        self.guard.as_ref().map_or(true, TagSnapshot::is_current)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() || self.options.ttl.is_zero()
    }

    /// Serialize the response now and write it in the background
    pub fn spawn(
        self,
        tracker: &TaskTracker,
        store: Arc<dyn CacheStore>,
        response: &GatewayResponse,
    ) {
        if self.is_empty() || !is_storable(response) {
            return;
        }

        let encoded = match CachedResponse::from_response(response).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                debug!("Skipping cache write, response not serializable: {}", e);
                return;
            }
        };

        tracker.spawn(async move { self.write(&*store, &encoded).await });
    }

    /// Write `value` under every key unless a guarded tag was invalidated
    pub async fn write<S>(&self, store: &S, value: &[u8])
    where
        S: CacheStore + ?Sized,
    {
        if !self.is_current() {
            debug!(keys = ?self.keys, "Skipping cache write, tags invalidated since the request started");
            return;
        }

        for key in &self.keys {
            if let Err(e) = store.set(key, value, &self.options).await {
                debug!("Cache write for key {} failed: {}", key, e);
            }
        }

        if !self.is_current() {
            debug!(keys = ?self.keys, "Invalidation raced a cache write, removing it");
            for key in &self.keys {
                if let Err(e) = store.delete(key).await {
                    debug!("Removing raced cache write for key {} failed: {}", key, e);
                }
            }
        }
    }
}

/// Handler decorator that persists the inner handler's response
pub struct CachingHandler {
    inner: Arc<dyn Handler>,
    store: Arc<dyn CacheStore>,
    plan: CacheWritePlan,
    tracker: TaskTracker,
}

impl CachingHandler {
    pub fn new(
        inner: Arc<dyn Handler>,
        store: Arc<dyn CacheStore>,
        plan: CacheWritePlan,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            inner,
            store,
            plan,
            tracker,
        }
    }
}

#[async_trait]
impl Handler for CachingHandler {
    async fn call(&self, request: RequestDescriptor) -> GatewayResult<GatewayResponse> {
        let response = self.inner.call(request).await?;
        self.plan
            .clone()
            .spawn(&self.tracker, self.store.clone(), &response);
        Ok(response)
    }
}
