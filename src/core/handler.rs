//! The downstream request handler the tiering layer delegates to.

use async_trait::async_trait;
use std::future::Future;

use crate::core::error::GatewayResult;
use crate::core::types::{GatewayResponse, RequestDescriptor};

/// Business handler invoked when a request is not served from cache
///
/// Errors returned here belong to the caller and are passed through unchanged.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: RequestDescriptor) -> GatewayResult<GatewayResponse>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(RequestDescriptor) -> Fut + Send + Sync,
    Fut: Future<Output = GatewayResult<GatewayResponse>> + Send,
{
    async fn call(&self, request: RequestDescriptor) -> GatewayResult<GatewayResponse> {
        (self)(request).await
    }
}
