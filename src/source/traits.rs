use anyhow::Result;
use async_trait::async_trait;

use crate::engine::request::AssetRequest;
use crate::engine::response::CachedResponse;

/// The real network behind the cache.
///
/// `Ok` for any response the server produced, whatever its status. `Err`
/// only when no response was obtained at all.
#[async_trait]
pub trait NetworkSource: Send + Sync {
    async fn fetch(&self, request: &AssetRequest) -> Result<CachedResponse>;
}
