use std::collections::HashMap;
use std::sync::Arc;

use super::logging::init_tracing;
use crate::config::CacheConfig;
use crate::engine::stats::StatsSnapshot;
use crate::engine::store::CacheStorage;
use crate::engine::worker::{InstallReport, OfflineAssetCache};
use crate::error::{CacheError, CacheResult};
use crate::server::handler::ProxyServer;
use crate::source::http_source::HttpSource;
use crate::source::traits::NetworkSource;

/// A running, activated cache and the proxy in front of it.
pub struct CacheHandle {
    server: ProxyServer,
    install: InstallReport,
}

impl CacheHandle {
    /// Proxy URL for a path under the origin.
    pub fn proxy_url(&self, path: &str) -> String {
        self.server.url_for(path)
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn cache(&self) -> &Arc<OfflineAssetCache> {
        self.server.cache()
    }

    pub fn install_report(&self) -> &InstallReport {
        &self.install
    }

    /// Return a snapshot of current cache statistics.
    pub async fn stats(&self) -> StatsSnapshot {
        self.server.cache().stats().await
    }

    /// Stop the proxy. Stored entries stay in place.
    pub fn shutdown(self) {
        self.server.shutdown();
    }
}

/// Storage selected by `config.cache_dir`: on disk when set, in memory otherwise.
pub fn storage_for(config: &CacheConfig) -> CacheStorage {
    if config.cache_dir.is_empty() {
        CacheStorage::in_memory()
    } else {
        CacheStorage::on_disk(&config.cache_dir)
    }
}

/// Build the cache over the real network, install, activate, and start the proxy.
pub async fn start_offline_cache(config: CacheConfig) -> CacheResult<CacheHandle> {
    init_tracing();
    let source = HttpSource::new(HashMap::new(), config.request_timeout())
        .map_err(|e| CacheError::Config(format!("{:#}", e)))?;
    start_with_source(config, Arc::new(source)).await
}

/// Same as `start_offline_cache` with a caller-supplied transport.
pub async fn start_with_source(
    config: CacheConfig,
    source: Arc<dyn NetworkSource>,
) -> CacheResult<CacheHandle> {
    let storage = Arc::new(storage_for(&config));
    let cache = Arc::new(OfflineAssetCache::new(config, storage, source)?);

    let install = cache.install().await?;
    cache.activate().await?;

    let server = ProxyServer::start(cache)
        .await
        .map_err(|e| CacheError::Server(format!("{:#}", e)))?;
    Ok(CacheHandle { server, install })
}
