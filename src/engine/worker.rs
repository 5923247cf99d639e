// Offline cache lifecycle — install, activate, and the cache-first fetch intercept.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::request::{AssetRequest, CacheKey, MatchOptions};
use super::response::CachedResponse;
use super::stats::{StatsCollector, StatsSnapshot};
use super::store::{CacheNamespace, CacheStorage};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::source::traits::NetworkSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, install not attempted yet.
    Parsed,
    Installing,
    /// Install succeeded; waiting for activation.
    Installed,
    /// Install failed; the host may call `install` again.
    InstallFailed,
    /// Intercepting fetches.
    Active,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::InstallFailed => "install-failed",
            Self::Active => "active",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub cache_name: String,
    /// Distinct entries written by the install batch.
    pub entries: usize,
}

type InflightFetch = Arc<OnceCell<CacheResult<CachedResponse>>>;

/// Leaves `Installing` for `InstallFailed` if an install future is dropped
/// before it finishes.
struct InstallGuard<'a> {
    state: &'a Mutex<LifecycleState>,
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::Installing {
            warn!("install abandoned before completion");
            *state = LifecycleState::InstallFailed;
        }
    }
}

/// Cache-first proxy over a single versioned namespace.
pub struct OfflineAssetCache {
    config: CacheConfig,
    origin: Url,
    storage: Arc<CacheStorage>,
    source: Arc<dyn NetworkSource>,
    state: Mutex<LifecycleState>,
    inflight: Mutex<HashMap<CacheKey, InflightFetch>>,
    stats: Arc<StatsCollector>,
}

impl OfflineAssetCache {
    pub fn new(
        config: CacheConfig,
        storage: Arc<CacheStorage>,
        source: Arc<dyn NetworkSource>,
    ) -> CacheResult<Self> {
        config.validate()?;
        let origin = config.origin_url()?;
        Ok(Self {
            config,
            origin,
            storage,
            source,
            state: Mutex::new(LifecycleState::Parsed),
            inflight: Mutex::new(HashMap::new()),
            stats: Arc::new(StatsCollector::new()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    /// A GET for `path` (which may carry a query string) under the origin.
    /// Paths that resolve outside the origin are `InvalidRequest`.
    pub fn request_for(&self, path: &str) -> CacheResult<AssetRequest> {
        AssetRequest::get_relative(&self.origin, path.trim_start_matches('/'))
    }

    async fn namespace(&self) -> CacheResult<Arc<CacheNamespace>> {
        self.storage
            .open(&self.config.cache_name)
            .await
            .map_err(|e| CacheError::storage(&e))
    }

    /// Pre-cache every manifest entry as one batch.
    ///
    /// Fails if any entry cannot be fetched or answers with a non-OK status;
    /// in that case nothing from the batch is written.
    pub async fn install(&self) -> CacheResult<InstallReport> {
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Parsed | LifecycleState::InstallFailed => {
                    *state = LifecycleState::Installing;
                }
                other => {
                    return Err(CacheError::InvalidState {
                        action: "install",
                        state: other.to_string(),
                    });
                }
            }
        }

        let _guard = InstallGuard { state: &self.state };
        let result = self.run_install().await;
        let next = if result.is_ok() {
            LifecycleState::Installed
        } else {
            LifecycleState::InstallFailed
        };
        *self.state.lock() = next;
        result
    }

    async fn run_install(&self) -> CacheResult<InstallReport> {
        let cache_name = self.config.cache_name.clone();
        let install_failed = |reason: String| CacheError::InstallFailed {
            cache_name: cache_name.clone(),
            reason,
        };

        let ns = self
            .namespace()
            .await
            .map_err(|e| install_failed(e.to_string()))?;

        let requests = self
            .config
            .manifest
            .iter()
            .map(|path| self.request_for(path))
            .collect::<CacheResult<Vec<_>>>()
            .map_err(|e| install_failed(e.to_string()))?;

        info!(
            "installing cache {} ({} manifest entries)",
            cache_name,
            requests.len()
        );
        match ns.add_all(self.source.as_ref(), &requests).await {
            Ok(entries) => {
                info!("cache {} installed with {} entries", cache_name, entries);
                Ok(InstallReport {
                    cache_name: cache_name.clone(),
                    entries,
                })
            }
            Err(e) => {
                warn!("cache {} install failed: {:#}", cache_name, e);
                Err(install_failed(format!("{:#}", e)))
            }
        }
    }

    /// Move from installed to active. Idempotent once active.
    pub async fn activate(&self) -> CacheResult<()> {
        match self.state() {
            LifecycleState::Installed => {}
            LifecycleState::Active => return Ok(()),
            other => {
                return Err(CacheError::InvalidState {
                    action: "activate",
                    state: other.to_string(),
                });
            }
        }

        if self.config.prune_stale_namespaces {
            self.prune_stale_namespaces().await?;
        }

        *self.state.lock() = LifecycleState::Active;
        info!("offline cache {} initialized", self.config.cache_name);
        Ok(())
    }

    async fn prune_stale_namespaces(&self) -> CacheResult<()> {
        let names = self
            .storage
            .keys()
            .await
            .map_err(|e| CacheError::storage(&e))?;
        for name in names.iter().filter(|n| **n != self.config.cache_name) {
            self.storage
                .delete(name)
                .await
                .map_err(|e| CacheError::storage(&e))?;
            info!("pruned stale cache namespace {}", name);
        }
        Ok(())
    }

    /// Answer an intercepted request: stored response if present (query string
    /// ignored), otherwise the network response, which is also stored.
    ///
    /// Before activation, and for anything but GET, the request goes straight
    /// to the network and nothing is stored.
    pub async fn handle_fetch(&self, request: &AssetRequest) -> CacheResult<CachedResponse> {
        if self.state() != LifecycleState::Active || !request.is_get() {
            self.stats.record_passthrough();
            debug!("passthrough {} {}", request.method, request.url);
            return self.fetch_network(request).await;
        }

        let ns = self.namespace().await?;
        if let Some(hit) = ns.match_request(request, MatchOptions::ignore_search()) {
            debug!("cache hit {}", request.url);
            self.stats.record_hit(hit.content_length());
            return Ok(hit);
        }

        debug!("cache miss {}", request.url);
        self.stats.record_miss();
        if self.config.dedupe_inflight {
            self.fetch_single_flight(&ns, request).await
        } else {
            self.fetch_and_store(&ns, request).await
        }
    }

    async fn fetch_network(&self, request: &AssetRequest) -> CacheResult<CachedResponse> {
        self.stats.fetch_started();
        let result = self.source.fetch(request).await;
        self.stats.fetch_finished();

        match result {
            Ok(resp) => {
                self.stats.record_network_served(resp.content_length());
                Ok(resp)
            }
            Err(e) => {
                self.stats.record_network_failure();
                warn!("network fetch failed {}: {:#}", request.url, e);
                Err(CacheError::network(request.url.as_str(), &e))
            }
        }
    }

    async fn fetch_and_store(
        &self,
        ns: &CacheNamespace,
        request: &AssetRequest,
    ) -> CacheResult<CachedResponse> {
        let response = self.fetch_network(request).await?;
        let (stored, returned) = response.duplicate();
        let len = stored.content_length();

        // A failed write does not fail the request; the next miss retries it.
        match ns.put(request, stored).await {
            Ok(()) => self.stats.record_stored(len),
            Err(e) => warn!("cache write failed {}: {:#}", request.url, e),
        }
        Ok(returned)
    }

    /// Concurrent misses on one key share a single network fetch.
    async fn fetch_single_flight(
        &self,
        ns: &CacheNamespace,
        request: &AssetRequest,
    ) -> CacheResult<CachedResponse> {
        let key = request.key();
        let cell = {
            let mut inflight = self.inflight.lock();
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| self.fetch_and_store(ns, request))
            .await
            .clone();

        {
            let mut inflight = self.inflight.lock();
            if inflight
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                inflight.remove(&key);
            }
        }
        result
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let entries = match self.namespace().await {
            Ok(ns) => ns.len(),
            Err(_) => 0,
        };
        self.stats.snapshot(entries)
    }
}
