use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::error::{CacheError, CacheResult};

/// Namespace used when the configuration does not name one.
pub const DEFAULT_CACHE_NAME: &str = "WonderGolf-static-v1";

/// Files the game build needs to start without a network.
pub const DEFAULT_MANIFEST: &[&str] = &[
    "index.html",
    "manifest.json",
    "WonderlandRuntime-LoadingScreen.bin",
    "WonderlandRuntime-physx.wasm",
    "WonderlandRuntime-physx.js",
    "WonderlandRuntime-physx-simd.wasm",
    "WonderlandRuntime-physx-simd.js",
    "WonderlandRuntime-physx-threads.wasm",
    "WonderlandRuntime-physx-threads.js",
    "WonderlandRuntime-physx-threads.worker.js",
    "WonderlandRuntime-physx-simd-threads.wasm",
    "WonderlandRuntime-physx-simd-threads.js",
    "WonderlandRuntime-physx-simd-threads.worker.js",
    "maid.gif",
    "videoplayback2.mp4",
    "videoplayback.mp4",
    "offline-video.mp4",
    "sfx/unclick.wav",
    "sfx/click.wav",
];

/// Extension of the file holding one stored entry (metadata header + body).
pub const STORE_ENTRY_EXT: &str = "entry";

/// Extension of in-progress entry writes; leftovers are removed on open.
pub const STORE_TMP_EXT: &str = "tmp";

/// Top-level configuration for the offline cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Versioned namespace the cache reads and writes.
    pub cache_name: String,
    /// Base URL that manifest entries and proxied paths are resolved against.
    pub origin: String,
    /// Relative paths pre-cached during install.
    pub manifest: Vec<String>,
    /// Directory for durable namespaces. Empty keeps everything in memory.
    pub cache_dir: String,
    /// Share one network fetch between concurrent misses on the same key.
    pub dedupe_inflight: bool,
    /// Delete every other namespace when the cache activates.
    pub prune_stale_namespaces: bool,
    /// Per-request network timeout in seconds; 0 disables it.
    pub request_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            origin: "http://127.0.0.1:8080/".to_string(),
            manifest: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
            cache_dir: String::new(),
            dedupe_inflight: false,
            prune_stale_namespaces: false,
            request_timeout_secs: 0,
        }
    }
}

impl CacheConfig {
    /// Build a config for `origin` with an explicit namespace and manifest.
    pub fn new(cache_name: &str, origin: &str, manifest: &[&str]) -> Self {
        Self {
            cache_name: cache_name.to_string(),
            origin: origin.to_string(),
            manifest: manifest.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> CacheResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CacheError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub async fn load(path: &Path) -> CacheResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            CacheError::Config(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.cache_name.trim().is_empty() {
            return Err(CacheError::Config("cache_name must not be empty".into()));
        }
        if self.cache_name.contains(['/', '\\']) || self.cache_name.starts_with('.') {
            return Err(CacheError::Config(format!(
                "cache_name '{}' is not usable as a directory name",
                self.cache_name
            )));
        }
        let origin = self.origin_url()?;
        for entry in &self.manifest {
            origin.join(entry).map_err(|e| {
                CacheError::Config(format!("manifest entry '{}': {}", entry, e))
            })?;
        }
        Ok(())
    }

    /// The origin as a URL whose path always ends in `/` and which carries no
    /// query or fragment, so relative joins land beneath it.
    pub fn origin_url(&self) -> CacheResult<Url> {
        let mut url = Url::parse(&self.origin)
            .map_err(|e| CacheError::Config(format!("origin '{}': {}", self.origin, e)))?;
        if url.cannot_be_a_base() {
            return Err(CacheError::Config(format!(
                "origin '{}' cannot be a base URL",
                self.origin
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}
