//! Error types for the offline asset cache.
//!
//! Lifecycle hooks and the fetch-intercept path return `CacheResult<T>`.
//! Transport and storage internals use `anyhow` and are folded into one of
//! these variants at the component boundary.

use thiserror::Error;

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Every failure the cache surfaces to its host.
///
/// Cloneable so one single-flighted network outcome can be handed to every
/// waiting request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("install of cache '{cache_name}' failed: {reason}")]
    InstallFailed { cache_name: String, reason: String },

    #[error("network fetch of {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("cache storage error: {0}")]
    Storage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("proxy server error: {0}")]
    Server(String),

    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
}

impl CacheError {
    /// Wrap a transport failure for `url`, keeping the whole context chain.
    pub fn network(url: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Network {
            url: url.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn storage(err: &anyhow::Error) -> Self {
        Self::Storage(format!("{:#}", err))
    }

    /// True for failures caused by the network transport.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}
