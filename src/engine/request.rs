// Request identity — the key every stored response is filed under.

use std::fmt;

use bytes::Bytes;
use reqwest::{Method, Url};

use crate::error::{CacheError, CacheResult};

/// Hop-by-hop headers: never forwarded upstream nor replayed from a stored response.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct AssetRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl AssetRequest {
    /// A GET for an absolute URL.
    pub fn get(url: &str) -> CacheResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| CacheError::InvalidRequest(format!("'{}': {}", url, e)))?;
        Ok(Self::new(Method::GET, url))
    }

    /// A GET for `path` resolved against `base`.
    ///
    /// The result must stay beneath `base`: absolute URLs and `..` segments
    /// that climb out of it are rejected.
    pub fn get_relative(base: &Url, path: &str) -> CacheResult<Self> {
        let url = base
            .join(path)
            .map_err(|e| CacheError::InvalidRequest(format!("'{}': {}", path, e)))?;
        if !url.as_str().starts_with(base.as_str()) {
            return Err(CacheError::InvalidRequest(format!(
                "'{}' resolves outside {}",
                path, base
            )));
        }
        Ok(Self::new(Method::GET, url))
    }

    pub fn new(method: Method, mut url: Url) -> Self {
        url.set_fragment(None);
        Self {
            method,
            url,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.as_str().to_string(),
            url: self.url.as_str().to_string(),
        }
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }
}

/// Method + URL (fragment removed, query kept).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// The URL with its query string removed, used when matching with
    /// `ignore_search`.
    pub fn search_stripped(&self) -> &str {
        match self.url.find('?') {
            Some(idx) => &self.url[..idx],
            None => &self.url,
        }
    }

    /// Whether `self` (a stored key) satisfies a lookup for `wanted`.
    pub fn matches(&self, wanted: &CacheKey, opts: MatchOptions) -> bool {
        if !opts.ignore_method && self.method != wanted.method {
            return false;
        }
        if opts.ignore_search {
            self.search_stripped() == wanted.search_stripped()
        } else {
            self.url == wanted.url
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Lookup policy for `match_request`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
    pub ignore_search: bool,
    pub ignore_method: bool,
}

impl MatchOptions {
    pub fn ignore_search() -> Self {
        Self {
            ignore_search: true,
            ignore_method: false,
        }
    }
}
