// Axum request handler — runs every incoming request through the offline cache.

use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::engine::request::HOP_BY_HOP;
use crate::engine::response::CachedResponse;
use crate::engine::worker::OfflineAssetCache;
use crate::error::CacheError;

pub struct ProxyServer {
    port: u16,
    cache: Arc<OfflineAssetCache>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ProxyServer {
    /// Start the proxy server on a random local port, returning a handle.
    pub async fn start(cache: Arc<OfflineAssetCache>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .fallback(intercept_handler)
            .with_state(cache.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        info!(
            "offline cache proxy for {} listening on 127.0.0.1:{}",
            cache.origin(),
            port
        );

        Ok(Self {
            port,
            cache,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Proxy URL for a path (with optional query) under the origin.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "http://127.0.0.1:{}/{}",
            self.port,
            path.trim_start_matches('/')
        )
    }

    pub fn cache(&self) -> &Arc<OfflineAssetCache> {
        &self.cache
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

/// Parse a Range header value.
/// Supports:
/// - bytes=start-end
/// - bytes=start-
/// - bytes=-suffix_len
fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let value = value.trim();
    let rest = value.strip_prefix("bytes=")?;
    let mut parts = rest.splitn(2, '-');
    let start_str = parts.next()?.trim();
    let end_str = parts.next()?.trim();

    if start_str.is_empty() {
        let len: u64 = end_str.parse().ok()?;
        if len == 0 {
            return None;
        }
        Some(ParsedRange::Suffix { len })
    } else {
        let start: u64 = start_str.parse().ok()?;
        let end_inclusive = if end_str.is_empty() {
            None
        } else {
            Some(end_str.parse::<u64>().ok()?)
        };
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive,
        })
    }
}

/// Resolve a parsed range against `total` bytes into `[start, end)`.
/// `None` means the range cannot be satisfied.
fn resolve_range(range: &ParsedRange, total: u64) -> Option<(u64, u64)> {
    match *range {
        ParsedRange::StartEnd {
            start,
            end_inclusive,
        } => {
            let end = match end_inclusive {
                Some(e) => e.saturating_add(1).min(total),
                None => total,
            };
            if start >= total || end <= start {
                return None;
            }
            Some((start, end))
        }
        ParsedRange::Suffix { len } => {
            if total == 0 {
                return None;
            }
            Some((total.saturating_sub(len), total))
        }
    }
}

/// Client headers that stay at the proxy. Range and conditional headers are
/// answered here from the full stored body, so they never reach the origin.
const NOT_FORWARDED: &[&str] = &[
    "host",
    "content-length",
    "accept-encoding",
    "range",
    "if-range",
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
];

fn forwards_header(name: &str) -> bool {
    !HOP_BY_HOP.contains(&name) && !NOT_FORWARDED.contains(&name)
}

/// Every path — answer from the cache or the network.
async fn intercept_handler(
    State(cache): State<Arc<OfflineAssetCache>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut request = match cache.request_for(path) {
        Ok(r) => r.with_body(body),
        Err(e) => {
            debug!("rejected {}: {}", path, e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    request.method = method.clone();
    for (name, value) in headers.iter() {
        if !forwards_header(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }

    debug!("intercept {} {}", request.method, request.url);

    match cache.handle_fetch(&request).await {
        Ok(resp) => {
            let range = headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_range_header);
            match range {
                Some(range) if method == Method::GET && resp.status == 200 => {
                    range_response(resp, &range)
                }
                _ => full_response(resp),
            }
        }
        Err(e @ CacheError::Network { .. }) => {
            error!("intercept failed: {}", e);
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
        Err(e) => {
            error!("intercept failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn response_headers(resp: &CachedResponse) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (k, v) in &resp.headers {
        if k.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(k.as_bytes()),
            HeaderValue::from_str(v),
        ) {
            out.append(name, value);
        }
    }
    out
}

fn full_response(resp: CachedResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = response_headers(&resp);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(resp.body.len()));
    (status, headers, resp.body).into_response()
}

/// Serve a slice of a cached full body.
fn range_response(resp: CachedResponse, range: &ParsedRange) -> Response {
    let total = resp.content_length();
    let mut headers = response_headers(&resp);
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let Some((start, end)) = resolve_range(range, total) else {
        if let Ok(v) = HeaderValue::from_str(&format!("bytes */{}", total)) {
            headers.insert(header::CONTENT_RANGE, v);
        }
        return (StatusCode::RANGE_NOT_SATISFIABLE, headers, "range not satisfiable")
            .into_response();
    };

    let body = resp.body.slice(start as usize..end as usize);
    // Content-Range: bytes start-end/total (end is inclusive in HTTP).
    let content_range = format!("bytes {}-{}/{}", start, end - 1, total);
    if let Ok(v) = HeaderValue::from_str(&content_range) {
        headers.insert(header::CONTENT_RANGE, v);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    (StatusCode::PARTIAL_CONTENT, headers, body).into_response()
}
