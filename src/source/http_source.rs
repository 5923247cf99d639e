use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

use super::traits::NetworkSource;
use crate::engine::request::{AssetRequest, HOP_BY_HOP};
use crate::engine::response::CachedResponse;

pub struct HttpSource {
    client: Client,
    headers: Arc<RwLock<HashMap<String, String>>>,
}

impl HttpSource {
    pub fn new(headers: HashMap<String, String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build().context("building http client")?,
            headers: Arc::new(RwLock::new(headers)),
        })
    }

    /// Replace the headers added to every outgoing request (e.g. after token refresh).
    pub fn update_headers(&self, new_headers: HashMap<String, String>) {
        *self.headers.write() = new_headers;
    }

    fn build_request(&self, request: &AssetRequest) -> RequestBuilder {
        let headers = self.headers.read().clone();

        let mut req = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if !request.body.is_empty() {
            req = req.body(request.body.clone());
        }
        req
    }
}

#[async_trait]
impl NetworkSource for HttpSource {
    async fn fetch(&self, request: &AssetRequest) -> Result<CachedResponse> {
        let resp = self
            .build_request(request)
            .send()
            .await
            .with_context(|| format!("{} {}", request.method, request.url))?;

        let status = resp.status();
        if status.is_success() {
            debug!("http fetch status={} url={}", status.as_u16(), request.url);
        } else {
            warn!("http fetch status={} url={}", status.as_u16(), request.url);
        }

        let headers = resp
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = resp
            .bytes()
            .await
            .with_context(|| format!("reading body of {}", request.url))?;

        Ok(CachedResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}
