//! Plain-body HTTP fetch.

use std::time::Duration;

use anyhow::{Context, Result};
use curlme_core::TransformError;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

/// Fetches a URL and returns its body as text.
#[async_trait::async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<String, TransformError>;
}

/// reqwest-backed fetcher. Every request is bounded by the client timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self { Self { client } }
}

/// Render an error with its causes; reqwest keeps the interesting part
/// (e.g. "connection refused") in the source chain.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut cur = e.source();
    while let Some(src) = cur {
        out.push_str(": ");
        out.push_str(&src.to_string());
        cur = src.source();
    }
    out
}

#[async_trait::async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, TransformError> {
        let res = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TransformError::Fetch(error_chain(&e)))?;
        let status = res.status();
        if status != StatusCode::OK {
            return Err(TransformError::Status(status.as_u16()));
        }
        let body = res.text().await.map_err(|e| TransformError::Body(error_chain(&e)))?;
        debug!(url = %url, bytes = body.len(), "fetched");
        Ok(body)
    }
}
