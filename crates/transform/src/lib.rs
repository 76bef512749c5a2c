//! curlme transform: populates a resource's data from the URL named in its
//! watched annotation (`<dataKey>=<url>`).

#![forbid(unsafe_code)]

use std::sync::Arc;

use curlme_core::{Resource, Transform, TransformError};
use tracing::debug;
use url::Url;

pub mod fetch;

pub use fetch::{Fetch, HttpFetcher};

/// Annotation watched when none is configured.
pub const DEFAULT_ANNOTATION: &str = "x-k8s.io/curl-me-that";

/// Split a directive into `(data key, url)`. Exactly one `=` with text on
/// both sides.
pub fn parse_directive(value: &str) -> Result<(String, String), TransformError> {
    let parts: Vec<&str> = value.split('=').collect();
    match parts.as_slice() {
        [key, url] if !key.is_empty() && !url.is_empty() => Ok(((*key).to_string(), (*url).to_string())),
        _ => Err(TransformError::Directive(value.to_string())),
    }
}

/// Accept absolute http(s) URLs as-is; anything else is retried with an
/// `https://` prefix.
pub fn normalize_url(raw: &str) -> Result<Url, TransformError> {
    if let Ok(u) = Url::parse(raw) {
        if matches!(u.scheme(), "http" | "https") && u.has_host() {
            return Ok(u);
        }
    }
    Url::parse(&format!("https://{}", raw))
        .map_err(|e| TransformError::InvalidUrl { url: raw.to_string(), reason: e.to_string() })
}

/// Fills `data[<dataKey>]` with the body fetched from the directive's URL.
pub struct DataPopulator {
    fetcher: Arc<dyn Fetch>,
    annotation: String,
}

impl DataPopulator {
    pub fn new(fetcher: Arc<dyn Fetch>, annotation: impl Into<String>) -> Self {
        Self { fetcher, annotation: annotation.into() }
    }

    pub fn annotation(&self) -> &str { &self.annotation }
}

#[async_trait::async_trait]
impl Transform for DataPopulator {
    async fn transform(&self, mut resource: Resource) -> Result<Option<Resource>, TransformError> {
        let Some(directive) = resource.annotation(&self.annotation) else {
            return Ok(None);
        };
        let (data_key, raw_url) = parse_directive(directive)?;
        let url = normalize_url(&raw_url)?;
        debug!(key = %resource.key(), data_key = %data_key, url = %url, "fetching directive");
        let body = self.fetcher.fetch(&url).await?;
        resource.data.insert(data_key, body);
        Ok(Some(resource))
    }
}
