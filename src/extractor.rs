use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use crate::error::{Error, Result};

pub const DEFAULT_EXTRACTOR_URL: &str = "http://localhost:9998/tika";

/// Converts an uploaded binary into plain text.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, bytes: Vec<u8>) -> Result<String>;
}

/// Client for an Apache Tika style server: `PUT` the raw bytes, read the
/// text back.
#[derive(Debug, Clone)]
pub struct TikaExtractor {
    client: reqwest::Client,
    url: String,
}

impl TikaExtractor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ContentExtractor for TikaExtractor {
    async fn extract(&self, bytes: Vec<u8>) -> Result<String> {
        let response = self
            .client
            .put(&self.url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(ACCEPT, "text/plain")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upstream(format!(
                "{} returned {status}",
                self.url
            )));
        }

        let body = response.bytes().await?;
        String::from_utf8(body.to_vec()).map_err(|_| {
            Error::Upstream(format!("{} returned a non-UTF-8 body", self.url))
        })
    }
}
