/// Web3.Storage primary store.
///
/// Uses the HTTP upload API: the raw bytes are the request body, the file
/// name travels in `X-Name`, and the response carries the root CID.
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{http_client, ContentStore};
use crate::error::{AnchorError, Result};

const PROVIDER: &str = "Web3.Storage";

#[derive(Debug, Clone)]
pub struct Web3StorageConfig {
    /// API base (e.g., "https://api.web3.storage").
    pub api_url: String,
    /// API token.
    pub token: String,
}

pub struct Web3Storage {
    client: Client,
    config: Web3StorageConfig,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    cid: String,
}

fn storage_err(message: impl Into<String>) -> AnchorError {
    AnchorError::Storage {
        provider: PROVIDER.to_string(),
        message: message.into(),
    }
}

impl Web3Storage {
    pub fn new(config: Web3StorageConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(PROVIDER)?,
            config,
        })
    }
}

#[async_trait]
impl ContentStore for Web3Storage {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn put(&self, data: &[u8], filename: &str) -> Result<String> {
        if self.config.token.is_empty() {
            return Err(storage_err("no API token configured"));
        }

        let resp = self
            .client
            .post(format!("{}/upload", self.config.api_url.trim_end_matches('/')))
            .bearer_auth(&self.config.token)
            .header("X-Name", filename)
            .header("Content-Type", "application/json")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| storage_err(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(storage_err(format!("{status}: {body}")));
        }

        let upload: UploadResponse = resp
            .json()
            .await
            .map_err(|e| storage_err(format!("response parse error: {e}")))?;

        Ok(upload.cid)
    }
}
