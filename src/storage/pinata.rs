/// Pinata fallback store.
///
/// Pins through the REST `pinFileToIPFS` endpoint. The record is staged in a
/// temporary file and streamed from disk as a multipart upload; the file is
/// removed when the upload finishes, whatever its outcome.
use std::io::Write;

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{Body, Client};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::warn;

use super::{http_client, ContentStore};
use crate::error::{AnchorError, Result};

const PROVIDER: &str = "Pinata";

#[derive(Debug, Clone)]
pub struct PinataConfig {
    /// API base (e.g., "https://api.pinata.cloud").
    pub api_url: String,
    /// JWT used as the bearer token.
    pub jwt: String,
}

pub struct PinataStore {
    client: Client,
    config: PinataConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PinResponse {
    ipfs_hash: String,
}

fn storage_err(message: impl Into<String>) -> AnchorError {
    AnchorError::Storage {
        provider: PROVIDER.to_string(),
        message: message.into(),
    }
}

/// Write `data` to a temp file that is deleted on drop.
fn stage(data: &[u8]) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("phishblock-evidence-")
        .suffix(".json")
        .tempfile()?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}

impl PinataStore {
    pub fn new(config: PinataConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(PROVIDER)?,
            config,
        })
    }

    async fn pin_file(&self, staged: &NamedTempFile, filename: &str) -> Result<String> {
        let file = tokio::fs::File::open(staged.path()).await?;
        let len = file.metadata().await?.len();

        let part = multipart::Part::stream_with_length(Body::from(file), len)
            .file_name(filename.to_string())
            .mime_str("application/json")
            .map_err(|e| storage_err(e.to_string()))?;
        let form = multipart::Form::new()
            .part("file", part)
            .text(
                "pinataMetadata",
                serde_json::json!({ "name": filename }).to_string(),
            );

        let resp = self
            .client
            .post(format!(
                "{}/pinning/pinFileToIPFS",
                self.config.api_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.config.jwt)
            .multipart(form)
            .send()
            .await
            .map_err(|e| storage_err(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(storage_err(format!("{status}: {body}")));
        }

        let pinned: PinResponse = resp
            .json()
            .await
            .map_err(|e| storage_err(format!("response parse error: {e}")))?;

        Ok(pinned.ipfs_hash)
    }
}

#[async_trait]
impl ContentStore for PinataStore {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn put(&self, data: &[u8], filename: &str) -> Result<String> {
        let staged = stage(data)?;
        let result = self.pin_file(&staged, filename).await;
        if let Err(e) = staged.close() {
            warn!(provider = PROVIDER, error = %e, "Failed to remove staged evidence file");
        }
        result
    }
}
