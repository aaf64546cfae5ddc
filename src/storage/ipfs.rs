/// Local IPFS node store via the Kubo HTTP API.
///
/// Adds and pins the record on a node the operator runs (typically
/// `http://localhost:5001`). A local pin only lasts as long as the node
/// keeps it, so this tier sits behind the pinning services.
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;

use super::{http_client, ContentStore};
use crate::error::{AnchorError, Result};

const PROVIDER: &str = "IPFS";

/// Configuration for the Kubo HTTP API.
#[derive(Debug, Clone)]
pub struct IpfsConfig {
    /// API endpoint (e.g., "http://localhost:5001").
    pub api_url: String,
}

pub struct IpfsStore {
    client: Client,
    config: IpfsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: String,
}

fn storage_err(message: impl Into<String>) -> AnchorError {
    AnchorError::Storage {
        provider: PROVIDER.to_string(),
        message: message.into(),
    }
}

impl IpfsStore {
    pub fn new(config: IpfsConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(PROVIDER)?,
            config,
        })
    }
}

#[async_trait]
impl ContentStore for IpfsStore {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn put(&self, data: &[u8], filename: &str) -> Result<String> {
        let part = multipart::Part::bytes(data.to_vec()).file_name(filename.to_string());
        let form = multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(format!(
                "{}/api/v0/add",
                self.config.api_url.trim_end_matches('/')
            ))
            .query(&[("pin", "true"), ("cid-version", "1")])
            .multipart(form)
            .send()
            .await
            .map_err(|e| storage_err(e.to_string()))?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(storage_err(format!("add failed: {body}")));
        }

        let added: AddResponse = resp
            .json()
            .await
            .map_err(|e| storage_err(format!("response parse error: {e}")))?;

        Ok(added.hash)
    }
}
