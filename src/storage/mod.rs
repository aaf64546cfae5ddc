/// Content-addressed storage for evidence records.
///
/// Providers are tried in order; the first success wins:
/// - Tier 1: Web3.Storage (primary `put`)
/// - Tier 2: Pinata (REST multipart pinning, fallback)
/// - Tier 3: a local IPFS node via the Kubo HTTP API (optional)
///
/// Every provider returns a CID, so gateway links are the same whichever
/// provider stored the record.
pub mod ipfs;
pub mod pinata;
pub mod web3storage;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AnchorError, Result};
use crate::evidence::{EvidenceRecord, EVIDENCE_FILE_NAME};

/// Default bound on one provider's upload, response included.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for a provider backend, bounded by [`DEFAULT_UPLOAD_TIMEOUT`].
fn http_client(provider: &str) -> Result<Client> {
    Client::builder()
        .timeout(DEFAULT_UPLOAD_TIMEOUT)
        .build()
        .map_err(|e| AnchorError::Http(format!("{provider} client build failed: {e}")))
}

/// Trait for pluggable content-addressed stores.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Human-readable name of this provider (e.g., "Pinata").
    fn name(&self) -> &str;

    /// Store `data` under `filename`. Returns the content address (CID).
    async fn put(&self, data: &[u8], filename: &str) -> Result<String>;
}

/// Where an upload landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub cid: String,
    pub provider: String,
}

/// Ordered list of stores, tried until one accepts the upload.
pub struct FallbackUploader {
    stores: Vec<Box<dyn ContentStore>>,
    per_store_timeout: Duration,
}

impl FallbackUploader {
    pub fn new(stores: Vec<Box<dyn ContentStore>>) -> Self {
        Self {
            stores,
            per_store_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }

    /// Give up on a provider after `timeout` and move on to the next one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_store_timeout = timeout;
        self
    }

    /// Longest a call to [`Self::upload`] can take.
    pub fn max_duration(&self) -> Duration {
        self.per_store_timeout * self.stores.len() as u32
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.stores.iter().map(|s| s.name()).collect()
    }

    /// Upload raw bytes. Fails with [`AnchorError::ArchiveFailed`] carrying
    /// every provider's error if none succeeds.
    pub async fn upload_bytes(&self, data: &[u8], filename: &str) -> Result<StoredObject> {
        let mut failures = Vec::new();

        for store in &self.stores {
            let provider = store.name().to_string();
            info!(provider = %provider, bytes = data.len(), "Uploading evidence");

            let attempt =
                tokio::time::timeout(self.per_store_timeout, store.put(data, filename));
            let message = match attempt.await {
                Ok(Ok(cid)) => {
                    info!(provider = %provider, cid = %cid, "Evidence stored");
                    return Ok(StoredObject { cid, provider });
                }
                Ok(Err(AnchorError::Storage { message, .. })) => message,
                Ok(Err(other)) => other.to_string(),
                Err(_) => format!("no response within {:?}", self.per_store_timeout),
            };
            warn!(provider = %provider, error = %message, "Upload failed, trying next provider");
            failures.push((provider, message));
        }

        Err(AnchorError::ArchiveFailed(failures))
    }

    /// Serialize and upload an evidence record.
    pub async fn upload(&self, record: &EvidenceRecord) -> Result<StoredObject> {
        let bytes = record.to_upload_bytes()?;
        self.upload_bytes(&bytes, EVIDENCE_FILE_NAME).await
    }
}

/// Gateway hosts used to build retrieval links.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Primary gateway base, e.g. `https://gateway.pinata.cloud/ipfs`.
    pub primary: String,
    /// Backup gateway base, e.g. `https://w3s.link/ipfs`.
    pub backup: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            primary: "https://gateway.pinata.cloud/ipfs".to_string(),
            backup: "https://w3s.link/ipfs".to_string(),
        }
    }
}

/// Retrieval links for a stored evidence record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayLinks {
    pub ipfs_gateway: String,
    pub ipfs_metadata: String,
    pub backup_link: String,
}

impl GatewayConfig {
    pub fn links(&self, cid: &str) -> GatewayLinks {
        let primary = format!("{}/{cid}", self.primary.trim_end_matches('/'));
        GatewayLinks {
            ipfs_metadata: format!("{primary}/{EVIDENCE_FILE_NAME}"),
            ipfs_gateway: primary,
            backup_link: format!("{}/{cid}", self.backup.trim_end_matches('/')),
        }
    }
}
