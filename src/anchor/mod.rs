/// Ledger anchoring for certified reports.
///
/// A report is anchored by invoking the contract's `anchor(bytes32, string)`
/// operation with a reference derived from the report id and the raw id as
/// auxiliary data. The reference is deterministic, so the same report always
/// anchors to the same on-chain value.
///
/// The ledger write is irrevocable. Once submitted, the transaction is awaited
/// to completion or reported as an unknown-outcome failure; there is no
/// compensating action.
pub mod ethereum;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::hash;
use crate::error::{AnchorError, Result};
use crate::state::models::AnchorTx;

/// Default bound on a single submission, RPC round trips included.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Confirmation details for a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub block_number: u64,
    pub confirmations: u64,
}

/// Narrow interface to the public ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Name of the network (e.g., "Polygon Amoy").
    fn chain_name(&self) -> &str;

    /// Submit an anchor transaction. Returns the transaction id.
    async fn submit(&self, reference: &[u8; 32], aux_id: &str) -> Result<String>;

    /// Block until the transaction has the configured number of confirmations.
    async fn await_confirmation(&self, tx_id: &str) -> Result<LedgerReceipt>;
}

/// Anchors report ids through a [`LedgerClient`].
pub struct ChainAnchorer {
    ledger: Arc<dyn LedgerClient>,
    explorer_tx_url: String,
    submit_timeout: Duration,
    confirmation_timeout: Duration,
}

impl ChainAnchorer {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        explorer_tx_url: &str,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            explorer_tx_url: explorer_tx_url.trim_end_matches('/').to_string(),
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            confirmation_timeout,
        }
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Longest a call to [`Self::anchor_report`] can take.
    pub fn max_duration(&self) -> Duration {
        self.submit_timeout + self.confirmation_timeout
    }

    /// Human-navigable URL for a transaction.
    pub fn tx_url(&self, tx_id: &str) -> String {
        format!("{}/{tx_id}", self.explorer_tx_url)
    }

    /// Submit and confirm the anchor transaction for `report_id`.
    pub async fn anchor_report(&self, report_id: &str) -> Result<AnchorTx> {
        let reference = hash::report_reference(report_id);

        info!(
            report_id = %report_id,
            chain = self.ledger.chain_name(),
            reference = %hash::to_prefixed_hex(&reference),
            "Submitting anchor transaction"
        );
        let tx_id = tokio::time::timeout(
            self.submit_timeout,
            self.ledger.submit(&reference, report_id),
        )
        .await
        .map_err(|_| {
            AnchorError::Ledger(format!(
                "submission did not return within {:?}, outcome unknown",
                self.submit_timeout
            ))
        })??;

        let receipt =
            tokio::time::timeout(self.confirmation_timeout, self.ledger.await_confirmation(&tx_id))
                .await
                .map_err(|_| AnchorError::ConfirmationTimeout {
                    tx_id: tx_id.clone(),
                    waited_secs: self.confirmation_timeout.as_secs(),
                })??;

        info!(
            report_id = %report_id,
            tx_id = %tx_id,
            block = receipt.block_number,
            confirmations = receipt.confirmations,
            "Anchor confirmed"
        );

        Ok(AnchorTx {
            tx_url: self.tx_url(&tx_id),
            tx_id,
            block_number: Some(receipt.block_number),
        })
    }
}
