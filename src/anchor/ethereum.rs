/// EVM ledger client.
///
/// Anchors a report by calling `anchor(bytes32 _hash, string postId)` on the
/// anchoring contract. Works against any EVM JSON-RPC endpoint (Polygon Amoy
/// by default). Uses raw JSON-RPC for maximum compatibility; transactions
/// are built and signed locally with alloy.
use std::time::Duration;

use async_trait::async_trait;
use alloy::primitives::{Address, B256};
use alloy::sol_types::SolCall;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LedgerClient, LedgerReceipt};
use crate::crypto::hash;
use crate::error::{AnchorError, Result};

/// Bound on one JSON-RPC round trip.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

alloy::sol! {
    function anchor(bytes32 _hash, string postId) external returns (bool);
}

/// Configuration for the EVM ledger.
#[derive(Debug, Clone)]
pub struct EthereumConfig {
    /// JSON-RPC endpoint (e.g., an Alchemy or Infura URL).
    pub rpc_url: String,
    /// Human-readable network name for logs.
    pub network: String,
    /// Private key (hex, with or without 0x prefix) for signing transactions.
    pub private_key_hex: String,
    /// Address of the anchoring contract.
    pub contract_address: String,
    /// Chain ID (80002 for Polygon Amoy).
    pub chain_id: u64,
    /// Confirmations required before a transaction counts as final.
    pub confirmations: u64,
    /// Delay between receipt polls.
    pub poll_interval: Duration,
}

pub struct EthereumLedger {
    config: EthereumConfig,
    client: Client,
}

/// Simplified JSON-RPC response.
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    block_number: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    input: String,
    to: Option<String>,
}

/// Decoded view of an anchor transaction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInspection {
    pub tx_id: String,
    pub contract: Option<String>,
    pub block_number: Option<u64>,
    /// `Some(true)` if mined successfully, `Some(false)` if reverted.
    pub succeeded: Option<bool>,
    /// Decoded `_hash` argument.
    pub reference: String,
    /// Decoded `postId` argument.
    pub report_id: String,
    /// Whether keccak256(report_id) equals the on-chain reference.
    pub reference_matches: bool,
}

/// Parse a JSON-RPC hex quantity.
fn parse_quantity(value: &str) -> Result<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| AnchorError::Ledger(format!("Invalid quantity {value}: {e}")))
}

/// ABI-encode the anchor call for a report.
pub fn encode_anchor_call(reference: &[u8; 32], report_id: &str) -> Vec<u8> {
    anchorCall {
        _hash: B256::from(*reference),
        postId: report_id.to_string(),
    }
    .abi_encode()
}

/// Decode anchor calldata into `(reference, report_id)`.
pub fn decode_anchor_call(input: &[u8]) -> Result<([u8; 32], String)> {
    let call = anchorCall::abi_decode(input)
        .map_err(|e| AnchorError::Ledger(format!("Not an anchor call: {e}")))?;
    Ok((call._hash.0, call.postId))
}

impl EthereumLedger {
    pub fn new(config: EthereumConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| AnchorError::Http(format!("RPC client build failed: {e}")))?;
        Ok(Self { config, client })
    }

    /// Send a JSON-RPC request. A `null` result is returned as `None`.
    async fn rpc_call_optional<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp: JsonRpcResponse<T> = self
            .client
            .post(&self.config.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnchorError::Ledger(format!("RPC transport error: {e}")))?
            .json()
            .await
            .map_err(|e| AnchorError::Serialization(format!("RPC response parse error: {e}")))?;

        if let Some(err) = resp.error {
            return Err(AnchorError::Ledger(format!(
                "{method} failed: {}",
                err.message
            )));
        }

        Ok(resp.result)
    }

    async fn rpc_call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        self.rpc_call_optional(method, params)
            .await?
            .ok_or_else(|| AnchorError::Ledger(format!("Empty {method} response")))
    }

    /// Build, sign, and send the anchor transaction.
    async fn send_anchor_tx(&self, reference: &[u8; 32], report_id: &str) -> Result<String> {
        use alloy::consensus::SignableTransaction;
        use alloy::primitives::{Bytes, U256};
        use alloy::signers::local::PrivateKeySigner;
        use alloy::signers::Signer;

        let signer: PrivateKeySigner = self
            .config
            .private_key_hex
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| AnchorError::InvalidConfig(format!("Invalid private key: {e}")))?;
        let contract: Address = self
            .config
            .contract_address
            .parse()
            .map_err(|e| AnchorError::InvalidConfig(format!("Invalid contract address: {e}")))?;

        let from_address = signer.address();
        let input = encode_anchor_call(reference, report_id);
        let input_hex = hash::to_prefixed_hex(&input);

        let nonce_hex: String = self
            .rpc_call(
                "eth_getTransactionCount",
                serde_json::json!([format!("{from_address:?}"), "pending"]),
            )
            .await?;
        let nonce = parse_quantity(&nonce_hex)?;

        let gas_price_hex: String = self.rpc_call("eth_gasPrice", serde_json::json!([])).await?;
        let gas_price = u128::from_str_radix(gas_price_hex.trim_start_matches("0x"), 16)
            .map_err(|e| AnchorError::Ledger(format!("Invalid gas price: {e}")))?;

        // Estimation fails fast on a reverting call, before anything is signed.
        let gas_hex: String = self
            .rpc_call(
                "eth_estimateGas",
                serde_json::json!([{
                    "from": format!("{from_address:?}"),
                    "to": format!("{contract:?}"),
                    "data": input_hex,
                }]),
            )
            .await?;
        let gas_limit = parse_quantity(&gas_hex)? * 12 / 10;

        let tx = alloy::consensus::TxLegacy {
            chain_id: Some(self.config.chain_id),
            nonce,
            gas_price,
            gas_limit,
            to: alloy::primitives::TxKind::Call(contract),
            value: U256::ZERO,
            input: Bytes::from(input),
        };

        let sig_hash = tx.signature_hash();
        let sig = signer
            .sign_hash(&sig_hash)
            .await
            .map_err(|e| AnchorError::Ledger(format!("Signing failed: {e}")))?;

        let signed = alloy::consensus::TxEnvelope::Legacy(tx.into_signed(sig));

        let mut raw_tx = Vec::new();
        alloy::eips::eip2718::Encodable2718::encode_2718(&signed, &mut raw_tx);
        let raw_hex = hash::to_prefixed_hex(&raw_tx);

        self.rpc_call("eth_sendRawTransaction", serde_json::json!([raw_hex]))
            .await
    }

    async fn receipt(&self, tx_id: &str) -> Result<Option<RpcReceipt>> {
        self.rpc_call_optional("eth_getTransactionReceipt", serde_json::json!([tx_id]))
            .await
    }

    /// Fetch and decode an anchor transaction.
    pub async fn inspect(&self, tx_id: &str) -> Result<TxInspection> {
        let tx: RpcTransaction = self
            .rpc_call_optional("eth_getTransactionByHash", serde_json::json!([tx_id]))
            .await?
            .ok_or_else(|| AnchorError::NotFound(format!("transaction {tx_id}")))?;

        let input = hex::decode(tx.input.trim_start_matches("0x"))
            .map_err(|e| AnchorError::Serialization(format!("Invalid calldata hex: {e}")))?;
        let (reference, report_id) = decode_anchor_call(&input)?;

        let receipt = self.receipt(tx_id).await?;
        let block_number = match receipt.as_ref().and_then(|r| r.block_number.as_deref()) {
            Some(block) => Some(parse_quantity(block)?),
            None => None,
        };
        let succeeded = receipt
            .as_ref()
            .and_then(|r| r.status.as_deref())
            .map(|status| status == "0x1");

        Ok(TxInspection {
            tx_id: tx_id.to_string(),
            contract: tx.to,
            block_number,
            succeeded,
            reference: hash::to_prefixed_hex(&reference),
            reference_matches: hash::report_reference(&report_id) == reference,
            report_id,
        })
    }
}

#[async_trait]
impl LedgerClient for EthereumLedger {
    fn chain_name(&self) -> &str {
        &self.config.network
    }

    async fn submit(&self, reference: &[u8; 32], aux_id: &str) -> Result<String> {
        self.send_anchor_tx(reference, aux_id).await
    }

    async fn await_confirmation(&self, tx_id: &str) -> Result<LedgerReceipt> {
        loop {
            if let Some(receipt) = self.receipt(tx_id).await? {
                if receipt.status.as_deref() == Some("0x0") {
                    return Err(AnchorError::TransactionReverted(tx_id.to_string()));
                }
                if let Some(block) = receipt.block_number.as_deref() {
                    let block_number = parse_quantity(block)?;
                    let head_hex: String =
                        self.rpc_call("eth_blockNumber", serde_json::json!([])).await?;
                    let head = parse_quantity(&head_hex)?;
                    let confirmations = head.saturating_sub(block_number) + 1;

                    if confirmations >= self.config.confirmations {
                        return Ok(LedgerReceipt {
                            block_number,
                            confirmations,
                        });
                    }
                    debug!(tx_id = %tx_id, confirmations, "Waiting for more confirmations");
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
