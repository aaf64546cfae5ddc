/// Evidence record: the permanent, uploaded proof of a certified report.
///
/// The record is assembled once from the freshly read report, the snapshot,
/// and the confirmed ledger transaction, then never mutated. Its content hash
/// covers the serialized record without the hash field and is then stored in
/// that field, so a verifier recomputes it by clearing the field first.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::hash;
use crate::error::Result;
use crate::snapshot::Snapshot;
use crate::state::models::{AnchorTx, PendingReport};

/// File name the record is uploaded under.
pub const EVIDENCE_FILE_NAME: &str = "metadata.json";

const DEFAULT_DESCRIPTION: &str = "No description provided.";
const DEFAULT_AUTHOR_NAME: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRecord {
    pub post_id: String,
    pub url: String,
    pub description: String,
    pub author_id: String,
    pub author_name: String,
    pub reported_at: DateTime<Utc>,
    pub http_status: Option<u16>,
    pub redirect_chain: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub snapshot_text: Option<String>,
    pub snapshot_html_hash: Option<String>,
    pub upvotes: i64,
    pub downvotes: i64,
    pub anchored: bool,
    pub anchor_tx: String,
    pub archived_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_hash: Option<String>,
}

fn non_blank(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => fallback.to_string(),
    }
}

/// Assemble the evidence record and compute its content hash.
pub fn build_evidence(
    report: &PendingReport,
    snapshot: Snapshot,
    tx: &AnchorTx,
    archived_at: DateTime<Utc>,
) -> Result<EvidenceRecord> {
    let snapshot_html_hash = snapshot
        .body
        .as_deref()
        .filter(|body| !body.is_empty())
        .map(|body| hash::sha256_hex(body.as_bytes()));

    let mut record = EvidenceRecord {
        post_id: report.id.clone(),
        url: report.target.clone(),
        description: non_blank(report.description.as_deref(), DEFAULT_DESCRIPTION),
        author_id: report.author_id.clone().unwrap_or_default(),
        author_name: non_blank(report.author_name.as_deref(), DEFAULT_AUTHOR_NAME),
        reported_at: report.created_at,
        http_status: snapshot.http_status,
        redirect_chain: snapshot.redirect_chain,
        headers: snapshot.headers,
        snapshot_text: snapshot.body,
        snapshot_html_hash,
        upvotes: report.upvotes,
        downvotes: report.downvotes,
        anchored: true,
        anchor_tx: tx.tx_id.clone(),
        archived_at,
        evidence_hash: None,
    };

    record.evidence_hash = Some(record.compute_hash()?);
    Ok(record)
}

impl EvidenceRecord {
    /// SHA-256 over the compact JSON form with `evidenceHash` omitted.
    pub fn compute_hash(&self) -> Result<String> {
        let unhashed = EvidenceRecord {
            evidence_hash: None,
            ..self.clone()
        };
        let bytes = serde_json::to_vec(&unhashed)?;
        Ok(hash::sha256_hex(&bytes))
    }

    /// Whether the stored hash matches the record's content.
    pub fn verify_hash(&self) -> Result<bool> {
        match &self.evidence_hash {
            Some(stored) => Ok(*stored == self.compute_hash()?),
            None => Ok(false),
        }
    }

    /// Bytes uploaded to content-addressed storage.
    pub fn to_upload_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
