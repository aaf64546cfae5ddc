/// Report record models.
///
/// A report lives in one of two shapes. While votes are still coming in it is
/// a [`PendingReport`]; once certified it is overwritten by an
/// [`AnchoredSummary`]. Both carry the original `created_at` so feed ordering
/// is stable across the transition.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A report record in either of its two shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReportDocument {
    Pending(PendingReport),
    Anchored(AnchoredSummary),
}

impl ReportDocument {
    pub fn id(&self) -> &str {
        match self {
            ReportDocument::Pending(r) => &r.id,
            ReportDocument::Anchored(s) => &s.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ReportDocument::Pending(r) => r.created_at,
            ReportDocument::Anchored(s) => s.created_at,
        }
    }

    pub fn upvotes(&self) -> i64 {
        match self {
            ReportDocument::Pending(r) => r.upvotes,
            ReportDocument::Anchored(s) => s.upvotes,
        }
    }

    /// True once the ledger write has happened, whatever the record shape.
    pub fn is_anchored(&self) -> bool {
        match self {
            ReportDocument::Pending(r) => r.anchored,
            ReportDocument::Anchored(_) => true,
        }
    }

    pub fn as_pending(&self) -> Option<&PendingReport> {
        match self {
            ReportDocument::Pending(r) => Some(r),
            ReportDocument::Anchored(_) => None,
        }
    }
}

/// The mutable report record, before collapse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReport {
    pub id: String,
    /// Reported URL or wallet address.
    #[serde(rename = "url")]
    pub target: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub upvotes: i64,
    #[serde(default)]
    pub downvotes: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub anchored: bool,
    #[serde(default)]
    pub anchoring_in_progress: bool,
    #[serde(default)]
    pub anchoring_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease: Option<Lease>,
    /// Set as soon as the ledger transaction is confirmed.
    #[serde(default)]
    pub anchor_tx: Option<AnchorTx>,
    /// Set as soon as the evidence record is stored.
    #[serde(default)]
    pub archive: Option<ArchiveRef>,
    #[serde(default)]
    pub anchoring_error: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_phase: Option<Phase>,
}

impl PendingReport {
    /// A fresh, unvoted report.
    pub fn new(id: &str, target: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            target: target.to_string(),
            description: None,
            author_id: None,
            author_name: None,
            upvotes: 0,
            downvotes: 0,
            created_at,
            anchored: false,
            anchoring_in_progress: false,
            anchoring_started_at: None,
            lease: None,
            anchor_tx: None,
            archive: None,
            anchoring_error: false,
            last_error: None,
            last_error_at: None,
            error_phase: None,
        }
    }

    /// Whether another invocation currently holds the pipeline.
    ///
    /// A flag without a lease (written by an older producer) counts as held;
    /// only an expired lease can be reclaimed.
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        match &self.lease {
            Some(lease) => lease.is_live(now),
            None => self.anchoring_in_progress,
        }
    }

    /// The conditional half of the guard's compare-and-set.
    pub fn admits(&self, intent: AcquireIntent, now: DateTime<Utc>) -> bool {
        if self.is_held(now) {
            return false;
        }
        match intent {
            AcquireIntent::Trigger => !self.anchored,
            AcquireIntent::Resume => self.anchor_tx.is_some(),
        }
    }

    /// The phase a run would start at, given what is already recorded.
    pub fn next_phase(&self) -> Phase {
        match (&self.anchor_tx, &self.archive) {
            (None, _) => Phase::Chain,
            (Some(_), None) => Phase::Archive,
            (Some(_), Some(_)) => Phase::Collapse,
        }
    }
}

/// The immutable public form of a certified report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchoredSummary {
    pub id: String,
    #[serde(rename = "url")]
    pub target: String,
    pub anchored: bool,
    pub anchor_tx: String,
    pub anchor_tx_url: String,
    pub archive_cid: String,
    pub ipfs_gateway: String,
    pub ipfs_metadata: String,
    pub backup_link: String,
    pub evidence_hash: String,
    pub archived_at: DateTime<Utc>,
    pub upvotes: i64,
    pub downvotes: i64,
    pub created_at: DateTime<Utc>,
}

/// Exclusive hold on a record's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Why a lease is being requested; each admits a different record state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireIntent {
    /// Threshold crossed on a record that has not been anchored.
    Trigger,
    /// Finishing a record whose ledger transaction is recorded.
    Resume,
}

/// A confirmed ledger transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorTx {
    pub tx_id: String,
    pub tx_url: String,
    pub block_number: Option<u64>,
}

/// A stored evidence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRef {
    pub cid: String,
    pub evidence_hash: String,
    pub provider: String,
    pub archived_at: DateTime<Utc>,
}

/// Pipeline phase, used to annotate failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "anchor_phase", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Chain,
    Archive,
    Collapse,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Chain => "chain",
            Phase::Archive => "archive",
            Phase::Collapse => "collapse",
        };
        f.write_str(name)
    }
}

/// A persisted failure annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorAnnotation {
    pub phase: Phase,
    pub message: String,
    pub at: DateTime<Utc>,
    /// A confirmed transaction the chain phase could not record. Written with
    /// the annotation, which also marks the record anchored.
    pub anchor_tx: Option<AnchorTx>,
}
