/// Collapse of a pending report into its public summary.
use chrono::{DateTime, Utc};

use crate::state::models::{AnchorTx, AnchoredSummary, ArchiveRef, PendingReport};
use crate::storage::GatewayLinks;

/// Build the summary that replaces `report`. Vote counts are taken from the
/// record as read at collapse time; `created_at` is carried over unchanged.
pub fn summarize(
    report: &PendingReport,
    tx: &AnchorTx,
    archive: &ArchiveRef,
    links: &GatewayLinks,
    archived_at: DateTime<Utc>,
) -> AnchoredSummary {
    AnchoredSummary {
        id: report.id.clone(),
        target: report.target.clone(),
        anchored: true,
        anchor_tx: tx.tx_id.clone(),
        anchor_tx_url: tx.tx_url.clone(),
        archive_cid: archive.cid.clone(),
        ipfs_gateway: links.ipfs_gateway.clone(),
        ipfs_metadata: links.ipfs_metadata.clone(),
        backup_link: links.backup_link.clone(),
        evidence_hash: archive.evidence_hash.clone(),
        archived_at,
        upvotes: report.upvotes,
        downvotes: report.downvotes,
        created_at: report.created_at,
    }
}
