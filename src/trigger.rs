/// Trigger predicate over record update events.
///
/// Every write to a report produces an update carrying the record before and
/// after the write. Only the write that carries a not-yet-anchored report
/// across the vote threshold starts the pipeline.
use serde::{Deserialize, Serialize};

use crate::state::models::ReportDocument;

/// Default upvote threshold.
pub const DEFAULT_VOTE_THRESHOLD: i64 = 10;

/// A record update as delivered by the store's change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportUpdate {
    pub id: String,
    /// Absent when the write created the record.
    #[serde(default)]
    pub before: Option<ReportDocument>,
    pub after: ReportDocument,
}

/// Whether `update` should start the anchoring pipeline.
pub fn should_anchor(update: &ReportUpdate, threshold: i64) -> bool {
    let was_anchored = update.before.as_ref().is_some_and(ReportDocument::is_anchored);
    if was_anchored {
        return false;
    }
    match &update.after {
        ReportDocument::Pending(after) => {
            after.upvotes >= threshold && !after.anchoring_in_progress && !after.anchored
        }
        ReportDocument::Anchored(_) => false,
    }
}
