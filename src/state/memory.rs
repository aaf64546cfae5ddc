/// In-memory report store.
///
/// Every operation runs under one async mutex, so the conditional acquire is
/// a true compare-and-set across concurrent invocations in the same process.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    AcquireIntent, AnchorTx, AnchoredSummary, ArchiveRef, ErrorAnnotation, Lease, PendingReport,
    ReportDocument,
};
use super::{ReportStore, LEASE_EXPIRED_MESSAGE};
use crate::error::{AnchorError, Result};

#[derive(Default)]
pub struct MemoryReportStore {
    docs: Mutex<HashMap<String, ReportDocument>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a record, as an external writer would.
    pub async fn put(&self, doc: ReportDocument) {
        self.docs.lock().await.insert(doc.id().to_string(), doc);
    }

    /// Apply `f` to a pending record, failing if it is missing or collapsed.
    async fn update_pending<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut PendingReport) + Send,
    {
        let mut docs = self.docs.lock().await;
        match docs.get_mut(id) {
            Some(ReportDocument::Pending(report)) => {
                f(report);
                Ok(())
            }
            Some(ReportDocument::Anchored(_)) => Err(AnchorError::Database(format!(
                "Report {id} is already collapsed"
            ))),
            None => Err(AnchorError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn get(&self, id: &str) -> Result<Option<ReportDocument>> {
        Ok(self.docs.lock().await.get(id).cloned())
    }

    async fn try_acquire(
        &self,
        id: &str,
        lease: &Lease,
        intent: AcquireIntent,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingReport>> {
        let mut docs = self.docs.lock().await;
        match docs.get_mut(id) {
            Some(ReportDocument::Pending(report)) if report.admits(intent, now) => {
                report.anchoring_in_progress = true;
                report.anchoring_started_at = Some(now);
                report.lease = Some(lease.clone());
                Ok(Some(report.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, id: &str, owner: Uuid) -> Result<()> {
        let mut docs = self.docs.lock().await;
        if let Some(ReportDocument::Pending(report)) = docs.get_mut(id) {
            let ours = report.lease.as_ref().is_some_and(|l| l.owner == owner);
            if ours {
                report.anchoring_in_progress = false;
                report.lease = None;
            }
        }
        Ok(())
    }

    async fn renew_lease(
        &self,
        id: &str,
        owner: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut docs = self.docs.lock().await;
        let Some(ReportDocument::Pending(report)) = docs.get_mut(id) else {
            return Ok(false);
        };
        match report.lease.as_mut() {
            Some(lease) if lease.owner == owner && lease.is_live(now) => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_anchor_tx(&self, id: &str, tx: &AnchorTx) -> Result<()> {
        let tx = tx.clone();
        self.update_pending(id, move |r| {
            r.anchored = true;
            r.anchor_tx = Some(tx);
        })
        .await
    }

    async fn record_archive(&self, id: &str, archive: &ArchiveRef) -> Result<()> {
        let archive = archive.clone();
        self.update_pending(id, move |r| r.archive = Some(archive))
            .await
    }

    async fn record_error(&self, id: &str, error: &ErrorAnnotation) -> Result<()> {
        let error = error.clone();
        self.update_pending(id, move |r| {
            r.anchoring_error = true;
            r.last_error = Some(error.message);
            r.last_error_at = Some(error.at);
            r.error_phase = Some(error.phase);
            if let Some(tx) = error.anchor_tx {
                r.anchored = true;
                r.anchor_tx = Some(tx);
            }
        })
        .await
    }

    async fn collapse(&self, id: &str, summary: &AnchoredSummary) -> Result<()> {
        let mut docs = self.docs.lock().await;
        match docs.get(id) {
            Some(ReportDocument::Pending(_)) => {
                docs.insert(id.to_string(), ReportDocument::Anchored(summary.clone()));
                Ok(())
            }
            Some(ReportDocument::Anchored(_)) => Err(AnchorError::Database(format!(
                "Report {id} is already collapsed"
            ))),
            None => Err(AnchorError::NotFound(id.to_string())),
        }
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let docs = self.docs.lock().await;
        let mut ids: Vec<String> = docs
            .values()
            .filter_map(ReportDocument::as_pending)
            .filter(|r| r.anchoring_in_progress && !r.is_held(now) && r.lease.is_some())
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn clear_expired_lease(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut docs = self.docs.lock().await;
        let Some(ReportDocument::Pending(report)) = docs.get_mut(id) else {
            return Ok(false);
        };
        let expired = report
            .lease
            .as_ref()
            .is_some_and(|lease| !lease.is_live(now));
        if !report.anchoring_in_progress || !expired {
            return Ok(false);
        }
        report.anchoring_in_progress = false;
        report.lease = None;
        report.anchoring_error = true;
        report.last_error = Some(LEASE_EXPIRED_MESSAGE.to_string());
        report.last_error_at = Some(now);
        Ok(true)
    }
}
