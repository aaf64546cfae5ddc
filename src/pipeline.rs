/// Anchoring pipeline orchestrator.
///
/// Coordinates one run for one report:
/// 1. Re-read the report and re-check the trigger predicate
/// 2. Acquire the lease (skip if another invocation holds it)
/// 3. Anchor the report id on the ledger and record the transaction
/// 4. Snapshot the target, build the evidence record, upload it
/// 5. Collapse the record into its public summary
/// 6. Release the lease, whatever happened above
///
/// Each phase persists its result before the next one starts. A retry picks
/// up at the first phase without a recorded result, so the ledger write is
/// never repeated once its transaction id is on the record.
///
/// Every phase must finish inside one lease TTL. The lease is renewed between
/// phases and before the upload; a run whose lease was lost stops writing.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::anchor::ChainAnchorer;
use crate::collapse;
use crate::error::{AnchorError, Result};
use crate::evidence;
use crate::guard::{HeldLease, IdempotencyGuard, DEFAULT_LEASE_TTL};
use crate::snapshot::EvidenceSource;
use crate::state::models::{
    AcquireIntent, AnchorTx, AnchoredSummary, ArchiveRef, ErrorAnnotation, PendingReport, Phase,
    ReportDocument,
};
use crate::state::ReportStore;
use crate::storage::{FallbackUploader, GatewayConfig};
use crate::trigger::{self, ReportUpdate, DEFAULT_VOTE_THRESHOLD};

/// Configuration for pipeline runs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upvotes needed before a report is anchored.
    pub vote_threshold: i64,
    /// How long an acquired lease stays live.
    pub lease_ttl: Duration,
    /// Gateways used for the summary's retrieval links.
    pub gateways: GatewayConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vote_threshold: DEFAULT_VOTE_THRESHOLD,
            lease_ttl: DEFAULT_LEASE_TTL,
            gateways: GatewayConfig::default(),
        }
    }
}

/// Why a run did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No record with that id.
    NotFound,
    /// The trigger predicate does not hold.
    NotEligible,
    /// The record is already anchored or collapsed.
    AlreadyAnchored,
    /// Another invocation holds the lease.
    Contended,
    /// Resume requested for a record with no recorded transaction.
    NothingToResume,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Skipped { reason: SkipReason },
    Completed { summary: AnchoredSummary },
    Failed { phase: Phase, message: String },
}

/// Attempts at recording a confirmed transaction before giving up.
const TX_RECORD_ATTEMPTS: u32 = 3;
/// Backoff step between those attempts.
const TX_RECORD_BACKOFF: Duration = Duration::from_millis(100);

/// A fatal error tagged with the phase it happened in.
struct PhaseError {
    phase: Phase,
    source: AnchorError,
    /// Confirmed on the ledger but not yet on the record.
    confirmed_tx: Option<AnchorTx>,
}

fn at(phase: Phase) -> impl FnOnce(AnchorError) -> PhaseError {
    move |source| PhaseError {
        phase,
        source,
        confirmed_tx: None,
    }
}

/// Reject a lease TTL that one phase could outlast.
fn ensure_lease_covers(ttl: Duration, phase: &str, budget: Duration) -> Result<()> {
    if ttl <= budget {
        return Err(AnchorError::InvalidConfig(format!(
            "lease TTL {ttl:?} must exceed the {phase} budget of {budget:?}"
        )));
    }
    Ok(())
}

pub struct AnchoringPipeline {
    store: Arc<dyn ReportStore>,
    guard: IdempotencyGuard,
    anchorer: ChainAnchorer,
    snapshotter: Arc<dyn EvidenceSource>,
    uploader: FallbackUploader,
    config: PipelineConfig,
}

impl AnchoringPipeline {
    pub fn new(
        store: Arc<dyn ReportStore>,
        anchorer: ChainAnchorer,
        snapshotter: Arc<dyn EvidenceSource>,
        uploader: FallbackUploader,
        config: PipelineConfig,
    ) -> Result<Self> {
        let ttl = config.lease_ttl;
        let chain_budget = anchorer.max_duration() + TX_RECORD_BACKOFF * TX_RECORD_ATTEMPTS;
        ensure_lease_covers(ttl, "ledger", chain_budget)?;
        ensure_lease_covers(ttl, "snapshot", snapshotter.time_budget())?;
        ensure_lease_covers(ttl, "upload", uploader.max_duration())?;

        let guard = IdempotencyGuard::new(store.clone(), ttl)?;
        Ok(Self {
            store,
            guard,
            anchorer,
            snapshotter,
            uploader,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn ReportStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Evaluate an update event and run the pipeline if it qualifies.
    pub async fn handle_update(&self, update: &ReportUpdate) -> Result<RunOutcome> {
        if !trigger::should_anchor(update, self.config.vote_threshold) {
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::NotEligible,
            });
        }
        self.run(&update.id).await
    }

    /// Anchor, archive and collapse `id` if the freshest read still qualifies.
    pub async fn run(&self, id: &str) -> Result<RunOutcome> {
        let report = match self.store.get(id).await? {
            None => return Ok(skipped(SkipReason::NotFound)),
            Some(ReportDocument::Anchored(_)) => return Ok(skipped(SkipReason::AlreadyAnchored)),
            Some(ReportDocument::Pending(report)) => report,
        };
        if report.anchored {
            return Ok(skipped(SkipReason::AlreadyAnchored));
        }
        if report.upvotes < self.config.vote_threshold {
            return Ok(skipped(SkipReason::NotEligible));
        }
        if report.is_held(Utc::now()) {
            return Ok(skipped(SkipReason::Contended));
        }

        self.execute(id, AcquireIntent::Trigger).await
    }

    /// Finish a record whose ledger transaction is already recorded.
    pub async fn resume(&self, id: &str) -> Result<RunOutcome> {
        match self.store.get(id).await? {
            None => return Ok(skipped(SkipReason::NotFound)),
            Some(ReportDocument::Anchored(_)) => return Ok(skipped(SkipReason::AlreadyAnchored)),
            Some(ReportDocument::Pending(report)) if report.anchor_tx.is_none() => {
                return Ok(skipped(SkipReason::NothingToResume));
            }
            Some(ReportDocument::Pending(_)) => {}
        }

        self.execute(id, AcquireIntent::Resume).await
    }

    async fn execute(&self, id: &str, intent: AcquireIntent) -> Result<RunOutcome> {
        let Some(held) = self.guard.acquire(id, intent).await? else {
            info!(report_id = %id, "Lease not acquired, skipping");
            return Ok(skipped(SkipReason::Contended));
        };

        let outcome = match self.run_phases(&held).await {
            Ok(summary) => RunOutcome::Completed { summary },
            Err(PhaseError {
                phase,
                source,
                confirmed_tx,
            }) => {
                let message = source.to_string();
                if matches!(source, AnchorError::LeaseLost(_)) {
                    // The record belongs to whoever took the lease over.
                    warn!(report_id = %id, phase = %phase, "Lease lost, abandoning run");
                } else {
                    error!(report_id = %id, phase = %phase, error = %message, "Pipeline failed");
                    self.annotate(id, phase, &message, confirmed_tx).await;
                }
                RunOutcome::Failed { phase, message }
            }
        };

        self.guard.release(&held).await;
        Ok(outcome)
    }

    async fn run_phases(&self, held: &HeldLease) -> std::result::Result<AnchoredSummary, PhaseError> {
        let id = held.report_id.as_str();
        let report = &held.report;
        info!(report_id = %id, start = %report.next_phase(), "Starting anchoring pipeline");

        let tx = match &report.anchor_tx {
            Some(tx) => {
                info!(report_id = %id, tx_id = %tx.tx_id, "Transaction already recorded, skipping chain phase");
                tx.clone()
            }
            None => self.chain_phase(id).await?,
        };

        let archive = match &report.archive {
            Some(archive) => {
                info!(report_id = %id, cid = %archive.cid, "Evidence already stored, skipping archive phase");
                archive.clone()
            }
            None => {
                self.guard.renew(held).await.map_err(at(Phase::Archive))?;
                self.archive_phase(held, &tx).await.map_err(at(Phase::Archive))?
            }
        };

        self.guard.renew(held).await.map_err(at(Phase::Collapse))?;
        let summary = self
            .collapse_phase(id, &tx, &archive)
            .await
            .map_err(at(Phase::Collapse))?;

        info!(
            report_id = %id,
            tx_id = %summary.anchor_tx,
            cid = %summary.archive_cid,
            "Anchoring pipeline complete"
        );
        Ok(summary)
    }

    /// Anchor and record the transaction. A transaction that stays unrecorded
    /// rides on the error so the annotation can persist it.
    async fn chain_phase(&self, id: &str) -> std::result::Result<AnchorTx, PhaseError> {
        let tx = self
            .anchorer
            .anchor_report(id)
            .await
            .map_err(at(Phase::Chain))?;

        match self.record_confirmed_tx(id, &tx).await {
            Ok(()) => Ok(tx),
            Err(e) => Err(PhaseError {
                phase: Phase::Chain,
                source: AnchorError::Database(format!(
                    "transaction {} confirmed but not recorded: {e}",
                    tx.tx_id
                )),
                confirmed_tx: Some(tx),
            }),
        }
    }

    async fn record_confirmed_tx(&self, id: &str, tx: &AnchorTx) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.store.record_anchor_tx(id, tx).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < TX_RECORD_ATTEMPTS => {
                    warn!(
                        report_id = %id,
                        tx_id = %tx.tx_id,
                        attempt,
                        error = %e,
                        "Recording confirmed transaction failed, retrying"
                    );
                    tokio::time::sleep(TX_RECORD_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn archive_phase(&self, held: &HeldLease, tx: &AnchorTx) -> Result<ArchiveRef> {
        let id = held.report_id.as_str();
        let report = self.fresh_pending(id).await?;
        let snapshot = self.snapshotter.capture(&report.target).await;
        self.guard.renew(held).await?;

        let archived_at = Utc::now();
        let record = evidence::build_evidence(&report, snapshot, tx, archived_at)?;
        let evidence_hash = record
            .evidence_hash
            .clone()
            .ok_or_else(|| AnchorError::Serialization("evidence hash missing".to_string()))?;

        let stored = self.uploader.upload(&record).await?;
        let archive = ArchiveRef {
            cid: stored.cid,
            evidence_hash,
            provider: stored.provider,
            archived_at,
        };
        self.store.record_archive(id, &archive).await?;
        Ok(archive)
    }

    async fn collapse_phase(
        &self,
        id: &str,
        tx: &AnchorTx,
        archive: &ArchiveRef,
    ) -> Result<AnchoredSummary> {
        let report = self.fresh_pending(id).await?;
        let links = self.config.gateways.links(&archive.cid);
        let summary = collapse::summarize(&report, tx, archive, &links, archive.archived_at);
        self.store.collapse(id, &summary).await?;
        Ok(summary)
    }

    async fn fresh_pending(&self, id: &str) -> Result<PendingReport> {
        match self.store.get(id).await? {
            Some(ReportDocument::Pending(report)) => Ok(report),
            Some(ReportDocument::Anchored(_)) => Err(AnchorError::Database(format!(
                "Report {id} was collapsed by another writer"
            ))),
            None => Err(AnchorError::NotFound(id.to_string())),
        }
    }

    async fn annotate(
        &self,
        id: &str,
        phase: Phase,
        message: &str,
        anchor_tx: Option<AnchorTx>,
    ) {
        let annotation = ErrorAnnotation {
            phase,
            message: message.to_string(),
            at: Utc::now(),
            anchor_tx,
        };
        if let Err(e) = self.store.record_error(id, &annotation).await {
            warn!(report_id = %id, error = %e, "Failed to persist error annotation");
        }
    }
}

fn skipped(reason: SkipReason) -> RunOutcome {
    RunOutcome::Skipped { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceRecord;
    use crate::state::memory::MemoryReportStore;
    use crate::storage::ContentStore;
    use crate::state::models::Lease;
    use crate::testing::{FakeLedger, FakeSnapshotter, FakeStore, FlakyStore};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn report(upvotes: i64) -> PendingReport {
        let created = Utc.with_ymd_and_hms(2025, 2, 14, 9, 0, 0).unwrap();
        let mut r = PendingReport::new("post-1", "https://secure-paypa1.example/login", created);
        r.upvotes = upvotes;
        r.downvotes = 1;
        r
    }

    fn recorded_tx() -> AnchorTx {
        AnchorTx {
            tx_id: "0xrecorded".to_string(),
            tx_url: "https://amoy.polygonscan.com/tx/0xrecorded".to_string(),
            block_number: Some(42),
        }
    }

    fn pipeline(
        store: Arc<dyn ReportStore>,
        ledger: Arc<FakeLedger>,
        stores: Vec<Box<dyn ContentStore>>,
    ) -> AnchoringPipeline {
        AnchoringPipeline::new(
            store,
            ChainAnchorer::new(ledger, "https://amoy.polygonscan.com/tx", Duration::from_secs(5)),
            Arc::new(FakeSnapshotter::default()),
            FallbackUploader::new(stores),
            PipelineConfig::default(),
        )
        .unwrap()
    }

    async fn seeded(report: PendingReport) -> Arc<MemoryReportStore> {
        let store = Arc::new(MemoryReportStore::new());
        store.put(ReportDocument::Pending(report)).await;
        store
    }

    async fn pending_of(store: &dyn ReportStore) -> PendingReport {
        store
            .get("post-1")
            .await
            .unwrap()
            .unwrap()
            .as_pending()
            .unwrap()
            .clone()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_anchor_once() {
        let store = seeded(report(10)).await;
        let ledger = Arc::new(FakeLedger::new());
        let pipeline = Arc::new(pipeline(
            store.clone(),
            ledger.clone(),
            vec![Box::new(FakeStore::succeeding("Web3.Storage", "bafyprimary"))],
        ));

        let runs = (0..8).map(|_| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run("post-1").await.unwrap() })
        });
        let outcomes: Vec<RunOutcome> = futures::future::join_all(runs)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(ledger.submit_count(), 1);
        let completed = outcomes
            .iter()
            .filter(|o| matches!(o, RunOutcome::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
        assert!(store.get("post-1").await.unwrap().unwrap().as_pending().is_none());
    }

    #[tokio::test]
    async fn test_crossing_threshold_completes_and_keeps_created_at() {
        let store = seeded(report(10)).await;
        let created_at = report(10).created_at;
        let ledger = Arc::new(FakeLedger::new());
        let p = pipeline(
            store.clone(),
            ledger.clone(),
            vec![Box::new(FakeStore::succeeding("Web3.Storage", "bafyprimary"))],
        );

        let update = ReportUpdate {
            id: "post-1".to_string(),
            before: Some(ReportDocument::Pending(report(9))),
            after: ReportDocument::Pending(report(10)),
        };
        let outcome = p.handle_update(&update).await.unwrap();
        let RunOutcome::Completed { summary } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(summary.anchor_tx, "0xtx1");
        assert_eq!(summary.anchor_tx_url, "https://amoy.polygonscan.com/tx/0xtx1");
        assert_eq!(summary.ipfs_gateway, "https://gateway.pinata.cloud/ipfs/bafyprimary");

        let doc = store.get("post-1").await.unwrap().unwrap();
        assert!(matches!(doc, ReportDocument::Anchored(_)));
        assert_eq!(doc.created_at(), created_at);
    }

    #[tokio::test]
    async fn test_already_anchored_update_does_not_run() {
        let mut anchored = report(12);
        anchored.anchored = true;
        anchored.anchor_tx = Some(recorded_tx());
        let store = seeded(anchored.clone()).await;
        let ledger = Arc::new(FakeLedger::new());
        let p = pipeline(store, ledger.clone(), vec![]);

        let mut before = anchored.clone();
        before.upvotes = 11;
        let update = ReportUpdate {
            id: "post-1".to_string(),
            before: Some(ReportDocument::Pending(before)),
            after: ReportDocument::Pending(anchored),
        };
        let outcome = p.handle_update(&update).await.unwrap();
        assert_eq!(outcome, skipped(SkipReason::NotEligible));
        assert_eq!(p.run("post-1").await.unwrap(), skipped(SkipReason::AlreadyAnchored));
        assert_eq!(ledger.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_never_reanchors_recorded_tx() {
        let mut r = report(10);
        r.anchored = true;
        r.anchor_tx = Some(recorded_tx());
        let store = seeded(r).await;
        let ledger = Arc::new(FakeLedger::new());
        let p = pipeline(
            store,
            ledger.clone(),
            vec![Box::new(FakeStore::succeeding("Pinata", "bafyresumed"))],
        );

        let outcome = p.resume("post-1").await.unwrap();
        let RunOutcome::Completed { summary } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(summary.anchor_tx, "0xrecorded");
        assert_eq!(summary.archive_cid, "bafyresumed");
        assert_eq!(ledger.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_without_tx_is_skipped() {
        let store = seeded(report(10)).await;
        let p = pipeline(store, Arc::new(FakeLedger::new()), vec![]);
        assert_eq!(p.resume("post-1").await.unwrap(), skipped(SkipReason::NothingToResume));
    }

    #[tokio::test]
    async fn test_all_stores_failing_leaves_anchored_record_with_error() {
        let store = seeded(report(10)).await;
        let ledger = Arc::new(FakeLedger::new());
        let p = pipeline(
            store.clone(),
            ledger.clone(),
            vec![
                Box::new(FakeStore::failing("Web3.Storage", "quota exceeded")),
                Box::new(FakeStore::failing("Pinata", "bad gateway")),
            ],
        );

        let outcome = p.run("post-1").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { phase: Phase::Archive, .. }));

        let r = pending_of(store.as_ref()).await;
        assert!(r.anchored);
        assert_eq!(r.anchor_tx.as_ref().map(|t| t.tx_id.as_str()), Some("0xtx1"));
        assert!(r.anchoring_error);
        assert_eq!(
            r.last_error.as_deref(),
            Some("Web3.Storage: quota exceeded | Pinata: bad gateway")
        );
        assert_eq!(r.error_phase, Some(Phase::Archive));
        assert!(r.last_error_at.is_some());
        assert!(!r.anchoring_in_progress);
        assert!(r.lease.is_none());

        // A later repair with a working store finishes without a second tx.
        let repaired = pipeline(
            store.clone(),
            ledger.clone(),
            vec![Box::new(FakeStore::succeeding("Pinata", "bafyrepaired"))],
        );
        let outcome = repaired.resume("post-1").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(ledger.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_fallback_success_has_no_error() {
        let store = seeded(report(10)).await;
        let p = pipeline(
            store.clone(),
            Arc::new(FakeLedger::new()),
            vec![
                Box::new(FakeStore::failing("Web3.Storage", "503 Service Unavailable")),
                Box::new(FakeStore::succeeding("Pinata", "bafyfallback")),
            ],
        );

        let outcome = p.run("post-1").await.unwrap();
        let RunOutcome::Completed { summary } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(summary.archive_cid, "bafyfallback");

        let doc = serde_json::to_value(store.get("post-1").await.unwrap().unwrap()).unwrap();
        assert_eq!(doc["archiveCid"], "bafyfallback");
        assert!(doc.get("anchoringError").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_target_still_archives() {
        let store = seeded(report(10)).await;
        let primary = FakeStore::succeeding("Web3.Storage", "bafyempty");
        let uploads = primary.calls();
        let p = pipeline(store, Arc::new(FakeLedger::new()), vec![Box::new(primary)]);

        let outcome = p.run("post-1").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let uploads = uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        let record = EvidenceRecord::from_bytes(&uploads[0]).unwrap();
        assert_eq!(record.post_id, "post-1");
        assert!(record.http_status.is_none());
        assert!(record.snapshot_text.is_none());
        assert_eq!(record.anchor_tx, "0xtx1");
        assert!(record.verify_hash().unwrap());
    }

    #[tokio::test]
    async fn test_chain_failure_releases_lease_and_stays_unanchored() {
        let store = seeded(report(10)).await;
        let primary = FakeStore::succeeding("Web3.Storage", "bafyunused");
        let uploads = primary.calls();
        let p = pipeline(
            store.clone(),
            Arc::new(FakeLedger::new().failing("insufficient funds for gas")),
            vec![Box::new(primary)],
        );

        let outcome = p.run("post-1").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { phase: Phase::Chain, .. }));

        let r = pending_of(store.as_ref()).await;
        assert!(!r.anchored);
        assert!(r.anchor_tx.is_none());
        assert!(r.anchoring_error);
        assert_eq!(r.error_phase, Some(Phase::Chain));
        assert!(r.last_error.unwrap().contains("insufficient funds"));
        assert!(!r.anchoring_in_progress);
        assert!(uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collapse_failure_is_repaired_without_redoing_work() {
        let store = Arc::new(FlakyStore::default());
        store.inner.put(ReportDocument::Pending(report(10))).await;
        store.fail_collapse(true);

        let ledger = Arc::new(FakeLedger::new());
        let primary = FakeStore::succeeding("Web3.Storage", "bafykept");
        let uploads = primary.calls();
        let p = pipeline(store.clone(), ledger.clone(), vec![Box::new(primary)]);

        let outcome = p.run("post-1").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { phase: Phase::Collapse, .. }));

        let r = pending_of(store.as_ref()).await;
        assert_eq!(r.anchor_tx.as_ref().map(|t| t.tx_id.as_str()), Some("0xtx1"));
        assert_eq!(r.archive.as_ref().map(|a| a.cid.as_str()), Some("bafykept"));
        assert_eq!(r.error_phase, Some(Phase::Collapse));

        store.fail_collapse(false);
        let outcome = p.resume("post-1").await.unwrap();
        let RunOutcome::Completed { summary } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(summary.archive_cid, "bafykept");
        assert_eq!(ledger.submit_count(), 1);
        assert_eq!(uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_and_below_threshold_are_skipped() {
        let store = seeded(report(4)).await;
        let ledger = Arc::new(FakeLedger::new());
        let p = pipeline(store, ledger.clone(), vec![]);

        assert_eq!(p.run("post-1").await.unwrap(), skipped(SkipReason::NotEligible));
        assert_eq!(p.run("post-404").await.unwrap(), skipped(SkipReason::NotFound));
        assert_eq!(ledger.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_tx_record_failure_is_retried() {
        let store = Arc::new(FlakyStore::default());
        store.inner.put(ReportDocument::Pending(report(10))).await;
        store.fail_anchor_tx_records(1);
        let ledger = Arc::new(FakeLedger::new());
        let p = pipeline(
            store.clone(),
            ledger.clone(),
            vec![Box::new(FakeStore::succeeding("Web3.Storage", "bafyretried"))],
        );

        let outcome = p.run("post-1").await.unwrap();
        let RunOutcome::Completed { summary } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(summary.anchor_tx, "0xtx1");
        assert_eq!(ledger.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_tx_is_kept_through_error_path() {
        let store = Arc::new(FlakyStore::default());
        store.inner.put(ReportDocument::Pending(report(10))).await;
        store.fail_anchor_tx_records(TX_RECORD_ATTEMPTS as usize);
        let ledger = Arc::new(FakeLedger::new());
        let p = pipeline(
            store.clone(),
            ledger.clone(),
            vec![Box::new(FakeStore::succeeding("Web3.Storage", "bafyrecovered"))],
        );

        let first = p.run("post-1").await.unwrap();
        let RunOutcome::Failed { phase, message } = first else {
            panic!("expected failure, got {first:?}");
        };
        assert_eq!(phase, Phase::Chain);
        assert!(message.contains("transaction 0xtx1 confirmed but not recorded"));

        let r = pending_of(store.as_ref()).await;
        assert!(r.anchored);
        assert_eq!(r.anchor_tx.as_ref().map(|t| t.tx_id.as_str()), Some("0xtx1"));
        assert_eq!(r.error_phase, Some(Phase::Chain));
        assert!(!r.anchoring_in_progress);

        // A later delivery must not send a second transaction.
        assert_eq!(p.run("post-1").await.unwrap(), skipped(SkipReason::AlreadyAnchored));

        let resumed = p.resume("post-1").await.unwrap();
        let RunOutcome::Completed { summary } = resumed else {
            panic!("expected completion, got {resumed:?}");
        };
        assert_eq!(summary.anchor_tx, "0xtx1");
        assert_eq!(summary.archive_cid, "bafyrecovered");
        assert_eq!(ledger.submit_count(), 1);
    }

    fn build_err(
        ttl: Duration,
        anchorer: ChainAnchorer,
        uploader: FallbackUploader,
    ) -> Option<AnchorError> {
        AnchoringPipeline::new(
            Arc::new(MemoryReportStore::new()),
            anchorer,
            Arc::new(FakeSnapshotter::default()),
            uploader,
            PipelineConfig {
                lease_ttl: ttl,
                ..PipelineConfig::default()
            },
        )
        .err()
    }

    #[test]
    fn test_lease_shorter_than_a_phase_is_rejected() {
        let anchorer = |confirmation| {
            ChainAnchorer::new(Arc::new(FakeLedger::new()), "https://explorer/tx", confirmation)
                .with_submit_timeout(Duration::from_millis(10))
        };

        let err = build_err(
            Duration::from_millis(100),
            anchorer(Duration::from_millis(400)),
            FallbackUploader::new(vec![]),
        );
        assert!(matches!(err, Some(AnchorError::InvalidConfig(m)) if m.contains("ledger")));

        let err = build_err(
            Duration::from_secs(10),
            anchorer(Duration::from_secs(1)),
            FallbackUploader::new(vec![Box::new(FakeStore::succeeding("Web3.Storage", "bafy"))]),
        );
        assert!(matches!(err, Some(AnchorError::InvalidConfig(m)) if m.contains("upload")));

        let err = build_err(
            Duration::from_secs(10),
            anchorer(Duration::from_secs(1)),
            FallbackUploader::new(vec![Box::new(FakeStore::succeeding("Web3.Storage", "bafy"))])
                .with_timeout(Duration::from_secs(5)),
        );
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_delivery_during_slow_confirmation_is_contended() {
        let store = seeded(report(10)).await;
        let ledger =
            Arc::new(FakeLedger::new().with_confirmation_delay(Duration::from_millis(400)));
        let p = Arc::new(pipeline(
            store.clone(),
            ledger.clone(),
            vec![Box::new(FakeStore::succeeding("Web3.Storage", "bafyslow"))],
        ));

        let first = tokio::spawn({
            let p = p.clone();
            async move { p.run("post-1").await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(p.run("post-1").await.unwrap(), skipped(SkipReason::Contended));

        assert!(matches!(first.await.unwrap(), RunOutcome::Completed { .. }));
        assert_eq!(ledger.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_run_that_outlives_its_lease_stops_before_upload() {
        let store = seeded(report(10)).await;
        let ledger = Arc::new(FakeLedger::new());
        let primary = FakeStore::succeeding("Web3.Storage", "bafyduplicate");
        let uploads = primary.calls();
        let anchorer = ChainAnchorer::new(
            ledger.clone(),
            "https://amoy.polygonscan.com/tx",
            Duration::from_millis(50),
        )
        .with_submit_timeout(Duration::from_millis(50));
        let p = Arc::new(
            AnchoringPipeline::new(
                store.clone(),
                anchorer,
                Arc::new(FakeSnapshotter::with_delay(Duration::from_millis(1000))),
                FallbackUploader::new(vec![Box::new(primary)])
                    .with_timeout(Duration::from_millis(50)),
                PipelineConfig {
                    lease_ttl: Duration::from_millis(600),
                    ..PipelineConfig::default()
                },
            )
            .unwrap(),
        );

        let run = tokio::spawn({
            let p = p.clone();
            async move { p.run("post-1").await.unwrap() }
        });

        // The capture overruns the lease; a resume takes the record over.
        tokio::time::sleep(Duration::from_millis(800)).await;
        let successor = Lease {
            owner: Uuid::new_v4(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        };
        let taken = store
            .try_acquire("post-1", &successor, AcquireIntent::Resume, Utc::now())
            .await
            .unwrap();
        assert!(taken.is_some());

        let outcome = run.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { phase: Phase::Archive, .. }));
        assert!(uploads.lock().unwrap().is_empty());
        assert_eq!(ledger.submit_count(), 1);

        let r = pending_of(store.as_ref()).await;
        assert_eq!(r.lease.as_ref().map(|l| l.owner), Some(successor.owner));
        assert!(r.anchoring_in_progress);
        assert!(!r.anchoring_error);
        assert!(r.archive.is_none());
    }
}
