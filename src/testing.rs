/// In-crate fakes for the pipeline's collaborators.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::anchor::{LedgerClient, LedgerReceipt};
use crate::error::{AnchorError, Result};
use crate::snapshot::{EvidenceSource, Snapshot};
use crate::state::memory::MemoryReportStore;
use crate::state::models::{
    AcquireIntent, AnchorTx, AnchoredSummary, ArchiveRef, ErrorAnnotation, Lease, PendingReport,
    ReportDocument,
};
use crate::state::ReportStore;
use crate::storage::ContentStore;

/// Ledger that confirms every submission at block 100.
pub struct FakeLedger {
    submissions: Mutex<Vec<([u8; 32], String)>>,
    count: AtomicUsize,
    failure: Option<String>,
    submit_delay: Duration,
    confirmation_delay: Duration,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            failure: None,
            submit_delay: Duration::ZERO,
            confirmation_delay: Duration::ZERO,
        }
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn with_confirmation_delay(mut self, delay: Duration) -> Self {
        self.confirmation_delay = delay;
        self
    }

    /// Reject every submission with `message`.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn submissions(&self) -> Vec<([u8; 32], String)> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    fn chain_name(&self) -> &str {
        "fake"
    }

    async fn submit(&self, reference: &[u8; 32], aux_id: &str) -> Result<String> {
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(AnchorError::Ledger(message.clone()));
        }
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.submissions
            .lock()
            .unwrap()
            .push((*reference, aux_id.to_string()));
        // Yield so concurrent callers interleave between submit and confirm.
        tokio::task::yield_now().await;
        Ok(format!("0xtx{n}"))
    }

    async fn await_confirmation(&self, _tx_id: &str) -> Result<LedgerReceipt> {
        if !self.confirmation_delay.is_zero() {
            tokio::time::sleep(self.confirmation_delay).await;
        }
        Ok(LedgerReceipt {
            block_number: 100,
            confirmations: 1,
        })
    }
}

/// Content store that either always succeeds with a fixed CID or always fails.
pub struct FakeStore {
    name: String,
    outcome: std::result::Result<String, String>,
    delay: Duration,
    calls: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeStore {
    pub fn succeeding(name: &str, cid: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: Ok(cid.to_string()),
            delay: Duration::ZERO,
            calls: Arc::default(),
        }
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: Err(message.to_string()),
            delay: Duration::ZERO,
            calls: Arc::default(),
        }
    }

    /// Stall each `put` for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Bytes received by each `put`, in call order.
    pub fn calls(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl ContentStore for FakeStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, data: &[u8], _filename: &str) -> Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.lock().unwrap().push(data.to_vec());
        self.outcome.clone().map_err(|message| AnchorError::Storage {
            provider: self.name.clone(),
            message,
        })
    }
}

/// Evidence source returning a fixed snapshot.
///
/// It always reports [`FakeSnapshotter::BUDGET`], so a `delay` past that
/// models a capture that overruns its bound.
#[derive(Default)]
pub struct FakeSnapshotter {
    pub snapshot: Snapshot,
    pub delay: Duration,
}

impl FakeSnapshotter {
    pub const BUDGET: Duration = Duration::from_millis(100);

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl EvidenceSource for FakeSnapshotter {
    async fn capture(&self, _target: &str) -> Snapshot {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.snapshot.clone()
    }

    fn time_budget(&self) -> Duration {
        Self::BUDGET
    }
}

/// Memory store whose collapse or transaction bookkeeping can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryReportStore,
    fail_collapse: AtomicBool,
    anchor_tx_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn fail_collapse(&self, fail: bool) {
        self.fail_collapse.store(fail, Ordering::SeqCst);
    }

    /// Reject the next `count` calls to `record_anchor_tx`.
    pub fn fail_anchor_tx_records(&self, count: usize) {
        self.anchor_tx_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReportStore for FlakyStore {
    async fn get(&self, id: &str) -> Result<Option<ReportDocument>> {
        self.inner.get(id).await
    }

    async fn try_acquire(
        &self,
        id: &str,
        lease: &Lease,
        intent: AcquireIntent,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingReport>> {
        self.inner.try_acquire(id, lease, intent, now).await
    }

    async fn release(&self, id: &str, owner: Uuid) -> Result<()> {
        self.inner.release(id, owner).await
    }

    async fn renew_lease(
        &self,
        id: &str,
        owner: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.renew_lease(id, owner, expires_at, now).await
    }

    async fn record_anchor_tx(&self, id: &str, tx: &AnchorTx) -> Result<()> {
        let failing = self
            .anchor_tx_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AnchorError::Database("transient".to_string()));
        }
        self.inner.record_anchor_tx(id, tx).await
    }

    async fn record_archive(&self, id: &str, archive: &ArchiveRef) -> Result<()> {
        self.inner.record_archive(id, archive).await
    }

    async fn record_error(&self, id: &str, error: &ErrorAnnotation) -> Result<()> {
        self.inner.record_error(id, error).await
    }

    async fn collapse(&self, id: &str, summary: &AnchoredSummary) -> Result<()> {
        if self.fail_collapse.load(Ordering::SeqCst) {
            return Err(AnchorError::Database("write rejected".to_string()));
        }
        self.inner.collapse(id, summary).await
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.inner.expired_leases(now).await
    }

    async fn clear_expired_lease(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.inner.clear_expired_lease(id, now).await
    }
}
