/// Report record store.
///
/// The pipeline writes to the store in three distinct shapes, which are not
/// interchangeable:
/// - conditional update (lease acquire, compare against `anchored` and the lease)
/// - full-document replace (collapse)
/// - plain field update (anchor/archive bookkeeping, error annotation, release)
///
/// Two backends implement [`ReportStore`]: PostgreSQL for deployments and an
/// in-memory map for development and tests.
pub mod memory;
pub mod models;
pub mod repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AnchorError, Result};
use models::{
    AcquireIntent, AnchorTx, AnchoredSummary, ArchiveRef, ErrorAnnotation, Lease, PendingReport,
    ReportDocument,
};

/// `lastError` stamped on a record whose lease was swept by reconciliation.
pub const LEASE_EXPIRED_MESSAGE: &str = "lease expired before the pipeline released it";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AnchorError::Database(format!("Migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Persistence seam for report records.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Read the current record.
    async fn get(&self, id: &str) -> Result<Option<ReportDocument>>;

    /// Atomically take the lease if the record admits `intent`.
    ///
    /// Sets `anchoringInProgress`, the start timestamp and the lease in a
    /// single conditional write. Returns the record as written, or `None` when
    /// the condition failed (already anchored, collapsed, missing, or held).
    async fn try_acquire(
        &self,
        id: &str,
        lease: &Lease,
        intent: AcquireIntent,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingReport>>;

    /// Clear `anchoringInProgress` and the lease if `owner` still holds it.
    async fn release(&self, id: &str, owner: Uuid) -> Result<()>;

    /// Push the lease expiry to `expires_at` if `owner` still holds a live
    /// lease. Returns false when the lease expired or changed hands.
    async fn renew_lease(
        &self,
        id: &str,
        owner: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record the confirmed ledger transaction and mark the record anchored.
    async fn record_anchor_tx(&self, id: &str, tx: &AnchorTx) -> Result<()>;

    /// Record where the evidence record was stored.
    async fn record_archive(&self, id: &str, archive: &ArchiveRef) -> Result<()>;

    /// Set `anchoringError`, `lastError`, `lastErrorAt` and the failing phase.
    /// A transaction carried by the annotation is recorded as well.
    async fn record_error(&self, id: &str, error: &ErrorAnnotation) -> Result<()>;

    /// Replace the pending record with its summary and drop per-voter rows.
    async fn collapse(&self, id: &str, summary: &AnchoredSummary) -> Result<()>;

    /// Ids of records still flagged in progress whose lease has expired.
    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    /// Clear an expired lease, annotating the record. Returns false if the
    /// lease was renewed or released in the meantime.
    async fn clear_expired_lease(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;
}
