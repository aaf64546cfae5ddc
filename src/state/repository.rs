/// PostgreSQL report store.
///
/// All queries use sqlx runtime-checked queries (not compile-time checked)
/// to avoid requiring a live database during development builds.
///
/// Pending and anchored records share the `reports` table. Collapse nulls
/// every pending-only column and stores the summary in `summary`, so the row
/// keeps its primary key and `created_at` while its shape changes.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::models::*;
use super::{Database, ReportStore, LEASE_EXPIRED_MESSAGE};
use crate::error::{AnchorError, Result};

/// Report store backed by the `reports` and `votes` tables.
#[derive(Clone)]
pub struct PgReportStore {
    db: Database,
}

impl PgReportStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/// Raw `reports` row.
#[derive(Debug, FromRow)]
struct ReportRow {
    id: String,
    state: String,
    url: String,
    description: Option<String>,
    author_id: Option<String>,
    author_name: Option<String>,
    upvotes: i64,
    downvotes: i64,
    created_at: DateTime<Utc>,
    anchored: bool,
    anchoring_in_progress: bool,
    anchoring_started_at: Option<DateTime<Utc>>,
    lease_owner: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    anchor_tx: Option<String>,
    anchor_tx_url: Option<String>,
    anchor_block: Option<i64>,
    archive_cid: Option<String>,
    archive_provider: Option<String>,
    evidence_hash: Option<String>,
    archived_at: Option<DateTime<Utc>>,
    anchoring_error: bool,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    error_phase: Option<Phase>,
    summary: Option<Json<AnchoredSummary>>,
}

/// Column list matching [`ReportRow`], shared by reads and `RETURNING`.
const REPORT_COLUMNS: &str = r#"
    id, state::TEXT AS state, url, description, author_id, author_name,
    upvotes, downvotes, created_at, anchored, anchoring_in_progress,
    anchoring_started_at, lease_owner, lease_expires_at, anchor_tx,
    anchor_tx_url, anchor_block, archive_cid, archive_provider,
    evidence_hash, archived_at, anchoring_error, last_error,
    last_error_at, error_phase, summary
"#;

impl TryFrom<ReportRow> for ReportDocument {
    type Error = AnchorError;

    fn try_from(row: ReportRow) -> Result<Self> {
        if row.state == "anchored" {
            let Json(summary) = row.summary.ok_or_else(|| {
                AnchorError::Database(format!("Anchored report {} has no summary", row.id))
            })?;
            return Ok(ReportDocument::Anchored(summary));
        }

        let lease = match (row.lease_owner, row.lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
            _ => None,
        };
        let anchor_tx = match (row.anchor_tx, row.anchor_tx_url) {
            (Some(tx_id), Some(tx_url)) => Some(AnchorTx {
                tx_id,
                tx_url,
                block_number: row.anchor_block.map(|b| b as u64),
            }),
            _ => None,
        };
        let archive = match (row.archive_cid, row.evidence_hash, row.archived_at) {
            (Some(cid), Some(evidence_hash), Some(archived_at)) => Some(ArchiveRef {
                cid,
                evidence_hash,
                provider: row.archive_provider.unwrap_or_default(),
                archived_at,
            }),
            _ => None,
        };

        Ok(ReportDocument::Pending(PendingReport {
            id: row.id,
            target: row.url,
            description: row.description,
            author_id: row.author_id,
            author_name: row.author_name,
            upvotes: row.upvotes,
            downvotes: row.downvotes,
            created_at: row.created_at,
            anchored: row.anchored,
            anchoring_in_progress: row.anchoring_in_progress,
            anchoring_started_at: row.anchoring_started_at,
            lease,
            anchor_tx,
            archive,
            anchoring_error: row.anchoring_error,
            last_error: row.last_error,
            last_error_at: row.last_error_at,
            error_phase: row.error_phase,
        }))
    }
}

/// Execute a pending-only update and fail if no pending row matched.
fn expect_pending_row(
    result: std::result::Result<sqlx::postgres::PgQueryResult, sqlx::Error>,
    id: &str,
) -> Result<()> {
    if result?.rows_affected() == 0 {
        return Err(AnchorError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Conditional lease write for `intent`.
///
/// The WHERE clause mirrors `PendingReport::admits`; the single UPDATE is the
/// compare-and-set and returns the row as written.
fn acquire_sql(intent: AcquireIntent) -> String {
    let intent_clause = match intent {
        AcquireIntent::Trigger => "NOT anchored",
        AcquireIntent::Resume => "anchor_tx IS NOT NULL",
    };
    format!(
        r#"
        UPDATE reports
        SET anchoring_in_progress = TRUE,
            anchoring_started_at = $4,
            lease_owner = $2,
            lease_expires_at = $3
        WHERE id = $1
          AND state = 'pending'
          AND {intent_clause}
          AND (
                (lease_owner IS NULL AND NOT anchoring_in_progress)
             OR (lease_owner IS NOT NULL AND lease_expires_at <= $4)
          )
        RETURNING {REPORT_COLUMNS}
        "#
    )
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn get(&self, id: &str) -> Result<Option<ReportDocument>> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = $1");
        let row = sqlx::query_as::<_, ReportRow>(&sql)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        row.map(ReportDocument::try_from).transpose()
    }

    async fn try_acquire(
        &self,
        id: &str,
        lease: &Lease,
        intent: AcquireIntent,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingReport>> {
        let sql = acquire_sql(intent);
        let row = sqlx::query_as::<_, ReportRow>(&sql)
            .bind(id)
            .bind(lease.owner)
            .bind(lease.expires_at)
            .bind(now)
            .fetch_optional(self.db.pool())
            .await?;

        match row.map(ReportDocument::try_from).transpose()? {
            Some(ReportDocument::Pending(report)) => Ok(Some(report)),
            _ => Ok(None),
        }
    }

    async fn release(&self, id: &str, owner: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE reports
            SET anchoring_in_progress = FALSE, lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND state = 'pending' AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn renew_lease(
        &self,
        id: &str,
        owner: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET lease_expires_at = $3
            WHERE id = $1 AND state = 'pending'
              AND lease_owner = $2 AND lease_expires_at > $4
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_anchor_tx(&self, id: &str, tx: &AnchorTx) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET anchored = TRUE, anchor_tx = $2, anchor_tx_url = $3, anchor_block = $4
            WHERE id = $1 AND state = 'pending'
            "#,
        )
        .bind(id)
        .bind(&tx.tx_id)
        .bind(&tx.tx_url)
        .bind(tx.block_number.map(|b| b as i64))
        .execute(self.db.pool())
        .await;

        expect_pending_row(result, id)
    }

    async fn record_archive(&self, id: &str, archive: &ArchiveRef) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET archive_cid = $2, evidence_hash = $3, archive_provider = $4, archived_at = $5
            WHERE id = $1 AND state = 'pending'
            "#,
        )
        .bind(id)
        .bind(&archive.cid)
        .bind(&archive.evidence_hash)
        .bind(&archive.provider)
        .bind(archive.archived_at)
        .execute(self.db.pool())
        .await;

        expect_pending_row(result, id)
    }

    async fn record_error(&self, id: &str, error: &ErrorAnnotation) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET anchoring_error = TRUE, last_error = $2, last_error_at = $3, error_phase = $4,
                anchored = anchored OR $5::TEXT IS NOT NULL,
                anchor_tx = COALESCE($5, anchor_tx),
                anchor_tx_url = COALESCE($6, anchor_tx_url),
                anchor_block = COALESCE($7, anchor_block)
            WHERE id = $1 AND state = 'pending'
            "#,
        )
        .bind(id)
        .bind(&error.message)
        .bind(error.at)
        .bind(error.phase)
        .bind(error.anchor_tx.as_ref().map(|tx| tx.tx_id.as_str()))
        .bind(error.anchor_tx.as_ref().map(|tx| tx.tx_url.as_str()))
        .bind(
            error
                .anchor_tx
                .as_ref()
                .and_then(|tx| tx.block_number)
                .map(|b| b as i64),
        )
        .execute(self.db.pool())
        .await;

        expect_pending_row(result, id)
    }

    async fn collapse(&self, id: &str, summary: &AnchoredSummary) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE reports
            SET state = 'anchored',
                summary = $2,
                url = $3,
                upvotes = $4,
                downvotes = $5,
                anchored = TRUE,
                anchor_tx = $6,
                anchor_tx_url = $7,
                archive_cid = $8,
                evidence_hash = $9,
                archived_at = $10,
                description = NULL,
                author_id = NULL,
                author_name = NULL,
                anchoring_in_progress = FALSE,
                anchoring_started_at = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                anchor_block = NULL,
                archive_provider = NULL,
                anchoring_error = FALSE,
                last_error = NULL,
                last_error_at = NULL,
                error_phase = NULL
            WHERE id = $1 AND state = 'pending'
            "#,
        )
        .bind(id)
        .bind(Json(summary))
        .bind(&summary.target)
        .bind(summary.upvotes)
        .bind(summary.downvotes)
        .bind(&summary.anchor_tx)
        .bind(&summary.anchor_tx_url)
        .bind(&summary.archive_cid)
        .bind(&summary.evidence_hash)
        .bind(summary.archived_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AnchorError::NotFound(id.to_string()));
        }

        sqlx::query("DELETE FROM votes WHERE report_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM reports
            WHERE state = 'pending' AND anchoring_in_progress AND lease_expires_at <= $1
            ORDER BY id
            "#,
        )
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;

        Ok(ids)
    }

    async fn clear_expired_lease(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET anchoring_in_progress = FALSE,
                lease_owner = NULL,
                lease_expires_at = NULL,
                anchoring_error = TRUE,
                last_error = $3,
                last_error_at = $2
            WHERE id = $1 AND state = 'pending' AND anchoring_in_progress
              AND lease_expires_at <= $2
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(LEASE_EXPIRED_MESSAGE)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
