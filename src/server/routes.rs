/// Hook and repair routes.
///
/// The update hook answers as soon as the trigger predicate has been
/// evaluated; the pipeline itself runs in a spawned task because a ledger
/// confirmation can take minutes. The resume route runs synchronously so the
/// operator sees the outcome.
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, info};

use super::middleware::HookAuth;
use super::AppState;
use crate::pipeline::RunOutcome;
use crate::trigger::{self, ReportUpdate};

/// Error body returned by every route.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Health ──────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

// ─── Update hook ─────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HookResponse {
    status: &'static str,
    report_id: String,
}

/// POST /hooks/report-updated: evaluate an update and start the pipeline.
async fn report_updated(
    _auth: HookAuth,
    State(state): State<Arc<AppState>>,
    Json(update): Json<ReportUpdate>,
) -> (StatusCode, Json<HookResponse>) {
    let threshold = state.pipeline.config().vote_threshold;
    if !trigger::should_anchor(&update, threshold) {
        return (
            StatusCode::OK,
            Json(HookResponse {
                status: "skipped",
                report_id: update.id,
            }),
        );
    }

    let pipeline = state.pipeline.clone();
    let report_id = update.id.clone();
    tokio::spawn(async move {
        match pipeline.handle_update(&update).await {
            Ok(outcome) => info!(report_id = %update.id, outcome = ?outcome, "Pipeline run finished"),
            Err(e) => error!(report_id = %update.id, error = %e, "Pipeline run aborted"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(HookResponse {
            status: "accepted",
            report_id,
        }),
    )
}

pub fn hook_routes() -> Router<Arc<AppState>> {
    Router::new().route("/hooks/report-updated", post(report_updated))
}

// ─── Repair ──────────────────────────────────────────────

/// POST /api/reports/{id}/resume: finish an anchored report.
async fn resume_report(
    _auth: HookAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunOutcome>, (StatusCode, Json<ErrorResponse>)> {
    state.pipeline.resume(&id).await.map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("Resume failed: {e}"),
            }),
        )
    })
}

pub fn repair_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/reports/{id}/resume", post(resume_report))
}
