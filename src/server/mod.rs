/// HTTP surface for the anchoring pipeline.
///
/// The server is a thin trigger layer. It receives record update events from
/// the store's change feed, evaluates the trigger predicate, and hands
/// qualifying reports to the pipeline in the background. Operators use the
/// same surface to resume reports that failed after their ledger write.
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::error::{AnchorError, Result};
use crate::pipeline::AnchoringPipeline;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AnchoringPipeline>,
    /// Bearer secret expected on hook and repair requests.
    pub hook_secret: String,
}

/// Build the Axum application with all routes and middleware.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::hook_routes())
        .merge(routes::repair_routes())
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

/// Start the hook server.
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(AnchorError::Io)?;

    tracing::info!("phishblock-anchor listening on {addr}");

    axum::serve(listener, app).await.map_err(AnchorError::Io)?;

    Ok(())
}
