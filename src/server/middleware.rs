/// Bearer-secret check for the hook and repair endpoints.
///
/// The store's change feed and operators share one secret. Handlers that take
/// [`HookAuth`] as an argument are rejected with 401 before they run unless
/// the request carries `Authorization: Bearer <secret>`.
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;

use super::routes::ErrorResponse;
use super::AppState;
use crate::crypto::hash;

#[derive(Debug, Clone, Copy)]
pub struct HookAuth;

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

impl FromRequestParts<Arc<AppState>> for HookAuth {
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("Missing Authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("Invalid Authorization format"))?;

        if !hash::secrets_match(token.as_bytes(), state.hook_secret.as_bytes()) {
            return Err(unauthorized("Invalid hook secret"));
        }

        Ok(HookAuth)
    }
}
