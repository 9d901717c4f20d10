//! Provider session endpoints.
//!
//! The session token authenticates this service against the connector
//! provider and lives only in the vault.

use super::{caller, AppError, AppState};
use axum::{
    extract::State,
    http::HeaderMap,
    response::Json,
    routing::put,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Request body for PUT /api/session
#[derive(Deserialize)]
pub struct SessionRequest {
    pub token: String,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub success: bool,
}

/// Create session API router
pub fn create_session_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/session", put(store_session).delete(logout))
        .with_state(state)
}

/// PUT /api/session - Store the provider session token
async fn store_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let user_id = caller(&headers)?;
    if request.ttl_seconds == 0 {
        return Err(AppError::BadRequest("ttl_seconds must be positive".to_string()));
    }

    state
        .service
        .store_session(
            &request.token,
            request.ttl_seconds,
            request.refresh_token.as_deref(),
        )
        .await?;

    info!(user_id = %user_id, "Provider session stored");
    Ok(Json(SessionResponse { success: true }))
}

/// DELETE /api/session - Log the caller out and drop their connection tokens
async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, AppError> {
    let user_id = caller(&headers)?;
    state.service.logout(&user_id).await?;
    Ok(Json(SessionResponse { success: true }))
}
