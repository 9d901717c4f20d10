//! HTTP surface over [`IntegrationService`](crate::service::IntegrationService).
//!
//! Callers authenticate with `Authorization: Bearer <user id>`. Errors are
//! JSON `{"error": "..."}` bodies carrying the user-facing message, plus
//! `"reauthenticate": true` when the integration needs to be reconnected.

mod integrations;
mod session;

pub use integrations::create_integration_router;
pub use session::create_session_router;

use crate::auth::extract_bearer_token;
use crate::error::IntegrationError;
use crate::service::IntegrationService;
use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::error;

/// Shared application state for the integration API
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IntegrationService>,
}

/// Full API router.
pub fn create_router(service: Arc<IntegrationService>) -> Router {
    let state = Arc::new(AppState { service });
    Router::new()
        .merge(create_integration_router(state.clone()))
        .merge(create_session_router(state))
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    reauthenticate: bool,
}

/// Application error types for API endpoints
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    ServerError(String),
    BadGateway { message: String, reauthenticate: bool },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, reauthenticate) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, false),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, true),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, false),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, false),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, false),
            AppError::BadGateway {
                message,
                reauthenticate,
            } => (StatusCode::BAD_GATEWAY, message, reauthenticate),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            reauthenticate,
        });

        (status, body).into_response()
    }
}

impl From<IntegrationError> for AppError {
    fn from(e: IntegrationError) -> Self {
        let message = e.user_message();
        match &e {
            IntegrationError::InvalidInput(_) => AppError::BadRequest(message),
            IntegrationError::InvalidTransition { .. } => AppError::BadRequest(e.to_string()),
            IntegrationError::ExpiryExhausted { .. } => AppError::Unauthorized(message),
            IntegrationError::Authorization { .. } => AppError::Forbidden(message),
            IntegrationError::Provider { source, .. } if source.is_not_found() => {
                AppError::NotFound(message)
            }
            IntegrationError::Provider { .. } | IntegrationError::Disconnect { .. } => {
                AppError::BadGateway {
                    reauthenticate: e.needs_reauthentication(),
                    message,
                }
            }
            IntegrationError::Storage(_)
            | IntegrationError::Corruption(_)
            | IntegrationError::Config(_) => {
                error!(error = %e, "Internal error");
                AppError::ServerError(message)
            }
        }
    }
}

/// Resolves the calling user from the bearer token.
fn caller(headers: &HeaderMap) -> Result<String, AppError> {
    extract_bearer_token(headers).map_err(|e| AppError::Unauthorized(e.to_string()))
}

/// Parses an optional JSON body. Empty bodies read as `null`.
fn json_or_null(body: &Bytes) -> Result<Value, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {e}")))
}
