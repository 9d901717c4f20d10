//! Integration, connection and health endpoints.

use super::{caller, json_or_null, AppError, AppState};
use crate::auth::AuthToken;
use crate::catalog::IntegrationDescriptor;
use crate::connections::Connection;
use crate::gateway::ConnectionState;
use crate::health::HealthSummary;
use crate::service::DisconnectResult;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// List integrations response
#[derive(Serialize)]
pub struct ListIntegrationsResponse {
    pub integrations: Vec<IntegrationDescriptor>,
}

/// List connections response
#[derive(Serialize)]
pub struct ListConnectionsResponse {
    pub connections: Vec<Connection>,
}

/// Request body for POST /api/integrations/:connector/callback
#[derive(Deserialize)]
pub struct CallbackRequest {
    pub success: bool,
}

#[derive(Serialize)]
pub struct CallbackResponse {
    pub connector: String,
    pub state: ConnectionState,
}

#[derive(Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub result: Value,
}

#[derive(Deserialize, Default)]
pub struct HealthQuery {
    #[serde(default)]
    pub detailed: bool,
}

/// Create integration API router
pub fn create_integration_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/integrations", get(list_integrations))
        .route("/api/integrations/overview", get(overview))
        .route("/api/integrations/:connector/token", post(generate_token))
        .route("/api/integrations/:connector/callback", post(record_callback))
        .route(
            "/api/integrations/:connector/actions/:action",
            post(execute_action),
        )
        .route("/api/integrations/:connector/health", get(test_connection))
        .route("/api/connections", get(list_connections))
        .route("/api/connections/:id", delete(disconnect))
        .route("/api/health", get(health_status))
        .with_state(state)
}

/// GET /api/integrations - Platform catalog, enriched
async fn list_integrations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListIntegrationsResponse>, AppError> {
    caller(&headers)?;
    let integrations = state.service.list_integrations().await?;
    Ok(Json(ListIntegrationsResponse { integrations }))
}

/// GET /api/integrations/overview - Catalog joined with the caller's
/// connections and health
async fn overview(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user_id = caller(&headers)?;
    let overview = state.service.overview(&user_id).await?;
    Ok(Json(overview).into_response())
}

/// POST /api/integrations/:connector/token - Issue a connect token
///
/// Body (optional): `{"metadata": {...}}`
async fn generate_token(
    State(state): State<Arc<AppState>>,
    Path(connector): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AuthToken>, AppError> {
    let user_id = caller(&headers)?;
    let metadata = match json_or_null(&body)? {
        Value::Object(mut map) => map.remove("metadata").unwrap_or(Value::Null),
        Value::Null => Value::Null,
        _ => return Err(AppError::BadRequest("Body must be a JSON object".to_string())),
    };

    let issued = state
        .service
        .generate_auth_token(&user_id, &connector, metadata)
        .await?;
    Ok(Json(issued))
}

/// POST /api/integrations/:connector/callback - Provider connect outcome
async fn record_callback(
    State(state): State<Arc<AppState>>,
    Path(connector): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CallbackRequest>,
) -> Result<Json<CallbackResponse>, AppError> {
    let user_id = caller(&headers)?;
    let new_state = state
        .service
        .record_callback(&user_id, &connector, request.success)?;
    Ok(Json(CallbackResponse {
        connector,
        state: new_state,
    }))
}

/// POST /api/integrations/:connector/actions/:action - Execute an action
///
/// The request body is forwarded as the action payload.
async fn execute_action(
    State(state): State<Arc<AppState>>,
    Path((connector, action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ActionResponse>, AppError> {
    let user_id = caller(&headers)?;
    let data = json_or_null(&body)?;

    debug!(user_id = %user_id, connector = %connector, action = %action, "Executing action");

    let result = state
        .service
        .execute_action(&user_id, &connector, &action, data)
        .await?;
    Ok(Json(ActionResponse {
        success: true,
        result,
    }))
}

/// GET /api/integrations/:connector/health - Probe one connection
///
/// `?detailed=true` adds provider metrics (or an explicit unavailable marker).
async fn test_connection(
    State(state): State<Arc<AppState>>,
    Path(connector): Path<String>,
    Query(query): Query<HealthQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user_id = caller(&headers)?;
    let response = if query.detailed {
        Json(state.service.test_connection_detailed(&user_id, &connector).await).into_response()
    } else {
        Json(state.service.test_connection(&user_id, &connector).await).into_response()
    };
    Ok(response)
}

/// GET /api/connections - Caller's connections, normalized
async fn list_connections(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListConnectionsResponse>, AppError> {
    let user_id = caller(&headers)?;
    let connections = state.service.list_connections(&user_id).await?;
    Ok(Json(ListConnectionsResponse { connections }))
}

/// DELETE /api/connections/:id - Revoke a connection upstream
async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResult>, AppError> {
    let user_id = caller(&headers)?;
    let result = state.service.disconnect(&user_id, &connection_id).await?;
    Ok(Json(result))
}

/// GET /api/health - Health of every active connection of the caller
async fn health_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<HealthSummary>, AppError> {
    let user_id = caller(&headers)?;
    let summary = state.service.get_health_status(&user_id).await?;
    Ok(Json(summary))
}
