//! User connections fetched from the provider and normalized into one shape.
//!
//! Providers disagree on field names (`id` vs `connection_id`, `created_at`
//! vs `connected_at`, ...) and on status vocabulary. Both are resolved here:
//! every attribute has an explicit priority list of source fields, and
//! status normalization is total.

use crate::error::{IntegrationError, Result};
use crate::provider::{with_retry, ConnectorProvider, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};


/// Source fields for each canonical attribute, highest priority first.
const ID_FIELDS: &[&str] = &["id", "connection_id", "connectionId", "uuid"];
const CONNECTOR_FIELDS: &[&str] = &[
    "connector_id",
    "connectorId",
    "connector",
    "integration_id",
    "integrationId",
    "app",
    "provider",
    // Some providers key connections by connector
    "id",
];
const STATUS_FIELDS: &[&str] = &["status", "state", "connection_status", "connectionStatus"];
const CONNECTED_AT_FIELDS: &[&str] = &["connected_at", "created_at", "connectedAt", "createdAt"];
const LAST_SYNC_FIELDS: &[&str] = &[
    "last_sync_at",
    "last_synced_at",
    "lastSyncAt",
    "lastSyncedAt",
    "updated_at",
    "updatedAt",
];
const METADATA_FIELDS: &[&str] = &["metadata", "meta", "data"];

/// Canonical connection status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Inactive,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Inactive => "inactive",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps any upstream status value to a canonical status.
///
/// Case-insensitive. `active|connected|enabled|online` → active,
/// `error|failed|broken|unauthorized` → error, anything else (including
/// null, missing, or non-string values) → inactive.
pub fn normalize_status(raw: Option<&Value>) -> ConnectionStatus {
    let Some(Value::String(s)) = raw else {
        return ConnectionStatus::Inactive;
    };
    match s.trim().to_ascii_lowercase().as_str() {
        "active" | "connected" | "enabled" | "online" => ConnectionStatus::Active,
        "error" | "failed" | "broken" | "unauthorized" => ConnectionStatus::Error,
        _ => ConnectionStatus::Inactive,
    }
}

/// A user's link to one connector, in canonical form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub connector_id: String,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Connection {
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }
}

/// Normalizes one raw upstream connection.
///
/// Returns `None` when no identifier can be found in any known field.
/// A missing connection timestamp falls back to `now`.
pub fn normalize_connection(raw: &Value, now: DateTime<Utc>) -> Option<Connection> {
    let object = raw.as_object()?;

    let id = first_field(object, ID_FIELDS).and_then(as_identifier)?;
    let connector_id = first_field(object, CONNECTOR_FIELDS)
        .and_then(as_identifier)
        .unwrap_or_else(|| id.clone());

    let status = normalize_status(first_field(object, STATUS_FIELDS));
    let connected_at = first_field(object, CONNECTED_AT_FIELDS)
        .and_then(as_timestamp)
        .unwrap_or(now);
    let last_sync_at = first_field(object, LAST_SYNC_FIELDS).and_then(as_timestamp);
    let metadata = first_field(object, METADATA_FIELDS)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    Some(Connection {
        id,
        connector_id,
        status,
        connected_at,
        last_sync_at,
        metadata,
    })
}

/// First non-null value among `fields`.
fn first_field<'a>(object: &'a Map<String, Value>, fields: &[&str]) -> Option<&'a Value> {
    fields
        .iter()
        .filter_map(|field| object.get(*field))
        .find(|value| !value.is_null())
}

fn as_identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts RFC 3339 strings and Unix timestamps (seconds or milliseconds).
fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| s.parse::<i64>().ok().and_then(from_epoch)),
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    // Anything past year 2286 in seconds is taken as milliseconds
    if value.abs() >= 10_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// Answers "does this user have an active connection to this connector?"
///
/// Implemented by [`ConnectionRegistry`]; the action gateway depends only on
/// this, so a cache can stand in for a live lookup.
#[async_trait]
pub trait ActiveConnections: Send + Sync {
    async fn active_connection(&self, user_id: &str, connector_id: &str)
        -> Result<Option<Connection>>;
}

/// Fetches and normalizes a user's connections. Holds no local cache.
pub struct ConnectionRegistry {
    provider: Arc<dyn ConnectorProvider>,
    retry: RetryPolicy,
}

impl ConnectionRegistry {
    pub fn new(provider: Arc<dyn ConnectorProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Lists the user's connections in canonical form.
    ///
    /// Entries without any recognizable identifier are skipped.
    pub async fn list(&self, user_id: &str) -> Result<Vec<Connection>> {
        let raw = with_retry(&self.retry, "list connections", || {
            self.provider.list_connections(user_id)
        })
        .await
        .map_err(|e| IntegrationError::provider("list connections", e))?;

        let now = Utc::now();
        let total = raw.len();
        let connections: Vec<Connection> = raw
            .iter()
            .filter_map(|item| {
                let normalized = normalize_connection(item, now);
                if normalized.is_none() {
                    warn!(user_id = %user_id, "Skipping connection without an identifier");
                }
                normalized
            })
            .collect();

        debug!(
            user_id = %user_id,
            total,
            normalized = connections.len(),
            "Fetched connections"
        );
        Ok(connections)
    }

    /// Revokes a connection upstream.
    ///
    /// Nothing is cached locally, so callers re-fetch to observe the change.
    pub async fn disconnect(&self, user_id: &str, connection_id: &str) -> Result<()> {
        self.provider
            .delete_connection(user_id, connection_id)
            .await
            .map_err(|e| {
                warn!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    error = %e,
                    "Provider failed to revoke connection"
                );
                IntegrationError::Disconnect {
                    reason: e.to_string(),
                }
            })?;

        info!(user_id = %user_id, connection_id = %connection_id, "Connection revoked");
        Ok(())
    }
}

#[async_trait]
impl ActiveConnections for ConnectionRegistry {
    async fn active_connection(
        &self,
        user_id: &str,
        connector_id: &str,
    ) -> Result<Option<Connection>> {
        Ok(self
            .list(user_id)
            .await?
            .into_iter()
            .find(|c| c.connector_id == connector_id && c.is_active()))
    }
}
