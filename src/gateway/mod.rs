//! Authorized remote action execution.
//!
//! Every call is gated on an active connection for the target connector,
//! checked at call time. Denied calls never reach the provider. Authorized
//! calls are stamped with the caller and time, forwarded once (actions may
//! not be idempotent, so there is no retry), and any provider failure is
//! wrapped with connector/action context.

pub mod lifecycle;

pub use lifecycle::{ConnectionState, LifecycleEntry, LifecycleEvent, LifecycleTracker};

use crate::connections::ActiveConnections;
use crate::credentials::TokenVault;
use crate::error::{IntegrationError, Result};
use crate::provider::{ActionRequest, ConnectorProvider};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Payload key naming the user who triggered the action.
pub const EXECUTED_BY: &str = "executed_by";
/// Payload key holding the RFC 3339 execution time.
pub const EXECUTED_AT: &str = "executed_at";

/// Adds `executed_by` / `executed_at` to a payload.
///
/// Objects keep their keys, but the stamped keys overwrite any caller value.
/// `null` becomes an empty object; any other non-object is wrapped as
/// `{"data": value}`.
pub fn stamp_payload(payload: Value, user_id: &str, at: DateTime<Utc>) -> Value {
    let mut object = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    object.insert(EXECUTED_BY.to_string(), Value::String(user_id.to_string()));
    object.insert(EXECUTED_AT.to_string(), Value::String(at.to_rfc3339()));
    Value::Object(object)
}

pub struct ActionGateway {
    connections: Arc<dyn ActiveConnections>,
    provider: Arc<dyn ConnectorProvider>,
    vault: Option<Arc<TokenVault>>,
}

impl ActionGateway {
    pub fn new(connections: Arc<dyn ActiveConnections>, provider: Arc<dyn ConnectorProvider>) -> Self {
        Self {
            connections,
            provider,
            vault: None,
        }
    }

    /// Forward per-connector tokens held in the vault with each action.
    pub fn with_vault(mut self, vault: Arc<TokenVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Executes `action_id` on `connector_id` for `user_id`.
    ///
    /// # Errors
    ///
    /// - `Authorization` when the user has no active connection to the
    ///   connector. The provider is not contacted.
    /// - `Provider` when the connection lookup or the action itself fails.
    pub async fn execute(
        &self,
        user_id: &str,
        connector_id: &str,
        action_id: &str,
        payload: Value,
    ) -> Result<Value> {
        if connector_id.trim().is_empty() || action_id.trim().is_empty() {
            return Err(IntegrationError::InvalidInput(
                "connector and action are required".to_string(),
            ));
        }

        let connection = self
            .connections
            .active_connection(user_id, connector_id)
            .await?;
        if connection.is_none() {
            warn!(
                user_id = %user_id,
                connector = %connector_id,
                action = %action_id,
                "Action denied: no active connection"
            );
            return Err(IntegrationError::Authorization {
                connector: connector_id.to_string(),
            });
        }

        let credential = match &self.vault {
            Some(vault) => vault.get_connection_token(user_id, connector_id).await?,
            None => None,
        };

        let request = ActionRequest {
            user_id: user_id.to_string(),
            connector_id: connector_id.to_string(),
            action_id: action_id.to_string(),
            payload: stamp_payload(payload, user_id, Utc::now()),
            credential,
        };

        let operation = format!("execute {connector_id}/{action_id}");
        match self.provider.execute_action(request).await {
            Ok(result) => {
                info!(user_id = %user_id, connector = %connector_id, action = %action_id, "Action executed");
                Ok(result)
            }
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    connector = %connector_id,
                    action = %action_id,
                    error = %e,
                    "Action failed"
                );
                Err(IntegrationError::provider(operation, e))
            }
        }
    }
}

#[cfg(test)]
mod tests;
