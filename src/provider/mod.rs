//! Upstream connector provider interface.
//!
//! The provider is an opaque capability: it lists the platform catalog and a
//! user's connections, executes actions, revokes connections, and reports
//! per-connector metrics when it has them. Response shapes are not trusted;
//! connections come back as raw JSON and are normalized by
//! [`ConnectionRegistry`](crate::connections::ConnectionRegistry).

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod http;
mod retry;

pub use http::{HttpConnectorProvider, HttpTokenRefresher, ProviderAuth};
pub use retry::{with_retry, RetryPolicy};

/// A connector as listed by the upstream catalog.
///
/// Only `id` is required; everything else is backfilled by the catalog
/// service when missing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpstreamConnector {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "logo", alias = "icon_url")]
    pub icon: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub features: Option<Vec<String>>,
    #[serde(default)]
    pub actions: Option<Vec<Value>>,
    #[serde(default)]
    pub requirements: Option<Vec<String>>,
}

/// Forwarded action call.
#[derive(Clone, Debug)]
pub struct ActionRequest {
    pub user_id: String,
    pub connector_id: String,
    pub action_id: String,
    pub payload: Value,
    /// Per-connector token from the vault, when one is held.
    pub credential: Option<String>,
}

/// Usage metrics a provider may expose for a connector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectorMetrics {
    /// Fraction of successful calls over the provider's window, 0.0..=1.0
    pub uptime: f64,
    /// Fraction of failed calls over the provider's window, 0.0..=1.0
    pub error_rate: f64,
    /// Calls per minute
    pub throughput: f64,
}

/// Upstream connector provider.
///
/// Implementations report failures as [`ProviderError`]; callers wrap them
/// with operation context before surfacing.
#[async_trait]
pub trait ConnectorProvider: Send + Sync {
    /// Lists every connector the platform offers.
    async fn list_connectors(&self) -> Result<Vec<UpstreamConnector>, ProviderError>;

    /// Lists a user's connections in whatever shape the provider uses.
    async fn list_connections(&self, user_id: &str) -> Result<Vec<Value>, ProviderError>;

    /// Executes a remote action and returns the provider's result.
    async fn execute_action(&self, request: ActionRequest) -> Result<Value, ProviderError>;

    /// Revokes a connection upstream.
    async fn delete_connection(&self, user_id: &str, connection_id: &str)
        -> Result<(), ProviderError>;

    /// Usage metrics for a connector, if the provider exposes them.
    async fn connector_metrics(
        &self,
        _user_id: &str,
        _connector_id: &str,
    ) -> Result<Option<ConnectorMetrics>, ProviderError> {
        Ok(None)
    }
}
