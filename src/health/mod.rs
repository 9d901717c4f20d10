//! Connection health probing and classification.
//!
//! A probe is a no-op action sent through the provider. Whatever happens,
//! the outcome is captured in a [`HealthRecord`]; probe failures are data,
//! not errors, so every public method here is infallible.
//!
//! ```text
//! check ──► probe action (retry on transient) ──► HealthRecord
//!                                                     │
//! check_all ──► join_all(check) ──► aggregate ──► HealthSummary
//! ```

use crate::credentials::TokenVault;
use crate::provider::{with_retry, ActionRequest, ConnectorMetrics, ConnectorProvider, RetryPolicy};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Smallest latency ever reported for a successful probe (1µs).
const MIN_LATENCY_MS: f64 = 0.001;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Error => "error",
        }
    }
}

/// Result of one probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub connector: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    /// Round-trip time in milliseconds; present and positive on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The provider rejected the connection's credentials
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reauthenticate: bool,
}

/// Usage metrics, or an explicit marker that the provider has none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum MetricsReport {
    Available(ConnectorMetrics),
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetailedHealth {
    #[serde(flatten)]
    pub record: HealthRecord,
    pub metrics: MetricsReport,
}

/// Per-user health snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub integrations: Vec<HealthRecord>,
    pub overall_status: HealthStatus,
    pub last_updated: DateTime<Utc>,
}

/// Three-way classification of a set of statuses.
///
/// Any `error` → error; every status `healthy` (including none at all)
/// → healthy; otherwise degraded.
pub fn classify(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
    let mut overall = HealthStatus::Healthy;
    for status in statuses {
        match status {
            HealthStatus::Error => return HealthStatus::Error,
            HealthStatus::Degraded => overall = HealthStatus::Degraded,
            HealthStatus::Healthy => {}
        }
    }
    overall
}

/// Overall status of a set of health records. See [`classify`].
pub fn aggregate(records: &[HealthRecord]) -> HealthStatus {
    classify(records.iter().map(|r| r.status))
}

pub struct HealthMonitor {
    provider: Arc<dyn ConnectorProvider>,
    vault: Option<Arc<TokenVault>>,
    retry: RetryPolicy,
    probe_action: String,
}

impl HealthMonitor {
    pub fn new(
        provider: Arc<dyn ConnectorProvider>,
        retry: RetryPolicy,
        probe_action: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            vault: None,
            retry,
            probe_action: probe_action.into(),
        }
    }

    /// Attach per-connector credentials from the vault to probes.
    pub fn with_vault(mut self, vault: Arc<TokenVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Probes one connector.
    pub async fn check(&self, user_id: &str, connector_id: &str) -> HealthRecord {
        let credential = self.credential_for(user_id, connector_id).await;
        let started = Instant::now();

        let outcome = with_retry(&self.retry, "health probe", || {
            self.provider.execute_action(ActionRequest {
                user_id: user_id.to_string(),
                connector_id: connector_id.to_string(),
                action_id: self.probe_action.clone(),
                payload: json!({ "probe": true }),
                credential: credential.clone(),
            })
        })
        .await;

        let last_check = Utc::now();
        match outcome {
            Ok(_) => {
                let latency = (started.elapsed().as_secs_f64() * 1000.0).max(MIN_LATENCY_MS);
                debug!(user_id = %user_id, connector = %connector_id, latency_ms = latency, "Probe succeeded");
                HealthRecord {
                    connector: connector_id.to_string(),
                    status: HealthStatus::Healthy,
                    last_check,
                    latency_ms: Some(latency),
                    error: None,
                    reauthenticate: false,
                }
            }
            Err(e) => {
                warn!(user_id = %user_id, connector = %connector_id, error = %e, "Probe failed");
                HealthRecord {
                    connector: connector_id.to_string(),
                    status: HealthStatus::Error,
                    last_check,
                    latency_ms: None,
                    error: Some(e.to_string()),
                    reauthenticate: e.is_auth_failure(),
                }
            }
        }
    }

    /// Probes one connector and attaches provider metrics when exposed.
    pub async fn check_detailed(&self, user_id: &str, connector_id: &str) -> DetailedHealth {
        let record = self.check(user_id, connector_id).await;

        let metrics = match self.provider.connector_metrics(user_id, connector_id).await {
            Ok(Some(metrics)) => MetricsReport::Available(metrics),
            Ok(None) => MetricsReport::Unavailable,
            Err(e) => {
                debug!(connector = %connector_id, error = %e, "Metrics lookup failed");
                MetricsReport::Unavailable
            }
        };

        DetailedHealth { record, metrics }
    }

    /// Probes every connector concurrently and classifies the result.
    pub async fn check_all(&self, user_id: &str, connector_ids: &[String]) -> HealthSummary {
        let integrations =
            join_all(connector_ids.iter().map(|id| self.check(user_id, id))).await;

        HealthSummary {
            overall_status: aggregate(&integrations),
            integrations,
            last_updated: Utc::now(),
        }
    }

    async fn credential_for(&self, user_id: &str, connector_id: &str) -> Option<String> {
        let vault = self.vault.as_ref()?;
        match vault.get_connection_token(user_id, connector_id).await {
            Ok(token) => token,
            Err(e) => {
                warn!(connector = %connector_id, error = %e, "Could not read connector token for probe");
                None
            }
        }
    }
}
