//! Platform-wide integration catalog.
//!
//! The upstream catalog is often sparse. [`enrich`] backfills category,
//! popularity and features from [`CatalogTables`] and is a pure function
//! of its inputs; [`CatalogService`] only adds the fetch.

use crate::config::CatalogTables;
use crate::error::{IntegrationError, Result};
use crate::provider::{with_retry, ConnectorProvider, RetryPolicy, UpstreamConnector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Catalog metadata for one connector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub category: String,
    pub popular: bool,
    pub features: Vec<String>,
    pub actions: Vec<Value>,
    pub requirements: Vec<String>,
}

/// Builds a descriptor from an upstream connector, filling gaps from `tables`.
///
/// Upstream values win when present and non-empty.
pub fn enrich(upstream: &UpstreamConnector, tables: &CatalogTables) -> IntegrationDescriptor {
    let id = upstream.id.clone();

    let name = non_empty(upstream.name.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| display_name(&id));
    let description = non_empty(upstream.description.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Connect your {name} account"));
    let category = non_empty(upstream.category.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| tables.category_for(&id).to_string());
    let features = match &upstream.features {
        Some(features) if !features.is_empty() => features.clone(),
        _ => tables.features_for(&id),
    };

    IntegrationDescriptor {
        popular: tables.is_popular(&id),
        icon: upstream.icon.clone(),
        actions: upstream.actions.clone().unwrap_or_default(),
        requirements: upstream.requirements.clone().unwrap_or_default(),
        id,
        name,
        description,
        category,
        features,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// `google-calendar` → `Google Calendar`
fn display_name(id: &str) -> String {
    id.split(['-', '_', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct CatalogService {
    provider: Arc<dyn ConnectorProvider>,
    tables: Arc<CatalogTables>,
    retry: RetryPolicy,
}

impl CatalogService {
    pub fn new(
        provider: Arc<dyn ConnectorProvider>,
        tables: Arc<CatalogTables>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            tables,
            retry,
        }
    }

    /// Fetches the upstream catalog and enriches every entry.
    pub async fn list_available(&self) -> Result<Vec<IntegrationDescriptor>> {
        let upstream = with_retry(&self.retry, "list connectors", || {
            self.provider.list_connectors()
        })
        .await
        .map_err(|e| IntegrationError::provider("list connectors", e))?;

        debug!(count = upstream.len(), "Fetched upstream catalog");

        Ok(upstream
            .iter()
            .map(|connector| enrich(connector, &self.tables))
            .collect())
    }
}
