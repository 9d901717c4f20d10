//! Caller-facing integration API.
//!
//! [`IntegrationService`] wires the vault, catalog, connection registry,
//! health monitor, action gateway and lifecycle tracker together and is the
//! only type the HTTP layer talks to.
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │      IntegrationService      │
//!                 └──────────────────────────────┘
//!        │            │            │           │           │
//!   TokenIssuer  CatalogService  Registry  HealthMonitor  ActionGateway
//!        │                          │                        │
//!    TokenVault ◄───────────────────┴────── LifecycleTracker ┘
//! ```

use crate::aggregate::{Aggregator, InputKind, IntegrationOverview};
use crate::auth::{AuthToken, TokenIssuer};
use crate::catalog::{CatalogService, IntegrationDescriptor};
use crate::config::LinkhubConfig;
use crate::connections::{Connection, ConnectionRegistry};
use crate::credentials::TokenVault;
use crate::error::{IntegrationError, Result};
use crate::gateway::{ActionGateway, ConnectionState, LifecycleEvent, LifecycleTracker};
use crate::health::{DetailedHealth, HealthMonitor, HealthRecord, HealthSummary};
use crate::provider::ConnectorProvider;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DisconnectResult {
    pub success: bool,
}

pub struct IntegrationService {
    vault: Arc<TokenVault>,
    issuer: TokenIssuer,
    catalog: CatalogService,
    registry: Arc<ConnectionRegistry>,
    health: HealthMonitor,
    gateway: ActionGateway,
    lifecycle: LifecycleTracker,
}

impl IntegrationService {
    /// Builds every component from validated configuration.
    ///
    /// # Arguments
    /// * `provider` - Upstream connector provider shared by all components
    /// * `vault` - Token vault for connector tokens and the session
    /// * `config` - Must have passed [`LinkhubConfig::validate`]
    pub fn new(
        provider: Arc<dyn ConnectorProvider>,
        vault: Arc<TokenVault>,
        config: &LinkhubConfig,
    ) -> Result<Self> {
        let secret = config
            .auth
            .signing_secret
            .as_deref()
            .ok_or_else(|| IntegrationError::Config("signing secret missing".to_string()))?;
        let issuer = TokenIssuer::new(secret, &config.auth.issuer, config.auth.token_ttl_seconds)?;

        let retry = config.provider.retry.clone();
        let registry = Arc::new(ConnectionRegistry::new(provider.clone(), retry.clone()));

        Ok(Self {
            catalog: CatalogService::new(
                provider.clone(),
                Arc::new(config.catalog.clone()),
                retry.clone(),
            ),
            health: HealthMonitor::new(provider.clone(), retry, config.health.probe_action.clone())
                .with_vault(vault.clone()),
            gateway: ActionGateway::new(registry.clone(), provider).with_vault(vault.clone()),
            registry,
            issuer,
            vault,
            lifecycle: LifecycleTracker::new(),
        })
    }

    // ── Tokens & session ─────────────────────────────────────────────────────

    /// Issues a token for connecting `connector_id`.
    ///
    /// The token is kept in the vault as the user's token for that
    /// connector until it expires, and the connection moves to `pending`. A connection that is
    /// already active keeps its state.
    pub async fn generate_auth_token(
        &self,
        user_id: &str,
        connector_id: &str,
        metadata: Value,
    ) -> Result<AuthToken> {
        let issued = self.issuer.generate(user_id, connector_id, metadata)?;

        self.vault
            .store_connection_token(user_id, connector_id, &issued.token, Some(issued.expires_in))
            .await?;

        if let Err(e) = self
            .lifecycle
            .transition(user_id, connector_id, LifecycleEvent::TokenIssued)
        {
            debug!(user_id = %user_id, connector = %connector_id, error = %e, "Token issued without state change");
        }

        info!(user_id = %user_id, connector = %connector_id, "Integration token issued");
        Ok(issued)
    }

    /// Records the outcome of the provider's connect callback.
    pub fn record_callback(
        &self,
        user_id: &str,
        connector_id: &str,
        success: bool,
    ) -> Result<ConnectionState> {
        let event = if success {
            LifecycleEvent::CallbackSucceeded
        } else {
            LifecycleEvent::CallbackFailed
        };
        self.lifecycle.transition(user_id, connector_id, event)
    }

    pub fn connection_state(&self, user_id: &str, connector_id: &str) -> ConnectionState {
        self.lifecycle.state(user_id, connector_id)
    }

    /// Stores the session token used to authenticate against the provider.
    pub async fn store_session(
        &self,
        token: &str,
        ttl_seconds: u64,
        refresh_token: Option<&str>,
    ) -> Result<()> {
        self.vault.store(token, ttl_seconds, refresh_token).await
    }

    /// Logs `user_id` out: drops their connection tokens and lifecycle
    /// state. The provider session and other users are untouched.
    pub async fn logout(&self, user_id: &str) -> Result<()> {
        self.vault.clear_connection_tokens(user_id).await?;
        self.lifecycle.forget_user(user_id);
        info!(user_id = %user_id, "Session cleared");
        Ok(())
    }

    // ── Catalog & connections ────────────────────────────────────────────────

    pub async fn list_integrations(&self) -> Result<Vec<IntegrationDescriptor>> {
        self.catalog.list_available().await
    }

    pub async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>> {
        let connections = self.registry.list(user_id).await?;
        self.lifecycle.sync(user_id, &connections);
        Ok(connections)
    }

    /// Revokes a connection upstream and drops its local token.
    pub async fn disconnect(&self, user_id: &str, connection_id: &str) -> Result<DisconnectResult> {
        self.registry.disconnect(user_id, connection_id).await?;

        if let Some(connector_id) = self.lifecycle.connector_for(user_id, connection_id) {
            self.lifecycle
                .transition(user_id, &connector_id, LifecycleEvent::Disconnected)?;
            self.vault
                .remove_connection_token(user_id, &connector_id)
                .await?;
        }

        Ok(DisconnectResult { success: true })
    }

    // ── Actions ──────────────────────────────────────────────────────────────

    /// Executes an action. A provider auth failure marks the connection
    /// as errored so the caller can offer re-authentication.
    pub async fn execute_action(
        &self,
        user_id: &str,
        connector_id: &str,
        action_id: &str,
        data: Value,
    ) -> Result<Value> {
        let result = self
            .gateway
            .execute(user_id, connector_id, action_id, data)
            .await;

        if let Err(e) = &result {
            if e.needs_reauthentication() {
                self.mark_auth_revoked(user_id, connector_id);
            }
        }
        result
    }

    // ── Health ───────────────────────────────────────────────────────────────

    // A probe rejected for bad credentials revokes the connection, the same
    // as a rejected action.

    pub async fn test_connection(&self, user_id: &str, connector_id: &str) -> HealthRecord {
        let record = self.health.check(user_id, connector_id).await;
        self.apply_health(user_id, std::slice::from_ref(&record));
        record
    }

    pub async fn test_connection_detailed(&self, user_id: &str, connector_id: &str) -> DetailedHealth {
        let detailed = self.health.check_detailed(user_id, connector_id).await;
        self.apply_health(user_id, std::slice::from_ref(&detailed.record));
        detailed
    }

    /// Probes every active connection of the user.
    pub async fn get_health_status(&self, user_id: &str) -> Result<HealthSummary> {
        let connectors = active_connectors(&self.list_connections(user_id).await?);
        let summary = self.health.check_all(user_id, &connectors).await;
        self.apply_health(user_id, &summary.integrations);
        Ok(summary)
    }

    // ── Overview ─────────────────────────────────────────────────────────────

    /// Fetches catalog, connections and health concurrently and composes
    /// the overview.
    pub async fn overview(&self, user_id: &str) -> Result<IntegrationOverview> {
        self.refresh_overview(user_id, &Aggregator::new()).await
    }

    /// Like [`overview`](Self::overview), feeding results into `aggregator`
    /// as they complete.
    ///
    /// Stops early if the aggregator is cancelled and returns whatever was
    /// applied before. Only a catalog failure is an error; without
    /// connections every integration reads as disconnected.
    pub async fn refresh_overview(
        &self,
        user_id: &str,
        aggregator: &Aggregator,
    ) -> Result<IntegrationOverview> {
        let cancelled = aggregator.cancellation();

        let catalog = async {
            let ticket = aggregator.begin(InputKind::Catalog);
            let descriptors = self.catalog.list_available().await?;
            aggregator.apply_catalog(ticket, descriptors);
            Ok::<_, IntegrationError>(())
        };

        let connections_and_health = async {
            let ticket = aggregator.begin(InputKind::Connections);
            let connections = match self.list_connections(user_id).await {
                Ok(connections) => connections,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Overview without connections");
                    return;
                }
            };
            let connectors = active_connectors(&connections);
            aggregator.apply_connections(ticket, connections);

            let ticket = aggregator.begin(InputKind::Health);
            let summary = self.health.check_all(user_id, &connectors).await;
            self.apply_health(user_id, &summary.integrations);
            aggregator.apply_health(ticket, summary.integrations);
        };

        tokio::select! {
            biased;
            _ = cancelled.cancelled() => {
                debug!(user_id = %user_id, "Overview refresh cancelled");
            }
            (catalog, ()) = async { tokio::join!(catalog, connections_and_health) } => {
                catalog?;
            }
        }

        Ok(aggregator.snapshot())
    }

    fn apply_health(&self, user_id: &str, records: &[HealthRecord]) {
        for record in records.iter().filter(|r| r.reauthenticate) {
            self.mark_auth_revoked(user_id, &record.connector);
        }
    }

    fn mark_auth_revoked(&self, user_id: &str, connector_id: &str) {
        if self.lifecycle.state(user_id, connector_id) != ConnectionState::Active {
            return;
        }
        if let Err(e) = self
            .lifecycle
            .transition(user_id, connector_id, LifecycleEvent::AuthRevoked)
        {
            debug!(user_id = %user_id, connector = %connector_id, error = %e, "Could not mark auth revoked");
        }
    }
}

fn active_connectors(connections: &[Connection]) -> Vec<String> {
    let mut ids: Vec<String> = connections
        .iter()
        .filter(|c| c.is_active())
        .map(|c| c.connector_id.clone())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemorySecureStore;
    use crate::error::ProviderError;
    use crate::provider::testing::MockProvider;
    use crate::provider::RetryPolicy;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde_json::json;

    fn config() -> LinkhubConfig {
        let mut config = LinkhubConfig::default();
        config.auth.signing_secret = Some("test-secret".to_string());
        config.provider.retry = RetryPolicy::none();
        config
    }

    fn service(provider: Arc<MockProvider>) -> (IntegrationService, Arc<TokenVault>) {
        let vault = Arc::new(
            TokenVault::new(
                Arc::new(MemorySecureStore::new()),
                &BASE64.encode([3u8; 32]),
                "test",
            )
            .unwrap(),
        );
        let service = IntegrationService::new(provider, vault.clone(), &config()).unwrap();
        (service, vault)
    }

    fn provider_with_gmail() -> Arc<MockProvider> {
        let provider = MockProvider::with_connectors(&["gmail", "slack", "unknown-svc"]);
        *provider.connections.lock().unwrap() =
            vec![json!({"id": "c1", "connector_id": "gmail", "status": "active"})];
        Arc::new(provider)
    }

    #[tokio::test]
    async fn test_generate_auth_token_stores_and_moves_to_pending() {
        let (service, vault) = service(Arc::new(MockProvider::default()));

        let issued = service.generate_auth_token("u1", "notion", json!({})).await.unwrap();

        assert_eq!(
            vault.get_connection_token("u1", "notion").await.unwrap().as_deref(),
            Some(issued.token.as_str())
        );
        assert_eq!(service.connection_state("u1", "notion"), ConnectionState::Pending);

        assert_eq!(
            service.record_callback("u1", "notion", true).unwrap(),
            ConnectionState::Active
        );
    }

    #[tokio::test]
    async fn test_missing_signing_secret_is_config_error() {
        let vault = Arc::new(
            TokenVault::new(Arc::new(MemorySecureStore::new()), &BASE64.encode([3u8; 32]), "t")
                .unwrap(),
        );
        let result = IntegrationService::new(
            Arc::new(MockProvider::default()),
            vault,
            &LinkhubConfig::default(),
        );
        assert!(matches!(result, Err(IntegrationError::Config(_))));
    }

    #[tokio::test]
    async fn test_auth_failure_marks_connection_errored() {
        let provider = provider_with_gmail();
        provider.fail_action(ProviderError::Http {
            status: 401,
            body: "revoked".into(),
        });
        let (service, _) = service(provider);

        service.list_connections("u1").await.unwrap();
        assert_eq!(service.connection_state("u1", "gmail"), ConnectionState::Active);

        let err = service
            .execute_action("u1", "gmail", "send_email", json!({}))
            .await
            .unwrap_err();
        assert!(err.needs_reauthentication());
        assert_eq!(service.connection_state("u1", "gmail"), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_disconnect_clears_token_and_state() {
        let provider = provider_with_gmail();
        let (service, vault) = service(provider);
        vault
            .store_connection_token("u1", "gmail", "gmail-token", None)
            .await
            .unwrap();
        service.list_connections("u1").await.unwrap();

        let result = service.disconnect("u1", "c1").await.unwrap();

        assert!(result.success);
        assert_eq!(service.connection_state("u1", "gmail"), ConnectionState::Disconnected);
        assert!(vault.get_connection_token("u1", "gmail").await.unwrap().is_none());
        assert!(service.list_connections("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_status_covers_active_connections() {
        let (service, _) = service(provider_with_gmail());
        let summary = service.get_health_status("u1").await.unwrap();

        assert_eq!(summary.integrations.len(), 1);
        assert_eq!(summary.integrations[0].connector, "gmail");
    }

    #[tokio::test]
    async fn test_overview() {
        let (service, _) = service(provider_with_gmail());
        let overview = service.overview("u1").await.unwrap();

        assert_eq!(overview.counts.total, 3);
        assert_eq!(overview.connected, vec!["gmail".to_string()]);
        assert_eq!(overview.by_category["Other"], vec!["unknown-svc".to_string()]);
    }

    #[tokio::test]
    async fn test_overview_survives_connection_failure() {
        let provider = provider_with_gmail();
        provider.list_failures.lock().unwrap().push(ProviderError::Http {
            status: 500,
            body: "down".into(),
        });
        let (service, _) = service(provider);

        let overview = service.overview("u1").await.unwrap();
        assert_eq!(overview.counts.total, 3);
        assert_eq!(overview.counts.connected, 0);
    }

    #[tokio::test]
    async fn test_cancelled_overview_applies_nothing() {
        let (service, _) = service(provider_with_gmail());
        let aggregator = Aggregator::new();
        aggregator.cancel();

        let overview = service.refresh_overview("u1", &aggregator).await.unwrap();
        assert!(overview.integrations.is_empty());
    }

    #[tokio::test]
    async fn test_logout_clears_only_the_caller() {
        let (service, vault) = service(Arc::new(MockProvider::default()));
        service.store_session("session", 60, None).await.unwrap();
        service.generate_auth_token("u1", "gmail", json!({})).await.unwrap();
        service.generate_auth_token("u2", "gmail", json!({})).await.unwrap();

        service.logout("u1").await.unwrap();

        assert!(vault.connection_token_ids("u1").await.unwrap().is_empty());
        assert_eq!(service.connection_state("u1", "gmail"), ConnectionState::Disconnected);

        assert_eq!(vault.connection_token_ids("u2").await.unwrap(), vec!["gmail".to_string()]);
        assert_eq!(service.connection_state("u2", "gmail"), ConnectionState::Pending);
        assert_eq!(vault.retrieve().await.unwrap().as_deref(), Some("session"));
    }

    #[tokio::test]
    async fn test_users_sharing_a_connector_keep_their_own_tokens() {
        let provider = provider_with_gmail();
        let (service, vault) = service(provider.clone());

        let alice = service.generate_auth_token("alice", "gmail", json!({})).await.unwrap();
        let bob = service.generate_auth_token("bob", "gmail", json!({})).await.unwrap();
        assert_ne!(alice.token, bob.token);

        service
            .execute_action("alice", "gmail", "send_email", json!({}))
            .await
            .unwrap();
        assert_eq!(
            provider.last_request().unwrap().credential.as_deref(),
            Some(alice.token.as_str())
        );

        service.list_connections("bob").await.unwrap();
        service.disconnect("bob", "c1").await.unwrap();
        service.logout("bob").await.unwrap();

        assert!(vault.get_connection_token("bob", "gmail").await.unwrap().is_none());
        assert_eq!(
            vault.get_connection_token("alice", "gmail").await.unwrap().as_deref(),
            Some(alice.token.as_str())
        );
    }

    #[tokio::test]
    async fn test_rejected_probe_marks_connection_errored() {
        let provider = provider_with_gmail();
        let (service, _) = service(provider.clone());
        service.list_connections("u1").await.unwrap();
        assert_eq!(service.connection_state("u1", "gmail"), ConnectionState::Active);

        provider.fail_action(ProviderError::Http {
            status: 401,
            body: "revoked".into(),
        });
        let record = service.test_connection("u1", "gmail").await;

        assert!(record.reauthenticate);
        assert_eq!(service.connection_state("u1", "gmail"), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_health_status_marks_revoked_connections() {
        let provider = provider_with_gmail();
        provider.fail_action(ProviderError::Http {
            status: 403,
            body: "forbidden".into(),
        });
        let (service, _) = service(provider);

        let summary = service.get_health_status("u1").await.unwrap();

        assert_eq!(summary.overall_status, crate::health::HealthStatus::Error);
        assert_eq!(service.connection_state("u1", "gmail"), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_transient_probe_failure_keeps_connection_active() {
        let provider = provider_with_gmail();
        provider.fail_action(ProviderError::Http {
            status: 500,
            body: "down".into(),
        });
        let (service, _) = service(provider);
        service.list_connections("u1").await.unwrap();

        let record = service.test_connection("u1", "gmail").await;

        assert!(!record.reauthenticate);
        assert_eq!(service.connection_state("u1", "gmail"), ConnectionState::Active);
    }
}
