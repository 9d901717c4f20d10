//! HTTP client for the upstream connector provider.
//!
//! # Endpoints
//! - `GET    {base}/v1/connectors`
//! - `GET    {base}/v1/users/{user}/connections`
//! - `POST   {base}/v1/users/{user}/connectors/{connector}/actions/{action}`
//! - `DELETE {base}/v1/users/{user}/connections/{connection}`
//! - `GET    {base}/v1/users/{user}/connectors/{connector}/metrics`
//! - `POST   {base}/v1/oauth/refresh`
//!
//! List endpoints may answer with a bare array or wrap it in an object
//! (`connectors`, `connections`, `items` or `data`).

use super::{ActionRequest, ConnectorMetrics, ConnectorProvider, UpstreamConnector};
use crate::credentials::{IssuedToken, TokenRefresher, TokenVault};
use crate::error::ProviderError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header carrying the per-connector token on action calls.
const CONNECTOR_TOKEN_HEADER: &str = "X-Connector-Token";

/// How requests to the provider authenticate.
#[derive(Clone)]
pub enum ProviderAuth {
    /// Static platform API key.
    ApiKey(String),
    /// The vault's primary token, refreshed on demand.
    Session(Arc<TokenVault>),
}

/// Connector provider reached over HTTP.
pub struct HttpConnectorProvider {
    base_url: String,
    auth: ProviderAuth,
    http_client: reqwest::Client,
}

impl HttpConnectorProvider {
    /// Creates a client whose every request is bounded by `timeout`.
    pub fn new(base_url: &str, auth: ProviderAuth, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            http_client: build_client(timeout)?,
        })
    }

    fn user_url(&self, user_id: &str, rest: &str) -> String {
        format!(
            "{}/v1/users/{}/{}",
            self.base_url,
            urlencoding::encode(user_id),
            rest
        )
    }

    async fn bearer(&self) -> Result<String, ProviderError> {
        match &self.auth {
            ProviderAuth::ApiKey(key) => Ok(key.clone()),
            ProviderAuth::Session(vault) => match vault.retrieve().await {
                Ok(Some(token)) => Ok(token),
                Ok(None) => Err(ProviderError::Http {
                    status: 401,
                    body: "session expired".to_string(),
                }),
                Err(e) => Err(ProviderError::Rejected(format!(
                    "session token unavailable: {}",
                    e
                ))),
            },
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let response = request
            .bearer_auth(self.bearer().await?)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(ProviderError::Http { status, body });
        }

        Ok(response)
    }

    async fn get_json(&self, url: &str) -> Result<Value, ProviderError> {
        let response = self.send(self.http_client.get(url)).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ConnectorProvider for HttpConnectorProvider {
    async fn list_connectors(&self) -> Result<Vec<UpstreamConnector>, ProviderError> {
        let url = format!("{}/v1/connectors", self.base_url);
        let body = self.get_json(&url).await?;

        let connectors: Vec<UpstreamConnector> = unwrap_list(body, "connectors")
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(connector) => Some(connector),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed catalog entry");
                    None
                }
            })
            .collect();

        debug!(count = connectors.len(), "Fetched upstream catalog");
        Ok(connectors)
    }

    async fn list_connections(&self, user_id: &str) -> Result<Vec<Value>, ProviderError> {
        let url = self.user_url(user_id, "connections");
        let body = self.get_json(&url).await?;
        Ok(unwrap_list(body, "connections"))
    }

    async fn execute_action(&self, request: ActionRequest) -> Result<Value, ProviderError> {
        let url = self.user_url(
            &request.user_id,
            &format!(
                "connectors/{}/actions/{}",
                urlencoding::encode(&request.connector_id),
                urlencoding::encode(&request.action_id)
            ),
        );

        let mut builder = self.http_client.post(&url).json(&request.payload);
        if let Some(credential) = &request.credential {
            builder = builder.header(CONNECTOR_TOKEN_HEADER, credential);
        }

        let response = self.send(builder).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn delete_connection(&self, user_id: &str, connection_id: &str) -> Result<(), ProviderError> {
        let url = self.user_url(
            user_id,
            &format!("connections/{}", urlencoding::encode(connection_id)),
        );
        self.send(self.http_client.delete(&url)).await?;
        Ok(())
    }

    async fn connector_metrics(
        &self,
        user_id: &str,
        connector_id: &str,
    ) -> Result<Option<ConnectorMetrics>, ProviderError> {
        let url = self.user_url(
            user_id,
            &format!("connectors/{}/metrics", urlencoding::encode(connector_id)),
        );

        match self.get_json(&url).await {
            Ok(body) => serde_json::from_value(body)
                .map(Some)
                .map_err(|e| ProviderError::Decode(e.to_string())),
            // Providers without a metrics endpoint
            Err(ProviderError::Http { status: 404 | 501, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Refreshes the vault's primary token against the provider's OAuth endpoint.
pub struct HttpTokenRefresher {
    token_url: String,
    http_client: reqwest::Client,
}

impl HttpTokenRefresher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            token_url: format!("{}/v1/oauth/refresh", base_url.trim_end_matches('/')),
            http_client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, ProviderError> {
        info!("Requesting token refresh from provider");

        let response = self
            .http_client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(ProviderError::Http { status, body });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Transport(format!("failed to build HTTP client: {e}")))
}

/// Extracts the item list from either a bare array or a wrapping object.
fn unwrap_list(body: Value, preferred_key: &str) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut map) => [preferred_key, "items", "data", "results"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemorySecureStore;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn provider(url: &str) -> HttpConnectorProvider {
        HttpConnectorProvider::new(
            url,
            ProviderAuth::ApiKey("platform-key".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_unwrap_list_shapes() {
        assert_eq!(unwrap_list(json!([{"id": "a"}]), "connections").len(), 1);
        assert_eq!(
            unwrap_list(json!({"connections": [{"id": "a"}, {"id": "b"}]}), "connections").len(),
            2
        );
        assert_eq!(unwrap_list(json!({"data": [{"id": "a"}]}), "connectors").len(), 1);
        assert!(unwrap_list(json!({"unexpected": true}), "connectors").is_empty());
        assert!(unwrap_list(json!("nope"), "connectors").is_empty());
    }

    #[tokio::test]
    async fn test_list_connectors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/connectors")
            .match_header("authorization", "Bearer platform-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[{"id":"gmail","name":"Gmail"},{"id":"slack"},{"name":"no id"}]}"#)
            .create_async()
            .await;

        let connectors = provider(&server.url()).list_connectors().await.unwrap();
        assert_eq!(connectors.len(), 2);
        assert_eq!(connectors[0].id, "gmail");
        assert_eq!(connectors[0].name.as_deref(), Some("Gmail"));
        assert!(connectors[1].name.is_none());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_execute_action_forwards_payload_and_credential() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/users/user%201/connectors/gmail/actions/send_email")
            .match_header("x-connector-token", "gmail-token")
            .match_body(mockito::Matcher::PartialJson(json!({"to": "a@example.com"})))
            .with_status(200)
            .with_body(r#"{"message_id":"m-1"}"#)
            .create_async()
            .await;

        let result = provider(&server.url())
            .execute_action(ActionRequest {
                user_id: "user 1".to_string(),
                connector_id: "gmail".to_string(),
                action_id: "send_email".to_string(),
                payload: json!({"to": "a@example.com"}),
                credential: Some("gmail-token".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(result["message_id"], "m-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("DELETE", "/v1/users/u1/connections/c1")
            .with_status(403)
            .with_body("forbidden")
            .create_async()
            .await;

        let err = provider(&server.url())
            .delete_connection("u1", "c1")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::Http {
                status: 403,
                body: "forbidden".to_string()
            }
        );
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn test_missing_metrics_endpoint_is_none() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/users/u1/connectors/gmail/metrics")
            .with_status(404)
            .create_async()
            .await;

        let metrics = provider(&server.url())
            .connector_metrics("u1", "gmail")
            .await
            .unwrap();
        assert!(metrics.is_none());
    }

    #[tokio::test]
    async fn test_session_auth_without_token_is_unauthorized() {
        let store = Arc::new(MemorySecureStore::new());
        let vault = Arc::new(TokenVault::new(store, &BASE64.encode([0u8; 32]), "test").unwrap());
        let provider = HttpConnectorProvider::new(
            "http://127.0.0.1:9",
            ProviderAuth::Session(vault),
            Duration::from_secs(1),
        )
        .unwrap();

        let err = provider.list_connectors().await.unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/oauth/refresh")
            .match_body(mockito::Matcher::PartialJson(json!({"refresh_token": "my_refresh"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new_token","expires_in":3600}"#)
            .create_async()
            .await;

        let refresher = HttpTokenRefresher::new(&server.url(), Duration::from_secs(5)).unwrap();
        let issued = refresher.refresh("my_refresh").await.unwrap();
        assert_eq!(issued.access_token, "new_token");
        assert_eq!(issued.expires_in, Some(3600));
        assert!(issued.refresh_token.is_none());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_http_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/oauth/refresh")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let refresher = HttpTokenRefresher::new(&server.url(), Duration::from_secs(5)).unwrap();
        let err = refresher.refresh("expired_refresh").await.unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 400, .. }));
    }
}
