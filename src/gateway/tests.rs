use super::*;
use crate::connections::ConnectionRegistry;
use crate::credentials::MemorySecureStore;
use crate::error::ProviderError;
use crate::provider::testing::MockProvider;
use crate::provider::RetryPolicy;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::json;

fn gateway(provider: Arc<MockProvider>) -> ActionGateway {
    let registry = Arc::new(ConnectionRegistry::new(provider.clone(), RetryPolicy::none()));
    ActionGateway::new(registry, provider)
}

fn connected_gmail() -> Arc<MockProvider> {
    Arc::new(MockProvider::with_connections(vec![json!({
        "id": "c1",
        "connector_id": "gmail",
        "status": "connected"
    })]))
}

// --- authorization gate ---

#[tokio::test]
async fn test_denied_without_connection_never_calls_provider() {
    let provider = Arc::new(MockProvider::default());
    let err = gateway(provider.clone())
        .execute("u1", "gmail", "send_email", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, IntegrationError::Authorization { ref connector } if connector == "gmail"));
    assert_eq!(provider.execute_calls(), 0);
}

#[tokio::test]
async fn test_denied_when_connection_not_active() {
    let provider = Arc::new(MockProvider::with_connections(vec![json!({
        "id": "c1",
        "connector_id": "gmail",
        "status": "unauthorized"
    })]));

    let err = gateway(provider.clone())
        .execute("u1", "gmail", "send_email", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, IntegrationError::Authorization { .. }));
    assert_eq!(provider.execute_calls(), 0);
}

#[tokio::test]
async fn test_other_connector_does_not_authorize() {
    let provider = connected_gmail();
    let err = gateway(provider.clone())
        .execute("u1", "slack", "post_message", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, IntegrationError::Authorization { .. }));
    assert_eq!(provider.execute_calls(), 0);
}

// --- execution ---

#[tokio::test]
async fn test_execute_stamps_payload() {
    let provider = connected_gmail();
    let payload = json!({"to": "a@example.com", "subject": "Hi", "body": "Hello"});

    let result = gateway(provider.clone())
        .execute("u1", "gmail", "send_email", payload)
        .await
        .unwrap();

    assert_eq!(result["ok"], true);
    let forwarded = provider.last_request().unwrap().payload;
    assert_eq!(forwarded["to"], "a@example.com");
    assert_eq!(forwarded["subject"], "Hi");
    assert_eq!(forwarded[EXECUTED_BY], "u1");
    assert!(forwarded[EXECUTED_AT].is_string());
}

#[test]
fn test_stamped_keys_win() {
    let at = Utc::now();
    let stamped = stamp_payload(json!({"executed_by": "mallory", "x": 1}), "u1", at);
    assert_eq!(stamped[EXECUTED_BY], "u1");
    assert_eq!(stamped[EXECUTED_AT], at.to_rfc3339());
    assert_eq!(stamped["x"], 1);
}

#[test]
fn test_non_object_payloads() {
    let at = Utc::now();
    assert_eq!(stamp_payload(Value::Null, "u1", at).as_object().unwrap().len(), 2);
    assert_eq!(stamp_payload(json!([1, 2]), "u1", at)["data"], json!([1, 2]));
}

#[tokio::test]
async fn test_provider_error_is_wrapped_and_not_retried() {
    let provider = connected_gmail();
    provider.fail_action(ProviderError::Http {
        status: 503,
        body: "mailbox unavailable".into(),
    });

    let err = gateway(provider.clone())
        .execute("u1", "gmail", "send_email", json!({}))
        .await
        .unwrap_err();

    match err {
        IntegrationError::Provider { operation, source } => {
            assert_eq!(operation, "execute gmail/send_email");
            assert!(source.to_string().contains("mailbox unavailable"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(provider.execute_calls(), 1);
}

#[tokio::test]
async fn test_connection_lookup_failure_propagates() {
    let provider = Arc::new(MockProvider::default());
    provider.list_failures.lock().unwrap().push(ProviderError::Http {
        status: 500,
        body: "down".into(),
    });

    let err = gateway(provider.clone())
        .execute("u1", "gmail", "send_email", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, IntegrationError::Provider { .. }));
    assert_eq!(provider.execute_calls(), 0);
}

#[tokio::test]
async fn test_rejects_blank_action() {
    let provider = connected_gmail();
    let err = gateway(provider.clone())
        .execute("u1", "gmail", " ", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidInput(_)));
}

#[tokio::test]
async fn test_forwards_connector_token_from_vault() {
    let provider = connected_gmail();
    let vault = Arc::new(
        TokenVault::new(
            Arc::new(MemorySecureStore::new()),
            &BASE64.encode([7u8; 32]),
            "test",
        )
        .unwrap(),
    );
    vault
        .store_connection_token("u1", "gmail", "gmail-token", None)
        .await
        .unwrap();
    vault
        .store_connection_token("u2", "gmail", "other-user-token", None)
        .await
        .unwrap();

    gateway(provider.clone())
        .with_vault(vault)
        .execute("u1", "gmail", "send_email", json!({}))
        .await
        .unwrap();

    assert_eq!(
        provider.last_request().unwrap().credential.as_deref(),
        Some("gmail-token")
    );
}
