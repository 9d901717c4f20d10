//! Error taxonomy for the integration core.
//!
//! Two layers:
//! - [`ProviderError`]: raw failures from the upstream connector provider.
//!   Never handed to callers as-is.
//! - [`IntegrationError`]: what the library surfaces, with the operation
//!   context attached.

/// Failure reported by (or while talking to) the upstream connector provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The provider answered with a non-success status.
    #[error("provider returned status {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never completed (DNS, connection reset, TLS, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The request exceeded its time bound.
    #[error("request timed out")]
    Timeout,

    /// The response body could not be decoded.
    #[error("malformed provider response: {0}")]
    Decode(String),

    /// The provider rejected the call for a provider-specific reason.
    #[error("{0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether an idempotent read may be retried after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport(_) | ProviderError::Timeout => true,
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Decode(_) | ProviderError::Rejected(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::Http { status: 404, .. })
    }

    /// Whether the provider signalled revoked or invalid authorization.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ProviderError::Http { status: 401 | 403, .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

/// Errors surfaced by the integration core.
#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    /// The secure store is unavailable or a write failed.
    #[error("secure storage error: {0}")]
    Storage(String),

    /// A stored blob failed to decrypt or parse.
    ///
    /// Recovered inside the vault as a cache miss; never returned from a
    /// public vault operation.
    #[error("corrupted secret: {0}")]
    Corruption(String),

    /// The token expired and no refresh was possible.
    #[error("credentials for `{key}` expired and could not be refreshed")]
    ExpiryExhausted { key: String },

    /// An action was attempted without an active connection.
    #[error("no active connection for connector `{connector}`")]
    Authorization { connector: String },

    /// A remote call failed; `operation` names what was being attempted.
    #[error("{operation} failed: {source}")]
    Provider {
        operation: String,
        #[source]
        source: ProviderError,
    },

    /// The provider refused or failed to revoke a connection.
    #[error("failed to disconnect: {reason}")]
    Disconnect { reason: String },

    /// Caller-supplied input was rejected before any I/O.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A connection lifecycle event is not valid from the current state.
    #[error("cannot apply `{event}` while connection is `{from}`")]
    InvalidTransition { from: String, event: String },

    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl IntegrationError {
    pub(crate) fn provider(operation: impl Into<String>, source: ProviderError) -> Self {
        IntegrationError::Provider {
            operation: operation.into(),
            source,
        }
    }

    /// Text suitable for showing to an end user.
    ///
    /// Storage and configuration failures are reported generically so no
    /// encryption details leak.
    pub fn user_message(&self) -> String {
        match self {
            IntegrationError::Storage(_) | IntegrationError::Corruption(_) => {
                "Secure storage is unavailable. Please try again.".to_string()
            }
            IntegrationError::ExpiryExhausted { .. } => {
                "Your session has expired. Please re-authenticate this integration.".to_string()
            }
            IntegrationError::Authorization { connector } => {
                format!("Connect {connector} first to use this action.")
            }
            IntegrationError::Provider { operation, source } if source.is_auth_failure() => {
                format!("{operation} was rejected. Please re-authenticate this integration.")
            }
            IntegrationError::Provider { .. } | IntegrationError::Disconnect { .. } => {
                self.to_string()
            }
            IntegrationError::InvalidInput(msg) => msg.clone(),
            IntegrationError::InvalidTransition { .. } | IntegrationError::Config(_) => {
                "The integration service is misconfigured.".to_string()
            }
        }
    }

    /// Whether the caller should be offered a re-authenticate affordance.
    pub fn needs_reauthentication(&self) -> bool {
        match self {
            IntegrationError::ExpiryExhausted { .. } => true,
            IntegrationError::Provider { source, .. } => source.is_auth_failure(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for IntegrationError {
    fn from(e: rusqlite::Error) -> Self {
        IntegrationError::Storage(e.to_string())
    }
}

pub type Result<T, E = IntegrationError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(ProviderError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(!ProviderError::Http { status: 404, body: String::new() }.is_retryable());
        assert!(!ProviderError::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn test_auth_failure_classification() {
        assert!(ProviderError::Http { status: 401, body: String::new() }.is_auth_failure());
        assert!(ProviderError::Http { status: 403, body: String::new() }.is_auth_failure());
        assert!(!ProviderError::Http { status: 500, body: String::new() }.is_auth_failure());
    }

    #[test]
    fn test_user_messages() {
        let err = IntegrationError::Authorization {
            connector: "gmail".to_string(),
        };
        assert_eq!(err.user_message(), "Connect gmail first to use this action.");

        let err = IntegrationError::Storage("AES key schedule failed".to_string());
        assert!(!err.user_message().contains("AES"));

        let err = IntegrationError::provider(
            "execute gmail/send_email",
            ProviderError::Http { status: 500, body: "boom".into() },
        );
        assert!(err.user_message().contains("gmail/send_email"));
        assert!(!err.needs_reauthentication());

        let err = IntegrationError::ExpiryExhausted { key: "auth_token".into() };
        assert!(err.needs_reauthentication());
    }
}
