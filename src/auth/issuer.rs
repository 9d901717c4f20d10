//! HS256 compact JWS tokens for integration handshakes.
//!
//! ```text
//! base64url(header) . base64url(claims) . base64url(HMAC-SHA256(secret, header.claims))
//! ```

use crate::error::{IntegrationError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by an integration token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationClaims {
    pub iss: String,
    /// User the token was issued to
    pub sub: String,
    pub connector: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub iat: i64,
    pub exp: i64,
    /// Unique per issuance
    pub jti: String,
}

/// Result of `generate_auth_token`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    /// Seconds until the token expires
    pub expires_in: u64,
}

pub struct TokenIssuer {
    secret: Vec<u8>,
    issuer: String,
    ttl_seconds: u64,
}

impl TokenIssuer {
    /// # Arguments
    /// * `secret` - HMAC signing secret, must not be empty
    /// * `issuer` - Value of the `iss` claim
    /// * `ttl_seconds` - Lifetime of issued tokens
    pub fn new(secret: &str, issuer: &str, ttl_seconds: u64) -> Result<Self> {
        if secret.is_empty() {
            return Err(IntegrationError::Config("signing secret must not be empty".to_string()));
        }
        if ttl_seconds == 0 {
            return Err(IntegrationError::Config("token ttl must be positive".to_string()));
        }

        Ok(Self {
            secret: secret.as_bytes().to_vec(),
            issuer: issuer.to_string(),
            ttl_seconds,
        })
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Issues a signed token for `user_id` to connect `connector_id`.
    ///
    /// `metadata` must be a JSON object or null.
    pub fn generate(&self, user_id: &str, connector_id: &str, metadata: Value) -> Result<AuthToken> {
        if user_id.trim().is_empty() || connector_id.trim().is_empty() {
            return Err(IntegrationError::InvalidInput(
                "user and connector are required".to_string(),
            ));
        }
        let metadata = match metadata {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(IntegrationError::InvalidInput(
                    "metadata must be a JSON object".to_string(),
                ))
            }
        };

        let now = Utc::now().timestamp();
        let claims = IntegrationClaims {
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
            connector: connector_id.to_string(),
            metadata,
            iat: now,
            exp: now.saturating_add(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX)),
            jti: Uuid::new_v4().to_string(),
        };

        let header = json!({ "alg": "HS256", "typ": "JWT" });
        let signing_input = format!(
            "{}.{}",
            encode_segment(&header)?,
            encode_segment(&claims)?
        );
        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes())?);

        Ok(AuthToken {
            token: format!("{signing_input}.{signature}"),
            expires_in: self.ttl_seconds,
        })
    }

    /// Checks signature and expiry and returns the claims.
    pub fn verify(&self, token: &str) -> Result<IntegrationClaims> {
        let invalid = || IntegrationError::InvalidInput("invalid integration token".to_string());

        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(invalid());
        };

        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| invalid())?;
        let mut mac = self.mac()?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).map_err(|_| invalid())?;

        let claims: IntegrationClaims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(invalid)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(IntegrationError::InvalidInput("integration token expired".to_string()));
        }
        Ok(claims)
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| IntegrationError::Config(format!("invalid signing secret: {e}")))
    }
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| IntegrationError::InvalidInput(format!("unencodable claims: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
