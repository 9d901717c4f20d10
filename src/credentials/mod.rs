//! Encrypted, expiry-aware token storage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenVault                         │
//! │  - expiry checks, single-flight refresh  │
//! │  - salt rotation, integrity checks       │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!      (seal)                (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - AES-256-GCM, key = H(master || salt)  │
//! │  - Unique nonce per blob                 │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SecureStore                        │
//! │  - opaque blobs by key                   │
//! │  - atomic batches                        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Three blobs live under the vault namespace, each keyed independently:
//! the primary token, the connection token map, and the encryption salt.
//! The primary token is the provider session shared by the service.
//! Connection tokens belong to one user and are keyed by user, then
//! connector.
//!
//! # Usage
//!
//! ```no_run
//! use linkhub::credentials::{MemorySecureStore, TokenVault};
//! use std::sync::Arc;
//!
//! # async fn demo() -> linkhub::Result<()> {
//! let key = std::env::var("LINKHUB_ENCRYPTION_KEY").unwrap_or_default();
//! let vault = TokenVault::new(Arc::new(MemorySecureStore::new()), &key, "linkhub")?;
//!
//! vault.store("session-token", 3600, Some("refresh-token")).await?;
//! if let Some(token) = vault.retrieve().await? {
//!     println!("token length: {}", token.len());
//! }
//! vault.remove().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{IntegrationError, ProviderError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

mod encryption;
mod storage;


pub use encryption::{validate_key, Salt};
pub use storage::{MemorySecureStore, SecureStore, SqliteSecureStore, StoreOp};

/// Lifetime given to a refreshed token when the provider omits `expires_in`.
const DEFAULT_REFRESHED_TTL_SECONDS: u64 = 3600;

/// Upper bound on any stored lifetime (100 years).
const MAX_TTL_SECONDS: i64 = 100 * 365 * 24 * 3600;

/// Token material returned by an issuance or refresh call.
#[derive(Clone, Debug, Deserialize)]
pub struct IssuedToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, ProviderError>;
}

/// Decrypted contents of the primary secret.
#[derive(Clone, Serialize, Deserialize)]
struct Credentials {
    token: String,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl Credentials {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn same_secret(&self, other: &Credentials) -> bool {
        self.token == other.token && self.expires_at == other.expires_at
    }
}

/// One entry in the per-connector token map.
#[derive(Clone, Serialize, Deserialize)]
struct ConnectionToken {
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    stored_at: DateTime<Utc>,
}

impl ConnectionToken {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn same_entry(&self, other: &ConnectionToken) -> bool {
        self.token == other.token && self.stored_at == other.stored_at
    }
}

/// user id -> connector id -> token
type ConnectionTokens = BTreeMap<String, BTreeMap<String, ConnectionToken>>;

/// Store keys for one vault namespace.
#[derive(Clone, Debug)]
struct VaultKeys {
    auth_token: String,
    connection_tokens: String,
    salt: String,
}

impl VaultKeys {
    fn new(namespace: &str) -> Self {
        Self {
            auth_token: format!("{namespace}.auth_token"),
            connection_tokens: format!("{namespace}.connection_tokens"),
            salt: format!("{namespace}.encryption_salt"),
        }
    }
}

/// Encrypted, expiry-aware token vault.
///
/// # Guarantees
/// - Plaintext tokens never reach the [`SecureStore`]
/// - [`retrieve`](Self::retrieve) never returns an expired token
/// - Concurrent callers hitting the same expired token share one refresh
/// - Every write is a single atomic batch against the store
/// - Corrupted blobs read as absent, never as errors
pub struct TokenVault {
    store: Arc<dyn SecureStore>,
    master_key: Vec<u8>,
    keys: VaultKeys,
    refresher: Option<Arc<dyn TokenRefresher>>,
    /// Serializes read-modify-write cycles against the store.
    write_lock: tokio::sync::Mutex<()>,
    /// Single-flight guards for refreshes, keyed by store key.
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenVault {
    /// Creates a vault over `store`.
    ///
    /// # Arguments
    /// * `store` - Backend for the sealed blobs
    /// * `encryption_key` - Base64-encoded 32-byte master key
    /// * `namespace` - Prefix for every store key this vault owns
    pub fn new(store: Arc<dyn SecureStore>, encryption_key: &str, namespace: &str) -> Result<Self> {
        let master_key = validate_key(encryption_key)?;
        if namespace.is_empty() {
            return Err(IntegrationError::Config(
                "vault namespace must not be empty".to_string(),
            ));
        }

        Ok(Self {
            store,
            master_key,
            keys: VaultKeys::new(namespace),
            refresher: None,
            write_lock: tokio::sync::Mutex::new(()),
            in_flight: DashMap::new(),
        })
    }

    /// Enables refresh of expired primary tokens.
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    // ── Primary token ────────────────────────────────────────────────────────

    /// Encrypts and stores the primary token.
    ///
    /// Replaces any existing primary token. Fails with
    /// [`IntegrationError::Storage`] if the store is unavailable.
    pub async fn store(
        &self,
        token: &str,
        ttl_seconds: u64,
        refresh_token: Option<&str>,
    ) -> Result<()> {
        if token.is_empty() {
            return Err(IntegrationError::InvalidInput(
                "token must not be empty".to_string(),
            ));
        }

        let credentials = Credentials {
            token: token.to_string(),
            expires_at: expiry_from_ttl(ttl_seconds),
            refresh_token: refresh_token.map(str::to_string),
        };

        let _write = self.write_lock.lock().await;
        self.write_credentials_locked(&credentials).await?;

        debug!(ttl_seconds, has_refresh = credentials.refresh_token.is_some(), "Stored primary token");
        Ok(())
    }

    /// Returns the primary token, refreshing it first if it has expired.
    ///
    /// When the token has expired, exactly one refresh is attempted. If that
    /// fails, or no refresh token exists, the secret is purged and `None`
    /// is returned.
    pub async fn retrieve(&self) -> Result<Option<String>> {
        match self.read_credentials().await? {
            None => return Ok(None),
            Some(credentials) if !credentials.is_expired(Utc::now()) => {
                return Ok(Some(credentials.token))
            }
            Some(_) => {}
        }

        let key = self.keys.auth_token.clone();
        let guard = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let result = {
            let _flight = guard.lock().await;
            self.refresh_locked().await
        };

        // Drop the guard entry once nobody else is waiting on it.
        drop(guard);
        self.in_flight
            .remove_if(&key, |_, g| Arc::strong_count(g) == 1);

        result
    }

    /// Like [`retrieve`](Self::retrieve), but a missing or unrefreshable
    /// token is an [`IntegrationError::ExpiryExhausted`].
    pub async fn require(&self) -> Result<String> {
        self.retrieve()
            .await?
            .ok_or_else(|| IntegrationError::ExpiryExhausted {
                key: "auth_token".to_string(),
            })
    }

    /// Must be called with the single-flight guard held.
    async fn refresh_locked(&self) -> Result<Option<String>> {
        // Another caller may have completed the refresh while we waited.
        let Some(current) = self.read_credentials().await? else {
            return Ok(None);
        };
        if !current.is_expired(Utc::now()) {
            return Ok(Some(current.token));
        }

        let issued = match (&current.refresh_token, &self.refresher) {
            (Some(refresh_token), Some(refresher)) => {
                info!("Refreshing expired primary token");
                match refresher.refresh(refresh_token).await {
                    Ok(issued) if !issued.access_token.is_empty() && issued.expires_in != Some(0) => {
                        Some(issued)
                    }
                    Ok(_) => {
                        warn!("Token refresh returned an unusable token, purging secret");
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "Token refresh failed, purging secret");
                        None
                    }
                }
            }
            _ => {
                debug!("Primary token expired with no refresh path, purging secret");
                None
            }
        };

        // The refresh ran without `write_lock`. Commit only if the secret we
        // refreshed is still the stored one.
        let _write = self.write_lock.lock().await;
        match self.read_credentials().await? {
            Some(latest) if latest.same_secret(&current) => {}
            Some(latest) if !latest.is_expired(Utc::now()) => {
                debug!("Primary token replaced during refresh, keeping the newer one");
                return Ok(Some(latest.token));
            }
            _ => {
                debug!("Primary token changed during refresh, discarding result");
                return Ok(None);
            }
        }

        let Some(issued) = issued else {
            self.store.delete(&self.keys.auth_token).await?;
            return Ok(None);
        };

        let refreshed = Credentials {
            token: issued.access_token,
            expires_at: expiry_from_ttl(issued.expires_in.unwrap_or(DEFAULT_REFRESHED_TTL_SECONDS)),
            // Keep the existing refresh token if the provider did not rotate it
            refresh_token: issued.refresh_token.or(current.refresh_token),
        };
        self.write_credentials_locked(&refreshed).await?;
        info!("Primary token refreshed successfully");

        Ok(Some(refreshed.token))
    }

    /// Deletes the primary token and its refresh token. Idempotent.
    pub async fn remove(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        self.store.delete(&self.keys.auth_token).await
    }

    /// Deletes every blob this vault owns, for every user.
    pub async fn clear(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        self.store
            .apply(vec![
                StoreOp::delete(&self.keys.auth_token),
                StoreOp::delete(&self.keys.connection_tokens),
                StoreOp::delete(&self.keys.salt),
            ])
            .await?;
        info!("Vault cleared");
        Ok(())
    }

    // ── Per-connector tokens ─────────────────────────────────────────────────

    /// Stores `user_id`'s token for one connector without touching any
    /// other entry.
    pub async fn store_connection_token(
        &self,
        user_id: &str,
        connector_id: &str,
        token: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<()> {
        if user_id.is_empty() || connector_id.is_empty() || token.is_empty() {
            return Err(IntegrationError::InvalidInput(
                "user id, connector id and token must not be empty".to_string(),
            ));
        }

        let _write = self.write_lock.lock().await;
        let (salt, salt_op) = self.current_salt_locked().await?;
        let mut tokens = self.read_connection_tokens(&salt).await?;
        tokens.entry(user_id.to_string()).or_default().insert(
            connector_id.to_string(),
            ConnectionToken {
                token: token.to_string(),
                expires_at: ttl_seconds.map(expiry_from_ttl),
                stored_at: Utc::now(),
            },
        );
        self.write_connection_tokens_locked(&tokens, &salt, salt_op).await?;

        debug!(user_id = %user_id, connector = %connector_id, "Stored connection token");
        Ok(())
    }

    /// Returns `user_id`'s token for `connector_id`, or `None` if absent or
    /// expired.
    ///
    /// Expired entries are purged on read.
    pub async fn get_connection_token(
        &self,
        user_id: &str,
        connector_id: &str,
    ) -> Result<Option<String>> {
        let Some(salt) = self.load_salt().await? else {
            return Ok(None);
        };
        let tokens = self.read_connection_tokens(&salt).await?;

        match tokens.get(user_id).and_then(|entries| entries.get(connector_id)) {
            None => Ok(None),
            Some(entry) if !entry.is_expired(Utc::now()) => Ok(Some(entry.token.clone())),
            Some(entry) => {
                debug!(user_id = %user_id, connector = %connector_id, "Connection token expired, purging");
                self.purge_connection_token(user_id, connector_id, entry).await?;
                Ok(None)
            }
        }
    }

    /// Removes `user_id`'s token for `connector_id`. Idempotent.
    pub async fn remove_connection_token(&self, user_id: &str, connector_id: &str) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let Some(salt) = self.load_salt().await? else {
            return Ok(());
        };
        let mut tokens = self.read_connection_tokens(&salt).await?;
        if !remove_entry(&mut tokens, user_id, connector_id) {
            return Ok(());
        }
        self.write_connection_tokens_locked(&tokens, &salt, None).await
    }

    /// Removes every connection token of `user_id`. Idempotent.
    pub async fn clear_connection_tokens(&self, user_id: &str) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let Some(salt) = self.load_salt().await? else {
            return Ok(());
        };
        let mut tokens = self.read_connection_tokens(&salt).await?;
        if tokens.remove(user_id).is_none() {
            return Ok(());
        }
        self.write_connection_tokens_locked(&tokens, &salt, None).await?;
        info!(user_id = %user_id, "Connection tokens cleared");
        Ok(())
    }

    /// Connector ids for which `user_id` currently holds a live token.
    pub async fn connection_token_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let Some(salt) = self.load_salt().await? else {
            return Ok(Vec::new());
        };
        let now = Utc::now();
        Ok(self
            .read_connection_tokens(&salt)
            .await?
            .remove(user_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(id, _)| id)
            .collect())
    }

    /// Deletes the entry only if it is still the one that was read as
    /// expired; a token stored since then is kept.
    async fn purge_connection_token(
        &self,
        user_id: &str,
        connector_id: &str,
        seen: &ConnectionToken,
    ) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let Some(salt) = self.load_salt().await? else {
            return Ok(());
        };
        let mut tokens = self.read_connection_tokens(&salt).await?;
        let unchanged = tokens
            .get(user_id)
            .and_then(|entries| entries.get(connector_id))
            .is_some_and(|current| current.same_entry(seen));
        if !unchanged {
            return Ok(());
        }
        remove_entry(&mut tokens, user_id, connector_id);
        self.write_connection_tokens_locked(&tokens, &salt, None).await
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Re-encrypts every secret under a freshly generated salt.
    ///
    /// The new salt and all re-sealed blobs are written in one atomic batch,
    /// so a failure leaves the old salt and secrets untouched. Blobs that
    /// were already unreadable are dropped.
    pub async fn rotate_salt(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;

        let old_salt = self.load_salt().await?;
        let new_salt = Salt::generate();
        let mut batch = vec![StoreOp::put(&self.keys.salt, new_salt.encode())];

        for key in [&self.keys.auth_token, &self.keys.connection_tokens] {
            let Some(blob) = self.store.get(key).await? else {
                continue;
            };
            let plaintext = old_salt
                .as_ref()
                .ok_or_else(|| IntegrationError::Corruption("salt missing".to_string()))
                .and_then(|salt| encryption::open(&blob, &self.master_key, salt));

            match plaintext {
                Ok(plaintext) => {
                    let resealed = encryption::seal(&plaintext, &self.master_key, &new_salt)?;
                    batch.push(StoreOp::put(key.as_str(), resealed));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping unreadable blob during salt rotation");
                    batch.push(StoreOp::delete(key.as_str()));
                }
            }
        }

        self.store.apply(batch).await?;
        info!(salt = ?new_salt, "Encryption salt rotated");
        Ok(())
    }

    /// Checks that every stored blob decrypts and parses.
    ///
    /// Never fails: storage, decryption and shape errors all yield `false`.
    pub async fn validate_integrity(&self) -> bool {
        match self.check_integrity().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Vault integrity check failed");
                false
            }
        }
    }

    async fn check_integrity(&self) -> Result<()> {
        let auth_blob = self.store.get(&self.keys.auth_token).await?;
        let tokens_blob = self.store.get(&self.keys.connection_tokens).await?;
        if auth_blob.is_none() && tokens_blob.is_none() {
            return Ok(());
        }

        let salt_blob = self
            .store
            .get(&self.keys.salt)
            .await?
            .ok_or_else(|| IntegrationError::Corruption("salt missing".to_string()))?;
        let salt = Salt::decode(&salt_blob)?;

        if let Some(blob) = auth_blob {
            self.open_json::<Credentials>(&blob, &salt)?;
        }
        if let Some(blob) = tokens_blob {
            self.open_json::<ConnectionTokens>(&blob, &salt)?;
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Loads the salt. A corrupted salt reads as missing.
    async fn load_salt(&self) -> Result<Option<Salt>> {
        let Some(encoded) = self.store.get(&self.keys.salt).await? else {
            return Ok(None);
        };
        match Salt::decode(&encoded) {
            Ok(salt) => Ok(Some(salt)),
            Err(e) => {
                warn!(error = %e, "Stored salt is corrupted, treating as missing");
                Ok(None)
            }
        }
    }

    /// Returns the salt to seal with, plus the op that persists it when it
    /// had to be generated. Caller must hold `write_lock`.
    async fn current_salt_locked(&self) -> Result<(Salt, Option<StoreOp>)> {
        match self.load_salt().await? {
            Some(salt) => Ok((salt, None)),
            None => {
                let salt = Salt::generate();
                let op = StoreOp::put(&self.keys.salt, salt.encode());
                Ok((salt, Some(op)))
            }
        }
    }

    fn open_json<T: serde::de::DeserializeOwned>(&self, blob: &str, salt: &Salt) -> Result<T> {
        let plaintext = encryption::open(blob, &self.master_key, salt)?;
        serde_json::from_str(&plaintext)
            .map_err(|e| IntegrationError::Corruption(format!("unexpected secret shape: {e}")))
    }

    fn seal_json<T: Serialize>(&self, value: &T, salt: &Salt) -> Result<String> {
        let plaintext = serde_json::to_string(value)
            .map_err(|e| IntegrationError::Storage(format!("failed to encode secret: {e}")))?;
        encryption::seal(&plaintext, &self.master_key, salt)
    }

    async fn read_credentials(&self) -> Result<Option<Credentials>> {
        let Some(blob) = self.store.get(&self.keys.auth_token).await? else {
            return Ok(None);
        };
        let Some(salt) = self.load_salt().await? else {
            warn!("Primary token present without a salt, treating as cache miss");
            return Ok(None);
        };
        match self.open_json(&blob, &salt) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                warn!(error = %e, "Primary token unreadable, treating as cache miss");
                Ok(None)
            }
        }
    }

    async fn write_credentials_locked(&self, credentials: &Credentials) -> Result<()> {
        let (salt, salt_op) = self.current_salt_locked().await?;
        let blob = self.seal_json(credentials, &salt)?;

        let mut batch: Vec<StoreOp> = salt_op.into_iter().collect();
        batch.push(StoreOp::put(&self.keys.auth_token, blob));
        self.store.apply(batch).await
    }

    async fn read_connection_tokens(&self, salt: &Salt) -> Result<ConnectionTokens> {
        let Some(blob) = self.store.get(&self.keys.connection_tokens).await? else {
            return Ok(ConnectionTokens::new());
        };
        match self.open_json(&blob, salt) {
            Ok(tokens) => Ok(tokens),
            Err(e) => {
                warn!(error = %e, "Connection token map unreadable, treating as empty");
                Ok(ConnectionTokens::new())
            }
        }
    }

    async fn write_connection_tokens_locked(
        &self,
        tokens: &ConnectionTokens,
        salt: &Salt,
        salt_op: Option<StoreOp>,
    ) -> Result<()> {
        let mut batch: Vec<StoreOp> = salt_op.into_iter().collect();
        if tokens.is_empty() {
            batch.push(StoreOp::delete(&self.keys.connection_tokens));
        } else {
            batch.push(StoreOp::put(
                &self.keys.connection_tokens,
                self.seal_json(tokens, salt)?,
            ));
        }
        self.store.apply(batch).await
    }
}

/// Removes one entry, dropping the user's map once it is empty.
fn remove_entry(tokens: &mut ConnectionTokens, user_id: &str, connector_id: &str) -> bool {
    let Some(entries) = tokens.get_mut(user_id) else {
        return false;
    };
    let removed = entries.remove(connector_id).is_some();
    if entries.is_empty() {
        tokens.remove(user_id);
    }
    removed
}

fn expiry_from_ttl(ttl_seconds: u64) -> DateTime<Utc> {
    let ttl = i64::try_from(ttl_seconds)
        .unwrap_or(MAX_TTL_SECONDS)
        .min(MAX_TTL_SECONDS);
    Utc::now() + Duration::seconds(ttl)
}
