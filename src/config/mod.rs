//! Service configuration.
//!
//! Loaded once at startup from a TOML file, then overlaid with secrets from
//! the environment and validated. Components receive the pieces they need
//! through their constructors; nothing reads the environment after boot.
//!
//! ```toml
//! [server]
//! port = 3000
//!
//! [vault]
//! database_path = "linkhub.db"
//!
//! [provider]
//! base_url = "https://connectors.example.com"
//! timeout_seconds = 30
//!
//! [provider.retry]
//! max_attempts = 3
//! initial_backoff_ms = 1000
//! ```

pub mod catalog;

pub use catalog::CatalogTables;

use crate::credentials::validate_key;
use crate::error::{IntegrationError, Result};
use crate::provider::RetryPolicy;
use serde::Deserialize;
use std::path::Path;

pub const ENV_CONFIG_PATH: &str = "LINKHUB_CONFIG";
pub const ENV_ENCRYPTION_KEY: &str = "LINKHUB_ENCRYPTION_KEY";
pub const ENV_SIGNING_SECRET: &str = "LINKHUB_SIGNING_SECRET";
pub const ENV_PROVIDER_API_KEY: &str = "LINKHUB_PROVIDER_API_KEY";
pub const ENV_PROVIDER_URL: &str = "LINKHUB_PROVIDER_URL";

pub const DEFAULT_CONFIG_PATH: &str = "linkhub.toml";

/// Complete linkhub configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkhubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub catalog: CatalogTables,
}

/// HTTP listener
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Token vault storage
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// SQLite file holding encrypted blobs
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Key prefix separating installs that share one database
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Base64-encoded 32-byte master key. Prefer `LINKHUB_ENCRYPTION_KEY`.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_database_path() -> String {
    "linkhub.db".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            namespace: default_namespace(),
            encryption_key: None,
        }
    }
}

/// Upstream connector provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_url")]
    pub base_url: String,
    /// Static API key. When absent, the session token held in the vault is used.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_provider_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_url(),
            api_key: None,
            timeout_seconds: default_timeout_seconds(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Integration token issuance
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for issued tokens. Prefer `LINKHUB_SIGNING_SECRET`.
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_seconds: u64,
    #[serde(default = "default_issuer")]
    pub issuer: String,
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_issuer() -> String {
    "linkhub".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            token_ttl_seconds: default_token_ttl(),
            issuer: default_issuer(),
        }
    }
}

/// Health probing
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Action id used as the no-op probe
    #[serde(default = "default_probe_action")]
    pub probe_action: String,
}

fn default_probe_action() -> String {
    "health_check".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_action: default_probe_action(),
        }
    }
}

impl LinkhubConfig {
    /// Overlays secrets and endpoints from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlays values from `lookup`. Empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_ENCRYPTION_KEY) {
            self.vault.encryption_key = Some(v);
        }
        if let Some(v) = get(ENV_SIGNING_SECRET) {
            self.auth.signing_secret = Some(v);
        }
        if let Some(v) = get(ENV_PROVIDER_API_KEY) {
            self.provider.api_key = Some(v);
        }
        if let Some(v) = get(ENV_PROVIDER_URL) {
            self.provider.base_url = v;
        }
    }

    /// Fails on the first missing or malformed required field.
    pub fn validate(&self) -> Result<()> {
        let key = self.vault.encryption_key.as_deref().ok_or_else(|| {
            IntegrationError::Config(format!("encryption key missing (set {ENV_ENCRYPTION_KEY})"))
        })?;
        validate_key(key)?;

        match self.auth.signing_secret.as_deref() {
            Some(secret) if !secret.is_empty() => {}
            _ => {
                return Err(IntegrationError::Config(format!(
                    "signing secret missing (set {ENV_SIGNING_SECRET})"
                )))
            }
        }

        if self.provider.base_url.trim().is_empty() {
            return Err(IntegrationError::Config("provider base_url is empty".to_string()));
        }
        if self.provider.timeout_seconds == 0 {
            return Err(IntegrationError::Config(
                "provider timeout_seconds must be positive".to_string(),
            ));
        }
        if self.vault.namespace.trim().is_empty() {
            return Err(IntegrationError::Config("vault namespace is empty".to_string()));
        }

        Ok(())
    }
}

/// Load configuration from a TOML file.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<LinkhubConfig> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(LinkhubConfig::default());
    }

    let contents = std::fs::read_to_string(path)?;
    let config: LinkhubConfig = toml::from_str(&contents)?;
    Ok(config)
}
