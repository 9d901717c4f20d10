// Error taxonomy
pub mod error;

// Configuration and catalog tables
pub mod config;

// Encrypted token vault
pub mod credentials;

// Bearer extraction and integration token issuance
pub mod auth;

// Upstream connector provider client
pub mod provider;

// Connection normalization
pub mod connections;

// Integration catalog
pub mod catalog;

// Health probing
pub mod health;

// Authorized action execution and connection lifecycle
pub mod gateway;

// Integration view models
pub mod aggregate;

// Caller-facing facade
pub mod service;

// HTTP API
pub mod api;

pub use error::{IntegrationError, ProviderError, Result};
