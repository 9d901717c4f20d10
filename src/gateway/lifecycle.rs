//! Connection lifecycle state machine.
//!
//! ```text
//!                 TokenIssued            CallbackSucceeded
//!  Disconnected ──────────────► Pending ──────────────────► Active
//!       ▲                          │  ▲                      │   │
//!       │      CallbackFailed      │  │ TokenIssued          │   │ AuthRevoked
//!       ├──────────────────────────┘  │ (re-authenticate)    │   ▼
//!       │                             └──────────────── Error / Inactive
//!       │                                                        ▲
//!       │   Disconnected (from any state)       Deactivated ─────┘
//!       └────────────────────────────────────────────────────────
//! ```

use crate::connections::{Connection, ConnectionStatus};
use crate::error::{IntegrationError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Pending,
    Active,
    Error,
    Inactive,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Pending => "pending",
            ConnectionState::Active => "active",
            ConnectionState::Error => "error",
            ConnectionState::Inactive => "inactive",
        }
    }

    /// Applies `event`, or fails if it is not valid from this state.
    pub fn apply(self, event: LifecycleEvent) -> Result<ConnectionState> {
        use ConnectionState as S;
        use LifecycleEvent as E;

        let next = match (self, event) {
            (_, E::Disconnected) => S::Disconnected,
            (S::Disconnected | S::Error | S::Inactive, E::TokenIssued) => S::Pending,
            // Re-issuing while pending restarts the handshake
            (S::Pending, E::TokenIssued) => S::Pending,
            (S::Pending, E::CallbackSucceeded) => S::Active,
            (S::Pending, E::CallbackFailed) => S::Disconnected,
            (S::Active, E::AuthRevoked) => S::Error,
            (S::Active, E::Deactivated) => S::Inactive,
            (from, event) => {
                return Err(IntegrationError::InvalidTransition {
                    from: from.as_str().to_string(),
                    event: event.as_str().to_string(),
                })
            }
        };
        Ok(next)
    }
}

impl From<ConnectionStatus> for ConnectionState {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Active => ConnectionState::Active,
            ConnectionStatus::Inactive => ConnectionState::Inactive,
            ConnectionStatus::Error => ConnectionState::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// An integration token was generated for the connector
    TokenIssued,
    /// The upstream OAuth callback reported success
    CallbackSucceeded,
    /// The upstream OAuth callback reported failure or cancellation
    CallbackFailed,
    /// A probe or action signalled revoked authorization
    AuthRevoked,
    /// The provider reports the connection as inactive
    Deactivated,
    /// Explicit disconnect
    Disconnected,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::TokenIssued => "token_issued",
            LifecycleEvent::CallbackSucceeded => "callback_succeeded",
            LifecycleEvent::CallbackFailed => "callback_failed",
            LifecycleEvent::AuthRevoked => "auth_revoked",
            LifecycleEvent::Deactivated => "deactivated",
            LifecycleEvent::Disconnected => "disconnected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LifecycleEntry {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

/// In-memory lifecycle state per (user, connector).
///
/// Unknown pairs are `Disconnected`.
#[derive(Default)]
pub struct LifecycleTracker {
    entries: DashMap<(String, String), LifecycleEntry>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, user_id: &str, connector_id: &str) -> ConnectionState {
        self.entries
            .get(&key(user_id, connector_id))
            .map(|entry| entry.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn entry(&self, user_id: &str, connector_id: &str) -> Option<LifecycleEntry> {
        self.entries
            .get(&key(user_id, connector_id))
            .map(|entry| entry.clone())
    }

    /// Connector a known connection id belongs to.
    pub fn connector_for(&self, user_id: &str, connection_id: &str) -> Option<String> {
        self.entries.iter().find_map(|entry| {
            let (user, connector) = entry.key();
            (user == user_id && entry.connection_id.as_deref() == Some(connection_id))
                .then(|| connector.clone())
        })
    }

    /// Applies `event` atomically for the pair.
    pub fn transition(
        &self,
        user_id: &str,
        connector_id: &str,
        event: LifecycleEvent,
    ) -> Result<ConnectionState> {
        // Validate before touching the map so a rejected event leaves no entry.
        let (from, next) = match self.entries.entry(key(user_id, connector_id)) {
            Entry::Occupied(mut occupied) => {
                let from = occupied.get().state;
                let next = from.apply(event)?;
                let entry = occupied.get_mut();
                entry.state = next;
                if next == ConnectionState::Disconnected {
                    entry.connection_id = None;
                }
                (from, next)
            }
            Entry::Vacant(vacant) => {
                let from = ConnectionState::Disconnected;
                let next = from.apply(event)?;
                if next != ConnectionState::Disconnected {
                    vacant.insert(LifecycleEntry {
                        state: next,
                        connection_id: None,
                    });
                }
                (from, next)
            }
        };

        info!(
            user_id = %user_id,
            connector = %connector_id,
            from = from.as_str(),
            to = next.as_str(),
            "Connection lifecycle transition"
        );
        Ok(next)
    }

    /// Reconciles tracked state with a fresh upstream connection list.
    ///
    /// Upstream is authoritative for connections it reports; when a
    /// connector has several, an active one wins. Tracked connectors missing
    /// from the list become `Disconnected`, except those still `Pending` a
    /// callback.
    pub fn sync(&self, user_id: &str, connections: &[Connection]) {
        let mut by_connector: BTreeMap<&str, &Connection> = BTreeMap::new();
        for connection in connections {
            by_connector
                .entry(connection.connector_id.as_str())
                .and_modify(|current| {
                    if !current.is_active() && connection.is_active() {
                        *current = connection;
                    }
                })
                .or_insert(connection);
        }

        for connection in by_connector.into_values() {
            self.entries.insert(
                key(user_id, &connection.connector_id),
                LifecycleEntry {
                    state: connection.status.into(),
                    connection_id: Some(connection.id.clone()),
                },
            );
        }

        self.entries.retain(|(user, connector), entry| {
            let reported = connections.iter().any(|c| &c.connector_id == connector);
            let keep = user != user_id || reported || entry.state == ConnectionState::Pending;
            if !keep {
                debug!(user_id = %user_id, connector = %connector, "Connection gone upstream");
            }
            keep
        });
    }

    /// Drops every tracked entry for a user.
    pub fn forget_user(&self, user_id: &str) {
        self.entries.retain(|(user, _), _| user != user_id);
    }
}

fn key(user_id: &str, connector_id: &str) -> (String, String) {
    (user_id.to_string(), connector_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;

    fn connection(id: &str, connector: &str, status: ConnectionStatus) -> Connection {
        Connection {
            id: id.to_string(),
            connector_id: connector.to_string(),
            status,
            connected_at: Utc::now(),
            last_sync_at: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_happy_path() {
        use LifecycleEvent::*;
        let tracker = LifecycleTracker::new();

        assert_eq!(tracker.state("u1", "gmail"), ConnectionState::Disconnected);
        assert_eq!(tracker.transition("u1", "gmail", TokenIssued).unwrap(), ConnectionState::Pending);
        assert_eq!(tracker.transition("u1", "gmail", CallbackSucceeded).unwrap(), ConnectionState::Active);
        assert_eq!(tracker.transition("u1", "gmail", AuthRevoked).unwrap(), ConnectionState::Error);
        // Re-authenticate
        assert_eq!(tracker.transition("u1", "gmail", TokenIssued).unwrap(), ConnectionState::Pending);
        assert_eq!(tracker.transition("u1", "gmail", CallbackFailed).unwrap(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_from_any_state() {
        use ConnectionState::*;
        for state in [Disconnected, Pending, Active, Error, Inactive] {
            assert_eq!(state.apply(LifecycleEvent::Disconnected).unwrap(), Disconnected);
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let tracker = LifecycleTracker::new();
        let err = tracker
            .transition("u1", "gmail", LifecycleEvent::CallbackSucceeded)
            .unwrap_err();
        assert!(matches!(err, IntegrationError::InvalidTransition { .. }));
        assert_eq!(tracker.state("u1", "gmail"), ConnectionState::Disconnected);

        assert!(ConnectionState::Error.apply(LifecycleEvent::CallbackSucceeded).is_err());
        assert!(ConnectionState::Pending.apply(LifecycleEvent::AuthRevoked).is_err());
    }

    #[test]
    fn test_sync_from_upstream() {
        let tracker = LifecycleTracker::new();
        tracker.transition("u1", "notion", LifecycleEvent::TokenIssued).unwrap();
        tracker.transition("u1", "dropbox", LifecycleEvent::TokenIssued).unwrap();
        tracker.transition("u1", "dropbox", LifecycleEvent::CallbackSucceeded).unwrap();
        tracker.transition("u2", "dropbox", LifecycleEvent::TokenIssued).unwrap();

        tracker.sync(
            "u1",
            &[
                connection("c1", "gmail", ConnectionStatus::Active),
                connection("c2", "slack", ConnectionStatus::Error),
            ],
        );

        assert_eq!(tracker.state("u1", "gmail"), ConnectionState::Active);
        assert_eq!(tracker.entry("u1", "gmail").unwrap().connection_id.as_deref(), Some("c1"));
        assert_eq!(tracker.state("u1", "slack"), ConnectionState::Error);
        // Awaiting callback
        assert_eq!(tracker.state("u1", "notion"), ConnectionState::Pending);
        // Gone upstream
        assert_eq!(tracker.state("u1", "dropbox"), ConnectionState::Disconnected);
        // Other users untouched
        assert_eq!(tracker.state("u2", "dropbox"), ConnectionState::Pending);
    }

    #[test]
    fn test_rejected_first_event_leaves_no_entry() {
        let tracker = LifecycleTracker::new();
        assert!(tracker
            .transition("u1", "gmail", LifecycleEvent::CallbackSucceeded)
            .is_err());
        assert!(tracker.entry("u1", "gmail").is_none());

        // Disconnecting an untracked pair is accepted but stores nothing
        assert_eq!(
            tracker.transition("u1", "gmail", LifecycleEvent::Disconnected).unwrap(),
            ConnectionState::Disconnected
        );
        assert!(tracker.entry("u1", "gmail").is_none());
    }

    #[test]
    fn test_sync_prefers_active_connection() {
        let tracker = LifecycleTracker::new();

        tracker.sync(
            "u1",
            &[
                connection("c1", "gmail", ConnectionStatus::Active),
                connection("c2", "gmail", ConnectionStatus::Inactive),
                connection("c3", "slack", ConnectionStatus::Error),
                connection("c4", "slack", ConnectionStatus::Active),
            ],
        );

        let gmail = tracker.entry("u1", "gmail").unwrap();
        assert_eq!(gmail.state, ConnectionState::Active);
        assert_eq!(gmail.connection_id.as_deref(), Some("c1"));
        let slack = tracker.entry("u1", "slack").unwrap();
        assert_eq!(slack.state, ConnectionState::Active);
        assert_eq!(slack.connection_id.as_deref(), Some("c4"));
    }

    #[test]
    fn test_forget_user() {
        let tracker = LifecycleTracker::new();
        tracker.transition("u1", "gmail", LifecycleEvent::TokenIssued).unwrap();
        tracker.forget_user("u1");
        assert!(tracker.entry("u1", "gmail").is_none());
    }
}
