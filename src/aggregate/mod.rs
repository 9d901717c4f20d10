//! Per-integration view models.
//!
//! [`compose`] joins catalog descriptors, connections and health records
//! into [`Integration`]s; [`IntegrationOverview`] derives every grouping and
//! count from that composed list. Nothing here is mutated incrementally.
//!
//! [`Aggregator`] holds the latest input of each kind as fetches complete,
//! in any order, and recomputes on demand from whatever has arrived. Each
//! fetch takes a [`Ticket`] first; completions older than what has already
//! been applied, or arriving after [`Aggregator::cancel`], are dropped.

use crate::catalog::IntegrationDescriptor;
use crate::connections::Connection;
use crate::health::{HealthRecord, HealthStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Healthy,
    Degraded,
    Error,
    Disconnected,
}

impl From<HealthStatus> for IntegrationStatus {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => IntegrationStatus::Healthy,
            HealthStatus::Degraded => IntegrationStatus::Degraded,
            HealthStatus::Error => IntegrationStatus::Error,
        }
    }
}

/// A catalog entry joined with the user's connection and its health.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Integration {
    #[serde(flatten)]
    pub descriptor: IntegrationDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<Connection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthRecord>,
    pub connected: bool,
    pub status: IntegrationStatus,
}

impl Integration {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Joins descriptors with connections and health, in descriptor order.
///
/// `connected` means an active connection exists for the descriptor id.
/// A connected integration takes its status from its health record, or
/// `healthy` when it has not been probed yet; otherwise it is
/// `disconnected`.
pub fn compose(
    descriptors: &[IntegrationDescriptor],
    connections: &[Connection],
    health: &HashMap<String, HealthRecord>,
) -> Vec<Integration> {
    descriptors
        .iter()
        .map(|descriptor| {
            let mut matching = connections
                .iter()
                .filter(|c| c.connector_id == descriptor.id);
            let active = matching.clone().find(|c| c.is_active());
            let connection = active.or_else(|| matching.next()).cloned();

            let connected = active.is_some();
            let health = if connected {
                health.get(&descriptor.id).cloned()
            } else {
                None
            };
            let status = match (&health, connected) {
                (_, false) => IntegrationStatus::Disconnected,
                (Some(record), true) => record.status.into(),
                (None, true) => IntegrationStatus::Healthy,
            };

            Integration {
                descriptor: descriptor.clone(),
                connection,
                health,
                connected,
                status,
            }
        })
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OverviewCounts {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub popular: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub error: usize,
}

/// Composed integrations plus groupings by integration id.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IntegrationOverview {
    pub integrations: Vec<Integration>,
    pub by_category: BTreeMap<String, Vec<String>>,
    pub popular: Vec<String>,
    pub connected: Vec<String>,
    pub disconnected: Vec<String>,
    pub counts: OverviewCounts,
}

impl IntegrationOverview {
    pub fn from_integrations(integrations: Vec<Integration>) -> Self {
        let mut by_category: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut popular = Vec::new();
        let mut connected = Vec::new();
        let mut disconnected = Vec::new();
        let mut counts = OverviewCounts {
            total: integrations.len(),
            ..Default::default()
        };

        for integration in &integrations {
            let id = integration.id().to_string();
            by_category
                .entry(integration.descriptor.category.clone())
                .or_default()
                .push(id.clone());
            if integration.descriptor.popular {
                popular.push(id.clone());
            }
            match integration.status {
                IntegrationStatus::Healthy => counts.healthy += 1,
                IntegrationStatus::Degraded => counts.degraded += 1,
                IntegrationStatus::Error => counts.error += 1,
                IntegrationStatus::Disconnected => {}
            }
            if integration.connected {
                connected.push(id);
            } else {
                disconnected.push(id);
            }
        }

        counts.connected = connected.len();
        counts.disconnected = disconnected.len();
        counts.popular = popular.len();

        Self {
            integrations,
            by_category,
            popular,
            connected,
            disconnected,
            counts,
        }
    }
}

/// The kind of input a fetch produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    Catalog,
    Connections,
    Health,
}

impl InputKind {
    fn slot(self) -> usize {
        match self {
            InputKind::Catalog => 0,
            InputKind::Connections => 1,
            InputKind::Health => 2,
        }
    }
}

/// Identifies one fetch. Issued by [`Aggregator::begin`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket {
    kind: InputKind,
    generation: u64,
}

#[derive(Default)]
struct Inputs {
    descriptors: Option<Vec<IntegrationDescriptor>>,
    connections: Option<Vec<Connection>>,
    health: HashMap<String, HealthRecord>,
    issued: [u64; 3],
    applied: [u64; 3],
}

/// Latest-wins holder for aggregator inputs.
#[derive(Default)]
pub struct Aggregator {
    inputs: Mutex<Inputs>,
    cancel: CancellationToken,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled by [`cancel`](Self::cancel); in-flight fetches
    /// should select on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tears the aggregator down. Later completions are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Registers a new fetch of `kind`.
    pub fn begin(&self, kind: InputKind) -> Ticket {
        let mut inputs = self.lock();
        let slot = kind.slot();
        inputs.issued[slot] += 1;
        Ticket {
            kind,
            generation: inputs.issued[slot],
        }
    }

    pub fn apply_catalog(&self, ticket: Ticket, descriptors: Vec<IntegrationDescriptor>) -> bool {
        self.apply(ticket, InputKind::Catalog, |inputs| {
            inputs.descriptors = Some(descriptors)
        })
    }

    pub fn apply_connections(&self, ticket: Ticket, connections: Vec<Connection>) -> bool {
        self.apply(ticket, InputKind::Connections, |inputs| {
            inputs.connections = Some(connections)
        })
    }

    /// Replaces all health records.
    pub fn apply_health(&self, ticket: Ticket, records: Vec<HealthRecord>) -> bool {
        self.apply(ticket, InputKind::Health, |inputs| {
            inputs.health = records
                .into_iter()
                .map(|record| (record.connector.clone(), record))
                .collect();
        })
    }

    /// Recomputes the overview from the inputs received so far.
    ///
    /// Without a catalog there is nothing to compose and the overview is
    /// empty. Missing connections read as none.
    pub fn snapshot(&self) -> IntegrationOverview {
        let inputs = self.lock();
        let Some(descriptors) = inputs.descriptors.as_deref() else {
            return IntegrationOverview::default();
        };
        let connections = inputs.connections.as_deref().unwrap_or_default();
        IntegrationOverview::from_integrations(compose(descriptors, connections, &inputs.health))
    }

    /// Which inputs have been applied at least once.
    pub fn received(&self) -> Vec<InputKind> {
        let inputs = self.lock();
        [InputKind::Catalog, InputKind::Connections, InputKind::Health]
            .into_iter()
            .filter(|kind| inputs.applied[kind.slot()] > 0)
            .collect()
    }

    fn apply(&self, ticket: Ticket, kind: InputKind, update: impl FnOnce(&mut Inputs)) -> bool {
        if ticket.kind != kind {
            debug!(ticket = ?ticket.kind, input = ?kind, "Ticket does not match input kind");
            return false;
        }
        if self.is_cancelled() {
            debug!(input = ?kind, "Discarding completion after cancellation");
            return false;
        }

        let mut inputs = self.lock();
        let slot = kind.slot();
        if ticket.generation <= inputs.applied[slot] {
            debug!(
                input = ?kind,
                generation = ticket.generation,
                applied = inputs.applied[slot],
                "Discarding stale completion"
            );
            return false;
        }

        update(&mut inputs);
        inputs.applied[slot] = ticket.generation;
        true
    }

    fn lock(&self) -> MutexGuard<'_, Inputs> {
        self.inputs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
