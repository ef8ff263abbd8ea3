//! Concurrency limiting for migration admission
//!
//! Counts migrations that hold a slot (admitted and not yet terminal) per
//! source node and across the cluster. The count is always re-derived from
//! a fresh list of migration objects; nothing is cached between calls.
//!
//! Check-and-admit must be atomic with respect to other reconciles, so the
//! caller holds the [`AdmissionGate`] from listing until the admitted status
//! has been written.

use std::fmt;

use kube::ResourceExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::config::MigrationConfig;
use crate::crd::VirtualMachineInstanceMigration;

/// Caps enforced by the limiter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    /// Outbound migrations per source node
    pub per_node: u32,
    /// Migrations across the whole cluster
    pub per_cluster: u32,
}

impl From<&MigrationConfig> for ConcurrencyLimits {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            per_node: config.parallel_outbound_migrations_per_node,
            per_cluster: config.parallel_migrations_per_cluster,
        }
    }
}

/// Why a migration has to wait
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferReason {
    /// The source node already has `limit` outbound migrations
    NodeCapacity {
        /// Source node
        node: String,
        /// Migrations currently holding a slot on the node
        active: u32,
        /// Configured cap
        limit: u32,
    },
    /// The cluster already has `limit` migrations
    ClusterCapacity {
        /// Migrations currently holding a slot
        active: u32,
        /// Configured cap
        limit: u32,
    },
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeCapacity {
                node,
                active,
                limit,
            } => write!(
                f,
                "waiting for capacity: {active}/{limit} outbound migrations active on node {node}"
            ),
            Self::ClusterCapacity { active, limit } => write!(
                f,
                "waiting for capacity: {active}/{limit} migrations active in the cluster"
            ),
        }
    }
}

/// Outcome of [`ConcurrencyLimiter::try_admit`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// A slot is available
    Granted,
    /// The migration stays Pending
    Deferred(DeferReason),
}

/// Admits or defers migrations against [`ConcurrencyLimits`]
#[derive(Clone, Copy, Debug)]
pub struct ConcurrencyLimiter {
    limits: ConcurrencyLimits,
}

impl ConcurrencyLimiter {
    /// Limiter enforcing `limits`
    pub fn new(limits: ConcurrencyLimits) -> Self {
        Self { limits }
    }

    /// Decide whether `candidate` may leave Pending for `source_node`
    ///
    /// `migrations` must be a fresh, cluster-wide listing. The candidate is
    /// ignored if it appears in it.
    pub fn try_admit(
        &self,
        candidate: &VirtualMachineInstanceMigration,
        source_node: &str,
        migrations: &[VirtualMachineInstanceMigration],
    ) -> Admission {
        let candidate_uid = candidate.uid();
        let holding: Vec<&VirtualMachineInstanceMigration> = migrations
            .iter()
            .filter(|m| m.phase().holds_slot())
            .filter(|m| candidate_uid.is_none() || m.uid() != candidate_uid)
            .collect();

        let cluster_active = holding.len() as u32;
        let node_active = holding
            .iter()
            .filter(|m| m.source_node() == Some(source_node))
            .count() as u32;

        debug!(
            node = %source_node,
            node_active,
            cluster_active,
            "evaluating migration capacity"
        );

        if node_active >= self.limits.per_node {
            return Admission::Deferred(DeferReason::NodeCapacity {
                node: source_node.to_string(),
                active: node_active,
                limit: self.limits.per_node,
            });
        }
        if cluster_active >= self.limits.per_cluster {
            return Admission::Deferred(DeferReason::ClusterCapacity {
                active: cluster_active,
                limit: self.limits.per_cluster,
            });
        }
        Admission::Granted
    }
}

/// Serializes admission decisions within this process
///
/// Only one reconcile at a time may list migrations, decide, and write the
/// admitted status. Unrelated phases never take the gate.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    lock: Mutex<()>,
}

impl AdmissionGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to admission
    pub async fn enter(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}
