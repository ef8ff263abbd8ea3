//! VirtualMachineInstanceMigration Custom Resource Definition
//!
//! A migration request moves one VMI to another node. Creating it starts the
//! migration, deleting it while non-terminal cancels it, and its status
//! phase is the client-visible progress marker.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer held while a migration is non-terminal
pub const MIGRATION_FINALIZER: &str = "ferry.dev/migration-protection";

/// Specification for a VirtualMachineInstanceMigration
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ferry.dev",
    version = "v1alpha1",
    kind = "VirtualMachineInstanceMigration",
    plural = "virtualmachineinstancemigrations",
    shortname = "vmim",
    status = "VirtualMachineInstanceMigrationStatus",
    namespaced,
    printcolumn = r#"{"name":"VMI","type":"string","jsonPath":".spec.vmiName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".status.sourceNode"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".status.targetNode"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceMigrationSpec {
    /// Name of the VMI to migrate, in the same namespace
    pub vmi_name: String,
}

/// Migration lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum MigrationPhase {
    /// Waiting for admission
    #[default]
    Pending,
    /// Admitted; target pod being created and verified
    Scheduling,
    /// Target reachable and handshake validated
    TargetReady,
    /// Hypervisor transfer in progress
    Running,
    /// Guest now runs on the target
    Succeeded,
    /// Guest stayed on the source
    Failed,
}

impl MigrationPhase {
    /// Returns true for Succeeded and Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true once admitted and until terminal
    ///
    /// These are the phases that hold a concurrency slot.
    pub fn holds_slot(&self) -> bool {
        matches!(self, Self::Scheduling | Self::TargetReady | Self::Running)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Scheduling => write!(f, "Scheduling"),
            Self::TargetReady => write!(f, "TargetReady"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Last observed transfer progress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Bytes sent so far
    pub data_processed_bytes: u64,
    /// Bytes left to send, as estimated by the hypervisor
    pub data_remaining_bytes: u64,
    /// Last time either counter moved in the right direction
    pub last_progress_timestamp: DateTime<Utc>,
}

/// Configuration values pinned when the migration was admitted
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PinnedMigrationConfig {
    /// Version of the configuration snapshot
    pub version: u64,
    /// Transfer rate cap in bytes per second
    pub bandwidth_per_migration: u64,
    /// Seconds without progress before aborting
    pub progress_timeout: u64,
    /// Seconds allotted per GiB of guest memory
    pub completion_timeout_per_gib: u64,
}

/// Status for a VirtualMachineInstanceMigration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceMigrationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: MigrationPhase,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Node the guest is migrating from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,

    /// Node the guest is migrating to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,

    /// Name of the target pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pod: Option<String>,

    /// Target pods created so far
    #[serde(default)]
    pub target_attempts: u32,

    /// Handshake rounds that failed so far
    #[serde(default)]
    pub handshake_attempts: u32,

    /// Last observed transfer progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TransferProgress>,

    /// Configuration pinned at admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<PinnedMigrationConfig>,
}

impl VirtualMachineInstanceMigrationStatus {
    /// Create a status with the given phase
    pub fn with_phase(phase: MigrationPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase, keeping every other field
    pub fn phase(mut self, phase: MigrationPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Clear the message
    pub fn without_message(mut self) -> Self {
        self.message = None;
        self
    }
}

impl VirtualMachineInstanceMigration {
    /// Current phase, Pending when no status has been written
    pub fn phase(&self) -> MigrationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Current status, or the default when none has been written
    pub fn status_or_default(&self) -> VirtualMachineInstanceMigrationStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Returns true if a client asked for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if the protection finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == MIGRATION_FINALIZER)
    }

    /// Source node recorded at admission
    pub fn source_node(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.source_node.as_deref())
    }

    /// Returns true if this migration targets `vmi_name` in `namespace`
    pub fn targets(&self, namespace: &str, vmi_name: &str) -> bool {
        self.spec.vmi_name == vmi_name && self.namespace().as_deref() == Some(namespace)
    }
}
