//! VirtualMachineInstance Custom Resource Definition
//!
//! A VMI is a running guest. It is launched by components outside ferry;
//! ferry reads its spec and owns two parts of its status: the published
//! conditions and the [`MigrationState`] record of the latest migration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Conditions;

/// Specification for a VirtualMachineInstance
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ferry.dev",
    version = "v1alpha1",
    kind = "VirtualMachineInstance",
    plural = "virtualmachineinstances",
    shortname = "vmi",
    status = "VirtualMachineInstanceStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#,
    printcolumn = r#"{"name":"Migratable","type":"string","jsonPath":".status.conditions.IsMigratable.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Guest memory as a Kubernetes quantity (e.g. "2Gi")
    pub memory: String,

    /// Volumes attached to the guest
    #[serde(default)]
    pub volumes: Vec<Volume>,

    /// What happens to the VMI when its node is drained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_strategy: Option<EvictionStrategy>,

    /// Node labels the VMI (and any migration target) must land on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
}

impl VirtualMachineInstanceSpec {
    /// Returns true if a drain should live-migrate this VMI
    pub fn migrates_on_eviction(&self) -> bool {
        matches!(self.eviction_strategy, Some(EvictionStrategy::LiveMigrate))
    }

    /// Guest memory in bytes
    pub fn memory_bytes(&self) -> Result<u64, crate::Error> {
        super::types::parse_quantity(&self.memory)
    }
}

/// Eviction strategy for a VMI
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Live-migrate the VMI away instead of evicting it
    LiveMigrate,
    /// Ordinary eviction rules apply
    None,
}

/// A named volume attached to the guest
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name, unique within the VMI
    pub name: String,

    /// Backing store of the volume
    #[serde(flatten)]
    pub source: VolumeSource,
}

/// Backing store of a volume
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// Disk image shipped in a container; recreated on every node
    ContainerDisk {
        /// Image reference
        image: String,
    },
    /// Cloud-init NoCloud seed
    CloudInitNoCloud {
        /// Raw user data
        #[serde(default)]
        user_data: String,
    },
    /// ConfigMap projected as a disk
    ConfigMap {
        /// ConfigMap name
        name: String,
    },
    /// Secret projected as a disk
    Secret {
        /// Secret name
        name: String,
    },
    /// Service account token projected as a disk
    ServiceAccount {
        /// Service account name
        name: String,
    },
    /// Scratch disk that starts empty
    EmptyDisk {
        /// Capacity as a quantity
        capacity: String,
    },
    /// Claim on a persistent volume
    PersistentVolumeClaim(ClaimVolume),
    /// Claim provisioned through a data volume
    DataVolume(ClaimVolume),
    /// Path on the node's filesystem
    HostDisk {
        /// Host path
        path: String,
    },
}

/// A volume backed by a persistent volume claim
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVolume {
    /// Claim (or data volume) name
    pub claim_name: String,

    /// Access mode the claim was bound with
    pub access_mode: AccessMode,

    /// How the volume is presented to the guest
    #[serde(default)]
    pub volume_mode: VolumeMode,
}

/// Persistent volume access mode
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AccessMode {
    /// Mountable read-write by a single node
    ReadWriteOnce,
    /// Mountable read-write by many nodes
    ReadWriteMany,
    /// Mountable read-only by many nodes
    ReadOnlyMany,
}

/// Persistent volume mode
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VolumeMode {
    /// Formatted filesystem holding a disk image
    #[default]
    Filesystem,
    /// Raw block device
    Block,
}

/// VMI lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum VmiPhase {
    /// Accepted, not yet scheduled
    #[default]
    Pending,
    /// Pod is being scheduled
    Scheduling,
    /// Pod is on a node, guest not yet started
    Scheduled,
    /// Guest is running
    Running,
    /// Guest shut down cleanly
    Succeeded,
    /// Guest crashed or could not start
    Failed,
    /// State cannot be determined
    Unknown,
}

impl std::fmt::Display for VmiPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Scheduling => write!(f, "Scheduling"),
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Status for a VirtualMachineInstance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    /// Current phase of the guest
    #[serde(default)]
    pub phase: VmiPhase,

    /// Node the guest currently runs on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Conditions published by ferry
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,

    /// Record of the most recent migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<MigrationState>,
}

/// Abort bookkeeping for a migration
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MigrationAbortStatus {
    /// No abort was requested
    #[default]
    #[serde(rename = "")]
    None,
    /// Abort requested, teardown in progress
    Requested,
    /// Target torn down, guest still on source
    Succeeded,
    /// Teardown of the target could not be confirmed
    Failed,
}

/// Stream carried on a migration port
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPortProtocol {
    /// Guest memory and device state
    Memory,
    /// Block device contents
    Block,
}

/// Durable record of one migration, embedded in the VMI status
///
/// Fields are written as the migration advances and are never retracted
/// until a different migration replaces the whole record. Optional fields
/// serialize as explicit nulls so a merge patch replaces a previous
/// migration's record wholesale.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    /// UID of the migration request this record belongs to
    pub migration_uid: String,

    /// Node the guest was running on when the migration was admitted
    pub source_node: String,

    /// Node the target pod was scheduled to
    #[serde(default)]
    pub target_node: Option<String>,

    /// Address the target listens on for migration traffic
    #[serde(default)]
    pub target_node_address: Option<String>,

    /// Ports exposed by the target, keyed by port number
    #[serde(default)]
    pub target_direct_migration_node_ports: BTreeMap<String, MigrationPortProtocol>,

    /// Name of the target pod
    #[serde(default)]
    pub target_pod: Option<String>,

    /// When the hypervisor transfer was started
    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,

    /// When the migration reached its outcome
    #[serde(default)]
    pub end_timestamp: Option<DateTime<Utc>>,

    /// The migration reached a terminal outcome
    #[serde(default)]
    pub completed: bool,

    /// The outcome was a failure; the guest stayed on the source
    #[serde(default)]
    pub failed: bool,

    /// A client asked for the migration to be cancelled
    #[serde(default)]
    pub abort_requested: bool,

    /// Progress of the requested abort
    #[serde(default)]
    pub abort_status: MigrationAbortStatus,
}

impl MigrationState {
    /// Fresh record for a newly admitted migration
    pub fn admitted(migration_uid: impl Into<String>, source_node: impl Into<String>) -> Self {
        Self {
            migration_uid: migration_uid.into(),
            source_node: source_node.into(),
            ..Default::default()
        }
    }

    /// Returns true once the record is terminal
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Returns true if an abort was requested and has not been resolved
    pub fn abort_pending(&self) -> bool {
        self.abort_requested && self.abort_status == MigrationAbortStatus::Requested
    }
}

impl VirtualMachineInstance {
    /// Current status, or the default when none has been written
    pub fn status_or_default(&self) -> VirtualMachineInstanceStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Node the guest currently runs on
    pub fn node_name(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.node_name.as_deref())
    }

    /// Returns true if the guest is running on a node and not being deleted
    pub fn is_running(&self) -> bool {
        self.metadata.deletion_timestamp.is_none()
            && self
                .status
                .as_ref()
                .map(|s| s.phase == VmiPhase::Running && s.node_name.is_some())
                .unwrap_or(false)
    }

    /// Migration record if it belongs to `migration_uid`
    pub fn migration_state_for(&self, migration_uid: &str) -> Option<&MigrationState> {
        self.status
            .as_ref()
            .and_then(|s| s.migration_state.as_ref())
            .filter(|m| m.migration_uid == migration_uid)
    }

    /// UID of the VMI; every persisted VMI has one
    pub fn uid_or_empty(&self) -> String {
        self.uid().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vmi_with_status(status: Option<VirtualMachineInstanceStatus>) -> VirtualMachineInstance {
        let mut vmi = VirtualMachineInstance::new(
            "guest",
            VirtualMachineInstanceSpec {
                memory: "1Gi".to_string(),
                volumes: vec![],
                eviction_strategy: None,
                node_selector: None,
            },
        );
        vmi.status = status;
        vmi
    }

    #[test]
    fn volume_sources_use_their_field_names() {
        let yaml = r#"
name: root
persistentVolumeClaim:
  claimName: root-disk
  accessMode: ReadWriteMany
  volumeMode: Block
"#;
        let volume: Volume = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(volume.name, "root");
        assert_eq!(
            volume.source,
            VolumeSource::PersistentVolumeClaim(ClaimVolume {
                claim_name: "root-disk".to_string(),
                access_mode: AccessMode::ReadWriteMany,
                volume_mode: VolumeMode::Block,
            })
        );

        let yaml = "name: cloudinit\ncloudInitNoCloud:\n  userData: \"#cloud-config\"\n";
        let volume: Volume = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(volume.source, VolumeSource::CloudInitNoCloud { .. }));
    }

    #[test]
    fn running_requires_phase_and_node() {
        assert!(!vmi_with_status(None).is_running());

        let scheduled = vmi_with_status(Some(VirtualMachineInstanceStatus {
            phase: VmiPhase::Scheduled,
            node_name: Some("node-a".to_string()),
            ..Default::default()
        }));
        assert!(!scheduled.is_running());

        let running = vmi_with_status(Some(VirtualMachineInstanceStatus {
            phase: VmiPhase::Running,
            node_name: Some("node-a".to_string()),
            ..Default::default()
        }));
        assert!(running.is_running());
        assert_eq!(running.node_name(), Some("node-a"));
    }

    #[test]
    fn migration_state_lookup_is_scoped_to_uid() {
        let vmi = vmi_with_status(Some(VirtualMachineInstanceStatus {
            phase: VmiPhase::Running,
            node_name: Some("node-a".to_string()),
            migration_state: Some(MigrationState::admitted("uid-1", "node-a")),
            ..Default::default()
        }));
        assert!(vmi.migration_state_for("uid-1").is_some());
        assert!(vmi.migration_state_for("uid-2").is_none());
    }

    #[test]
    fn empty_optional_fields_serialize_as_null() {
        let json = serde_json::to_value(MigrationState::admitted("uid", "node-a")).unwrap();
        assert!(json["targetNode"].is_null());
        assert!(json.as_object().unwrap().contains_key("targetNode"));
        assert_eq!(json["abortStatus"], "");
    }

    #[test]
    fn abort_pending_only_while_requested() {
        let mut state = MigrationState::admitted("uid", "node-a");
        assert!(!state.abort_pending());
        state.abort_requested = true;
        state.abort_status = MigrationAbortStatus::Requested;
        assert!(state.abort_pending());
        state.abort_status = MigrationAbortStatus::Succeeded;
        assert!(!state.abort_pending());
    }
}
