//! Custom Resource Definitions for ferry

mod migration;
mod types;
mod vmi;

pub use migration::{
    MigrationPhase, PinnedMigrationConfig, TransferProgress, VirtualMachineInstanceMigration,
    VirtualMachineInstanceMigrationSpec, VirtualMachineInstanceMigrationStatus,
    MIGRATION_FINALIZER,
};
pub use types::{parse_quantity, Condition, ConditionKind, ConditionStatus, Conditions};
pub use vmi::{
    AccessMode, ClaimVolume, EvictionStrategy, MigrationAbortStatus, MigrationPortProtocol,
    MigrationState, VirtualMachineInstance, VirtualMachineInstanceSpec,
    VirtualMachineInstanceStatus, VmiPhase, Volume, VolumeMode, VolumeSource,
};
