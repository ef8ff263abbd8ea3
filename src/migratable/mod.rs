//! Migratability checks for VMI volumes
//!
//! A guest can only be live-migrated when every disk it writes to is
//! reachable from the target node with the same consistency guarantees.
//! Ephemeral sources are rebuilt on the target; persistent ones must be
//! shared, and shared filesystems must also be safe for concurrent access
//! from two hosts. The process-wide unsafe override skips the check.

use std::collections::BTreeSet;

use crate::crd::{
    AccessMode, ClaimVolume, Condition, ConditionStatus, VirtualMachineInstanceSpec, VolumeMode,
    VolumeSource,
};

/// Reason published when a VMI has disks that block migration
pub const DISKS_NOT_LIVE_MIGRATABLE: &str = "DisksNotLiveMigratable";

/// Reason published when the unsafe override allowed an otherwise blocked VMI
pub const UNSAFE_MIGRATION_OVERRIDE: &str = "UnsafeMigrationOverride";

/// Verdict of [`check_migratable`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Migratability {
    /// Whether a migration may be admitted
    pub migratable: bool,
    /// One entry per blocking volume, sorted
    pub reasons: BTreeSet<String>,
    /// True when `migratable` only holds because of the unsafe override
    pub overridden: bool,
}

impl Migratability {
    /// Condition to publish as IsMigratable
    pub fn condition(&self) -> Condition {
        match (self.migratable, self.overridden) {
            (true, false) => Condition::new(ConditionStatus::True, "", ""),
            (true, true) => Condition::new(
                ConditionStatus::True,
                UNSAFE_MIGRATION_OVERRIDE,
                self.joined_reasons(),
            ),
            (false, _) => Condition::new(
                ConditionStatus::False,
                DISKS_NOT_LIVE_MIGRATABLE,
                self.joined_reasons(),
            ),
        }
    }

    /// Message returned to a client whose request was refused
    pub fn denial_message(&self) -> String {
        format!(
            "cannot migrate VMI: {}: {}",
            DISKS_NOT_LIVE_MIGRATABLE,
            self.joined_reasons()
        )
    }

    fn joined_reasons(&self) -> String {
        self.reasons.iter().cloned().collect::<Vec<_>>().join("; ")
    }
}

/// Decide whether `spec` can be live-migrated
///
/// Pure and deterministic for a given spec and override flag.
pub fn check_migratable(spec: &VirtualMachineInstanceSpec, unsafe_override: bool) -> Migratability {
    let reasons: BTreeSet<String> = spec
        .volumes
        .iter()
        .filter_map(|volume| blocking_reason(&volume.name, &volume.source))
        .collect();

    let blocked = !reasons.is_empty();
    Migratability {
        migratable: !blocked || unsafe_override,
        overridden: blocked && unsafe_override,
        reasons,
    }
}

fn blocking_reason(name: &str, source: &VolumeSource) -> Option<String> {
    match source {
        VolumeSource::ContainerDisk { .. }
        | VolumeSource::CloudInitNoCloud { .. }
        | VolumeSource::ConfigMap { .. }
        | VolumeSource::Secret { .. }
        | VolumeSource::ServiceAccount { .. }
        | VolumeSource::EmptyDisk { .. } => None,
        VolumeSource::PersistentVolumeClaim(claim) | VolumeSource::DataVolume(claim) => {
            claim_reason(name, claim)
        }
        VolumeSource::HostDisk { path } => Some(format!(
            "volume {name}: host disk {path} is local to the node"
        )),
    }
}

fn claim_reason(name: &str, claim: &ClaimVolume) -> Option<String> {
    match (claim.access_mode, claim.volume_mode) {
        (AccessMode::ReadWriteMany, VolumeMode::Block) => None,
        (AccessMode::ReadWriteMany, VolumeMode::Filesystem) => Some(format!(
            "volume {name}: shared filesystem claim {} has no clustering guarantees",
            claim.claim_name
        )),
        (mode, _) => Some(format!(
            "volume {name}: claim {} is {:?}, ReadWriteMany is required",
            claim.claim_name, mode
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Volume;
    use rstest::rstest;

    fn spec_with(volumes: Vec<Volume>) -> VirtualMachineInstanceSpec {
        VirtualMachineInstanceSpec {
            memory: "1Gi".to_string(),
            volumes,
            eviction_strategy: None,
            node_selector: None,
        }
    }

    fn claim(access_mode: AccessMode, volume_mode: VolumeMode) -> VolumeSource {
        VolumeSource::PersistentVolumeClaim(ClaimVolume {
            claim_name: "disk".to_string(),
            access_mode,
            volume_mode,
        })
    }

    fn volume(name: &str, source: VolumeSource) -> Volume {
        Volume {
            name: name.to_string(),
            source,
        }
    }

    #[rstest]
    #[case::container_disk(VolumeSource::ContainerDisk { image: "cirros".to_string() })]
    #[case::cloud_init(VolumeSource::CloudInitNoCloud { user_data: String::new() })]
    #[case::config_map(VolumeSource::ConfigMap { name: "cm".to_string() })]
    #[case::secret(VolumeSource::Secret { name: "s".to_string() })]
    #[case::service_account(VolumeSource::ServiceAccount { name: "default".to_string() })]
    #[case::empty_disk(VolumeSource::EmptyDisk { capacity: "1Gi".to_string() })]
    #[case::shared_block(claim(AccessMode::ReadWriteMany, VolumeMode::Block))]
    fn migratable_sources(#[case] source: VolumeSource) {
        let verdict = check_migratable(&spec_with(vec![volume("v", source)]), false);
        assert!(verdict.migratable);
        assert!(verdict.reasons.is_empty());
        assert_eq!(verdict.condition().status, ConditionStatus::True);
    }

    #[rstest]
    #[case::rwo_claim(claim(AccessMode::ReadWriteOnce, VolumeMode::Filesystem))]
    #[case::rwo_block(claim(AccessMode::ReadWriteOnce, VolumeMode::Block))]
    #[case::read_only_many(claim(AccessMode::ReadOnlyMany, VolumeMode::Block))]
    #[case::shared_filesystem(claim(AccessMode::ReadWriteMany, VolumeMode::Filesystem))]
    #[case::host_disk(VolumeSource::HostDisk { path: "/var/disk.img".to_string() })]
    fn blocking_sources(#[case] source: VolumeSource) {
        let verdict = check_migratable(&spec_with(vec![volume("v", source)]), false);
        assert!(!verdict.migratable);
        assert_eq!(verdict.reasons.len(), 1);

        let condition = verdict.condition();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, DISKS_NOT_LIVE_MIGRATABLE);
        assert!(verdict.denial_message().contains(DISKS_NOT_LIVE_MIGRATABLE));
    }

    #[test]
    fn data_volumes_follow_claim_rules() {
        let dv = VolumeSource::DataVolume(ClaimVolume {
            claim_name: "dv".to_string(),
            access_mode: AccessMode::ReadWriteOnce,
            volume_mode: VolumeMode::Filesystem,
        });
        let verdict = check_migratable(&spec_with(vec![volume("root", dv)]), false);
        assert!(!verdict.migratable);
        assert!(verdict.denial_message().contains("volume root"));
    }

    #[test]
    fn unsafe_override_allows_and_is_reported() {
        let spec = spec_with(vec![volume(
            "root",
            claim(AccessMode::ReadWriteMany, VolumeMode::Filesystem),
        )]);
        let verdict = check_migratable(&spec, true);
        assert!(verdict.migratable);
        assert!(verdict.overridden);

        let condition = verdict.condition();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, UNSAFE_MIGRATION_OVERRIDE);
    }

    #[test]
    fn override_on_a_clean_spec_is_not_reported() {
        let verdict = check_migratable(&spec_with(vec![]), true);
        assert!(verdict.migratable);
        assert!(!verdict.overridden);
    }

    #[test]
    fn every_blocking_volume_is_listed_once() {
        let spec = spec_with(vec![
            volume("a", claim(AccessMode::ReadWriteOnce, VolumeMode::Filesystem)),
            volume("b", VolumeSource::HostDisk { path: "/d".to_string() }),
            volume("c", VolumeSource::ContainerDisk { image: "img".to_string() }),
        ]);
        let verdict = check_migratable(&spec, false);
        assert_eq!(verdict.reasons.len(), 2);
        assert_eq!(verdict, check_migratable(&spec, false));
    }
}
