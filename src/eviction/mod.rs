//! Eviction protection for VMI pods
//!
//! A VMI with the `LiveMigrate` eviction strategy must never lose its pod to
//! a voluntary eviction: a drain migrates it instead. Two mechanisms enforce
//! this and are derived from the same inputs:
//!
//! - a PodDisruptionBudget selecting every pod created for the VMI, with
//!   `minAvailable` raised to cover the target pod while a migration is active
//! - the eviction webhook, which answers from the moment a pod exists, before
//!   the budget has been observed by the API server
//!
//! VMIs without the strategy get no budget and ordinary eviction rules.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::{VirtualMachineInstance, VirtualMachineInstanceMigration};

/// Label carrying the UID of the VMI a pod was created for
pub const CREATED_BY_LABEL: &str = "ferry.dev/created-by";

/// Label carrying the UID of the migration a target pod was created for
pub const MIGRATION_UID_LABEL: &str = "ferry.dev/migration-uid";

/// Label carrying the VMI name on derived objects
pub const VMI_NAME_LABEL: &str = "ferry.dev/vmi";

/// Name of the disruption budget for `vmi_name`
pub fn disruption_budget_name(vmi_name: &str) -> String {
    format!("{vmi_name}-migration-pdb")
}

/// Controller owner reference pointing at `vmi`
pub fn vmi_owner_reference(vmi: &VirtualMachineInstance) -> Option<OwnerReference> {
    vmi.controller_owner_ref(&())
}

/// The disruption budget `vmi` should have, or None if it should have none
///
/// While `migration_active`, `minAvailable` is 2 so neither the source nor
/// the target pod can be evicted.
pub fn desired_disruption_budget(
    vmi: &VirtualMachineInstance,
    migration_active: bool,
) -> Option<PodDisruptionBudget> {
    if !vmi.spec.migrates_on_eviction() || vmi.metadata.deletion_timestamp.is_some() {
        return None;
    }
    let uid = vmi.uid()?;
    let name = vmi.name_any();

    Some(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(disruption_budget_name(&name)),
            namespace: vmi.namespace(),
            labels: Some(BTreeMap::from([(VMI_NAME_LABEL.to_string(), name)])),
            owner_references: vmi_owner_reference(vmi).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(if migration_active { 2 } else { 1 })),
            selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(CREATED_BY_LABEL.to_string(), uid)])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Answer to an eviction request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvictionDecision {
    /// Ordinary eviction rules apply
    Allow,
    /// Reject with a "too many requests" response
    Deny(String),
}

/// Decide whether `pod`, created for `vmi`, may be evicted
///
/// `active` is the VMI's non-terminal migration, if any. The VMI's current
/// pod is always protected, as is the target pod of the active migration.
/// Pods left behind by finished migrations are not.
pub fn evaluate_eviction(
    pod: &Pod,
    vmi: &VirtualMachineInstance,
    active: Option<&VirtualMachineInstanceMigration>,
) -> EvictionDecision {
    if !vmi.spec.migrates_on_eviction() {
        return EvictionDecision::Allow;
    }

    let pod_name = pod.name_any();
    let vmi_name = vmi.name_any();
    let pod_node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
    let pod_migration = pod.labels().get(MIGRATION_UID_LABEL).map(String::as_str);
    let on_current_node = pod_node.is_some() && pod_node == vmi.node_name();

    if let Some(active) = active {
        let active_uid = active.uid();
        if pod_migration.is_some() && pod_migration == active_uid.as_deref() {
            return EvictionDecision::Deny(format!(
                "pod {pod_name} is the target of migration {} for VMI {vmi_name}",
                active.name_any()
            ));
        }
        if on_current_node {
            return EvictionDecision::Deny(format!(
                "VMI {vmi_name} is migrating; pod {pod_name} cannot be evicted until it completes"
            ));
        }
        return EvictionDecision::Allow;
    }

    // Launching pods have no node yet but already belong to the VMI
    let launching = pod_node.is_none() && pod_migration.is_none();
    if on_current_node || launching {
        return EvictionDecision::Deny(format!(
            "VMI {vmi_name} has eviction strategy LiveMigrate; drain the node to migrate it"
        ));
    }
    EvictionDecision::Allow
}
