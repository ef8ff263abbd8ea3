//! Target pod for a migration
//!
//! The target pod is the receiving end of the transfer. It is created by the
//! migration controller, owned by the VMI, kept off the source node with a
//! required anti-affinity, and carries the same `created-by` label as the
//! source pod so the VMI's disruption budget covers it.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, Pod, PodSpec, ResourceRequirements, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::{TARGET_READY_TIMEOUT, TARGET_SCHEDULING_TIMEOUT};
use crate::crd::{MigrationPortProtocol, VirtualMachineInstance, VirtualMachineInstanceMigration};
use crate::eviction::{vmi_owner_reference, CREATED_BY_LABEL, MIGRATION_UID_LABEL, VMI_NAME_LABEL};
use crate::transport::session_secret_name;

/// Label carrying the name of the migration a target pod belongs to
pub const MIGRATION_LABEL: &str = "ferry.dev/migration";

/// Port carrying guest memory and device state
pub const MEMORY_PORT: u16 = 49152;

/// Port carrying block device contents
pub const BLOCK_PORT: u16 = 49153;

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
const TLS_VOLUME: &str = "session-tls";
const TLS_MOUNT_PATH: &str = "/var/run/ferry/tls";

/// Name of the target pod for the given attempt
pub fn target_pod_name(migration_name: &str, attempt: u32) -> String {
    format!("{migration_name}-target-{attempt}")
}

/// Ports every target listens on, keyed by port number
pub fn target_ports() -> BTreeMap<String, MigrationPortProtocol> {
    BTreeMap::from([
        (MEMORY_PORT.to_string(), MigrationPortProtocol::Memory),
        (BLOCK_PORT.to_string(), MigrationPortProtocol::Block),
    ])
}

/// Build the target pod for `migration` of `vmi` away from `source_node`
///
/// Returns None if either object has no UID yet.
pub fn build_target_pod(
    vmi: &VirtualMachineInstance,
    migration: &VirtualMachineInstanceMigration,
    source_node: &str,
    attempt: u32,
    image: &str,
) -> Option<Pod> {
    let vmi_uid = vmi.uid()?;
    let migration_uid = migration.uid()?;
    let migration_name = migration.name_any();
    let vmi_name = vmi.name_any();

    let labels = BTreeMap::from([
        (CREATED_BY_LABEL.to_string(), vmi_uid),
        (MIGRATION_LABEL.to_string(), migration_name.clone()),
        (MIGRATION_UID_LABEL.to_string(), migration_uid.clone()),
        (VMI_NAME_LABEL.to_string(), vmi_name.clone()),
    ]);

    let anti_affinity = Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: HOSTNAME_LABEL.to_string(),
                        operator: "NotIn".to_string(),
                        values: Some(vec![source_node.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let ports = [(MEMORY_PORT, "memory"), (BLOCK_PORT, "block")]
        .into_iter()
        .map(|(port, name)| ContainerPort {
            container_port: i32::from(port),
            name: Some(name.to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: "target".to_string(),
        image: Some(image.to_string()),
        args: Some(vec![
            "receive".to_string(),
            format!("--migration-uid={migration_uid}"),
            format!("--vmi={vmi_name}"),
            format!("--tls-dir={TLS_MOUNT_PATH}"),
        ]),
        ports: Some(ports),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity(vmi.spec.memory.clone()),
            )])),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: TLS_VOLUME.to_string(),
            mount_path: TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Some(Pod {
        metadata: ObjectMeta {
            name: Some(target_pod_name(&migration_name, attempt)),
            namespace: migration.namespace(),
            labels: Some(labels),
            owner_references: vmi_owner_reference(vmi).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            affinity: Some(anti_affinity),
            node_selector: vmi.spec.node_selector.clone(),
            containers: vec![container],
            // The secret is written once the target has an address
            volumes: Some(vec![Volume {
                name: TLS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(session_secret_name(&migration_name)),
                    optional: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    })
}

/// What the controller sees when it looks at a target pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetPodState {
    /// Not yet scheduled or not yet ready
    Starting,
    /// Running and ready on `node`, listening on `address`
    Ready {
        /// Node the pod was scheduled to
        node: String,
        /// Pod IP
        address: IpAddr,
    },
    /// Will never become ready
    Dead(String),
}

/// Classify `pod` for a migration away from `source_node`
pub fn target_pod_state(pod: &Pod, source_node: &str, now: DateTime<Utc>) -> TargetPodState {
    if pod.metadata.deletion_timestamp.is_some() {
        return TargetPodState::Dead("target pod is being deleted".to_string());
    }

    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("Pending");
    if matches!(phase, "Failed" | "Succeeded") {
        let detail = status
            .and_then(|s| s.message.clone().or_else(|| s.reason.clone()))
            .unwrap_or_default();
        return TargetPodState::Dead(format!("target pod {phase} {detail}").trim().to_string());
    }

    let age = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| (now - t.0).to_std().ok())
        .unwrap_or_default();

    let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
    let Some(node) = node else {
        if age > TARGET_SCHEDULING_TIMEOUT {
            return TargetPodState::Dead(format!(
                "target pod not scheduled after {}s",
                TARGET_SCHEDULING_TIMEOUT.as_secs()
            ));
        }
        return TargetPodState::Starting;
    };
    if node == source_node {
        return TargetPodState::Dead(format!("target pod landed on source node {node}"));
    }

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    let address = status
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| ip.parse::<IpAddr>().ok());

    match (phase, ready, address) {
        ("Running", true, Some(address)) => TargetPodState::Ready {
            node: node.to_string(),
            address,
        },
        // Image pulls and sandbox setup that never finish
        _ if age > TARGET_READY_TIMEOUT => TargetPodState::Dead(format!(
            "target pod on node {node} not ready after {}s",
            TARGET_READY_TIMEOUT.as_secs()
        )),
        _ => TargetPodState::Starting,
    }
}
