//! Kubernetes Event recording for migrations
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown under REASON in `kubectl get events`
pub mod reasons {
    /// Admitted; a target pod is being scheduled
    pub const MIGRATION_SCHEDULING: &str = "MigrationScheduling";
    /// Admission deferred by a concurrency cap
    pub const MIGRATION_DEFERRED: &str = "MigrationDeferred";
    /// Target is up and the secure channel was verified
    pub const TARGET_READY: &str = "TargetReady";
    /// State transfer started
    pub const MIGRATION_RUNNING: &str = "MigrationRunning";
    /// Guest now runs on the target node
    pub const MIGRATION_SUCCEEDED: &str = "MigrationSucceeded";
    /// Migration failed; guest stays on the source
    pub const MIGRATION_FAILED: &str = "MigrationFailed";
    /// Migration was cancelled
    pub const MIGRATION_ABORTED: &str = "MigrationAborted";
    /// Node drain created a migration for the VMI
    pub const EVACUATION_STARTED: &str = "EvacuationStarted";
}

/// Event actions, shown under ACTION in `kubectl get events`
pub mod actions {
    /// Admission decision
    pub const ADMIT: &str = "Admit";
    /// Phase change during reconcile
    pub const MIGRATE: &str = "Migrate";
    /// Cancellation handling
    pub const ABORT: &str = "Abort";
    /// Node drain handling
    pub const EVACUATE: &str = "Evacuate";
}
