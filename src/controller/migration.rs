//! VirtualMachineInstanceMigration controller
//!
//! Drives one migration through
//! `Pending -> Scheduling -> TargetReady -> Running -> {Succeeded | Failed}`.
//! Every step re-reads the VMI and the migration and writes its progress
//! into both objects, VMI first, so a restart resumes from durable state:
//!
//! - Pending: admission under the [`crate::limiter::AdmissionGate`]
//! - Scheduling: target pod creation (bounded retries), session
//!   credentials and the mutual-TLS handshake probe
//! - TargetReady: start of the hypervisor transfer
//! - Running: progress supervision until the collaborator reports an outcome
//!
//! The VMI's `MigrationState` is the record of truth for the outcome. Once it
//! says `completed`, the migration's phase is settled from it, never the
//! other way round, so the two can not disagree.
//!
//! Deletion while non-terminal is cancellation; see [`super::cancel`].

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::target::{build_target_pod, target_pod_state, target_ports, TargetPodState};
use super::{
    cancel, Context, VmiStatusPatch, BLOCK_PORT, MAX_HANDSHAKE_ROUNDS, MAX_TARGET_ATTEMPTS,
    MEMORY_PORT, PENDING_REQUEUE, POLL_INTERVAL,
};
use crate::crd::{
    MigrationAbortStatus, MigrationPhase, MigrationState, VirtualMachineInstance,
    VirtualMachineInstanceMigration, VirtualMachineInstanceMigrationStatus,
};
use crate::events::{actions, reasons};
use crate::limiter::{Admission, ConcurrencyLimiter, ConcurrencyLimits};
use crate::migratable::check_migratable;
use crate::monitor::{MonitorVerdict, ProgressMonitor};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::transfer::{AbortOutcome, TransferHandle, TransferRequest, TransferState};
use crate::transport::{session_secret_name, SessionCredentials, TargetEndpoint};
use crate::Error;

/// One reconcile's view of a migration
pub(super) struct Scope<'a> {
    pub migration: &'a VirtualMachineInstanceMigration,
    pub ctx: &'a Context,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl<'a> Scope<'a> {
    fn new(migration: &'a VirtualMachineInstanceMigration, ctx: &'a Context) -> Option<Self> {
        Some(Self {
            migration,
            ctx,
            namespace: migration.namespace()?,
            name: migration.name_any(),
            uid: migration.uid()?,
        })
    }

    pub fn vmi_name(&self) -> &str {
        &self.migration.spec.vmi_name
    }

    pub fn status(&self) -> VirtualMachineInstanceMigrationStatus {
        self.migration.status_or_default()
    }

    /// Source node recorded at admission, falling back to where the VMI runs
    pub fn source_node(&self, vmi: Option<&VirtualMachineInstance>) -> String {
        self.migration
            .source_node()
            .or_else(|| vmi.and_then(|v| v.node_name()))
            .unwrap_or_default()
            .to_string()
    }

    pub fn transfer_handle(&self, source_node: &str) -> TransferHandle {
        TransferHandle {
            migration_uid: self.uid.clone(),
            source_node: source_node.to_string(),
        }
    }

    pub async fn get_vmi(&self) -> Result<Option<VirtualMachineInstance>, Error> {
        self.ctx.client.get_vmi(&self.namespace, self.vmi_name()).await
    }

    pub async fn write_status(
        &self,
        status: &VirtualMachineInstanceMigrationStatus,
    ) -> Result<(), Error> {
        self.ctx
            .client
            .patch_migration_status(&self.namespace, &self.name, status)
            .await
    }

    pub async fn write_vmi(&self, patch: &VmiStatusPatch) -> Result<(), Error> {
        self.ctx
            .client
            .patch_vmi_status(&self.namespace, self.vmi_name(), patch)
            .await
    }

    pub async fn event(&self, type_: EventType, reason: &str, action: &str, note: String) {
        let object_ref: ObjectReference = self.migration.object_ref(&());
        self.ctx
            .events
            .publish(&object_ref, type_, reason, action, Some(note))
            .await;
    }
}

/// Reconcile a VirtualMachineInstanceMigration
#[instrument(
    skip(migration, ctx),
    fields(
        migration = %migration.name_any(),
        vmi = %migration.spec.vmi_name,
        phase = %migration.phase()
    )
)]
pub async fn reconcile(
    migration: std::sync::Arc<VirtualMachineInstanceMigration>,
    ctx: std::sync::Arc<Context>,
) -> Result<Action, Error> {
    let Some(scope) = Scope::new(&migration, &ctx) else {
        warn!("migration has no namespace or uid yet, skipping");
        return Ok(Action::await_change());
    };

    if migration.is_deleting() {
        return cancel::cancel(&scope).await;
    }

    match migration.phase() {
        MigrationPhase::Pending => admit(&scope).await,
        phase if phase.is_terminal() => {
            release(&scope).await?;
            Ok(Action::await_change())
        }
        _ => advance(&scope).await,
    }
}

/// Error policy for the migration controller
pub fn error_policy(
    migration: std::sync::Arc<VirtualMachineInstanceMigration>,
    error: &Error,
    _ctx: std::sync::Arc<Context>,
) -> Action {
    error!(
        ?error,
        migration = %migration.name_any(),
        phase = %migration.phase(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

// =============================================================================
// Pending
// =============================================================================

async fn admit(scope: &Scope<'_>) -> Result<Action, Error> {
    let ctx = scope.ctx;
    let snapshot = ctx.config.current();

    let Some(vmi) = scope.get_vmi().await? else {
        return finalize_failure(
            scope,
            None,
            format!("VMI {} does not exist", scope.vmi_name()),
            None,
        )
        .await;
    };

    let source = match vmi.node_name() {
        Some(node) if vmi.is_running() => node.to_string(),
        _ => {
            return defer(scope, format!("VMI {} is not running", scope.vmi_name())).await;
        }
    };

    let verdict = check_migratable(&vmi.spec, snapshot.config.unsafe_migration_override);
    if !verdict.migratable {
        return defer(scope, verdict.denial_message()).await;
    }

    let gate = ctx.admission.enter().await;
    let migrations = ctx.client.list_migrations().await?;

    // Admitted by an earlier pass since this copy was read
    let current = migrations
        .iter()
        .find(|m| m.uid().as_deref() == Some(scope.uid.as_str()));
    if current.is_some_and(|m| m.phase() != MigrationPhase::Pending) {
        drop(gate);
        debug!("migration is no longer pending, skipping admission");
        return Ok(Action::await_change());
    }

    let competing = migrations.iter().find(|m| {
        m.uid().as_deref() != Some(scope.uid.as_str())
            && m.targets(&scope.namespace, scope.vmi_name())
            && m.phase().holds_slot()
    });
    if let Some(other) = competing {
        let message = format!(
            "waiting for migration {} of VMI {} to finish",
            other.name_any(),
            scope.vmi_name()
        );
        drop(gate);
        return defer(scope, message).await;
    }

    let limiter = ConcurrencyLimiter::new(ConcurrencyLimits::from(snapshot.config.as_ref()));
    if let Admission::Deferred(reason) = limiter.try_admit(scope.migration, &source, &migrations) {
        drop(gate);
        return defer(scope, reason.to_string()).await;
    }

    // Finalizer first: a cancel from here on must find it
    let mut owner = vmi.controller_owner_ref(&());
    if let Some(owner) = owner.as_mut() {
        owner.controller = Some(false);
        owner.block_owner_deletion = None;
    }
    ctx.client
        .add_migration_finalizer(&scope.namespace, &scope.name, owner)
        .await?;

    let status = VirtualMachineInstanceMigrationStatus {
        phase: MigrationPhase::Scheduling,
        source_node: Some(source.clone()),
        configuration: Some(snapshot.pin()),
        ..Default::default()
    };
    scope.write_status(&status).await?;
    drop(gate);

    scope
        .write_vmi(&VmiStatusPatch::state(MigrationState::admitted(
            &scope.uid, &source,
        )))
        .await?;

    info!(node = %source, config_version = snapshot.version, "migration admitted");
    scope
        .event(
            EventType::Normal,
            reasons::MIGRATION_SCHEDULING,
            actions::ADMIT,
            format!("Migrating VMI {} away from node {source}", scope.vmi_name()),
        )
        .await;
    Ok(Action::requeue(POLL_INTERVAL))
}

/// Keep the migration Pending with `message`
async fn defer(scope: &Scope<'_>, message: String) -> Result<Action, Error> {
    let status = scope.status();
    if status.message.as_deref() != Some(message.as_str()) {
        debug!(reason = %message, "migration deferred");
        scope
            .write_status(&status.phase(MigrationPhase::Pending).message(message.clone()))
            .await?;
        scope
            .event(
                EventType::Normal,
                reasons::MIGRATION_DEFERRED,
                actions::ADMIT,
                message,
            )
            .await;
    }
    Ok(Action::requeue(PENDING_REQUEUE))
}

// =============================================================================
// Active phases
// =============================================================================

async fn advance(scope: &Scope<'_>) -> Result<Action, Error> {
    let phase = scope.migration.phase();

    let Some(vmi) = scope.get_vmi().await? else {
        return finalize_failure(scope, None, "VMI was deleted".to_string(), None).await;
    };
    let source = scope.source_node(Some(&vmi));

    let state = match vmi.migration_state_for(&scope.uid) {
        Some(state) if state.is_completed() => return settle(scope, &vmi).await,
        Some(state) => state.clone(),
        None if phase == MigrationPhase::Scheduling => {
            // Admission wrote the status but not the VMI record
            let state = MigrationState::admitted(&scope.uid, &source);
            scope.write_vmi(&VmiStatusPatch::state(state.clone())).await?;
            state
        }
        None => {
            return finalize_failure(
                scope,
                Some(&vmi),
                "migration record missing from VMI".to_string(),
                None,
            )
            .await;
        }
    };

    match phase {
        MigrationPhase::Scheduling => schedule(scope, &vmi, state, &source).await,
        MigrationPhase::TargetReady => start_transfer(scope, &vmi, state, &source).await,
        MigrationPhase::Running => supervise(scope, &vmi, &state, &source).await,
        _ => Ok(Action::await_change()),
    }
}

/// Bring the migration phase in line with a terminal VMI record
pub(super) async fn settle(
    scope: &Scope<'_>,
    vmi: &VirtualMachineInstance,
) -> Result<Action, Error> {
    match vmi.migration_state_for(&scope.uid) {
        Some(state) if !state.failed => finalize_success(scope, vmi).await,
        _ => finalize_failure(scope, Some(vmi), "migration failed".to_string(), None).await,
    }
}

async fn schedule(
    scope: &Scope<'_>,
    vmi: &VirtualMachineInstance,
    state: MigrationState,
    source: &str,
) -> Result<Action, Error> {
    let status = scope.status();

    let pod_state = match &status.target_pod {
        None => None,
        Some(name) => Some(
            match scope.ctx.client.get_pod(&scope.namespace, name).await? {
                Some(pod) => target_pod_state(&pod, source, Utc::now()),
                None => TargetPodState::Dead(format!("target pod {name} disappeared")),
            },
        ),
    };

    match pod_state {
        None => create_target(scope, vmi, source, 1).await,
        Some(TargetPodState::Starting) => Ok(Action::requeue(POLL_INTERVAL)),
        Some(TargetPodState::Dead(reason)) => {
            if let Some(name) = &status.target_pod {
                scope.ctx.client.delete_pod(&scope.namespace, name).await?;
            }
            if status.target_attempts >= MAX_TARGET_ATTEMPTS {
                return finalize_failure(
                    scope,
                    Some(vmi),
                    format!(
                        "no usable target after {} attempts: {reason}",
                        status.target_attempts
                    ),
                    None,
                )
                .await;
            }
            warn!(attempt = status.target_attempts, %reason, "target pod failed, retrying");
            create_target(scope, vmi, source, status.target_attempts + 1).await
        }
        Some(TargetPodState::Ready { node, address }) => {
            handshake(scope, vmi, state, source, &node, address).await
        }
    }
}

async fn create_target(
    scope: &Scope<'_>,
    vmi: &VirtualMachineInstance,
    source: &str,
    attempt: u32,
) -> Result<Action, Error> {
    let pod = build_target_pod(vmi, scope.migration, source, attempt, &scope.ctx.target_image)
        .ok_or_else(|| Error::validation("VMI has no UID"))?;
    let pod_name = pod.name_any();
    scope.ctx.client.create_pod(&scope.namespace, &pod).await?;

    let mut status = scope.status();
    status.target_pod = Some(pod_name.clone());
    status.target_attempts = attempt;
    status.message = Some(format!("waiting for target pod {pod_name}"));
    scope.write_status(&status).await?;

    info!(pod = %pod_name, attempt, "created target pod");
    Ok(Action::requeue(POLL_INTERVAL))
}

/// Credentials for this session, reusing the stored ones when still valid
async fn session_credentials(
    scope: &Scope<'_>,
    source: &str,
    target: &str,
    address: std::net::IpAddr,
) -> Result<SessionCredentials, Error> {
    let ctx = scope.ctx;
    let secret_name = session_secret_name(&scope.name);

    if let Some(secret) = ctx.client.get_secret(&scope.namespace, &secret_name).await? {
        match SessionCredentials::from_secret(&secret) {
            Ok(creds) if creds.matches(&scope.uid, source, target, address) => return Ok(creds),
            Ok(_) => debug!("stored session credentials are for another target"),
            Err(e) => warn!(error = %e, "stored session credentials are unreadable"),
        }
    }

    let creds = ctx.ca.issue_session(&scope.uid, source, target, address)?;
    let secret = creds.to_secret(
        &secret_name,
        &scope.namespace,
        scope.migration.controller_owner_ref(&()),
    );
    ctx.client.apply_secret(&scope.namespace, &secret).await?;
    info!(target_node = %target, "issued session credentials");
    Ok(creds)
}

async fn handshake(
    scope: &Scope<'_>,
    vmi: &VirtualMachineInstance,
    mut state: MigrationState,
    source: &str,
    node: &str,
    address: std::net::IpAddr,
) -> Result<Action, Error> {
    let creds = session_credentials(scope, source, node, address).await?;
    let endpoint = TargetEndpoint {
        address,
        ports: vec![MEMORY_PORT, BLOCK_PORT],
    };

    let prober = &scope.ctx.prober;
    let (endpoint_ref, creds_ref) = (&endpoint, &creds);
    let probe = retry_with_backoff(
        &RetryConfig::within_reconcile(3),
        "target_handshake",
        move || prober.probe(endpoint_ref, creds_ref),
    )
    .await;

    let mut status = scope.status();
    if let Err(e) = probe {
        let rounds = status.handshake_attempts + 1;
        if rounds >= MAX_HANDSHAKE_ROUNDS {
            return finalize_failure(
                scope,
                Some(vmi),
                format!("handshake with target failed {rounds} times: {e}"),
                None,
            )
            .await;
        }
        status.handshake_attempts = rounds;
        status.message = Some(format!("handshake with target failed: {e}"));
        scope.write_status(&status).await?;

        let backoff = RetryConfig {
            initial_delay: POLL_INTERVAL,
            ..RetryConfig::default()
        };
        return Ok(Action::requeue(backoff.delay_for_attempt(rounds)));
    }

    state.target_node = Some(node.to_string());
    state.target_node_address = Some(address.to_string());
    state.target_direct_migration_node_ports = target_ports();
    state.target_pod = status.target_pod.clone();
    scope.write_vmi(&VmiStatusPatch::state(state)).await?;

    status.phase = MigrationPhase::TargetReady;
    status.target_node = Some(node.to_string());
    status.message = None;
    scope.write_status(&status).await?;

    info!(target_node = %node, %address, "target ready");
    scope
        .event(
            EventType::Normal,
            reasons::TARGET_READY,
            actions::MIGRATE,
            format!("Target on node {node} passed the handshake"),
        )
        .await;
    Ok(Action::requeue(POLL_INTERVAL))
}

/// Reason the target can no longer take the guest, if any
async fn dead_target(scope: &Scope<'_>, source: &str) -> Result<Option<String>, Error> {
    let Some(name) = scope.status().target_pod else {
        return Ok(Some("no target pod recorded".to_string()));
    };
    match scope.ctx.client.get_pod(&scope.namespace, &name).await? {
        None => Ok(Some(format!("target pod {name} disappeared"))),
        Some(pod) => match target_pod_state(&pod, source, Utc::now()) {
            TargetPodState::Dead(reason) => Ok(Some(reason)),
            _ => Ok(None),
        },
    }
}

async fn start_transfer(
    scope: &Scope<'_>,
    vmi: &VirtualMachineInstance,
    mut state: MigrationState,
    source: &str,
) -> Result<Action, Error> {
    if let Some(reason) = dead_target(scope, source).await? {
        return finalize_failure(scope, Some(vmi), reason, None).await;
    }
    let Some(address) = state.target_node_address.clone() else {
        return finalize_failure(
            scope,
            Some(vmi),
            "target address missing from migration record".to_string(),
            None,
        )
        .await;
    };

    let mut status = scope.status();
    let pinned = status
        .configuration
        .clone()
        .unwrap_or_else(|| scope.ctx.config.current().pin());

    let request = TransferRequest {
        migration_uid: scope.uid.clone(),
        namespace: scope.namespace.clone(),
        vmi_name: scope.vmi_name().to_string(),
        source_node: source.to_string(),
        target_address: address,
        target_ports: state.target_direct_migration_node_ports.clone(),
        bandwidth_bytes_per_second: pinned.bandwidth_per_migration,
        credentials_secret: session_secret_name(&scope.name),
    };
    let transfer = &scope.ctx.transfer;
    let request_ref = &request;
    retry_with_backoff(
        &RetryConfig::within_reconcile(3),
        "start_transfer",
        move || transfer.start(request_ref),
    )
    .await?;

    state.start_timestamp.get_or_insert_with(Utc::now);
    scope.write_vmi(&VmiStatusPatch::state(state)).await?;

    status.phase = MigrationPhase::Running;
    status.progress = None;
    scope.write_status(&status).await?;

    info!(bandwidth = pinned.bandwidth_per_migration, "transfer started");
    scope
        .event(
            EventType::Normal,
            reasons::MIGRATION_RUNNING,
            actions::MIGRATE,
            format!("Transferring VMI {} state", scope.vmi_name()),
        )
        .await;
    Ok(Action::requeue(POLL_INTERVAL))
}

async fn supervise(
    scope: &Scope<'_>,
    vmi: &VirtualMachineInstance,
    state: &MigrationState,
    source: &str,
) -> Result<Action, Error> {
    let handle = scope.transfer_handle(source);
    let (processed, remaining) = match scope.ctx.transfer.report(&handle).await? {
        TransferState::Completed => return finalize_success(scope, vmi).await,
        TransferState::Failed { reason } => {
            return finalize_failure(scope, Some(vmi), format!("transfer failed: {reason}"), None)
                .await;
        }
        TransferState::InProgress {
            data_processed_bytes,
            data_remaining_bytes,
        } => (data_processed_bytes, data_remaining_bytes),
    };

    if let Some(reason) = dead_target(scope, source).await? {
        return abort_transfer(scope, vmi, &handle, reason).await;
    }

    let mut status = scope.status();
    let pinned = status
        .configuration
        .clone()
        .unwrap_or_else(|| scope.ctx.config.current().pin());
    let guest_bytes = vmi.spec.memory_bytes().unwrap_or_else(|e| {
        warn!(error = %e, "unreadable guest memory size, assuming the minimum");
        0
    });
    let monitor = ProgressMonitor::new(&pinned, guest_bytes);

    let now = Utc::now();
    let started = state.start_timestamp.unwrap_or(now);
    match monitor.evaluate(started, status.progress.as_ref(), processed, remaining, now) {
        MonitorVerdict::Continue { progress, changed } => {
            if changed {
                status.progress = Some(progress);
                scope.write_status(&status).await?;
            }
            Ok(Action::requeue(POLL_INTERVAL))
        }
        MonitorVerdict::Abort(cause) => {
            warn!(%cause, "aborting transfer");
            abort_transfer(scope, vmi, &handle, cause.to_string()).await
        }
    }
}

/// Stop the transfer and finalize with whatever outcome it reports
async fn abort_transfer(
    scope: &Scope<'_>,
    vmi: &VirtualMachineInstance,
    handle: &TransferHandle,
    reason: String,
) -> Result<Action, Error> {
    match scope.ctx.transfer.abort(handle).await? {
        AbortOutcome::Aborted => finalize_failure(scope, Some(vmi), reason, None).await,
        AbortOutcome::AlreadyCompleted => {
            info!(%reason, "transfer completed before the abort");
            finalize_success(scope, vmi).await
        }
    }
}

// =============================================================================
// Finalization
// =============================================================================

/// Record success on the VMI, clean up and mark the migration Succeeded
pub(super) async fn finalize_success(
    scope: &Scope<'_>,
    vmi: &VirtualMachineInstance,
) -> Result<Action, Error> {
    let ctx = scope.ctx;
    let source = scope.source_node(Some(vmi));
    let mut state = vmi
        .migration_state_for(&scope.uid)
        .cloned()
        .unwrap_or_else(|| MigrationState::admitted(&scope.uid, &source));

    if state.completed && state.failed {
        return finalize_failure(scope, Some(vmi), "migration failed".to_string(), None).await;
    }
    let Some(target) = state.target_node.clone() else {
        return finalize_failure(
            scope,
            Some(vmi),
            "transfer completed without a recorded target".to_string(),
            None,
        )
        .await;
    };

    if !state.completed {
        state.completed = true;
        state.failed = false;
        state.end_timestamp = Some(Utc::now());
        scope
            .write_vmi(&VmiStatusPatch::state(state).with_node(&target))
            .await?;
    }

    // The guest left the source; its pods there are done
    for pod in ctx
        .client
        .list_vmi_pods(&scope.namespace, &vmi.uid_or_empty())
        .await?
    {
        let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
        if node == Some(source.as_str()) {
            ctx.client
                .delete_pod(&scope.namespace, &pod.name_any())
                .await?;
        }
    }
    ctx.client
        .delete_secret(&scope.namespace, &session_secret_name(&scope.name))
        .await?;

    let mut status = scope.status();
    status.phase = MigrationPhase::Succeeded;
    status.target_node = Some(target.clone());
    status.message = None;
    scope.write_status(&status).await?;

    info!(from = %source, to = %target, "migration succeeded");
    scope
        .event(
            EventType::Normal,
            reasons::MIGRATION_SUCCEEDED,
            actions::MIGRATE,
            format!("VMI {} moved from {source} to {target}", scope.vmi_name()),
        )
        .await;

    ctx.client
        .remove_migration_finalizer(&scope.namespace, &scope.name)
        .await?;
    Ok(Action::await_change())
}

/// Record failure on the VMI, tear down the target and mark the migration Failed
///
/// `abort` carries the abort bookkeeping of a cancellation. The guest keeps
/// running on the source either way.
pub(super) async fn finalize_failure(
    scope: &Scope<'_>,
    vmi: Option<&VirtualMachineInstance>,
    reason: String,
    abort: Option<MigrationAbortStatus>,
) -> Result<Action, Error> {
    let ctx = scope.ctx;

    if let Some(vmi) = vmi {
        match vmi.migration_state_for(&scope.uid) {
            Some(state) if state.completed && !state.failed => {
                return Box::pin(finalize_success(scope, vmi)).await;
            }
            Some(state) if state.completed => {}
            existing => {
                let mut state = existing.cloned().unwrap_or_else(|| {
                    MigrationState::admitted(&scope.uid, scope.source_node(Some(vmi)))
                });
                state.completed = true;
                state.failed = true;
                state.end_timestamp = Some(Utc::now());
                if let Some(abort) = abort {
                    state.abort_requested = true;
                    state.abort_status = abort;
                }
                scope.write_vmi(&VmiStatusPatch::state(state)).await?;
            }
        }
    }

    let status = scope.status();
    if let Some(pod) = &status.target_pod {
        ctx.client.delete_pod(&scope.namespace, pod).await?;
    }
    ctx.client
        .delete_secret(&scope.namespace, &session_secret_name(&scope.name))
        .await?;

    scope
        .write_status(&status.phase(MigrationPhase::Failed).message(reason.clone()))
        .await?;

    let (reason_code, note) = match abort {
        Some(MigrationAbortStatus::Succeeded) => (
            reasons::MIGRATION_ABORTED,
            format!("Migration cancelled: {reason}"),
        ),
        Some(_) => (
            reasons::MIGRATION_ABORTED,
            format!("Migration cancelled, teardown unconfirmed: {reason}"),
        ),
        None => (reasons::MIGRATION_FAILED, format!("Migration failed: {reason}")),
    };
    warn!(%reason, "migration failed");
    scope
        .event(EventType::Warning, reason_code, actions::MIGRATE, note)
        .await;

    ctx.client
        .remove_migration_finalizer(&scope.namespace, &scope.name)
        .await?;
    Ok(Action::await_change())
}

/// Drop leftovers of a terminal migration that still holds its finalizer
pub(super) async fn release(scope: &Scope<'_>) -> Result<(), Error> {
    if !scope.migration.has_finalizer() {
        return Ok(());
    }
    let ctx = scope.ctx;
    let status = scope.status();
    if status.phase == MigrationPhase::Failed {
        if let Some(pod) = &status.target_pod {
            ctx.client.delete_pod(&scope.namespace, pod).await?;
        }
    }
    ctx.client
        .delete_secret(&scope.namespace, &session_secret_name(&scope.name))
        .await?;
    ctx.client
        .remove_migration_finalizer(&scope.namespace, &scope.name)
        .await
}
