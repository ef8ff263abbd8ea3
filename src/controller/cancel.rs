//! Cancellation of migrations deleted before reaching a terminal phase
//!
//! The finalizer keeps the object around until the VMI record says how the
//! migration ended. A transfer that finishes before the abort reaches the
//! hypervisor still counts as a success.

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{info, warn};

use super::migration::{finalize_failure, finalize_success, release, settle, Scope};
use super::{VmiStatusPatch, POLL_INTERVAL, TEARDOWN_TIMEOUT};
use crate::crd::{MigrationAbortStatus, MigrationPhase, MigrationState};
use crate::events::{actions, reasons};
use crate::transfer::AbortOutcome;
use crate::Error;

/// Handle a migration whose deletion was requested
pub(super) async fn cancel(scope: &Scope<'_>) -> Result<Action, Error> {
    if !scope.migration.has_finalizer() {
        return Ok(Action::await_change());
    }

    match scope.migration.phase() {
        MigrationPhase::Pending => {
            info!("cancelled before admission");
            scope
                .ctx
                .client
                .remove_migration_finalizer(&scope.namespace, &scope.name)
                .await?;
            Ok(Action::await_change())
        }
        MigrationPhase::Running => cancel_running(scope).await,
        phase if phase.is_terminal() => {
            release(scope).await?;
            Ok(Action::await_change())
        }
        _ => tear_down_target(scope).await,
    }
}

async fn cancel_running(scope: &Scope<'_>) -> Result<Action, Error> {
    let Some(vmi) = scope.get_vmi().await? else {
        return tear_down_target(scope).await;
    };

    match vmi.migration_state_for(&scope.uid) {
        Some(state) if state.is_completed() => return settle(scope, &vmi).await,
        Some(state) if state.abort_pending() => return tear_down_target(scope).await,
        _ => {}
    }

    let handle = scope.transfer_handle(&scope.source_node(Some(&vmi)));
    match scope.ctx.transfer.abort(&handle).await? {
        AbortOutcome::AlreadyCompleted => {
            info!("transfer completed before the cancellation reached it");
            finalize_success(scope, &vmi).await
        }
        AbortOutcome::Aborted => tear_down_target(scope).await,
    }
}

/// Record the abort request, remove the target pod and wait for it to go
async fn tear_down_target(scope: &Scope<'_>) -> Result<Action, Error> {
    let ctx = scope.ctx;
    let vmi = scope.get_vmi().await?;

    if let Some(vmi) = &vmi {
        match vmi.migration_state_for(&scope.uid) {
            Some(state) if state.is_completed() => return settle(scope, vmi).await,
            Some(state) if state.abort_pending() => {}
            existing => {
                let mut state = existing.cloned().unwrap_or_else(|| {
                    MigrationState::admitted(&scope.uid, scope.source_node(Some(vmi)))
                });
                state.abort_requested = true;
                state.abort_status = MigrationAbortStatus::Requested;
                scope.write_vmi(&VmiStatusPatch::state(state)).await?;
                scope
                    .event(
                        EventType::Normal,
                        reasons::MIGRATION_ABORTED,
                        actions::ABORT,
                        format!("Cancelling migration of VMI {}", scope.vmi_name()),
                    )
                    .await;
            }
        }
    }

    if let Some(pod_name) = scope.status().target_pod {
        if let Some(pod) = ctx.client.get_pod(&scope.namespace, &pod_name).await? {
            let Some(deleted_at) = pod.metadata.deletion_timestamp.as_ref().map(|t| t.0) else {
                ctx.client.delete_pod(&scope.namespace, &pod_name).await?;
                return Ok(Action::requeue(POLL_INTERVAL));
            };

            let waited = (Utc::now() - deleted_at).to_std().unwrap_or_default();
            if waited < TEARDOWN_TIMEOUT {
                return Ok(Action::requeue(POLL_INTERVAL));
            }
            warn!(pod = %pod_name, waited_secs = waited.as_secs(), "target pod teardown not confirmed");
            return finalize_failure(
                scope,
                vmi.as_ref(),
                format!(
                    "target pod {pod_name} still present {}s after deletion",
                    waited.as_secs()
                ),
                Some(MigrationAbortStatus::Failed),
            )
            .await;
        }
    }

    finalize_failure(
        scope,
        vmi.as_ref(),
        "cancelled by request".to_string(),
        Some(MigrationAbortStatus::Succeeded),
    )
    .await
}
