//! Admission checks for VirtualMachineInstanceMigration requests

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, error, info};

use super::{WebhookError, WebhookState};
use crate::crd::{VirtualMachineInstance, VirtualMachineInstanceMigration};
use crate::migratable::check_migratable;

/// Decide whether a migration request may be stored
///
/// `vmi` is the VMI the request names and `existing` every migration in the
/// cluster. Returns the denial message on refusal.
pub fn validate_migration(
    operation: &Operation,
    migration: &VirtualMachineInstanceMigration,
    old: Option<&VirtualMachineInstanceMigration>,
    vmi: Option<&VirtualMachineInstance>,
    existing: &[VirtualMachineInstanceMigration],
    unsafe_override: bool,
) -> Result<(), String> {
    let vmi_name = &migration.spec.vmi_name;

    match operation {
        Operation::Create => {
            if vmi_name.is_empty() {
                return Err("spec.vmiName must be set".to_string());
            }
            let Some(vmi) = vmi else {
                return Err(format!("VMI {vmi_name} does not exist"));
            };
            if !vmi.is_running() {
                return Err(format!("VMI {vmi_name} is not running"));
            }
            let verdict = check_migratable(&vmi.spec, unsafe_override);
            if !verdict.migratable {
                return Err(verdict.denial_message());
            }

            let namespace = migration.namespace().unwrap_or_default();
            let name = migration.name_any();
            if let Some(other) = existing.iter().find(|m| {
                m.targets(&namespace, vmi_name)
                    && m.name_any() != name
                    && !m.phase().is_terminal()
            }) {
                return Err(format!(
                    "VMI {vmi_name} already has migration {} in phase {}",
                    other.name_any(),
                    other.phase()
                ));
            }
            Ok(())
        }
        Operation::Update => match old {
            Some(old) if old.spec.vmi_name != *vmi_name => {
                Err("spec.vmiName is immutable".to_string())
            }
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

/// Handle validating admission review for migrations
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<VirtualMachineInstanceMigration>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<VirtualMachineInstanceMigration> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = match review(&state, &req).await {
        Ok(Ok(())) => AdmissionResponse::from(&req),
        Ok(Err(message)) => {
            info!(migration = %req.name, %message, "denying migration request");
            AdmissionResponse::from(&req).deny(message)
        }
        Err(e) => {
            error!(migration = %req.name, error = %e, "failed to review migration request");
            AdmissionResponse::from(&req).deny(e.to_string())
        }
    };
    Json(response.into_review())
}

async fn review(
    state: &WebhookState,
    req: &AdmissionRequest<VirtualMachineInstanceMigration>,
) -> Result<Result<(), String>, WebhookError> {
    let Some(migration) = &req.object else {
        debug!(uid = %req.uid, "no migration object in request, allowing");
        return Ok(Ok(()));
    };

    if req.operation != Operation::Create {
        return Ok(validate_migration(
            &req.operation,
            migration,
            req.old_object.as_ref(),
            None,
            &[],
            false,
        ));
    }

    let namespace = req
        .namespace
        .clone()
        .or_else(|| migration.namespace())
        .ok_or_else(|| WebhookError::InvalidReview("request has no namespace".to_string()))?;
    let vmi = state
        .client
        .get_vmi(&namespace, &migration.spec.vmi_name)
        .await?;
    let existing = state.client.list_migrations().await?;
    let snapshot = state.config.current();

    // The object under review may not carry its namespace yet
    let mut migration = migration.clone();
    migration.metadata.namespace = Some(namespace);

    Ok(validate_migration(
        &req.operation,
        &migration,
        None,
        vmi.as_ref(),
        &existing,
        snapshot.config.unsafe_migration_override,
    ))
}
