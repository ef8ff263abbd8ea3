//! Admission checks for pod evictions
//!
//! A drain evicts every pod on the node. Pods backing a LiveMigrate VMI must
//! not go that way: the eviction is refused with 429 so the drain keeps
//! retrying while the VMI controller migrates the guest off the node.

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, error, info};

use super::{WebhookError, WebhookState};
use crate::controller::MigrationClient;
use crate::crd::VirtualMachineInstance;
use crate::eviction::{evaluate_eviction, EvictionDecision, CREATED_BY_LABEL, VMI_NAME_LABEL};

const TOO_MANY_REQUESTS: u16 = 429;

/// Name of the VMI that `pod` was created for, if any
///
/// The owner reference wins over the name label.
pub fn owning_vmi_name(pod: &Pod) -> Option<String> {
    pod.owner_references()
        .iter()
        .find(|r| r.kind == "VirtualMachineInstance")
        .map(|r| r.name.clone())
        .or_else(|| pod.labels().get(VMI_NAME_LABEL).cloned())
}

/// Decide on an eviction of pod `name` in `namespace`
pub async fn review_eviction(
    client: &dyn MigrationClient,
    namespace: &str,
    name: &str,
) -> Result<EvictionDecision, WebhookError> {
    let Some(pod) = client.get_pod(namespace, name).await? else {
        return Ok(EvictionDecision::Allow);
    };
    let Some(vmi_name) = owning_vmi_name(&pod) else {
        return Ok(EvictionDecision::Allow);
    };
    let Some(vmi) = client.get_vmi(namespace, &vmi_name).await? else {
        return Ok(EvictionDecision::Allow);
    };
    if !created_for(&pod, &vmi) {
        debug!(pod = %name, vmi = %vmi_name, "pod does not belong to this VMI incarnation");
        return Ok(EvictionDecision::Allow);
    }

    let migrations = client.list_migrations().await?;
    let active = migrations
        .iter()
        .find(|m| m.targets(namespace, &vmi_name) && !m.phase().is_terminal());

    Ok(evaluate_eviction(&pod, &vmi, active))
}

fn created_for(pod: &Pod, vmi: &VirtualMachineInstance) -> bool {
    vmi.uid().is_some_and(|uid| pod.labels().get(CREATED_BY_LABEL) == Some(&uid))
}

/// Handle validating admission review for pods/eviction
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(respond(&state, &req).await.into_review())
}

async fn respond(state: &WebhookState, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    if req.operation != Operation::Create || req.sub_resource.as_deref() != Some("eviction") {
        return AdmissionResponse::from(req);
    }
    let Some(namespace) = req.namespace.as_deref() else {
        return AdmissionResponse::from(req);
    };

    match review_eviction(state.client.as_ref(), namespace, &req.name).await {
        Ok(EvictionDecision::Allow) => AdmissionResponse::from(req),
        Ok(EvictionDecision::Deny(message)) => {
            info!(pod = %req.name, %message, "refusing eviction");
            let mut response = AdmissionResponse::from(req).deny(message);
            response.result.code = TOO_MANY_REQUESTS;
            response.result.reason = "TooManyRequests".to_string();
            response
        }
        Err(e) => {
            error!(pod = %req.name, error = %e, "failed to review eviction");
            AdmissionResponse::from(req).deny(e.to_string())
        }
    }
}
