//! Validating admission webhook for ferry
//!
//! Two checks run in the API server's admission path:
//! - migration requests are refused unless the VMI exists, runs, can be
//!   migrated and has no other migration in flight
//! - evictions of pods backing a LiveMigrate VMI are refused with
//!   "too many requests" so drains go through a migration instead

pub mod eviction;
pub mod migration;

use std::sync::Arc;

use axum::{routing::post, Router};

use crate::config::ConfigHandle;
use crate::controller::MigrationClient;

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// API access for looking up VMIs, pods and migrations
    pub client: Arc<dyn MigrationClient>,
    /// Current migration configuration
    pub config: ConfigHandle,
}

impl WebhookState {
    /// Create webhook state over `client`
    pub fn new(client: Arc<dyn MigrationClient>, config: ConfigHandle) -> Self {
        Self { client, config }
    }
}

/// Error type for webhook lookups
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// A lookup against the API server failed
    #[error("lookup failed: {0}")]
    Lookup(#[from] crate::Error),
}

/// Create the webhook router with all validation endpoints
///
/// - POST /validate/migrations - VirtualMachineInstanceMigration CREATE/UPDATE
/// - POST /validate/evictions - pods/eviction CREATE
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate/migrations", post(migration::validate_handler))
        .route("/validate/evictions", post(eviction::validate_handler))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::{json, Value};

    /// AdmissionReview JSON as the API server sends it
    pub fn review(
        kind: (&str, &str, &str),
        resource: &str,
        sub_resource: Option<&str>,
        operation: &str,
        name: &str,
        object: Value,
        old_object: Value,
    ) -> Value {
        let (group, version, kind) = kind;
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": group, "version": version, "kind": kind},
                "resource": {"group": group, "version": version, "resource": resource},
                "subResource": sub_resource,
                "name": name,
                "namespace": "default",
                "operation": operation,
                "userInfo": {"username": "admin"},
                "object": object,
                "oldObject": old_object,
                "dryRun": false
            }
        })
    }
}
