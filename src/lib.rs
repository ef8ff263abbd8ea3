//! Ferry - live-migration control plane for virtual machine instances on Kubernetes
//!
//! Ferry moves a running guest from one node to another without stopping it.
//! A client (or a node drain) creates a `VirtualMachineInstanceMigration`;
//! the operator admits it, starts a target pod, proves the secured data
//! channel works, hands the transfer to the node handler and records the
//! outcome on the VMI.
//!
//! # Architecture
//!
//! - Admission is gated twice: synchronously by the validating webhook and
//!   again by the controller under an in-process mutex, which also applies
//!   the per-node and cluster-wide concurrency caps
//! - The VMI's `status.migrationState` is the record of truth; the
//!   migration's own phase follows it
//! - Deleting a migration is the durable cancellation request, held open by
//!   a finalizer until the target is torn down
//! - A guest is never stopped because its migration failed
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (VirtualMachineInstance, VirtualMachineInstanceMigration)
//! - [`config`] - Hot-reloaded migration configuration
//! - [`controller`] - Migration and VMI reconcilers
//! - [`migratable`] - Volume and access mode checks
//! - [`limiter`] - Per-node and cluster-wide concurrency caps
//! - [`eviction`] - Disruption budgets and eviction decisions
//! - [`monitor`] - Stall and completion-timeout detection
//! - [`transport`] - Migration CA and session certificate checks
//! - [`transfer`] - Contract with the node-side transfer handler
//! - [`webhook`] - Validating admission webhooks
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Exponential backoff helpers
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod eviction;
pub mod limiter;
pub mod migratable;
pub mod monitor;
pub mod retry;
pub mod telemetry;
pub mod transfer;
pub mod transport;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace the operator runs in unless told otherwise
pub const DEFAULT_NAMESPACE: &str = "ferry-system";

/// Port the admission webhook listens on
///
/// The webhook Service maps 443 onto it.
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Name of the Service fronting the webhook
pub const DEFAULT_WEBHOOK_SERVICE: &str = "ferry-webhook";

/// Secret holding the migration CA
pub const CA_SECRET_NAME: &str = "ferry-migration-ca";
