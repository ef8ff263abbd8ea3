//! Controllers for ferry resources
//!
//! Two controllers share one [`Context`]:
//!
//! - the migration controller drives a `VirtualMachineInstanceMigration`
//!   from Pending to a terminal phase ([`migration`])
//! - the VMI controller publishes conditions, keeps the disruption budget in
//!   shape and starts evacuations from drained nodes ([`vmi`])
//!
//! Both are level-triggered: each reconcile re-reads the objects it needs,
//! and running it twice against unchanged state writes nothing.

mod cancel;
mod client;
mod migration;
mod target;
mod vmi;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

pub use client::{KubeMigrationClient, MigrationClient, VmiStatusPatch, FIELD_MANAGER};
pub use migration::{error_policy, reconcile};
pub use target::{
    build_target_pod, target_pod_name, target_pod_state, target_ports, TargetPodState,
    BLOCK_PORT, MEMORY_PORT, MIGRATION_LABEL,
};
pub use vmi::{error_policy as vmi_error_policy, reconcile as reconcile_vmi, DRAIN_TAINT_KEY};

#[cfg(test)]
pub use client::MockMigrationClient;

use crate::config::ConfigHandle;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::limiter::AdmissionGate;
use crate::transfer::{HandlerTransferClient, TransferDriver, DEFAULT_HANDLER_PORT};
use crate::transport::{HandshakeProber, MigrationCa, TlsHandshakeProber};
use crate::Error;

/// How often a Pending migration re-checks admission
pub const PENDING_REQUEUE: Duration = Duration::from_secs(5);

/// How often an active migration is polled
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Target pods created before the migration fails
pub const MAX_TARGET_ATTEMPTS: u32 = 3;

/// Failed handshake rounds before the migration fails
pub const MAX_HANDSHAKE_ROUNDS: u32 = 5;

/// How long a cancelled migration waits for its target pod to go away
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a target pod may stay unscheduled
pub const TARGET_SCHEDULING_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a scheduled target pod may take to become ready, counted from creation
pub const TARGET_READY_TIMEOUT: Duration = Duration::from_secs(600);

/// Name the controllers report events and writes under
pub const CONTROLLER_NAME: &str = "ferry-controller";

const DEFAULT_TARGET_IMAGE: &str = "ghcr.io/ferry-dev/ferry-target:latest";

/// Shared state for both controllers
///
/// Create with [`Context::builder`]:
///
/// ```ignore
/// let ctx = Context::builder(client, ca, config)
///     .namespace("ferry-system")
///     .target_image("ghcr.io/ferry-dev/ferry-target:v0.1.0")
///     .build()?;
/// ```
pub struct Context {
    /// API server access (trait object for testability)
    pub client: Arc<dyn MigrationClient>,
    /// Hypervisor transfer collaborator
    pub transfer: Arc<dyn TransferDriver>,
    /// Handshake checks against target pods
    pub prober: Arc<dyn HandshakeProber>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Hot-reloaded migration configuration
    pub config: ConfigHandle,
    /// CA issuing per-migration session certificates
    pub ca: Arc<MigrationCa>,
    /// Serializes admission decisions
    pub admission: AdmissionGate,
    /// Image run by target pods
    pub target_image: String,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, ca: Arc<MigrationCa>, config: ConfigHandle) -> ContextBuilder {
        ContextBuilder::new(client, ca, config)
    }

    /// Create a context for testing with custom collaborators
    ///
    /// Events are dropped and a fresh CA is generated.
    #[cfg(test)]
    pub fn for_testing(
        client: Arc<dyn MigrationClient>,
        transfer: Arc<dyn TransferDriver>,
        prober: Arc<dyn HandshakeProber>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            client,
            transfer,
            prober,
            events: Arc::new(crate::events::NoopEventPublisher),
            config,
            ca: Arc::new(MigrationCa::new("ferry test CA").expect("test CA")),
            admission: AdmissionGate::new(),
            target_image: "ferry-target:test".to_string(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    ca: Arc<MigrationCa>,
    config: ConfigHandle,
    namespace: String,
    handler_port: u16,
    target_image: String,
    migration_client: Option<Arc<dyn MigrationClient>>,
    transfer: Option<Arc<dyn TransferDriver>>,
    prober: Option<Arc<dyn HandshakeProber>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, ca: Arc<MigrationCa>, config: ConfigHandle) -> Self {
        Self {
            client,
            ca,
            config,
            namespace: "ferry-system".to_string(),
            handler_port: DEFAULT_HANDLER_PORT,
            target_image: DEFAULT_TARGET_IMAGE.to_string(),
            migration_client: None,
            transfer: None,
            prober: None,
            events: None,
        }
    }

    /// Namespace the transfer handlers run in
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Port of the transfer handler API
    pub fn handler_port(mut self, port: u16) -> Self {
        self.handler_port = port;
        self
    }

    /// Image run by target pods
    pub fn target_image(mut self, image: impl Into<String>) -> Self {
        self.target_image = image.into();
        self
    }

    /// Override the API client
    pub fn migration_client(mut self, client: Arc<dyn MigrationClient>) -> Self {
        self.migration_client = Some(client);
        self
    }

    /// Override the transfer driver
    pub fn transfer_driver(mut self, transfer: Arc<dyn TransferDriver>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Override the handshake prober
    pub fn prober(mut self, prober: Arc<dyn HandshakeProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    ///
    /// Fails if the controller's client certificate for the transfer
    /// handlers cannot be issued.
    pub fn build(self) -> Result<Context, Error> {
        let transfer = match self.transfer {
            Some(transfer) => transfer,
            None => {
                let identity = self.ca.issue_client_cert(CONTROLLER_NAME)?;
                Arc::new(HandlerTransferClient::new(
                    self.client.clone(),
                    &self.namespace,
                    self.handler_port,
                    &identity,
                    self.ca.ca_cert_pem(),
                )?)
            }
        };

        Ok(Context {
            client: self
                .migration_client
                .unwrap_or_else(|| Arc::new(KubeMigrationClient::new(self.client.clone()))),
            transfer,
            prober: self
                .prober
                .unwrap_or_else(|| Arc::new(TlsHandshakeProber::default())),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            config: self.config,
            ca: self.ca,
            admission: AdmissionGate::new(),
            target_image: self.target_image,
        })
    }
}
