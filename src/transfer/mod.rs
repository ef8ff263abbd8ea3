//! Transfer collaborator contract
//!
//! The hypervisor-level memory transfer is opaque to the control plane. It
//! is driven through [`TransferDriver`], which starts a transfer, reports
//! its progress and aborts it. All three calls are idempotent for a given
//! migration UID.
//!
//! The production driver talks to the per-node handler over mTLS:
//!
//! ```text
//! PUT    https://<handler-ip>:<port>/v1/migrations/<uid>   start
//! GET    https://<handler-ip>:<port>/v1/migrations/<uid>   report
//! DELETE https://<handler-ip>:<port>/v1/migrations/<uid>   abort
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::crd::MigrationPortProtocol;
use crate::transport::IssuedCert;
use crate::{Error, Result};

/// Label selecting the per-node handler pods
pub const HANDLER_SELECTOR: &str = "app=ferry-handler";

/// Default port of the handler API
pub const DEFAULT_HANDLER_PORT: u16 = 8186;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the source node needs to start pushing state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Migration UID; the idempotency key
    pub migration_uid: String,
    /// Namespace of the VMI
    pub namespace: String,
    /// Name of the VMI
    pub vmi_name: String,
    /// Node the guest runs on
    pub source_node: String,
    /// Target pod address
    pub target_address: String,
    /// Target ports and what each carries
    pub target_ports: BTreeMap<String, MigrationPortProtocol>,
    /// Transfer rate cap in bytes per second
    pub bandwidth_bytes_per_second: u64,
    /// Secret holding the session credentials
    pub credentials_secret: String,
}

impl TransferRequest {
    /// Handle identifying this transfer
    pub fn handle(&self) -> TransferHandle {
        TransferHandle {
            migration_uid: self.migration_uid.clone(),
            source_node: self.source_node.clone(),
        }
    }
}

/// Identifies a started transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferHandle {
    /// Migration UID
    pub migration_uid: String,
    /// Node whose handler drives the transfer
    pub source_node: String,
}

/// Transfer state reported by the collaborator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TransferState {
    /// Still copying
    #[serde(rename_all = "camelCase")]
    InProgress {
        /// Bytes sent so far
        data_processed_bytes: u64,
        /// Bytes the hypervisor estimates are left
        data_remaining_bytes: u64,
    },
    /// The guest runs on the target
    Completed,
    /// The transfer failed; the guest still runs on the source
    Failed {
        /// Failure reported by the hypervisor
        reason: String,
    },
}

/// Answer to an abort request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum AbortOutcome {
    /// Stopped before switchover; the guest stays on the source
    Aborted,
    /// Switchover already happened; the abort had no effect
    AlreadyCompleted,
}

/// Drives the hypervisor transfer for one migration at a time
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransferDriver: Send + Sync {
    /// Start the transfer; calling again for a started transfer is a no-op
    async fn start(&self, request: &TransferRequest) -> Result<TransferHandle>;

    /// Current state of the transfer
    async fn report(&self, handle: &TransferHandle) -> Result<TransferState>;

    /// Stop the transfer unless switchover already happened
    async fn abort(&self, handle: &TransferHandle) -> Result<AbortOutcome>;
}

/// [`TransferDriver`] backed by the node handler's HTTP API
pub struct HandlerTransferClient {
    http: reqwest::Client,
    pods: Api<Pod>,
    port: u16,
}

impl HandlerTransferClient {
    /// Client authenticating with `identity`, trusting only `ca_cert_pem`
    ///
    /// Handler pods are looked up in `namespace`.
    pub fn new(
        client: Client,
        namespace: &str,
        port: u16,
        identity: &IssuedCert,
        ca_cert_pem: &str,
    ) -> Result<Self> {
        let ca_cert = reqwest::Certificate::from_pem(ca_cert_pem.as_bytes())
            .map_err(|e| Error::transport(format!("invalid CA certificate: {e}")))?;
        let bundle = format!("{}{}", identity.cert_pem, identity.key_pem.as_str());
        let identity = reqwest::Identity::from_pem(bundle.as_bytes())
            .map_err(|e| Error::transport(format!("invalid client identity: {e}")))?;

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca_cert)
            .identity(identity)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            pods: Api::namespaced(client, namespace),
            port,
        })
    }

    async fn migration_url(&self, node: &str, migration_uid: &str) -> Result<String> {
        let lp = ListParams::default()
            .labels(HANDLER_SELECTOR)
            .fields(&format!("spec.nodeName={node}"));
        let pods = self.pods.list(&lp).await?;
        let address = handler_address(&pods.items)
            .ok_or_else(|| Error::transfer(format!("no ready transfer handler on node {node}")))?;
        Ok(migration_url(&address, self.port, migration_uid))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::transfer(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transfer(format!("handler returned {status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl TransferDriver for HandlerTransferClient {
    #[instrument(skip(self, request), fields(migration = %request.migration_uid, node = %request.source_node))]
    async fn start(&self, request: &TransferRequest) -> Result<TransferHandle> {
        let url = self
            .migration_url(&request.source_node, &request.migration_uid)
            .await?;
        self.send(self.http.put(&url).json(request)).await?;
        info!(target = %request.target_address, "transfer started");
        Ok(request.handle())
    }

    async fn report(&self, handle: &TransferHandle) -> Result<TransferState> {
        let url = self
            .migration_url(&handle.source_node, &handle.migration_uid)
            .await?;
        let state = self
            .send(self.http.get(&url))
            .await?
            .json::<TransferState>()
            .await
            .map_err(|e| Error::serialization(e.to_string()))?;
        debug!(migration = %handle.migration_uid, ?state, "transfer report");
        Ok(state)
    }

    #[instrument(skip(self, handle), fields(migration = %handle.migration_uid))]
    async fn abort(&self, handle: &TransferHandle) -> Result<AbortOutcome> {
        let url = self
            .migration_url(&handle.source_node, &handle.migration_uid)
            .await?;
        let outcome = self
            .send(self.http.delete(&url))
            .await?
            .json::<AbortOutcome>()
            .await
            .map_err(|e| Error::serialization(e.to_string()))?;
        info!(?outcome, "transfer abort answered");
        Ok(outcome)
    }
}

/// Address of the first running handler pod in `pods`
fn handler_address(pods: &[Pod]) -> Option<String> {
    pods.iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter_map(|p| p.status.as_ref())
        .filter(|s| s.phase.as_deref() == Some("Running"))
        .find_map(|s| s.pod_ip.clone())
}

fn migration_url(address: &str, port: u16, migration_uid: &str) -> String {
    let host = if address.contains(':') {
        format!("[{address}]")
    } else {
        address.to_string()
    };
    format!("https://{host}:{port}/v1/migrations/{migration_uid}")
}
