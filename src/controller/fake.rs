//! In-memory cluster and collaborators for driving the controllers in tests
//!
//! [`FakeCluster`] stands in for the API server and a very small scheduler:
//! created pods are bound to the first node their affinity and node selector
//! allow, then come up Running and Ready with an address. Finalizers are
//! honoured so deletion behaves like the real thing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::{
    Node, NodeSpec, Pod, PodCondition, PodSpec, PodStatus, Secret, Taint,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;

use super::{reconcile, reconcile_vmi, Context, MigrationClient, VmiStatusPatch};
use crate::config::{ConfigHandle, MigrationConfig};
use crate::crd::{
    EvictionStrategy, MigrationPhase, VirtualMachineInstance, VirtualMachineInstanceMigration,
    VirtualMachineInstanceMigrationSpec, VirtualMachineInstanceSpec,
    VirtualMachineInstanceStatus, VmiPhase, Volume, MIGRATION_FINALIZER,
};
use crate::eviction::{disruption_budget_name, CREATED_BY_LABEL, VMI_NAME_LABEL};
use crate::transfer::{AbortOutcome, TransferDriver, TransferHandle, TransferRequest, TransferState};
use crate::transport::{MockHandshakeProber, TransportError};
use crate::Error;

/// Namespace every fake object lives in
pub const NAMESPACE: &str = "default";

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

fn not_found(kind: &str, name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{kind} {name} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

fn conflict(kind: &str, name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{kind} {name} already exists"),
        reason: "AlreadyExists".to_string(),
        code: 409,
    }))
}

#[derive(Default)]
struct State {
    vmis: BTreeMap<String, VirtualMachineInstance>,
    migrations: BTreeMap<String, VirtualMachineInstanceMigration>,
    pods: BTreeMap<String, Pod>,
    nodes: BTreeMap<String, Node>,
    budgets: BTreeMap<String, PodDisruptionBudget>,
    secrets: BTreeMap<String, Secret>,
    next_uid: u64,
    next_ip: u8,
    vmi_writes: usize,
    fail_targets: bool,
    stall_targets: bool,
    hold_pod_deletion: bool,
    scheduling_stopped: bool,
}

impl State {
    fn uid(&mut self, prefix: &str) -> String {
        self.next_uid += 1;
        format!("{prefix}-{:04}", self.next_uid)
    }

    fn node_fits(&self, node: &Node, pod: &Pod) -> bool {
        let name = node.name_any();
        let labels = node.labels();
        let spec = pod.spec.as_ref();

        if node.spec.as_ref().is_some_and(|s| {
            s.taints
                .as_ref()
                .is_some_and(|t| t.iter().any(|t| t.effect == "NoSchedule"))
        }) {
            return false;
        }

        let excluded = spec
            .and_then(|s| s.affinity.as_ref())
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref())
            .map(|sel| {
                sel.node_selector_terms.iter().any(|term| {
                    term.match_expressions.iter().flatten().any(|req| {
                        req.key == HOSTNAME_LABEL
                            && req.operator == "NotIn"
                            && req.values.iter().flatten().any(|v| *v == name)
                    })
                })
            })
            .unwrap_or(false);
        if excluded {
            return false;
        }

        spec.and_then(|s| s.node_selector.as_ref())
            .map(|selector| selector.iter().all(|(k, v)| labels.get(k) == Some(v)))
            .unwrap_or(true)
    }

    /// Bind `pod` to a node and bring it up
    fn schedule(&mut self, pod: &mut Pod) {
        if self.scheduling_stopped {
            return;
        }
        let candidate: &Pod = pod;
        let Some(node) = self
            .nodes
            .values()
            .find(|n| self.node_fits(n, candidate))
            .map(|n| n.name_any())
        else {
            return;
        };

        if let Some(spec) = pod.spec.as_mut() {
            spec.node_name = Some(node);
        }
        if self.fail_targets {
            pod.status = Some(PodStatus {
                phase: Some("Failed".to_string()),
                reason: Some("Error".to_string()),
                ..Default::default()
            });
            return;
        }
        if self.stall_targets {
            pod.status = Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            });
            return;
        }
        self.next_ip += 1;
        pod.status = Some(running_status(Some(format!("10.0.0.{}", self.next_ip))));
    }
}

fn running_status(ip: Option<String>) -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        pod_ip: ip,
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// In-memory API server for one namespace
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    /// Cluster with schedulable nodes named `nodes`
    pub fn with_nodes(nodes: &[&str]) -> Self {
        let cluster = Self::default();
        {
            let mut state = cluster.lock();
            for name in nodes {
                state.nodes.insert(
                    name.to_string(),
                    Node {
                        metadata: ObjectMeta {
                            name: Some(name.to_string()),
                            labels: Some(BTreeMap::from([(
                                HOSTNAME_LABEL.to_string(),
                                name.to_string(),
                            )])),
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                );
            }
        }
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake cluster lock poisoned")
    }

    /// Add a running 1Gi VMI on `node` together with its launcher pod
    pub fn add_vmi(&self, name: &str, node: &str, live_migrate: bool) -> VirtualMachineInstance {
        self.add_vmi_with_volumes(name, node, live_migrate, vec![])
    }

    /// Like [`Self::add_vmi`] with the given volumes
    pub fn add_vmi_with_volumes(
        &self,
        name: &str,
        node: &str,
        live_migrate: bool,
        volumes: Vec<Volume>,
    ) -> VirtualMachineInstance {
        let mut state = self.lock();
        let uid = state.uid("vmi");

        let mut vmi = VirtualMachineInstance::new(
            name,
            VirtualMachineInstanceSpec {
                memory: "1Gi".to_string(),
                volumes,
                eviction_strategy: live_migrate.then_some(EvictionStrategy::LiveMigrate),
                node_selector: None,
            },
        );
        vmi.metadata.namespace = Some(NAMESPACE.to_string());
        vmi.metadata.uid = Some(uid.clone());
        vmi.status = Some(VirtualMachineInstanceStatus {
            phase: VmiPhase::Running,
            node_name: Some(node.to_string()),
            ..Default::default()
        });
        state.vmis.insert(name.to_string(), vmi.clone());

        let pod_name = format!("launcher-{name}");
        state.pods.insert(
            pod_name.clone(),
            Pod {
                metadata: ObjectMeta {
                    name: Some(pod_name),
                    namespace: Some(NAMESPACE.to_string()),
                    labels: Some(BTreeMap::from([
                        (CREATED_BY_LABEL.to_string(), uid),
                        (VMI_NAME_LABEL.to_string(), name.to_string()),
                    ])),
                    creation_timestamp: Some(Time(Utc::now())),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    node_name: Some(node.to_string()),
                    ..Default::default()
                }),
                status: Some(running_status(None)),
            },
        );
        vmi
    }

    /// Create a migration request for `vmi`, as a client would
    pub fn request_migration(&self, name: &str, vmi: &str) -> VirtualMachineInstanceMigration {
        let mut state = self.lock();
        let uid = state.uid("mig");
        let mut migration = VirtualMachineInstanceMigration::new(
            name,
            VirtualMachineInstanceMigrationSpec {
                vmi_name: vmi.to_string(),
            },
        );
        migration.metadata.namespace = Some(NAMESPACE.to_string());
        migration.metadata.uid = Some(uid);
        migration.metadata.creation_timestamp = Some(Time(Utc::now()));
        state.migrations.insert(name.to_string(), migration.clone());
        migration
    }

    /// Delete a migration as a client would; finalizers delay removal
    pub fn delete_migration(&self, name: &str) {
        let mut state = self.lock();
        let Some(migration) = state.migrations.get_mut(name) else {
            return;
        };
        if migration.finalizers().is_empty() {
            state.migrations.remove(name);
        } else {
            migration
                .metadata
                .deletion_timestamp
                .get_or_insert(Time(Utc::now()));
        }
    }

    /// Force a migration into `phase`, sourcing it from the VMI's node
    pub fn set_migration_phase(&self, name: &str, phase: MigrationPhase) {
        let mut state = self.lock();
        let source = state
            .migrations
            .get(name)
            .and_then(|m| state.vmis.get(&m.spec.vmi_name))
            .and_then(|v| v.node_name().map(str::to_string));
        if let Some(migration) = state.migrations.get_mut(name) {
            let status = migration.status.get_or_insert_with(Default::default);
            status.phase = phase;
            status.source_node = source;
        }
    }

    /// Taint `node` for draining
    pub fn drain(&self, node: &str) {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(node) {
            node.spec
                .get_or_insert_with(NodeSpec::default)
                .taints
                .get_or_insert_with(Vec::new)
                .push(Taint {
                    key: super::DRAIN_TAINT_KEY.to_string(),
                    effect: "NoSchedule".to_string(),
                    ..Default::default()
                });
        }
    }

    /// Target pods created from now on fail right after scheduling
    pub fn fail_targets(&self, fail: bool) {
        self.lock().fail_targets = fail;
    }

    /// Pods scheduled from now on bind to a node but never become ready
    pub fn stall_targets(&self, stall: bool) {
        self.lock().stall_targets = stall;
    }

    /// Pod deletions from now on never complete
    pub fn hold_pod_deletion(&self, hold: bool) {
        self.lock().hold_pod_deletion = hold;
    }

    /// Pods created from now on stay unscheduled
    pub fn stop_scheduling(&self, stopped: bool) {
        self.lock().scheduling_stopped = stopped;
    }

    /// Move the stored progress timestamp of `migration` into the past
    pub fn backdate_progress(&self, migration: &str, secs: i64) {
        let mut state = self.lock();
        if let Some(progress) = state
            .migrations
            .get_mut(migration)
            .and_then(|m| m.status.as_mut())
            .and_then(|s| s.progress.as_mut())
        {
            progress.last_progress_timestamp -= Duration::seconds(secs);
        }
    }

    /// Move the transfer start recorded on `vmi` into the past
    pub fn backdate_transfer_start(&self, vmi: &str, secs: i64) {
        let mut state = self.lock();
        if let Some(start) = state
            .vmis
            .get_mut(vmi)
            .and_then(|v| v.status.as_mut())
            .and_then(|s| s.migration_state.as_mut())
            .and_then(|m| m.start_timestamp.as_mut())
        {
            *start -= Duration::seconds(secs);
        }
    }

    /// Move the end recorded on `vmi`'s migration record into the past
    pub fn backdate_migration_end(&self, vmi: &str, secs: i64) {
        let mut state = self.lock();
        if let Some(end) = state
            .vmis
            .get_mut(vmi)
            .and_then(|v| v.status.as_mut())
            .and_then(|s| s.migration_state.as_mut())
            .and_then(|m| m.end_timestamp.as_mut())
        {
            *end -= Duration::seconds(secs);
        }
    }

    /// Move the deletion timestamp of `pod` into the past
    pub fn backdate_pod_deletion(&self, pod: &str, secs: i64) {
        let mut state = self.lock();
        if let Some(ts) = state
            .pods
            .get_mut(pod)
            .and_then(|p| p.metadata.deletion_timestamp.as_mut())
        {
            ts.0 -= Duration::seconds(secs);
        }
    }

    /// Move the creation timestamp of `pod` into the past
    pub fn backdate_pod_creation(&self, pod: &str, secs: i64) {
        let mut state = self.lock();
        if let Some(ts) = state
            .pods
            .get_mut(pod)
            .and_then(|p| p.metadata.creation_timestamp.as_mut())
        {
            ts.0 -= Duration::seconds(secs);
        }
    }

    pub fn vmi(&self, name: &str) -> Option<VirtualMachineInstance> {
        self.lock().vmis.get(name).cloned()
    }

    pub fn vmis(&self) -> Vec<VirtualMachineInstance> {
        self.lock().vmis.values().cloned().collect()
    }

    pub fn migration(&self, name: &str) -> Option<VirtualMachineInstanceMigration> {
        self.lock().migrations.get(name).cloned()
    }

    pub fn migrations(&self) -> Vec<VirtualMachineInstanceMigration> {
        self.lock().migrations.values().cloned().collect()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.lock().pods.get(name).cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.lock().pods.values().cloned().collect()
    }

    pub fn budget(&self, vmi: &str) -> Option<PodDisruptionBudget> {
        self.lock().budgets.get(&disruption_budget_name(vmi)).cloned()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.lock().secrets.get(name).cloned()
    }

    /// Number of VMI status writes so far
    pub fn vmi_writes(&self) -> usize {
        self.lock().vmi_writes
    }
}

#[async_trait]
impl MigrationClient for FakeCluster {
    async fn get_vmi(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineInstance>, Error> {
        Ok(self.vmi(name))
    }

    async fn patch_vmi_status(
        &self,
        _namespace: &str,
        name: &str,
        patch: &VmiStatusPatch,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let vmi = state
            .vmis
            .get_mut(name)
            .ok_or_else(|| not_found("VirtualMachineInstance", name))?;
        let status = vmi.status.get_or_insert_with(Default::default);
        if let Some(node) = &patch.node_name {
            status.node_name = Some(node.clone());
        }
        if let Some(conditions) = &patch.conditions {
            status.conditions = conditions.clone();
        }
        if let Some(migration_state) = &patch.migration_state {
            status.migration_state = Some(migration_state.clone());
        }
        state.vmi_writes += 1;
        Ok(())
    }

    async fn list_migrations(&self) -> Result<Vec<VirtualMachineInstanceMigration>, Error> {
        Ok(self.migrations())
    }

    async fn create_migration(
        &self,
        _namespace: &str,
        migration: &VirtualMachineInstanceMigration,
    ) -> Result<(), Error> {
        let name = migration.name_any();
        let mut state = self.lock();
        if state.migrations.contains_key(&name) {
            return Err(conflict("VirtualMachineInstanceMigration", &name));
        }
        let mut migration = migration.clone();
        migration.metadata.uid = Some(state.uid("mig"));
        migration.metadata.creation_timestamp = Some(Time(Utc::now()));
        state.migrations.insert(name, migration);
        Ok(())
    }

    async fn patch_migration_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &crate::crd::VirtualMachineInstanceMigrationStatus,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let migration = state
            .migrations
            .get_mut(name)
            .ok_or_else(|| not_found("VirtualMachineInstanceMigration", name))?;
        migration.status = Some(status.clone());
        Ok(())
    }

    async fn add_migration_finalizer(
        &self,
        _namespace: &str,
        name: &str,
        owner: Option<OwnerReference>,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let migration = state
            .migrations
            .get_mut(name)
            .ok_or_else(|| not_found("VirtualMachineInstanceMigration", name))?;
        if !migration.finalizers().iter().any(|f| f == MIGRATION_FINALIZER) {
            migration.finalizers_mut().push(MIGRATION_FINALIZER.to_string());
        }
        if let Some(owner) = owner {
            migration.metadata.owner_references = Some(vec![owner]);
        }
        Ok(())
    }

    async fn remove_migration_finalizer(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        let Some(migration) = state.migrations.get_mut(name) else {
            return Ok(());
        };
        migration.finalizers_mut().retain(|f| f != MIGRATION_FINALIZER);
        if migration.metadata.deletion_timestamp.is_some() && migration.finalizers().is_empty() {
            state.migrations.remove(name);
        }
        Ok(())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pod(name))
    }

    async fn list_vmi_pods(&self, _namespace: &str, vmi_uid: &str) -> Result<Vec<Pod>, Error> {
        Ok(self
            .pods()
            .into_iter()
            .filter(|p| p.labels().get(CREATED_BY_LABEL).map(String::as_str) == Some(vmi_uid))
            .collect())
    }

    async fn create_pod(&self, _namespace: &str, pod: &Pod) -> Result<(), Error> {
        let name = pod.name_any();
        let mut state = self.lock();
        if state.pods.contains_key(&name) {
            return Ok(());
        }
        let mut pod = pod.clone();
        pod.metadata.uid = Some(state.uid("pod"));
        pod.metadata.creation_timestamp = Some(Time(Utc::now()));
        pod.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        state.schedule(&mut pod);
        state.pods.insert(name, pod);
        Ok(())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if state.hold_pod_deletion {
            if let Some(pod) = state.pods.get_mut(name) {
                pod.metadata
                    .deletion_timestamp
                    .get_or_insert(Time(Utc::now()));
            }
        } else {
            state.pods.remove(name);
        }
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        Ok(self.lock().nodes.get(name).cloned())
    }

    async fn apply_disruption_budget(
        &self,
        _namespace: &str,
        budget: &PodDisruptionBudget,
    ) -> Result<(), Error> {
        self.lock().budgets.insert(budget.name_any(), budget.clone());
        Ok(())
    }

    async fn delete_disruption_budget(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.lock().budgets.remove(name);
        Ok(())
    }

    async fn apply_secret(&self, _namespace: &str, secret: &Secret) -> Result<(), Error> {
        self.lock().secrets.insert(secret.name_any(), secret.clone());
        Ok(())
    }

    async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.secret(name))
    }

    async fn delete_secret(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.lock().secrets.remove(name);
        Ok(())
    }
}

// =============================================================================
// Transfer collaborator
// =============================================================================

#[derive(Clone, Debug)]
enum TransferMode {
    CompleteAfter(u32),
    Stall,
    Fail(String),
}

#[derive(Clone, Debug, Default)]
struct Session {
    reports: u32,
    completed: bool,
    aborted: bool,
}

/// Scripted hypervisor transfer
pub struct FakeTransfer {
    mode: TransferMode,
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl FakeTransfer {
    fn with_mode(mode: TransferMode) -> Self {
        Self {
            mode,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reports progress `reports` times, then completion
    pub fn completing_after(reports: u32) -> Self {
        Self::with_mode(TransferMode::CompleteAfter(reports))
    }

    /// Reports the same counters forever
    pub fn stalling() -> Self {
        Self::with_mode(TransferMode::Stall)
    }

    /// Reports failure on the first poll
    pub fn failing(reason: &str) -> Self {
        Self::with_mode(TransferMode::Fail(reason.to_string()))
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<String, Session>> {
        self.sessions.lock().expect("fake transfer lock poisoned")
    }

    /// Switch over `migration_uid` right now, before any abort lands
    pub fn finish(&self, migration_uid: &str) {
        self.sessions()
            .entry(migration_uid.to_string())
            .or_default()
            .completed = true;
    }

    pub fn started(&self, migration_uid: &str) -> bool {
        self.sessions().contains_key(migration_uid)
    }

    pub fn aborted(&self, migration_uid: &str) -> bool {
        self.sessions()
            .get(migration_uid)
            .is_some_and(|s| s.aborted)
    }
}

#[async_trait]
impl TransferDriver for FakeTransfer {
    async fn start(&self, request: &TransferRequest) -> crate::Result<TransferHandle> {
        self.sessions()
            .entry(request.migration_uid.clone())
            .or_default();
        Ok(request.handle())
    }

    async fn report(&self, handle: &TransferHandle) -> crate::Result<TransferState> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(&handle.migration_uid)
            .ok_or_else(|| Error::transfer("unknown migration"))?;

        if session.aborted {
            return Ok(TransferState::Failed {
                reason: "aborted".to_string(),
            });
        }
        if session.completed {
            return Ok(TransferState::Completed);
        }
        match &self.mode {
            TransferMode::Fail(reason) => Ok(TransferState::Failed {
                reason: reason.clone(),
            }),
            TransferMode::Stall => Ok(TransferState::InProgress {
                data_processed_bytes: 100,
                data_remaining_bytes: 900,
            }),
            TransferMode::CompleteAfter(n) => {
                session.reports += 1;
                if session.reports > *n {
                    session.completed = true;
                    return Ok(TransferState::Completed);
                }
                let processed = u64::from(session.reports) * 100;
                Ok(TransferState::InProgress {
                    data_processed_bytes: processed,
                    data_remaining_bytes: 1000u64.saturating_sub(processed),
                })
            }
        }
    }

    async fn abort(&self, handle: &TransferHandle) -> crate::Result<AbortOutcome> {
        let mut sessions = self.sessions();
        let session = sessions.entry(handle.migration_uid.clone()).or_default();
        if session.completed {
            return Ok(AbortOutcome::AlreadyCompleted);
        }
        session.aborted = true;
        Ok(AbortOutcome::Aborted)
    }
}

/// Prober that accepts every target
pub fn accepting_prober() -> MockHandshakeProber {
    let mut prober = MockHandshakeProber::new();
    prober.expect_probe().returning(|_, _| Ok(()));
    prober
}

/// Prober that fails every handshake
pub fn refusing_prober() -> MockHandshakeProber {
    let mut prober = MockHandshakeProber::new();
    prober.expect_probe().returning(|endpoint, _| {
        Err(TransportError::Handshake {
            endpoint: endpoint.address.to_string(),
            reason: "connection refused".to_string(),
        })
    });
    prober
}

// =============================================================================
// Harness
// =============================================================================

/// Both controllers wired to a [`FakeCluster`]
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub transfer: Arc<FakeTransfer>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new(
        cluster: FakeCluster,
        transfer: FakeTransfer,
        prober: MockHandshakeProber,
        config: MigrationConfig,
    ) -> Self {
        let cluster = Arc::new(cluster);
        let transfer = Arc::new(transfer);
        let ctx = Arc::new(Context::for_testing(
            cluster.clone(),
            transfer.clone(),
            Arc::new(prober),
            ConfigHandle::fixed(config),
        ));
        Self {
            cluster,
            transfer,
            ctx,
        }
    }

    /// Two nodes, a completing transfer and an accepting prober
    pub fn two_nodes() -> Self {
        Self::new(
            FakeCluster::with_nodes(&["node-a", "node-b"]),
            FakeTransfer::completing_after(2),
            accepting_prober(),
            MigrationConfig::default(),
        )
    }

    /// Reconcile `name` once
    pub async fn reconcile(&self, name: &str) -> Result<Action, Error> {
        let migration = self
            .cluster
            .migration(name)
            .ok_or_else(|| not_found("VirtualMachineInstanceMigration", name))?;
        reconcile(Arc::new(migration), self.ctx.clone()).await
    }

    /// Reconcile every migration, then every VMI, once
    pub async fn step(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        for migration in self.cluster.migrations() {
            if let Err(e) = reconcile(Arc::new(migration), self.ctx.clone()).await {
                errors.push(e);
            }
        }
        for vmi in self.cluster.vmis() {
            if let Err(e) = reconcile_vmi(Arc::new(vmi), self.ctx.clone()).await {
                errors.push(e);
            }
        }
        errors
    }

    /// Step until `done` holds, at most `max_steps` times
    pub async fn run_until(&self, max_steps: usize, done: impl Fn(&FakeCluster) -> bool) -> bool {
        for _ in 0..max_steps {
            if done(&self.cluster) {
                return true;
            }
            let errors = self.step().await;
            assert!(errors.is_empty(), "reconcile errors: {errors:?}");
        }
        done(&self.cluster)
    }

    /// Step until migration `name` is terminal or gone
    pub async fn settle(&self, name: &str) -> Option<VirtualMachineInstanceMigration> {
        let finished = |c: &FakeCluster| {
            c.migration(name)
                .map(|m| m.phase().is_terminal() && !m.has_finalizer())
                .unwrap_or(true)
        };
        assert!(
            self.run_until(40, finished).await,
            "migration {name} did not settle"
        );
        self.cluster.migration(name)
    }
}
