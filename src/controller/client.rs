//! Kubernetes access for the migration controllers
//!
//! Reconcilers only talk to the API server through [`MigrationClient`], so
//! tests can drive whole migrations against an in-memory cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    Conditions, MigrationState, VirtualMachineInstance, VirtualMachineInstanceMigration,
    VirtualMachineInstanceMigrationStatus, MIGRATION_FINALIZER,
};
use crate::eviction::CREATED_BY_LABEL;
use crate::Error;

/// Field manager for every write the controller makes
pub const FIELD_MANAGER: &str = "ferry-controller";

/// The parts of a VMI status the controllers write
///
/// Absent fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmiStatusPatch {
    /// Node the guest now runs on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Full condition map
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
    /// Migration record, replacing any previous one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<MigrationState>,
}

impl VmiStatusPatch {
    /// Patch writing only the migration record
    pub fn state(state: MigrationState) -> Self {
        Self {
            migration_state: Some(state),
            ..Default::default()
        }
    }

    /// Patch writing only the conditions
    pub fn conditions(conditions: Conditions) -> Self {
        Self {
            conditions: Some(conditions),
            ..Default::default()
        }
    }

    /// Also move the guest to `node`
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node_name = Some(node.into());
        self
    }
}

/// API operations needed by the VMI and migration controllers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MigrationClient: Send + Sync {
    /// Fetch a VMI, None if it does not exist
    async fn get_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineInstance>, Error>;

    /// Merge `patch` into the VMI status
    async fn patch_vmi_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &VmiStatusPatch,
    ) -> Result<(), Error>;

    /// List migrations in every namespace
    async fn list_migrations(&self) -> Result<Vec<VirtualMachineInstanceMigration>, Error>;

    /// Create a migration
    async fn create_migration(
        &self,
        namespace: &str,
        migration: &VirtualMachineInstanceMigration,
    ) -> Result<(), Error>;

    /// Replace the migration status
    async fn patch_migration_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualMachineInstanceMigrationStatus,
    ) -> Result<(), Error>;

    /// Add the protection finalizer and, if given, an owner reference
    async fn add_migration_finalizer(
        &self,
        namespace: &str,
        name: &str,
        owner: Option<OwnerReference>,
    ) -> Result<(), Error>;

    /// Remove the protection finalizer; a missing migration is not an error
    async fn remove_migration_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch a pod, None if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Pods created for the VMI with UID `vmi_uid`
    async fn list_vmi_pods(&self, namespace: &str, vmi_uid: &str) -> Result<Vec<Pod>, Error>;

    /// Create a pod; an existing pod with the same name is not an error
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;

    /// Delete a pod; a missing pod is not an error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch a node, None if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Create or update a disruption budget
    async fn apply_disruption_budget(
        &self,
        namespace: &str,
        budget: &PodDisruptionBudget,
    ) -> Result<(), Error>;

    /// Delete a disruption budget; a missing budget is not an error
    async fn delete_disruption_budget(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create or update a Secret
    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Fetch a Secret, None if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Delete a Secret; a missing Secret is not an error
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`MigrationClient`] backed by the API server
pub struct KubeMigrationClient {
    client: Client,
}

impl KubeMigrationClient {
    /// Create a new KubeMigrationClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn vmis(&self, namespace: &str) -> Api<VirtualMachineInstance> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn migrations(&self, namespace: &str) -> Api<VirtualMachineInstanceMigration> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Treat a 404 as success
fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Merge body that also clears optional status fields set to None
fn migration_status_body(status: &VirtualMachineInstanceMigrationStatus) -> Result<Value, Error> {
    let mut value = serde_json::to_value(status)?;
    if let Some(fields) = value.as_object_mut() {
        for key in ["message", "targetNode", "targetPod", "progress"] {
            fields.entry(key).or_insert(Value::Null);
        }
    }
    Ok(json!({ "status": value }))
}

#[async_trait]
impl MigrationClient for KubeMigrationClient {
    async fn get_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineInstance>, Error> {
        Ok(self.vmis(namespace).get_opt(name).await?)
    }

    async fn patch_vmi_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &VmiStatusPatch,
    ) -> Result<(), Error> {
        let api = self.vmis(namespace);
        let params = PatchParams::apply(FIELD_MANAGER);

        if let Some(state) = &patch.migration_state {
            // A merge patch would keep map keys from another migration's record
            let current = api.get_status(name).await?;
            let replaces_other = current
                .status
                .and_then(|s| s.migration_state)
                .is_some_and(|m| m.migration_uid != state.migration_uid);
            if replaces_other {
                let reset = json!({ "status": { "migrationState": null } });
                api.patch_status(name, &params, &Patch::Merge(&reset))
                    .await?;
            }
        }

        let body = json!({ "status": patch });
        api.patch_status(name, &params, &Patch::Merge(&body)).await?;
        Ok(())
    }

    async fn list_migrations(&self) -> Result<Vec<VirtualMachineInstanceMigration>, Error> {
        let api: Api<VirtualMachineInstanceMigration> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_migration(
        &self,
        namespace: &str,
        migration: &VirtualMachineInstanceMigration,
    ) -> Result<(), Error> {
        self.migrations(namespace)
            .create(&PostParams::default(), migration)
            .await?;
        Ok(())
    }

    async fn patch_migration_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualMachineInstanceMigrationStatus,
    ) -> Result<(), Error> {
        let body = migration_status_body(status)?;
        self.migrations(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
            .await?;
        Ok(())
    }

    async fn add_migration_finalizer(
        &self,
        namespace: &str,
        name: &str,
        owner: Option<OwnerReference>,
    ) -> Result<(), Error> {
        let api = self.migrations(namespace);
        let current = api.get(name).await?;

        let mut finalizers = current.finalizers().to_vec();
        if !finalizers.iter().any(|f| f == MIGRATION_FINALIZER) {
            finalizers.push(MIGRATION_FINALIZER.to_string());
        }
        let mut owners = current.owner_references().to_vec();
        if let Some(owner) = owner {
            if !owners.iter().any(|o| o.uid == owner.uid) {
                owners.push(owner);
            }
        }

        // resourceVersion turns a concurrent edit into a conflict instead of a lost update
        let patch = json!({
            "metadata": {
                "resourceVersion": current.resource_version(),
                "finalizers": finalizers,
                "ownerReferences": owners,
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(migration = %name, "added migration finalizer");
        Ok(())
    }

    async fn remove_migration_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api = self.migrations(namespace);
        let Some(current) = api.get_opt(name).await? else {
            return Ok(());
        };
        if !current.has_finalizer() {
            return Ok(());
        }

        let finalizers: Vec<&String> = current
            .finalizers()
            .iter()
            .filter(|f| *f != MIGRATION_FINALIZER)
            .collect();
        let patch = json!({
            "metadata": {
                "resourceVersion": current.resource_version(),
                "finalizers": finalizers,
            }
        });
        ignore_not_found(
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await,
        )?;
        debug!(migration = %name, "removed migration finalizer");
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_vmi_pods(&self, namespace: &str, vmi_uid: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{CREATED_BY_LABEL}={vmi_uid}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), pod).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(pod = %pod.name_any(), "pod already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn apply_disruption_budget(
        &self,
        namespace: &str,
        budget: &PodDisruptionBudget,
    ) -> Result<(), Error> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &budget.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(budget),
        )
        .await?;
        Ok(())
    }

    async fn delete_disruption_budget(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &secret.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }
}
