//! VirtualMachineInstance controller
//!
//! Keeps the per-VMI view consistent with the migrations that target it:
//! the `IsMigratable` and `Migrating` conditions, the disruption budget
//! guarding the VMI's pods, and evacuation of guests off drained nodes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{Context, VmiStatusPatch};
use crate::crd::{
    Condition, ConditionKind, ConditionStatus, MigrationPhase, VirtualMachineInstance,
    VirtualMachineInstanceMigration, VirtualMachineInstanceMigrationSpec,
};
use crate::eviction::{desired_disruption_budget, disruption_budget_name, VMI_NAME_LABEL};
use crate::events::{actions, reasons};
use crate::migratable::{check_migratable, Migratability};
use crate::retry::RetryConfig;
use crate::Error;

/// Taint marking a node whose LiveMigrate guests must leave
pub const DRAIN_TAINT_KEY: &str = "ferry.dev/drain";

/// Label on migrations created by an evacuation, holding the drained node
pub const EVACUATION_LABEL: &str = "ferry.dev/evacuation";

const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Spacing of evacuation attempts off one node, doubling per failed attempt
fn evacuation_backoff() -> RetryConfig {
    RetryConfig {
        max_attempts: 0,
        initial_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(15 * 60),
        backoff_multiplier: 2.0,
    }
}

/// Reconcile a VirtualMachineInstance
#[instrument(skip(vmi, ctx), fields(vmi = %vmi.name_any()))]
pub async fn reconcile(
    vmi: Arc<VirtualMachineInstance>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let Some(namespace) = vmi.namespace() else {
        return Ok(Action::await_change());
    };
    let name = vmi.name_any();
    let snapshot = ctx.config.current();

    let migrations: Vec<VirtualMachineInstanceMigration> = ctx
        .client
        .list_migrations()
        .await?
        .into_iter()
        .filter(|m| m.targets(&namespace, &name))
        .collect();
    let active = migrations.iter().find(|m| m.phase().holds_slot());

    let verdict = check_migratable(&vmi.spec, snapshot.config.unsafe_migration_override);
    publish_conditions(&vmi, &ctx, &namespace, &verdict, active).await?;

    match desired_disruption_budget(&vmi, active.is_some()) {
        Some(budget) => {
            ctx.client
                .apply_disruption_budget(&namespace, &budget)
                .await?
        }
        None => {
            ctx.client
                .delete_disruption_budget(&namespace, &disruption_budget_name(&name))
                .await?
        }
    }

    let backoff = evacuate_if_draining(&vmi, &ctx, &namespace, &verdict, &migrations).await?;

    Ok(Action::requeue(
        backoff.map_or(RESYNC_INTERVAL, |wait| wait.min(RESYNC_INTERVAL)),
    ))
}

/// Error policy for the VMI controller
pub fn error_policy(
    vmi: Arc<VirtualMachineInstance>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(?error, vmi = %vmi.name_any(), "reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

async fn publish_conditions(
    vmi: &VirtualMachineInstance,
    ctx: &Context,
    namespace: &str,
    verdict: &Migratability,
    active: Option<&VirtualMachineInstanceMigration>,
) -> Result<(), Error> {
    let mut conditions = vmi.status_or_default().conditions;

    let migrating = match active {
        Some(m) => Condition::new(
            ConditionStatus::True,
            "MigrationInProgress",
            format!("migration {} is in progress", m.name_any()),
        ),
        None => Condition::new(ConditionStatus::False, "", ""),
    };

    let migratable_changed = conditions.set(ConditionKind::IsMigratable, verdict.condition());
    let migrating_changed = conditions.set(ConditionKind::Migrating, migrating);
    if !(migratable_changed || migrating_changed) {
        return Ok(());
    }

    debug!(
        migratable = verdict.migratable,
        migrating = active.is_some(),
        "updating VMI conditions"
    );
    ctx.client
        .patch_vmi_status(
            namespace,
            &vmi.name_any(),
            &VmiStatusPatch::conditions(conditions),
        )
        .await
}

/// Returns true if `node` carries the NoSchedule drain taint
pub fn is_draining(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .any(|t| t.key == DRAIN_TAINT_KEY && t.effect == "NoSchedule")
        })
        .unwrap_or(false)
}

/// Time left before another evacuation may start after `failed` ones
///
/// The newest failure is timed by the VMI's migration record when it still
/// belongs to that migration, and by the migration's creation otherwise.
fn evacuation_wait(
    vmi: &VirtualMachineInstance,
    failed: &[&VirtualMachineInstanceMigration],
    now: DateTime<Utc>,
) -> Option<Duration> {
    let newest = failed
        .iter()
        .max_by_key(|m| m.metadata.creation_timestamp.as_ref().map(|t| t.0))?;
    let finished = newest
        .uid()
        .and_then(|uid| vmi.migration_state_for(&uid).and_then(|s| s.end_timestamp))
        .or_else(|| newest.metadata.creation_timestamp.as_ref().map(|t| t.0))?;

    let delay = evacuation_backoff().delay_for_attempt(failed.len() as u32);
    let elapsed = (now - finished).to_std().unwrap_or_default();
    delay.checked_sub(elapsed).filter(|wait| !wait.is_zero())
}

/// Create a migration for a LiveMigrate guest sitting on a drained node
///
/// Returns how long to wait when earlier evacuations off the same node
/// failed too recently for another attempt.
async fn evacuate_if_draining(
    vmi: &VirtualMachineInstance,
    ctx: &Context,
    namespace: &str,
    verdict: &Migratability,
    migrations: &[VirtualMachineInstanceMigration],
) -> Result<Option<Duration>, Error> {
    if !vmi.spec.migrates_on_eviction() || !vmi.is_running() {
        return Ok(None);
    }
    if migrations.iter().any(|m| !m.phase().is_terminal()) {
        return Ok(None);
    }
    let Some(node_name) = vmi.node_name() else {
        return Ok(None);
    };
    let Some(node) = ctx.client.get_node(node_name).await? else {
        return Ok(None);
    };
    if !is_draining(&node) {
        return Ok(None);
    }
    if !verdict.migratable {
        warn!(node = %node_name, "node is draining but the VMI cannot be migrated");
        return Ok(None);
    }

    let failed: Vec<&VirtualMachineInstanceMigration> = migrations
        .iter()
        .filter(|m| {
            m.phase() == MigrationPhase::Failed
                && m.labels().get(EVACUATION_LABEL).map(String::as_str) == Some(node_name)
        })
        .collect();
    if let Some(wait) = evacuation_wait(vmi, &failed, Utc::now()) {
        debug!(
            node = %node_name,
            failures = failed.len(),
            wait_secs = wait.as_secs(),
            "holding back evacuation after failed attempts"
        );
        return Ok(Some(wait));
    }

    let vmi_name = vmi.name_any();
    let suffix = Uuid::new_v4().simple().to_string();
    let migration = VirtualMachineInstanceMigration {
        metadata: ObjectMeta {
            name: Some(format!("{vmi_name}-evacuation-{}", &suffix[..8])),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (VMI_NAME_LABEL.to_string(), vmi_name.clone()),
                (EVACUATION_LABEL.to_string(), node_name.to_string()),
            ])),
            ..Default::default()
        },
        spec: VirtualMachineInstanceMigrationSpec {
            vmi_name: vmi_name.clone(),
        },
        status: None,
    };
    ctx.client.create_migration(namespace, &migration).await?;

    info!(node = %node_name, migration = %migration.name_any(), "evacuating VMI from draining node");
    ctx.events
        .publish(
            &vmi.object_ref(&()),
            EventType::Normal,
            reasons::EVACUATION_STARTED,
            actions::EVACUATE,
            Some(format!("Node {node_name} is draining")),
        )
        .await;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHandle, MigrationConfig};
    use crate::controller::fake::{accepting_prober, FakeCluster, FakeTransfer, Harness};
    use crate::controller::MockMigrationClient;
    use crate::crd::MigrationState;
    use crate::transport::MockHandshakeProber;
    use k8s_openapi::api::core::v1::{NodeSpec, Taint};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rstest::rstest;

    fn ctx(cluster: Arc<FakeCluster>) -> Arc<Context> {
        Arc::new(Context::for_testing(
            cluster,
            Arc::new(FakeTransfer::completing_after(1)),
            Arc::new(MockHandshakeProber::new()),
            ConfigHandle::fixed(MigrationConfig::default()),
        ))
    }

    fn tainted(effect: &str) -> Node {
        Node {
            spec: Some(NodeSpec {
                taints: Some(vec![Taint {
                    key: DRAIN_TAINT_KEY.to_string(),
                    effect: effect.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn only_no_schedule_drain_taint_counts() {
        assert!(is_draining(&tainted("NoSchedule")));
        assert!(!is_draining(&tainted("PreferNoSchedule")));
        assert!(!is_draining(&Node::default()));
    }

    #[tokio::test]
    async fn conditions_and_budget_follow_the_vmi() {
        let cluster = Arc::new(FakeCluster::with_nodes(&["node-a", "node-b"]));
        cluster.add_vmi("vm1", "node-a", true);
        let ctx = ctx(cluster.clone());

        let vmi = cluster.vmi("vm1").expect("vmi");
        reconcile(Arc::new(vmi), ctx.clone()).await.expect("reconcile");

        let vmi = cluster.vmi("vm1").expect("vmi");
        let conditions = vmi.status_or_default().conditions;
        assert_eq!(
            conditions.status(ConditionKind::IsMigratable),
            ConditionStatus::True
        );
        assert_eq!(
            conditions.status(ConditionKind::Migrating),
            ConditionStatus::False
        );
        assert!(cluster.budget("vm1").is_some());

        // A second pass over unchanged state writes nothing new
        let writes = cluster.vmi_writes();
        reconcile(Arc::new(vmi), ctx).await.expect("reconcile");
        assert_eq!(cluster.vmi_writes(), writes);
    }

    #[tokio::test]
    async fn vmi_without_live_migrate_has_no_budget() {
        let cluster = Arc::new(FakeCluster::with_nodes(&["node-a", "node-b"]));
        cluster.add_vmi("vm1", "node-a", false);
        let ctx = ctx(cluster.clone());

        let vmi = cluster.vmi("vm1").expect("vmi");
        reconcile(Arc::new(vmi), ctx).await.expect("reconcile");
        assert!(cluster.budget("vm1").is_none());
    }

    #[tokio::test]
    async fn draining_node_creates_one_evacuation() {
        let cluster = Arc::new(FakeCluster::with_nodes(&["node-a", "node-b"]));
        cluster.add_vmi("vm1", "node-a", true);
        cluster.add_vmi("vm2", "node-a", false);
        cluster.drain("node-a");
        let ctx = ctx(cluster.clone());

        for _ in 0..2 {
            for name in ["vm1", "vm2"] {
                let vmi = cluster.vmi(name).expect("vmi");
                reconcile(Arc::new(vmi), ctx.clone()).await.expect("reconcile");
            }
        }

        let migrations = cluster.migrations();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].spec.vmi_name, "vm1");
        assert!(migrations[0].name_any().starts_with("vm1-evacuation-"));
        assert_eq!(
            migrations[0].labels().get(EVACUATION_LABEL).map(String::as_str),
            Some("node-a")
        );
    }

    #[tokio::test]
    async fn active_migration_raises_budget_and_migrating() {
        let cluster = Arc::new(FakeCluster::with_nodes(&["node-a", "node-b"]));
        cluster.add_vmi("vm1", "node-a", true);
        let migration = cluster.request_migration("mig1", "vm1");
        cluster.set_migration_phase("mig1", MigrationPhase::Running);
        let ctx = ctx(cluster.clone());

        let vmi = cluster.vmi("vm1").expect("vmi");
        reconcile(Arc::new(vmi), ctx).await.expect("reconcile");

        let vmi = cluster.vmi("vm1").expect("vmi");
        let migrating = vmi.status_or_default().conditions.get(ConditionKind::Migrating);
        assert_eq!(migrating.status, ConditionStatus::True);
        assert!(migrating.message.contains(&migration.name_any()));

        let budget = cluster.budget("vm1").expect("budget");
        assert_eq!(
            budget.spec.and_then(|s| s.min_available),
            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(2))
        );
    }

    fn failed_evacuation(uid: &str, created: DateTime<Utc>) -> VirtualMachineInstanceMigration {
        let mut migration = VirtualMachineInstanceMigration::new(
            uid,
            VirtualMachineInstanceMigrationSpec {
                vmi_name: "vm1".to_string(),
            },
        );
        migration.metadata.uid = Some(uid.to_string());
        migration.metadata.creation_timestamp = Some(Time(created));
        migration
    }

    #[rstest]
    #[case::nothing_failed(0, 0, None)]
    #[case::first_failure_just_now(1, 10, Some(20))]
    #[case::first_failure_waited_out(1, 40, None)]
    #[case::third_failure_doubles_twice(3, 100, Some(20))]
    #[case::capped_after_many_failures(12, 600, Some(300))]
    fn evacuation_waits_longer_after_each_failure(
        #[case] failures: usize,
        #[case] newest_secs_ago: i64,
        #[case] expected_secs: Option<u64>,
    ) {
        let cluster = FakeCluster::with_nodes(&["node-a"]);
        cluster.add_vmi("vm1", "node-a", true);
        let vmi = cluster.vmi("vm1").expect("vmi");
        let now = Utc::now();

        let migrations: Vec<_> = (0..failures)
            .map(|i| {
                let age = newest_secs_ago + 3600 * i as i64;
                failed_evacuation(&format!("evac-{i}"), now - chrono::Duration::seconds(age))
            })
            .collect();
        let failed: Vec<_> = migrations.iter().collect();

        assert_eq!(
            evacuation_wait(&vmi, &failed, now),
            expected_secs.map(Duration::from_secs)
        );
    }

    #[test]
    fn evacuation_wait_counts_from_the_recorded_end() {
        let cluster = FakeCluster::with_nodes(&["node-a"]);
        cluster.add_vmi("vm1", "node-a", true);
        let mut vmi = cluster.vmi("vm1").expect("vmi");
        let now = Utc::now();

        // Created long ago but only gave up 5s ago
        let migration = failed_evacuation("evac-0", now - chrono::Duration::seconds(3600));
        vmi.status.get_or_insert_with(Default::default).migration_state = Some(MigrationState {
            completed: true,
            failed: true,
            end_timestamp: Some(now - chrono::Duration::seconds(5)),
            ..MigrationState::admitted("evac-0", "node-a")
        });

        assert_eq!(
            evacuation_wait(&vmi, &[&migration], now),
            Some(Duration::from_secs(25))
        );
    }

    // =========================================================================
    // Evacuation that keeps failing
    // =========================================================================

    #[tokio::test]
    async fn story_failing_evacuation_backs_off_between_attempts() {
        let h = Harness::new(
            FakeCluster::with_nodes(&["node-a", "node-b"]),
            FakeTransfer::failing("destination rejected the guest"),
            accepting_prober(),
            MigrationConfig::default(),
        );
        h.cluster.add_vmi("vm1", "node-a", true);
        h.cluster.drain("node-a");

        let all_failed = |c: &FakeCluster| {
            let migrations = c.migrations();
            !migrations.is_empty()
                && migrations
                    .iter()
                    .all(|m| m.phase() == MigrationPhase::Failed && !m.has_finalizer())
        };

        assert!(h.run_until(40, all_failed).await, "first evacuation did not fail");
        for _ in 0..50 {
            let errors = h.step().await;
            assert!(errors.is_empty(), "{errors:?}");
        }
        assert_eq!(h.cluster.migrations().len(), 1);

        // The first pause is over: exactly one more attempt
        h.cluster.backdate_migration_end("vm1", 40);
        assert!(
            h.run_until(40, |c| c.migrations().len() == 2 && all_failed(c))
                .await,
            "second evacuation did not fail"
        );
        for _ in 0..50 {
            h.step().await;
        }
        assert_eq!(h.cluster.migrations().len(), 2);

        // The second pause is twice as long
        h.cluster.backdate_migration_end("vm1", 40);
        for _ in 0..10 {
            h.step().await;
        }
        assert_eq!(h.cluster.migrations().len(), 2);
        h.cluster.backdate_migration_end("vm1", 40);
        h.step().await;
        assert_eq!(h.cluster.migrations().len(), 3);

        let migrations = h.cluster.migrations();
        assert!(migrations.iter().all(|m| {
            m.name_any().starts_with("vm1-evacuation-")
                && m.labels().get(EVACUATION_LABEL).map(String::as_str) == Some("node-a")
        }));
        assert_eq!(h.cluster.vmi("vm1").expect("vmi").node_name(), Some("node-a"));
    }

    #[tokio::test]
    async fn api_errors_propagate() {
        let mut client = MockMigrationClient::new();
        client
            .expect_list_migrations()
            .returning(|| Err(Error::validation("boom")));
        let ctx = Arc::new(Context::for_testing(
            Arc::new(client),
            Arc::new(FakeTransfer::completing_after(1)),
            Arc::new(MockHandshakeProber::new()),
            ConfigHandle::fixed(MigrationConfig::default()),
        ));
        let cluster = FakeCluster::with_nodes(&["node-a"]);
        cluster.add_vmi("vm1", "node-a", true);

        let vmi = cluster.vmi("vm1").expect("vmi");
        assert!(reconcile(Arc::new(vmi), ctx).await.is_err());
    }
}
