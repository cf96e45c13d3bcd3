//! MinikubeMachine reconciler
//!
//! Owns the node lifecycle of one machine:
//!
//! ```text
//! (unset) -> Provisioning -> Provisioned -> Provisioned (steady state)
//!                 |
//!                 +-> Failed (profile unreadable or add-node failed)
//!
//! any -> Deleting -> finalizer released
//! ```
//!
//! A non-empty `spec.providerID` marks the node as created; from then on
//! the node is only described, never added again.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{
    add_finalizer, is_deleting, remove_finalizer, settle, with_deadline, Context,
    NODE_PROVISIONED_CONDITION, READY_CONDITION,
};
use crate::crd::capi::{capi_owner, has_paused_annotation, is_paused, CLUSTER_NAME_LABEL};
use crate::crd::{
    Cluster, Condition, ConditionStatus, FailureReason, Machine, MachineAddress, MachinePhase,
    MinikubeCluster, MinikubeMachine, MinikubeMachineStatus,
};
use crate::metrics::{record_node_deletion, record_node_provisioned, DeletionResult};
use crate::provisioner::{next_node_name, provider_id, NodeInfo, NodeSpec};
use crate::registry::Kind;
use crate::scheduler::{Action, Reconciler};
use crate::store::{ObjectKey, PatchHelper};
use crate::{Result, MACHINE_FINALIZER};

/// [`Reconciler`] for MinikubeMachine objects
pub struct MachineReconciler {
    ctx: Arc<Context>,
}

impl MachineReconciler {
    /// Create a reconciler over the shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for MachineReconciler {
    async fn reconcile(&self, key: &ObjectKey, deadline: Instant) -> Result<Action> {
        reconcile(key, &self.ctx, deadline).await
    }
}

/// Owner chain of a MinikubeMachine; any link may be missing
#[derive(Default)]
struct Owners {
    machine: Option<Machine>,
    cluster: Option<Cluster>,
    cluster_name: Option<String>,
    infra: Option<MinikubeCluster>,
}

impl Owners {
    /// Profile of the owning cluster.
    ///
    /// The MinikubeCluster's explicit profile, else the Cluster name, else
    /// `default`.
    fn profile(&self, default: &str) -> String {
        let explicit = self
            .infra
            .as_ref()
            .and_then(|infra| infra.spec.profile_name.as_deref())
            .filter(|p| !p.is_empty());
        match (explicit, &self.cluster_name) {
            (Some(profile), _) => profile.to_string(),
            (None, Some(cluster)) => cluster.clone(),
            (None, None) => default.to_string(),
        }
    }
}

/// Walk MinikubeMachine -> Machine -> Cluster -> MinikubeCluster
async fn resolve_owners(mm: &MinikubeMachine, ctx: &Context) -> Result<Owners> {
    let namespace = mm.namespace().unwrap_or_default();
    let mut owners = Owners::default();

    if let Some(owner_ref) = capi_owner(&mm.metadata, Kind::Machine.kind_str()) {
        owners.machine = ctx.store.get_machine(&namespace, &owner_ref.name).await?;
    }

    owners.cluster_name = owners
        .machine
        .as_ref()
        .and_then(|m| m.cluster_name())
        .or_else(|| {
            mm.labels()
                .get(CLUSTER_NAME_LABEL)
                .map(String::as_str)
                .filter(|n| !n.is_empty())
        })
        .map(str::to_string);

    if let Some(cluster_name) = &owners.cluster_name {
        owners.cluster = ctx.store.get_cluster(&namespace, cluster_name).await?;
    }

    let infra_ref = owners
        .cluster
        .as_ref()
        .and_then(|c| c.spec.infrastructure_ref.as_ref())
        .filter(|r| r.kind == Kind::MinikubeCluster.kind_str() && !r.name.is_empty());
    if let Some(infra_ref) = infra_ref {
        owners.infra = ctx
            .store
            .get_minikube_cluster(&namespace, &infra_ref.name)
            .await?;
    }

    Ok(owners)
}

fn update_status(
    mm: &mut MinikubeMachine,
    f: impl FnOnce(MinikubeMachineStatus) -> MinikubeMachineStatus,
) {
    mm.status = Some(f(mm.status.take().unwrap_or_default()));
}

fn addresses(info: &NodeInfo) -> Vec<MachineAddress> {
    if info.address.is_empty() {
        Vec::new()
    } else {
        vec![MachineAddress::internal_ip(&info.address)]
    }
}

fn ready_condition(running: bool) -> Condition {
    if running {
        Condition::new(READY_CONDITION, ConditionStatus::True, "NodeRunning", "")
    } else {
        Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            "NodeNotRunning",
            "node is not running",
        )
    }
}

fn node_provisioned() -> Condition {
    Condition::new(
        NODE_PROVISIONED_CONDITION,
        ConditionStatus::True,
        "NodeAdded",
        "",
    )
}

/// Record a provisioning failure on the object
fn fail(mm: &mut MinikubeMachine, reason: FailureReason, message: String) {
    update_status(mm, |s| {
        s.phase(MachinePhase::Failed)
            .ready(false)
            .failure(reason, message.clone())
            .condition(Condition::new(
                NODE_PROVISIONED_CONDITION,
                ConditionStatus::False,
                reason.to_string(),
                message.clone(),
            ))
            .condition(Condition::new(
                READY_CONDITION,
                ConditionStatus::False,
                reason.to_string(),
                message,
            ))
    });
}

/// Run one pass for a MinikubeMachine; status changes are flushed on every exit
#[instrument(skip(ctx, deadline), fields(machine = %key.namespaced_name()))]
pub async fn reconcile(key: &ObjectKey, ctx: &Context, deadline: Instant) -> Result<Action> {
    let Some(mut mm) = ctx
        .store
        .get_minikube_machine(&key.namespace, &key.name)
        .await?
    else {
        debug!("MinikubeMachine not found");
        return Ok(Action::await_change());
    };

    let patch = PatchHelper::new(&mm)?;
    let result = reconcile_machine(&mut mm, ctx, deadline).await;
    let flushed = patch.flush(ctx.store.as_ref(), &mm).await;
    settle(result, flushed)
}

async fn reconcile_machine(
    mm: &mut MinikubeMachine,
    ctx: &Context,
    deadline: Instant,
) -> Result<Action> {
    let owners = resolve_owners(mm, ctx).await?;

    let paused = match &owners.cluster {
        Some(cluster) => is_paused(cluster, &mm.metadata),
        None => has_paused_annotation(&mm.metadata),
    };
    if paused {
        info!("reconciliation paused");
        return Ok(Action::await_change());
    }

    if is_deleting(mm) {
        return reconcile_delete(mm, &owners, ctx, deadline).await;
    }

    if owners.machine.is_none() {
        debug!("waiting for owning Machine");
        return Ok(Action::await_change());
    }
    if owners.cluster.is_none() {
        debug!(cluster = ?owners.cluster_name, "waiting for owning Cluster");
        return Ok(Action::await_change());
    }
    if owners.infra.is_none() {
        debug!("waiting for MinikubeCluster");
        return Ok(Action::await_change());
    }

    if add_finalizer(mm, MACHINE_FINALIZER) {
        info!("added finalizer");
        return Ok(Action::requeue_now());
    }

    let profile = owners.profile(&ctx.default_profile);
    match mm.spec.provider_id().map(str::to_string) {
        Some(provider_id) => observe(mm, &profile, &provider_id, ctx, deadline).await,
        None => provision(mm, &profile, ctx, deadline).await,
    }
}

/// Steady state: republish readiness and addresses from the live node
async fn observe(
    mm: &mut MinikubeMachine,
    profile: &str,
    provider_id: &str,
    ctx: &Context,
    deadline: Instant,
) -> Result<Action> {
    let node = match mm.spec.node_name() {
        Some(node) => node.to_string(),
        None => provider_id
            .rsplit('/')
            .next()
            .unwrap_or(provider_id)
            .to_string(),
    };

    let info = match with_deadline(
        deadline,
        "describe_node",
        ctx.provisioner.describe_node(profile, &node),
    )
    .await
    {
        Ok(info) => info,
        Err(e) => {
            warn!(profile = %profile, node = %node, error = %e, "failed to describe node");
            let message = e.to_string();
            update_status(mm, |s| {
                s.ready(false).condition(Condition::new(
                    READY_CONDITION,
                    ConditionStatus::False,
                    "NodeDescribeFailed",
                    message,
                ))
            });
            return Err(e);
        }
    };

    if !info.running {
        debug!(profile = %profile, node = %node, "node is not running");
    }
    update_status(mm, |s| {
        s.phase(MachinePhase::Provisioned)
            .ready(info.running)
            .addresses(addresses(&info))
            .condition(node_provisioned())
            .condition(ready_condition(info.running))
    });
    Ok(Action::requeue(ctx.resync_interval))
}

/// Create the node and record its provider ID
async fn provision(
    mm: &mut MinikubeMachine,
    profile: &str,
    ctx: &Context,
    deadline: Instant,
) -> Result<Action> {
    update_status(mm, |s| s.phase(MachinePhase::Provisioning));
    let _profile_guard = with_deadline(deadline, "lock_profile", async {
        Ok(ctx.lock_profile(profile).await)
    })
    .await?;

    let config = match with_deadline(
        deadline,
        "get_profile_config",
        ctx.provisioner.get_profile_config(profile),
    )
    .await
    {
        Ok(config) => config,
        Err(e) => {
            warn!(profile = %profile, error = %e, "failed to read profile configuration");
            fail(mm, FailureReason::ClusterConfigNotFound, e.to_string());
            return Err(e);
        }
    };

    let node = match mm.spec.node_name() {
        Some(node) => node.to_string(),
        None => {
            let node = next_node_name(&config.nodes);
            info!(profile = %profile, node = %node, "assigned node name");
            mm.spec.node_name = Some(node.clone());
            node
        }
    };

    if config.has_node(&node) {
        info!(profile = %profile, node = %node, "node already in profile, skipping add");
    } else {
        let spec = NodeSpec {
            name: node.clone(),
            worker: mm.spec.is_worker(),
            control_plane: mm.spec.control_plane,
            kubernetes_version: config.kubernetes_version.clone(),
        };
        info!(
            profile = %profile,
            node = %node,
            worker = spec.worker,
            control_plane = spec.control_plane,
            kubernetes_version = %spec.kubernetes_version,
            "adding node"
        );
        // Failed adds stay in place for diagnosis.
        if let Err(e) = with_deadline(
            deadline,
            "add_node",
            ctx.provisioner.add_node(profile, &spec, false),
        )
        .await
        {
            warn!(profile = %profile, node = %node, error = %e, "failed to add node");
            fail(mm, FailureReason::NodeProvisionFailed, e.to_string());
            return Err(e);
        }
        record_node_provisioned(profile);
    }

    let info = match with_deadline(
        deadline,
        "describe_node",
        ctx.provisioner.describe_node(profile, &node),
    )
    .await
    {
        Ok(info) => info,
        Err(e) => {
            warn!(
                profile = %profile,
                node = %node,
                error = %e,
                "node added but not yet describable"
            );
            update_status(mm, |s| s.condition(node_provisioned()));
            return Ok(Action::requeue(ctx.poll_interval));
        }
    };

    let id = if info.provider_id.is_empty() {
        provider_id(profile, &node)
    } else {
        info.provider_id.clone()
    };
    info!(profile = %profile, node = %node, provider_id = %id, "node provisioned");
    mm.spec.provider_id = Some(id);
    update_status(mm, |s| {
        s.phase(MachinePhase::Provisioned)
            .ready(true)
            .addresses(addresses(&info))
            .clear_failure()
            .condition(node_provisioned())
            .condition(ready_condition(true))
    });
    Ok(Action::requeue(ctx.resync_interval))
}

/// Best-effort node removal, then release the finalizer
async fn reconcile_delete(
    mm: &mut MinikubeMachine,
    owners: &Owners,
    ctx: &Context,
    deadline: Instant,
) -> Result<Action> {
    update_status(mm, |s| s.phase(MachinePhase::Deleting).ready(false));
    let profile = owners.profile(&ctx.default_profile);

    if let Some(node) = mm.spec.node_name().map(str::to_string) {
        let result = match with_deadline(
            deadline,
            "delete_node",
            ctx.provisioner.delete_node(&profile, &node),
        )
        .await
        {
            Ok(()) => {
                info!(profile = %profile, node = %node, "node deleted");
                DeletionResult::Deleted
            }
            Err(e) if e.is_not_found() => {
                debug!(profile = %profile, node = %node, "node already absent");
                DeletionResult::Absent
            }
            Err(e) => {
                warn!(
                    profile = %profile,
                    node = %node,
                    error = %e,
                    "failed to delete node, releasing finalizer anyway"
                );
                DeletionResult::Failed
            }
        };
        record_node_deletion(&profile, result);
    }

    if remove_finalizer(mm, MACHINE_FINALIZER) {
        info!("removed finalizer");
    }
    Ok(Action::await_change())
}
