//! MinikubeCluster reconciler
//!
//! Publishes readiness and the control-plane endpoint of a profile. The
//! deletion path only releases the finalizer: tearing down a whole profile
//! is left to an operator.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{
    add_finalizer, is_deleting, remove_finalizer, settle, with_deadline, Context,
    READY_CONDITION,
};
use crate::crd::capi::{capi_owner, has_paused_annotation, is_paused};
use crate::crd::{
    ApiEndpoint, Condition, ConditionStatus, FailureReason, MinikubeCluster,
    MinikubeClusterStatus,
};
use crate::registry::Kind;
use crate::scheduler::{Action, Reconciler};
use crate::store::{ObjectKey, PatchHelper};
use crate::{Result, CLUSTER_FINALIZER};

/// [`Reconciler`] for MinikubeCluster objects
pub struct ClusterReconciler {
    ctx: Arc<Context>,
}

impl ClusterReconciler {
    /// Create a reconciler over the shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for ClusterReconciler {
    async fn reconcile(&self, key: &ObjectKey, deadline: Instant) -> Result<Action> {
        reconcile(key, &self.ctx, deadline).await
    }
}

fn update_status(
    cluster: &mut MinikubeCluster,
    f: impl FnOnce(MinikubeClusterStatus) -> MinikubeClusterStatus,
) {
    cluster.status = Some(f(cluster.status.take().unwrap_or_default()));
}

/// Run one pass for a MinikubeCluster; status changes are flushed on every exit
#[instrument(skip(ctx, deadline), fields(cluster = %key.namespaced_name()))]
pub async fn reconcile(key: &ObjectKey, ctx: &Context, deadline: Instant) -> Result<Action> {
    let Some(mut cluster) = ctx
        .store
        .get_minikube_cluster(&key.namespace, &key.name)
        .await?
    else {
        debug!("MinikubeCluster not found");
        return Ok(Action::await_change());
    };

    let patch = PatchHelper::new(&cluster)?;
    let result = reconcile_cluster(&mut cluster, ctx, deadline).await;
    let flushed = patch.flush(ctx.store.as_ref(), &cluster).await;
    settle(result, flushed)
}

async fn reconcile_cluster(
    cluster: &mut MinikubeCluster,
    ctx: &Context,
    deadline: Instant,
) -> Result<Action> {
    let namespace = cluster.namespace().unwrap_or_default();
    let owner = match capi_owner(&cluster.metadata, Kind::Cluster.kind_str()) {
        Some(owner_ref) => ctx.store.get_cluster(&namespace, &owner_ref.name).await?,
        None => None,
    };

    let owner = match owner {
        Some(owner) if is_paused(&owner, &cluster.metadata) => {
            info!("reconciliation paused");
            return Ok(Action::await_change());
        }
        None if has_paused_annotation(&cluster.metadata) => {
            info!("reconciliation paused");
            return Ok(Action::await_change());
        }
        owner => owner,
    };

    if is_deleting(cluster) {
        return Ok(reconcile_delete(cluster));
    }

    let Some(owner) = owner else {
        debug!("waiting for owning Cluster");
        return Ok(Action::await_change());
    };

    if add_finalizer(cluster, CLUSTER_FINALIZER) {
        info!("added finalizer");
        return Ok(Action::requeue_now());
    }

    let owner_name = owner.name_any();
    let profile = cluster.spec.effective_profile(&owner_name).to_string();

    let config = match with_deadline(
        deadline,
        "get_profile_config",
        ctx.provisioner.get_profile_config(&profile),
    )
    .await
    {
        Ok(config) => config,
        Err(e) => {
            warn!(profile = %profile, error = %e, "failed to read profile configuration");
            let message = e.to_string();
            update_status(cluster, |s| {
                s.ready(false)
                    .failure(FailureReason::ClusterConfigNotFound, message.clone())
                    .condition(Condition::new(
                        READY_CONDITION,
                        ConditionStatus::False,
                        FailureReason::ClusterConfigNotFound.to_string(),
                        message,
                    ))
            });
            return Err(e);
        }
    };

    if !cluster.spec.control_plane_endpoint.is_set() {
        if let Some(address) = config.first_node_address() {
            cluster.spec.control_plane_endpoint = ApiEndpoint {
                host: address.to_string(),
                port: config.api_server_port,
            };
            info!(
                profile = %profile,
                endpoint = %cluster.spec.control_plane_endpoint,
                "control plane endpoint set"
            );
        }
    }

    if !cluster.spec.control_plane_endpoint.is_set() {
        debug!(profile = %profile, "profile has no addressable node yet");
        update_status(cluster, |s| {
            s.ready(false).clear_failure().condition(Condition::new(
                READY_CONDITION,
                ConditionStatus::False,
                "WaitingForControlPlaneNode",
                format!("profile {profile} has no addressable node"),
            ))
        });
        return Ok(Action::requeue(ctx.poll_interval));
    }

    update_status(cluster, |s| {
        s.ready(true).clear_failure().condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::True,
            "ControlPlaneEndpointSet",
            "",
        ))
    });
    Ok(Action::await_change())
}

/// Release the finalizer; the profile's nodes are left alone
fn reconcile_delete(cluster: &mut MinikubeCluster) -> Action {
    if remove_finalizer(cluster, CLUSTER_FINALIZER) {
        info!("removed finalizer, profile left intact");
    }
    Action::await_change()
}
