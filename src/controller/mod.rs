//! Reconcilers for MinikubeCluster and MinikubeMachine
//!
//! Both follow the same pass shape: load the object, snapshot it in a
//! [`PatchHelper`](crate::store::PatchHelper), run the state machine on the
//! local copy, and flush the snapshot diff no matter how the pass ended.

pub mod cluster;
pub mod machine;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::warn;

use crate::provisioner::NodeProvisioner;
use crate::scheduler::Action;
use crate::store::ResourceStore;
use crate::{Error, Result, DEFAULT_PROFILE};

pub use cluster::ClusterReconciler;
pub use machine::MachineReconciler;

/// Condition type reporting overall readiness
pub const READY_CONDITION: &str = "Ready";

/// Condition type reporting whether the node exists
pub const NODE_PROVISIONED_CONDITION: &str = "NodeProvisioned";

/// Default interval between steady-state machine passes
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Default interval for re-checking external profile state
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Shared controller context
///
/// Holds the collaborators every pass needs. Use [`ContextBuilder`] to
/// construct instances:
///
/// ```ignore
/// let ctx = Context::builder(store, provisioner)
///     .default_profile("dev")
///     .resync_interval(Duration::from_secs(30))
///     .build();
/// ```
pub struct Context {
    /// Resource store (trait object for testability)
    pub store: Arc<dyn ResourceStore>,
    /// Node provisioner (trait object for testability)
    pub provisioner: Arc<dyn NodeProvisioner>,
    /// Profile used when a deleting machine has lost its owners
    pub default_profile: String,
    /// Requeue delay for provisioned machines
    pub resync_interval: Duration,
    /// Requeue delay while waiting on external profile state
    pub poll_interval: Duration,
    /// Serializes node creation per profile
    profile_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        store: Arc<dyn ResourceStore>,
        provisioner: Arc<dyn NodeProvisioner>,
    ) -> ContextBuilder {
        ContextBuilder::new(store, provisioner)
    }

    /// Create a context for testing with custom mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ResourceStore>,
        provisioner: Arc<dyn NodeProvisioner>,
    ) -> Self {
        Self::builder(store, provisioner).build()
    }

    /// Exclusive access to a profile's node list.
    ///
    /// Held from reading the profile until the new node exists, so two
    /// machines of one profile never pick the same node name.
    pub async fn lock_profile(&self, profile: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .profile_locks
            .lock()
            .entry(profile.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    store: Arc<dyn ResourceStore>,
    provisioner: Arc<dyn NodeProvisioner>,
    default_profile: String,
    resync_interval: Duration,
    poll_interval: Duration,
}

impl ContextBuilder {
    fn new(store: Arc<dyn ResourceStore>, provisioner: Arc<dyn NodeProvisioner>) -> Self {
        Self {
            store,
            provisioner,
            default_profile: DEFAULT_PROFILE.to_string(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the fallback profile
    pub fn default_profile(mut self, profile: impl Into<String>) -> Self {
        self.default_profile = profile.into();
        self
    }

    /// Set the steady-state requeue delay
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Set the poll delay for external profile state
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self.store,
            provisioner: self.provisioner,
            default_profile: self.default_profile,
            resync_interval: self.resync_interval,
            poll_interval: self.poll_interval,
            profile_locks: Mutex::new(HashMap::new()),
        }
    }
}

/// True if the object carries the finalizer
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Add the finalizer; returns false if it was already present
pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.finalizers_mut().push(finalizer.to_string());
    true
}

/// Remove the finalizer; returns false if it was absent
pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    let before = obj.finalizers().len();
    obj.finalizers_mut().retain(|f| f != finalizer);
    obj.finalizers().len() != before
}

/// True once deletion has been requested
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Bound a collaborator call by the pass deadline
pub async fn with_deadline<T, F>(deadline: Instant, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| Error::timeout(operation))?
}

/// Combine the pass outcome with the flush outcome.
///
/// A flush failure fails an otherwise successful pass so the scheduler
/// retries it; after a failed pass the pass error wins.
fn settle(result: Result<Action>, flushed: Result<()>) -> Result<Action> {
    match (result, flushed) {
        (Ok(action), Ok(())) => Ok(action),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(flush_err)) => {
            warn!(error = %flush_err, "failed to persist status after failed pass");
            Err(e)
        }
    }
}

/// Object builders shared by the reconciler tests
#[cfg(test)]
pub(crate) mod fixtures {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    use crate::crd::capi::CLUSTER_NAME_LABEL;
    use crate::crd::{Cluster, ClusterSpec, Machine, MachineSpec, ObjectReference};
    use crate::registry::Kind;

    pub const NAMESPACE: &str = "default";

    pub fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        }
    }

    pub fn owned_by(kind: Kind, name: &str) -> Vec<OwnerReference> {
        vec![OwnerReference {
            api_version: kind.api_version(),
            kind: kind.kind_str().to_string(),
            name: name.to_string(),
            uid: format!("{name}-uid"),
            controller: Some(true),
            ..Default::default()
        }]
    }

    pub fn reference(kind: Kind, name: &str) -> Option<ObjectReference> {
        Some(ObjectReference {
            api_version: kind.api_version(),
            kind: kind.kind_str().to_string(),
            name: name.to_string(),
            namespace: None,
        })
    }

    /// Cluster `name` whose infrastructure is MinikubeCluster `infra`
    pub fn capi_cluster(name: &str, infra: &str, paused: bool) -> Cluster {
        let mut cluster = Cluster::new(
            name,
            ClusterSpec {
                paused,
                infrastructure_ref: reference(Kind::MinikubeCluster, infra),
            },
        );
        cluster.metadata = meta(name);
        cluster
    }

    /// Machine `name` in `cluster` whose infrastructure is MinikubeMachine `infra`
    pub fn capi_machine(name: &str, cluster: &str, infra: &str) -> Machine {
        let mut machine = Machine::new(
            name,
            MachineSpec {
                cluster_name: cluster.to_string(),
                infrastructure_ref: reference(Kind::MinikubeMachine, infra),
                version: None,
            },
        );
        machine.metadata = meta(name);
        machine.metadata.labels = Some(
            [(CLUSTER_NAME_LABEL.to_string(), cluster.to_string())]
                .into_iter()
                .collect(),
        );
        machine
    }
}
