//! Event sources for the scheduler
//!
//! Both sources produce the keys of infrastructure objects to reconcile.
//! Changes to a Cluster API `Cluster` or `Machine` are mapped onto the
//! infrastructure objects they reference, so unpausing a cluster or
//! attaching an owner re-triggers the affected objects.

use std::fmt::Debug;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::crd::capi::CLUSTER_NAME_LABEL;
use crate::crd::{Cluster, Machine, MinikubeCluster, MinikubeMachine, ObjectReference};
use crate::registry::Kind;
use crate::store::{Change, MemoryStore, ObjectKey};

fn key_of<K: Resource>(kind: Kind, obj: &K) -> ObjectKey {
    ObjectKey::new(kind, obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Key of the infrastructure object a Cluster API object references, if it
/// is of the expected kind
fn referenced(
    target: Kind,
    namespace: &str,
    reference: Option<&ObjectReference>,
) -> Option<ObjectKey> {
    let reference = reference?;
    if reference.kind != target.kind_str() || reference.name.is_empty() {
        return None;
    }
    let namespace = reference.namespace.as_deref().unwrap_or(namespace);
    Some(ObjectKey::new(target, namespace, &reference.name))
}

fn machine_target(machine: &Machine) -> Option<ObjectKey> {
    referenced(
        Kind::MinikubeMachine,
        &machine.namespace().unwrap_or_default(),
        machine.spec.infrastructure_ref.as_ref(),
    )
}

fn cluster_target(cluster: &Cluster) -> Option<ObjectKey> {
    referenced(
        Kind::MinikubeCluster,
        &cluster.namespace().unwrap_or_default(),
        cluster.spec.infrastructure_ref.as_ref(),
    )
}

fn member_of(machine: &MinikubeMachine, cluster: &str) -> bool {
    machine
        .labels()
        .get(CLUSTER_NAME_LABEL)
        .map(|c| c == cluster)
        .unwrap_or(false)
}

/// Applied objects of one kind; watch errors are logged and retried with
/// the watcher's default backoff
fn applied<K>(api: Api<K>) -> BoxStream<'static, K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .applied_objects()
        .filter_map(|event| async move {
            match event {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!(error = %e, "watch stream error");
                    None
                }
            }
        })
        .boxed()
}

async fn cluster_targets(client: Client, cluster: Cluster) -> Vec<ObjectKey> {
    let namespace = cluster.namespace().unwrap_or_default();
    let mut keys: Vec<ObjectKey> = cluster_target(&cluster).into_iter().collect();

    let machines: Api<MinikubeMachine> = Api::namespaced(client, &namespace);
    let selector = format!("{CLUSTER_NAME_LABEL}={}", cluster.name_any());
    match machines.list(&ListParams::default().labels(&selector)).await {
        Ok(list) => keys.extend(
            list.items
                .iter()
                .map(|m| key_of(Kind::MinikubeMachine, m)),
        ),
        Err(e) => {
            warn!(cluster = %cluster.name_any(), error = %e, "failed to list cluster machines");
        }
    }
    keys
}

/// Change notifications from the Kubernetes API server
pub fn event_stream(client: Client) -> BoxStream<'static, ObjectKey> {
    let infra_clusters = applied(Api::<MinikubeCluster>::all(client.clone()))
        .map(|c| key_of(Kind::MinikubeCluster, &c))
        .boxed();
    let infra_machines = applied(Api::<MinikubeMachine>::all(client.clone()))
        .map(|m| key_of(Kind::MinikubeMachine, &m))
        .boxed();
    let machines = applied(Api::<Machine>::all(client.clone()))
        .filter_map(|m| async move { machine_target(&m) })
        .boxed();
    let list_client = client.clone();
    let clusters = applied(Api::<Cluster>::all(client))
        .then(move |c| cluster_targets(list_client.clone(), c))
        .flat_map(stream::iter)
        .boxed();

    stream::select_all(vec![infra_clusters, infra_machines, machines, clusters]).boxed()
}

fn infra_keys(store: &MemoryStore) -> Vec<ObjectKey> {
    let mut keys = store.keys(Kind::MinikubeCluster);
    keys.extend(store.keys(Kind::MinikubeMachine));
    keys
}

fn memory_targets(store: &MemoryStore, change: &Change) -> Vec<ObjectKey> {
    let key = &change.key;
    match key.kind {
        Kind::MinikubeCluster | Kind::MinikubeMachine => vec![key.clone()],
        Kind::MinikubeMachineTemplate => Vec::new(),
        _ if change.removed => Vec::new(),
        Kind::Machine => match store.get::<Machine>(key) {
            Ok(machine) => machine.as_ref().and_then(machine_target).into_iter().collect(),
            Err(e) => {
                warn!(object = %key, error = %e, "failed to read changed object");
                Vec::new()
            }
        },
        Kind::Cluster => {
            let cluster = match store.get::<Cluster>(key) {
                Ok(Some(cluster)) => cluster,
                Ok(None) => return Vec::new(),
                Err(e) => {
                    warn!(object = %key, error = %e, "failed to read changed object");
                    return Vec::new();
                }
            };
            let mut keys: Vec<ObjectKey> = cluster_target(&cluster).into_iter().collect();
            for machine_key in store.keys(Kind::MinikubeMachine) {
                if machine_key.namespace != key.namespace {
                    continue;
                }
                if let Ok(Some(machine)) = store.get::<MinikubeMachine>(&machine_key) {
                    if member_of(&machine, &key.name) {
                        keys.push(machine_key);
                    }
                }
            }
            keys
        }
    }
}

/// Change notifications from an in-memory store.
///
/// Starts with every infrastructure object already stored, like the initial
/// list of a watch. A lagging subscriber resyncs all infrastructure objects.
pub fn memory_events(store: Arc<MemoryStore>) -> BoxStream<'static, ObjectKey> {
    let rx = store.subscribe();
    let initial = infra_keys(&store);

    let changes = stream::unfold((store, rx), |(store, mut rx)| async move {
        let keys = match rx.recv().await {
            Ok(change) => memory_targets(&store, &change),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "change feed lagged, resyncing");
                infra_keys(&store)
            }
            Err(RecvError::Closed) => {
                debug!("change feed closed");
                return None;
            }
        };
        Some((stream::iter(keys), (store, rx)))
    })
    .flatten();

    stream::iter(initial).chain(changes).boxed()
}
