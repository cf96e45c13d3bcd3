//! Snapshot-and-flush patch helper
//!
//! A reconcile pass takes a [`PatchHelper`] snapshot before touching the
//! object and flushes it on every exit path. The flush writes status first,
//! then metadata and spec. A conflict re-reads the latest object, replays the
//! pass's changes on top of it and tries again.

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::ResourceStore;
use crate::crd::{MinikubeCluster, MinikubeMachine};
use crate::registry::{codec, Kind};
use crate::retry::{retry_if, RetryConfig};
use crate::{Error, Result};

/// Maximum flush attempts before a conflict is handed to the scheduler
const MAX_FLUSH_ATTEMPTS: u32 = 5;

/// Infrastructure objects the reconcilers write back
#[async_trait]
pub trait InfraObject:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Registry kind
    const KIND: Kind;

    /// Read the latest copy
    async fn fetch(store: &dyn ResourceStore, namespace: &str, name: &str)
        -> Result<Option<Self>>;

    /// Guarded metadata/spec write
    async fn write(store: &dyn ResourceStore, obj: &Self) -> Result<Self>;

    /// Guarded status write
    async fn write_status(store: &dyn ResourceStore, obj: &Self) -> Result<Self>;
}

#[async_trait]
impl InfraObject for MinikubeCluster {
    const KIND: Kind = Kind::MinikubeCluster;

    async fn fetch(
        store: &dyn ResourceStore,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Self>> {
        store.get_minikube_cluster(namespace, name).await
    }

    async fn write(store: &dyn ResourceStore, obj: &Self) -> Result<Self> {
        store.replace_minikube_cluster(obj).await
    }

    async fn write_status(store: &dyn ResourceStore, obj: &Self) -> Result<Self> {
        store.replace_minikube_cluster_status(obj).await
    }
}

#[async_trait]
impl InfraObject for MinikubeMachine {
    const KIND: Kind = Kind::MinikubeMachine;

    async fn fetch(
        store: &dyn ResourceStore,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Self>> {
        store.get_minikube_machine(namespace, name).await
    }

    async fn write(store: &dyn ResourceStore, obj: &Self) -> Result<Self> {
        store.replace_minikube_machine(obj).await
    }

    async fn write_status(store: &dyn ResourceStore, obj: &Self) -> Result<Self> {
        store.replace_minikube_machine_status(obj).await
    }
}

/// Snapshot of an object taken at the start of a reconcile pass
pub struct PatchHelper<K: InfraObject> {
    original: Value,
    namespace: String,
    name: String,
    retry: RetryConfig,
    _kind: std::marker::PhantomData<K>,
}

/// What a pass changed relative to the snapshot
#[derive(Debug, Default, PartialEq)]
struct Delta {
    finalizers_added: Vec<String>,
    finalizers_removed: Vec<String>,
    spec: Map<String, Value>,
    status: Option<Value>,
}

impl Delta {
    fn is_empty(&self) -> bool {
        self.finalizers_added.is_empty()
            && self.finalizers_removed.is_empty()
            && self.spec.is_empty()
            && self.status.is_none()
    }

    fn touches_object(&self) -> bool {
        !self.finalizers_added.is_empty()
            || !self.finalizers_removed.is_empty()
            || !self.spec.is_empty()
    }
}

impl<K: InfraObject> PatchHelper<K> {
    /// Snapshot the object
    pub fn new(obj: &K) -> Result<Self> {
        Ok(Self {
            original: codec(K::KIND).encode(obj)?,
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
            retry: RetryConfig {
                max_attempts: MAX_FLUSH_ATTEMPTS,
                ..RetryConfig::default()
            },
            _kind: std::marker::PhantomData,
        })
    }

    /// Override the conflict retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Write whatever the pass changed.
    ///
    /// Succeeds without writing if nothing changed, and succeeds if the
    /// object no longer exists.
    pub async fn flush(&self, store: &dyn ResourceStore, obj: &K) -> Result<()> {
        let desired = codec(K::KIND).encode(obj)?;
        let delta = diff(&self.original, &desired);
        if delta.is_empty() {
            return Ok(());
        }

        let mut first = true;
        let this = self;
        let delta = &delta;
        retry_if(
            &self.retry,
            "flush_patch",
            |e: &Error| e.is_conflict(),
            move || {
                let refetch = !std::mem::replace(&mut first, false);
                let desired = desired.clone();
                async move { this.try_flush(store, desired, delta, refetch).await }
            },
        )
        .await
    }

    async fn try_flush(
        &self,
        store: &dyn ResourceStore,
        desired: Value,
        delta: &Delta,
        rebase_on_latest: bool,
    ) -> Result<()> {
        let kind = K::KIND;
        let target = if rebase_on_latest {
            let Some(latest) = K::fetch(store, &self.namespace, &self.name).await? else {
                debug!(name = %self.name, %kind, "object gone, nothing to flush");
                return Ok(());
            };
            let latest = codec(K::KIND).encode(&latest)?;
            codec(K::KIND).decode::<K>(rebase(latest, delta))?
        } else {
            codec(K::KIND).decode::<K>(desired)?
        };

        let mut target = target;
        if delta.status.is_some() {
            match K::write_status(store, &target).await {
                Ok(written) => target.meta_mut().resource_version = written.resource_version(),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => {
                    if e.is_conflict() {
                        warn!(name = %self.name, %kind, "status write conflicted, rebasing");
                    }
                    return Err(e);
                }
            }
        }

        if delta.touches_object() {
            match K::write(store, &target).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn finalizers(obj: &Value) -> Vec<String> {
    obj["metadata"]
        .get("finalizers")
        .and_then(Value::as_array)
        .map(|f| {
            f.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn object_field(obj: &Value, field: &str) -> Map<String, Value> {
    obj.get(field)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn diff(original: &Value, desired: &Value) -> Delta {
    let before = finalizers(original);
    let after = finalizers(desired);

    let original_spec = object_field(original, "spec");
    let desired_spec = object_field(desired, "spec");
    let mut spec = Map::new();
    for (k, v) in &desired_spec {
        if original_spec.get(k) != Some(v) {
            spec.insert(k.clone(), v.clone());
        }
    }
    for k in original_spec.keys() {
        if !desired_spec.contains_key(k) {
            spec.insert(k.clone(), Value::Null);
        }
    }

    let status = match (original.get("status"), desired.get("status")) {
        (a, b) if a == b => None,
        (_, Some(s)) => Some(s.clone()),
        (_, None) => Some(Value::Null),
    };

    Delta {
        finalizers_added: after.iter().filter(|f| !before.contains(f)).cloned().collect(),
        finalizers_removed: before.iter().filter(|f| !after.contains(f)).cloned().collect(),
        spec,
        status,
    }
}

/// Replay a pass's changes on top of the latest stored object
fn rebase(mut latest: Value, delta: &Delta) -> Value {
    let mut fins: Vec<String> = finalizers(&latest)
        .into_iter()
        .filter(|f| !delta.finalizers_removed.contains(f))
        .collect();
    for f in &delta.finalizers_added {
        if !fins.contains(f) {
            fins.push(f.clone());
        }
    }
    latest["metadata"]["finalizers"] = Value::from(fins);

    if !delta.spec.is_empty() {
        let mut spec = object_field(&latest, "spec");
        for (k, v) in &delta.spec {
            if v.is_null() {
                spec.remove(k);
            } else {
                spec.insert(k.clone(), v.clone());
            }
        }
        latest["spec"] = Value::Object(spec);
    }

    match &delta.status {
        Some(Value::Null) => {
            if let Some(map) = latest.as_object_mut() {
                map.remove("status");
            }
        }
        Some(status) => latest["status"] = status.clone(),
        None => {}
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MachinePhase, MinikubeMachineSpec, MinikubeMachineStatus};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn machine(name: &str) -> MinikubeMachine {
        let mut m = MinikubeMachine::new(name, MinikubeMachineSpec::default());
        m.metadata.namespace = Some("default".to_string());
        m
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_diff_tracks_finalizers_spec_and_status() {
        let original = serde_json::json!({
            "metadata": { "finalizers": ["a", "b"] },
            "spec": { "nodeName": "node-1", "cpus": 2 },
        });
        let desired = serde_json::json!({
            "metadata": { "finalizers": ["b", "c"] },
            "spec": { "nodeName": "node-1", "providerID": "minikube://p/node-1" },
            "status": { "ready": true },
        });
        let delta = diff(&original, &desired);
        assert_eq!(delta.finalizers_added, vec!["c"]);
        assert_eq!(delta.finalizers_removed, vec!["a"]);
        assert_eq!(delta.spec.get("providerID"), Some(&Value::from("minikube://p/node-1")));
        assert_eq!(delta.spec.get("cpus"), Some(&Value::Null));
        assert!(!delta.spec.contains_key("nodeName"));
        assert_eq!(delta.status, Some(serde_json::json!({ "ready": true })));
    }

    #[test]
    fn test_rebase_keeps_concurrent_edits() {
        let latest = serde_json::json!({
            "metadata": { "finalizers": ["a", "external"], "resourceVersion": "9" },
            "spec": { "cpus": 8, "nodeName": "node-1" },
            "status": { "ready": false },
        });
        let delta = Delta {
            finalizers_added: vec!["mine".to_string()],
            finalizers_removed: vec!["a".to_string()],
            spec: Map::from_iter([("providerID".to_string(), Value::from("id"))]),
            status: Some(serde_json::json!({ "ready": true })),
        };
        let rebased = rebase(latest, &delta);
        assert_eq!(rebased["metadata"]["finalizers"], serde_json::json!(["external", "mine"]));
        assert_eq!(rebased["metadata"]["resourceVersion"], "9");
        assert_eq!(rebased["spec"]["cpus"], 8);
        assert_eq!(rebased["spec"]["providerID"], "id");
        assert_eq!(rebased["status"]["ready"], true);
    }

    #[tokio::test]
    async fn test_unchanged_object_is_not_written() {
        let store = MemoryStore::new();
        let obj = store.create(&machine("m1")).unwrap();
        let helper = PatchHelper::new(&obj).unwrap();
        helper.flush(&store, &obj).await.unwrap();

        let stored: MinikubeMachine = store
            .get_minikube_machine("default", "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.resource_version(), obj.resource_version());
    }

    #[tokio::test]
    async fn test_flush_writes_status_then_spec() {
        let store = MemoryStore::new();
        let mut obj = store.create(&machine("m1")).unwrap();
        let helper = PatchHelper::new(&obj).unwrap();

        obj.spec.provider_id = Some("minikube://dev/node-1".to_string());
        obj.status = Some(
            MinikubeMachineStatus::default()
                .phase(MachinePhase::Provisioned)
                .ready(true),
        );
        helper.flush(&store, &obj).await.unwrap();

        let stored = store
            .get_minikube_machine("default", "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.spec.provider_id.as_deref(), Some("minikube://dev/node-1"));
        assert_eq!(
            stored.status.and_then(|s| s.phase),
            Some(MachinePhase::Provisioned)
        );
    }

    #[tokio::test]
    async fn test_conflict_is_rebased_onto_latest() {
        let store = MemoryStore::new();
        let mut obj = store.create(&machine("m1")).unwrap();
        let helper = PatchHelper::new(&obj).unwrap().with_retry(fast_retry());

        // Someone else edits the object mid-pass.
        let mut other = obj.clone();
        other.spec.cpus = Some(4);
        store.replace_minikube_machine(&other).await.unwrap();

        obj.metadata.finalizers = Some(vec![crate::MACHINE_FINALIZER.to_string()]);
        helper.flush(&store, &obj).await.unwrap();

        let stored = store
            .get_minikube_machine("default", "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.spec.cpus, Some(4));
        assert_eq!(stored.finalizers(), &[crate::MACHINE_FINALIZER.to_string()]);
    }

    #[tokio::test]
    async fn test_flush_succeeds_when_finalizer_removal_deletes_object() {
        let store = MemoryStore::new();
        let mut m = machine("m1");
        m.metadata.finalizers = Some(vec![crate::MACHINE_FINALIZER.to_string()]);
        store.create(&m).unwrap();
        store
            .request_delete(Kind::MinikubeMachine, "default", "m1")
            .unwrap();

        let mut obj = store
            .get_minikube_machine("default", "m1")
            .await
            .unwrap()
            .unwrap();
        let helper = PatchHelper::new(&obj).unwrap();
        obj.status = Some(MinikubeMachineStatus::default().phase(MachinePhase::Deleting));
        obj.metadata.finalizers = Some(vec![]);
        helper.flush(&store, &obj).await.unwrap();

        assert!(store
            .get_minikube_machine("default", "m1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_vanished_object_ends_flush() {
        let store = MemoryStore::new();
        let mut obj = store.create(&machine("m1")).unwrap();
        let helper = PatchHelper::new(&obj).unwrap().with_retry(fast_retry());
        store
            .request_delete(Kind::MinikubeMachine, "default", "m1")
            .unwrap();

        obj.status = Some(MinikubeMachineStatus::default().ready(true));
        helper.flush(&store, &obj).await.unwrap();
    }
}
