//! In-process resource store
//!
//! Objects are kept as JSON, normalized through the kind registry. The store
//! mimics the API server behaviors the reconcilers rely on: monotonically
//! increasing resource versions, a separate status subresource, and
//! tombstone deletion that waits for finalizers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::Resource;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ObjectKey, ResourceStore};
use crate::crd::{Cluster, Machine, MinikubeCluster, MinikubeMachine};
use crate::registry::{codec, Kind};
use crate::{Error, Result};

const CHANGE_FEED_CAPACITY: usize = 1024;

/// One entry of the change feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Object that changed
    pub key: ObjectKey,
    /// True if the object was removed from the store
    pub removed: bool,
}

struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    last_version: u64,
    last_uid: u64,
}

/// [`ResourceStore`] kept entirely in memory
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<Change>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                last_version: 0,
                last_uid: 0,
            }),
            changes,
        }
    }

    /// Subscribe to the change feed
    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    /// Keys of all stored objects of a kind
    pub fn keys(&self, kind: Kind) -> Vec<ObjectKey> {
        self.inner
            .lock()
            .objects
            .keys()
            .filter(|k| k.kind == kind)
            .cloned()
            .collect()
    }

    /// Create a new object; fails with a conflict if it already exists
    pub fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let (key, mut value) = self.prepare(obj)?;
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(&key) {
            return Err(Error::conflict(key.kind.kind_str(), key.namespaced_name()));
        }
        inner.last_uid += 1;
        let uid = format!("{:08x}-0000-4000-8000-000000000000", inner.last_uid);
        set_meta(&mut value, "uid", Value::String(uid));
        set_meta(
            &mut value,
            "creationTimestamp",
            Value::String(now_rfc3339()),
        );
        remove_meta(&mut value, "deletionTimestamp");
        self.commit(&mut inner, key, value)
    }

    /// Overwrite an object unconditionally, creating it if absent.
    ///
    /// Stands in for edits made by users or other controllers.
    pub fn apply<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let (key, mut value) = self.prepare(obj)?;
        let mut inner = self.inner.lock();
        let existing = inner.objects.get(&key).map(|c| c["metadata"].clone());
        let Some(current_meta) = existing else {
            drop(inner);
            return self.create(obj);
        };
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            match current_meta.get(field) {
                Some(v) => set_meta(&mut value, field, v.clone()),
                None => remove_meta(&mut value, field),
            }
        }
        self.commit(&mut inner, key, value)
    }

    /// Request deletion: removes the object at once if it carries no
    /// finalizers, otherwise marks it with a deletion timestamp
    pub fn request_delete(&self, kind: Kind, namespace: &str, name: &str) -> Result<()> {
        let key = ObjectKey::new(kind, namespace, name);
        let mut inner = self.inner.lock();
        let Some(current) = inner.objects.get(&key) else {
            return Err(Error::not_found(kind.kind_str(), key.namespaced_name()));
        };
        if current["metadata"].get("deletionTimestamp").is_some() {
            return Ok(());
        }
        let mut value = current.clone();
        set_meta(
            &mut value,
            "deletionTimestamp",
            Value::String(now_rfc3339()),
        );
        commit_value(&mut inner, &self.changes, key, value);
        Ok(())
    }

    /// Typed read of any stored kind
    pub fn get<K: DeserializeOwned>(&self, key: &ObjectKey) -> Result<Option<K>> {
        let value = self.inner.lock().objects.get(key).cloned();
        value.map(|v| codec(key.kind).decode(v)).transpose()
    }

    fn prepare<K>(&self, obj: &K) -> Result<(ObjectKey, Value)>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let api_version = K::api_version(&());
        let kind_str = K::kind(&());
        let kind = Kind::from_type_meta(&api_version, &kind_str).ok_or_else(|| {
            Error::validation_for(kind_str.to_string(), "kind is not registered")
        })?;
        let meta = obj.meta();
        let name = meta.name.clone().unwrap_or_default();
        let namespace = meta.namespace.clone().unwrap_or_default();
        if name.is_empty() || namespace.is_empty() {
            return Err(Error::validation_for(
                kind.kind_str(),
                "object must have metadata.name and metadata.namespace",
            ));
        }
        let codec = codec(kind);
        let value = codec.normalize(codec.encode(obj)?)?;
        Ok((ObjectKey::new(kind, namespace, name), value))
    }

    fn commit<K: DeserializeOwned>(
        &self,
        inner: &mut Inner,
        key: ObjectKey,
        value: Value,
    ) -> Result<K> {
        let kind = key.kind;
        let stored = commit_value(inner, &self.changes, key, value);
        codec(kind).decode(stored)
    }

    /// Guarded write of metadata/spec (`status_only == false`) or status
    fn replace<K>(&self, obj: &K, status_only: bool) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let (key, incoming) = self.prepare(obj)?;
        let mut inner = self.inner.lock();
        let Some(current) = inner.objects.get(&key).cloned() else {
            return Err(Error::not_found(key.kind.kind_str(), key.namespaced_name()));
        };

        if incoming["metadata"].get("resourceVersion") != current["metadata"].get("resourceVersion")
        {
            debug!(object = %key, "rejecting stale write");
            return Err(Error::conflict(key.kind.kind_str(), key.namespaced_name()));
        }

        let mut next = if status_only {
            let mut next = current.clone();
            match incoming.get("status") {
                Some(status) => next["status"] = status.clone(),
                None => {
                    if let Some(map) = next.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
            next
        } else {
            let mut next = incoming;
            match current.get("status") {
                Some(status) => next["status"] = status.clone(),
                None => {
                    if let Some(map) = next.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
            for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
                match current["metadata"].get(field) {
                    Some(v) => set_meta(&mut next, field, v.clone()),
                    None => remove_meta(&mut next, field),
                }
            }
            next
        };

        // A no-op write keeps the current version, as the API server does.
        if next == current {
            return codec(key.kind).decode(current);
        }
        set_meta(
            &mut next,
            "resourceVersion",
            current["metadata"]["resourceVersion"].clone(),
        );
        self.commit(&mut inner, key, next)
    }
}

/// Bump the version, store or remove the object and publish the change
fn commit_value(
    inner: &mut Inner,
    changes: &broadcast::Sender<Change>,
    key: ObjectKey,
    mut value: Value,
) -> Value {
    inner.last_version += 1;
    set_meta(
        &mut value,
        "resourceVersion",
        Value::String(inner.last_version.to_string()),
    );

    let finalizers_empty = value["metadata"]
        .get("finalizers")
        .and_then(Value::as_array)
        .map(|f| f.is_empty())
        .unwrap_or(true);
    let deleting = value["metadata"].get("deletionTimestamp").is_some();

    let removed = deleting && finalizers_empty;
    if removed {
        inner.objects.remove(&key);
        debug!(object = %key, "object removed");
    } else {
        inner.objects.insert(key.clone(), value.clone());
    }
    // No subscribers is fine.
    let _ = changes.send(Change { key, removed });
    value
}

fn set_meta(value: &mut Value, field: &str, v: Value) {
    value["metadata"][field] = v;
}

fn remove_meta(value: &mut Value, field: &str) {
    if let Some(meta) = value["metadata"].as_object_mut() {
        meta.remove(field);
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        self.get(&ObjectKey::new(Kind::Cluster, namespace, name))
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>> {
        self.get(&ObjectKey::new(Kind::Machine, namespace, name))
    }

    async fn get_minikube_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MinikubeCluster>> {
        self.get(&ObjectKey::new(Kind::MinikubeCluster, namespace, name))
    }

    async fn get_minikube_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MinikubeMachine>> {
        self.get(&ObjectKey::new(Kind::MinikubeMachine, namespace, name))
    }

    async fn replace_minikube_cluster(&self, obj: &MinikubeCluster) -> Result<MinikubeCluster> {
        self.replace(obj, false)
    }

    async fn replace_minikube_cluster_status(
        &self,
        obj: &MinikubeCluster,
    ) -> Result<MinikubeCluster> {
        self.replace(obj, true)
    }

    async fn replace_minikube_machine(&self, obj: &MinikubeMachine) -> Result<MinikubeMachine> {
        self.replace(obj, false)
    }

    async fn replace_minikube_machine_status(
        &self,
        obj: &MinikubeMachine,
    ) -> Result<MinikubeMachine> {
        self.replace(obj, true)
    }
}
