//! Kubernetes API server backed store

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use super::ResourceStore;
use crate::crd::{Cluster, Machine, MinikubeCluster, MinikubeMachine};
use crate::registry::Kind;
use crate::{Error, Result};

/// [`ResourceStore`] over the Kubernetes API
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new KubeStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn replace<K>(&self, kind: Kind, obj: &K) -> Result<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + Debug,
    {
        let (namespace, name) = identity(kind, obj)?;
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| write_error(kind, &namespace, &name, e))
    }

    async fn replace_status<K>(&self, kind: Kind, obj: &K) -> Result<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + Debug,
    {
        let (namespace, name) = identity(kind, obj)?;
        let data = serde_json::to_vec(obj)
            .map_err(|e| Error::serialization_for_kind(kind.kind_str(), e.to_string()))?;
        self.api::<K>(&namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| write_error(kind, &namespace, &name, e))
    }
}

fn identity<K: Resource>(kind: Kind, obj: &K) -> Result<(String, String)> {
    let name = obj.meta().name.clone().unwrap_or_default();
    let namespace = obj.namespace().unwrap_or_default();
    if name.is_empty() || namespace.is_empty() {
        return Err(Error::validation_for(
            kind.kind_str(),
            "object must have metadata.name and metadata.namespace",
        ));
    }
    Ok((namespace, name))
}

/// Translate optimistic-concurrency and missing-object responses
fn write_error(kind: Kind, namespace: &str, name: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::conflict(kind.kind_str(), format!("{namespace}/{name}"))
        }
        kube::Error::Api(ae) if ae.code == 404 => {
            Error::not_found(kind.kind_str(), format!("{namespace}/{name}"))
        }
        _ => err.into(),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        self.get(namespace, name).await
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>> {
        self.get(namespace, name).await
    }

    async fn get_minikube_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MinikubeCluster>> {
        self.get(namespace, name).await
    }

    async fn get_minikube_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MinikubeMachine>> {
        self.get(namespace, name).await
    }

    async fn replace_minikube_cluster(&self, obj: &MinikubeCluster) -> Result<MinikubeCluster> {
        self.replace(Kind::MinikubeCluster, obj).await
    }

    async fn replace_minikube_cluster_status(
        &self,
        obj: &MinikubeCluster,
    ) -> Result<MinikubeCluster> {
        self.replace_status(Kind::MinikubeCluster, obj).await
    }

    async fn replace_minikube_machine(&self, obj: &MinikubeMachine) -> Result<MinikubeMachine> {
        self.replace(Kind::MinikubeMachine, obj).await
    }

    async fn replace_minikube_machine_status(
        &self,
        obj: &MinikubeMachine,
    ) -> Result<MinikubeMachine> {
        self.replace_status(Kind::MinikubeMachine, obj).await
    }
}
