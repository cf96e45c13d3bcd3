//! Resource store access
//!
//! The [`ResourceStore`] trait is the only way reconcilers read and write
//! objects. [`KubeStore`] talks to the Kubernetes API server, [`MemoryStore`]
//! keeps everything in process. Writes are guarded by `resourceVersion`; a
//! stale write fails with [`Error::Conflict`](crate::Error::Conflict).

mod kubernetes;
mod memory;
mod patch;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Cluster, Machine, MinikubeCluster, MinikubeMachine};
use crate::registry::Kind;
use crate::Result;

pub use kubernetes::KubeStore;
pub use memory::{Change, MemoryStore};
pub use patch::{InfraObject, PatchHelper};

/// Identity of one object: kind plus namespaced name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object kind
    pub kind: Kind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Create a key
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// `namespace/name`
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Typed access to the objects the reconcilers work with
///
/// Getters return `Ok(None)` for absent objects. Replace calls send the whole
/// object and are rejected with a conflict if its `resourceVersion` is stale.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a Cluster API Cluster
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    /// Get a Cluster API Machine
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>>;

    /// Get a MinikubeCluster
    async fn get_minikube_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MinikubeCluster>>;

    /// Get a MinikubeMachine
    async fn get_minikube_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MinikubeMachine>>;

    /// Replace metadata and spec of a MinikubeCluster (status is ignored)
    async fn replace_minikube_cluster(&self, obj: &MinikubeCluster) -> Result<MinikubeCluster>;

    /// Replace the status subresource of a MinikubeCluster
    async fn replace_minikube_cluster_status(
        &self,
        obj: &MinikubeCluster,
    ) -> Result<MinikubeCluster>;

    /// Replace metadata and spec of a MinikubeMachine (status is ignored)
    async fn replace_minikube_machine(&self, obj: &MinikubeMachine) -> Result<MinikubeMachine>;

    /// Replace the status subresource of a MinikubeMachine
    async fn replace_minikube_machine_status(
        &self,
        obj: &MinikubeMachine,
    ) -> Result<MinikubeMachine>;
}
