//! Cluster API owner types
//!
//! Only the fields the infrastructure controllers read are modelled; every
//! other field of the upstream `Cluster` and `Machine` kinds is ignored on
//! decode. These kinds are owned by Cluster API, so no CRD is generated for
//! them.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ObjectReference;

/// API group of the Cluster API core kinds
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// Label naming the Cluster a Machine belongs to
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Annotation that pauses reconciliation of the annotated object
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Cluster API `Cluster` spec (subset)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    plural = "clusters",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Suspends reconciliation of the cluster and all its dependents
    #[serde(default)]
    pub paused: bool,

    /// Reference to the infrastructure object (a MinikubeCluster)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

/// Cluster API `Machine` spec (subset)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the owning Cluster
    #[serde(default)]
    pub cluster_name: String,

    /// Reference to the infrastructure object (a MinikubeMachine)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    /// Kubernetes version requested for the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Machine {
    /// Name of the owning Cluster: the cluster-name label, else `spec.clusterName`
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CLUSTER_NAME_LABEL))
            .map(String::as_str)
            .filter(|n| !n.is_empty())
            .or_else(|| Some(self.spec.cluster_name.as_str()).filter(|n| !n.is_empty()))
    }
}

/// Find the Cluster API owner of the given kind in an object's owner references
pub fn capi_owner<'a>(meta: &'a ObjectMeta, kind: &str) -> Option<&'a OwnerReference> {
    meta.owner_references.as_ref()?.iter().find(|r| {
        r.kind == kind
            && r
                .api_version
                .split_once('/')
                .map(|(group, _)| group == CAPI_GROUP)
                .unwrap_or(false)
    })
}

/// True if the object carries the paused annotation
pub fn has_paused_annotation(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .map(|a| a.contains_key(PAUSED_ANNOTATION))
        .unwrap_or(false)
}

/// Reconciliation is paused if the owning Cluster is paused or the object is annotated
pub fn is_paused(cluster: &Cluster, meta: &ObjectMeta) -> bool {
    cluster.spec.paused || has_paused_annotation(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn owner(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            ..Default::default()
        }
    }

    #[test]
    fn test_capi_owner_matches_group_and_kind() {
        let meta = ObjectMeta {
            owner_references: Some(vec![
                owner("apps/v1", "Cluster", "not-capi"),
                owner("cluster.x-k8s.io/v1beta1", "Machine", "m1"),
                owner("cluster.x-k8s.io/v1beta1", "Cluster", "c1"),
            ]),
            ..Default::default()
        };

        assert_eq!(capi_owner(&meta, "Cluster").map(|o| o.name.as_str()), Some("c1"));
        assert_eq!(capi_owner(&meta, "Machine").map(|o| o.name.as_str()), Some("m1"));
        assert!(capi_owner(&ObjectMeta::default(), "Cluster").is_none());
    }

    #[test]
    fn test_machine_cluster_name_prefers_label() {
        let mut machine = Machine::new(
            "m1",
            MachineSpec {
                cluster_name: "from-spec".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(machine.cluster_name(), Some("from-spec"));

        machine.metadata.labels = Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            "from-label".to_string(),
        )]));
        assert_eq!(machine.cluster_name(), Some("from-label"));

        let machine = Machine::new("m2", MachineSpec::default());
        assert_eq!(machine.cluster_name(), None);
    }

    #[test]
    fn test_pause_from_cluster_or_annotation() {
        let running = Cluster::new("c1", ClusterSpec::default());
        let paused = Cluster::new(
            "c1",
            ClusterSpec {
                paused: true,
                ..Default::default()
            },
        );
        let annotated = ObjectMeta {
            annotations: Some(BTreeMap::from([(
                PAUSED_ANNOTATION.to_string(),
                String::new(),
            )])),
            ..Default::default()
        };

        assert!(!is_paused(&running, &ObjectMeta::default()));
        assert!(is_paused(&paused, &ObjectMeta::default()));
        assert!(is_paused(&running, &annotated));
    }

    #[test]
    fn test_decodes_upstream_cluster_ignoring_unknown_fields() {
        let json = serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": { "name": "c1", "namespace": "default" },
            "spec": {
                "clusterNetwork": { "pods": { "cidrBlocks": ["10.244.0.0/16"] } },
                "infrastructureRef": {
                    "apiVersion": "infrastructure.cluster.x-k8s.io/v1alpha1",
                    "kind": "MinikubeCluster",
                    "name": "c1-infra"
                }
            }
        });
        let cluster: Cluster = serde_json::from_value(json).unwrap();
        assert!(!cluster.spec.paused);
        assert_eq!(
            cluster.spec.infrastructure_ref.map(|r| r.name),
            Some("c1-infra".to_string())
        );
    }
}
