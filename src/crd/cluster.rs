//! MinikubeCluster Custom Resource Definition
//!
//! The MinikubeCluster CRD is the infrastructure object behind a Cluster API
//! `Cluster`. It names the minikube profile backing the cluster and publishes
//! the control-plane endpoint derived from that profile.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, ApiEndpoint, Condition, FailureReason};

/// Specification for a MinikubeCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "MinikubeCluster",
    plural = "minikubeclusters",
    shortname = "mkc",
    status = "MinikubeClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Profile","type":"string","jsonPath":".spec.profileName"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MinikubeClusterSpec {
    /// Minikube profile backing this cluster (defaults to the owning Cluster's name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,

    /// Endpoint used to reach the control plane; set once by the controller
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// VM or container driver (e.g., docker, kvm2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    /// Container runtime (e.g., containerd, cri-o)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<String>,

    /// CNI plugin (e.g., calico, cilium)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_plugin: Option<String>,
}

impl MinikubeClusterSpec {
    /// Effective profile name: explicit value, else the owning Cluster's name
    pub fn effective_profile<'a>(&'a self, owner_name: &'a str) -> &'a str {
        match self.profile_name.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => owner_name,
        }
    }
}

/// Status for a MinikubeCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MinikubeClusterStatus {
    /// True once the control-plane endpoint is known
    #[serde(default)]
    pub ready: bool,

    /// Machine-readable failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,

    /// Human-readable failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl MinikubeClusterStatus {
    /// Set readiness and return self for chaining
    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Record a failure and return self for chaining
    pub fn failure(mut self, reason: FailureReason, message: impl Into<String>) -> Self {
        self.failure_reason = Some(reason);
        self.failure_message = Some(message.into());
        self
    }

    /// Clear failure fields and return self for chaining
    pub fn clear_failure(mut self) -> Self {
        self.failure_reason = None;
        self.failure_message = None;
        self
    }

    /// Add or replace a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }
}
