//! MinikubeMachine and MinikubeMachineTemplate Custom Resource Definitions
//!
//! A MinikubeMachine is the infrastructure object behind a Cluster API
//! `Machine`: one node in the owning cluster's minikube profile.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, Condition, FailureReason, MachineAddress, MachinePhase};

/// Specification for a MinikubeMachine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "MinikubeMachine",
    plural = "minikubemachines",
    shortname = "mkm",
    status = "MinikubeMachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MinikubeMachineSpec {
    /// Provider identifier, set once the node exists
    #[serde(
        default,
        rename = "providerID",
        skip_serializing_if = "Option::is_none"
    )]
    pub provider_id: Option<String>,

    /// Node name within the profile; generated when not supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Whether the node runs a control-plane instance
    #[serde(default)]
    pub control_plane: bool,

    /// Whether the node schedules workloads (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<bool>,

    /// Number of CPUs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<i32>,

    /// Memory in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i32>,

    /// Disk size in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<i32>,

    /// Free-form options passed through to the provisioner
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_options: BTreeMap<String, String>,
}

impl MinikubeMachineSpec {
    /// Provider ID if set and non-empty
    pub fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Node name if set and non-empty
    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref().filter(|n| !n.is_empty())
    }

    /// Effective worker flag
    pub fn is_worker(&self) -> bool {
        self.worker.unwrap_or(true)
    }
}

/// Status for a MinikubeMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MinikubeMachineStatus {
    /// True when the node is running
    #[serde(default)]
    pub ready: bool,

    /// Addresses of the node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Coarse lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,

    /// Machine-readable failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,

    /// Human-readable failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Conditions representing the machine state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl MinikubeMachineStatus {
    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: MachinePhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Set readiness and return self for chaining
    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Replace addresses and return self for chaining
    pub fn addresses(mut self, addresses: Vec<MachineAddress>) -> Self {
        self.addresses = addresses;
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

/// Machine template wrapper used by MachineDeployments
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MinikubeMachineTemplateResource {
    /// Spec stamped onto every MinikubeMachine created from the template
    pub spec: MinikubeMachineSpec,
}

/// Specification for a MinikubeMachineTemplate
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "MinikubeMachineTemplate",
    plural = "minikubemachinetemplates",
    namespaced
)]
pub struct MinikubeMachineTemplateSpec {
    /// Template for new MinikubeMachines
    pub template: MinikubeMachineTemplateResource,
}
