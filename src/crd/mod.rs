//! Custom Resource Definitions for the minikube infrastructure provider
//!
//! `MinikubeCluster`, `MinikubeMachine` and `MinikubeMachineTemplate` are
//! served by this provider. `Cluster` and `Machine` belong to Cluster API and
//! are only read.

pub mod capi;
mod cluster;
mod machine;
mod types;

pub use capi::{Cluster, ClusterSpec, Machine, MachineSpec};
pub use cluster::{MinikubeCluster, MinikubeClusterSpec, MinikubeClusterStatus};
pub use machine::{
    MinikubeMachine, MinikubeMachineSpec, MinikubeMachineStatus, MinikubeMachineTemplate,
    MinikubeMachineTemplateResource, MinikubeMachineTemplateSpec,
};
pub use types::{
    find_condition, set_condition, AddressType, ApiEndpoint, Condition, ConditionStatus,
    FailureReason, MachineAddress, MachinePhase, ObjectReference,
};
