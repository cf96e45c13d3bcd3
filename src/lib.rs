//! capmk - Cluster API infrastructure provider backed by minikube profiles
//!
//! Users declare `MinikubeCluster` and `MinikubeMachine` objects next to their
//! Cluster API `Cluster` and `Machine`; the provider converges them onto nodes
//! of a minikube profile through an external node provisioner.
//!
//! # Architecture
//!
//! - Watchers feed object keys into the [`scheduler`]
//! - The scheduler runs at most one reconcile per object at a time and
//!   retries failures with backoff
//! - The [`controller`] reconcilers read owners from the [`store`], call the
//!   [`provisioner`] and write status back through an optimistic patch
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (MinikubeCluster, MinikubeMachine, CAPI owners)
//! - [`registry`] - Kind table and codecs
//! - [`store`] - Resource store trait, Kubernetes and in-memory implementations, patch helper
//! - [`provisioner`] - Node provisioner trait and the bridge executable adapter
//! - [`controller`] - Cluster and machine reconciliation logic
//! - [`scheduler`] - Per-object dispatch, deduplication and backoff
//! - [`telemetry`] / [`metrics`] - Tracing, OpenTelemetry setup and the Prometheus endpoint
//! - [`health`] - Liveness and readiness probes
//! - [`error`] - Error types for the provider

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod health;
pub mod metrics;
pub mod provisioner;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Finalizer guarding MinikubeCluster removal
pub const CLUSTER_FINALIZER: &str = "minikubecluster.infrastructure.cluster.x-k8s.io";

/// Finalizer guarding MinikubeMachine removal
pub const MACHINE_FINALIZER: &str = "minikubemachine.infrastructure.cluster.x-k8s.io";

/// Default minikube storage directory
pub const DEFAULT_STORAGE_PATH: &str = "/var/lib/minikube";

/// Default minikube profile
pub const DEFAULT_PROFILE: &str = "minikube";

/// Default address for the Prometheus metrics endpoint
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

/// Default address for the health probe server
pub const DEFAULT_HEALTH_PROBE_ADDR: &str = "0.0.0.0:8081";

/// Provider ID scheme produced by the bundled provisioner
pub const PROVIDER_ID_SCHEME: &str = "minikube://";
