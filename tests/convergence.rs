//! End-to-end convergence against the in-memory store
//!
//! Drives the scheduler, both reconcilers and the change feed of a
//! [`MemoryStore`] with a provisioner that keeps profiles in memory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use capmk::controller::{ClusterReconciler, Context, MachineReconciler};
use capmk::crd::capi::CLUSTER_NAME_LABEL;
use capmk::crd::{
    Cluster, ClusterSpec, Machine, MachinePhase, MachineSpec, MinikubeCluster,
    MinikubeClusterSpec, MinikubeMachine, MinikubeMachineSpec, ObjectReference,
};
use capmk::error::ProvisionerErrorKind;
use capmk::provisioner::{NodeInfo, NodeProvisioner, NodeRef, NodeSpec, ProfileConfig};
use capmk::registry::Kind;
use capmk::retry::RetryConfig;
use capmk::scheduler::watch::memory_events;
use capmk::scheduler::{Scheduler, SchedulerConfig};
use capmk::store::{MemoryStore, ObjectKey};
use capmk::{Error, Result};

const NS: &str = "default";

// =============================================================================
// In-memory profiles
// =============================================================================

#[derive(Default)]
struct Profiles {
    nodes: Mutex<BTreeMap<String, Vec<NodeRef>>>,
    deletes: Mutex<Vec<String>>,
}

impl Profiles {
    fn with_control_plane(profile: &str) -> Arc<Self> {
        let profiles = Self::default();
        profiles.nodes.lock().insert(
            profile.to_string(),
            vec![NodeRef {
                name: "node-1".to_string(),
                address: "192.168.49.2".to_string(),
            }],
        );
        Arc::new(profiles)
    }

    fn node_names(&self, profile: &str) -> Vec<String> {
        self.nodes
            .lock()
            .get(profile)
            .map(|nodes| nodes.iter().map(|n| n.name.clone()).collect())
            .unwrap_or_default()
    }

    fn missing(profile: &str, what: &str) -> Error {
        Error::provisioner(profile, ProvisionerErrorKind::NotFound, format!("{what} not found"))
    }
}

#[async_trait]
impl NodeProvisioner for Profiles {
    async fn get_profile_config(&self, profile: &str) -> Result<ProfileConfig> {
        let nodes = self.nodes.lock();
        let nodes = nodes
            .get(profile)
            .ok_or_else(|| Self::missing(profile, "profile"))?;
        Ok(ProfileConfig {
            nodes: nodes.clone(),
            api_server_port: 8443,
            kubernetes_version: "v1.30.0".to_string(),
        })
    }

    async fn add_node(&self, profile: &str, spec: &NodeSpec, _delete_on_failure: bool) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let nodes = nodes
            .get_mut(profile)
            .ok_or_else(|| Self::missing(profile, "profile"))?;
        if nodes.iter().any(|n| n.name == spec.name) {
            return Err(Error::provisioner(
                profile,
                ProvisionerErrorKind::Provision,
                format!("node {} already exists", spec.name),
            ));
        }
        let address = format!("192.168.49.{}", nodes.len() + 2);
        nodes.push(NodeRef {
            name: spec.name.clone(),
            address,
        });
        Ok(())
    }

    async fn delete_node(&self, profile: &str, node: &str) -> Result<()> {
        self.deletes.lock().push(format!("{profile}/{node}"));
        let mut nodes = self.nodes.lock();
        let nodes = nodes
            .get_mut(profile)
            .ok_or_else(|| Self::missing(profile, "profile"))?;
        let before = nodes.len();
        nodes.retain(|n| n.name != node);
        if nodes.len() == before {
            return Err(Self::missing(profile, "node"));
        }
        Ok(())
    }

    async fn describe_node(&self, profile: &str, node: &str) -> Result<NodeInfo> {
        let nodes = self.nodes.lock();
        let found = nodes
            .get(profile)
            .and_then(|nodes| nodes.iter().find(|n| n.name == node))
            .ok_or_else(|| Self::missing(profile, "node"))?;
        Ok(NodeInfo {
            provider_id: format!("minikube://{profile}/{node}"),
            address: found.address.clone(),
            running: true,
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    store: Arc<MemoryStore>,
    profiles: Arc<Profiles>,
    scheduler: Arc<Scheduler>,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(profiles: Arc<Profiles>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(
            Context::builder(store.clone(), profiles.clone())
                .poll_interval(Duration::from_millis(50))
                .resync_interval(Duration::from_millis(200))
                .build(),
        );
        let config = SchedulerConfig {
            reconcile_timeout: Duration::from_secs(5),
            grace: Duration::from_millis(100),
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                backoff_multiplier: 2.0,
            },
        };
        let scheduler = Arc::new(
            Scheduler::new(config)
                .register(
                    Kind::MinikubeCluster,
                    Arc::new(ClusterReconciler::new(ctx.clone())),
                )
                .register(Kind::MinikubeMachine, Arc::new(MachineReconciler::new(ctx))),
        );
        let task = tokio::spawn(scheduler.clone().run(memory_events(store.clone())));
        Self {
            store,
            profiles,
            scheduler,
            task,
        }
    }

    async fn stop(self) {
        self.scheduler.cancellation_token().cancel();
        self.task.await.unwrap();
    }

    fn cluster(&self, name: &str) -> Option<MinikubeCluster> {
        self.store
            .get(&ObjectKey::new(Kind::MinikubeCluster, NS, name))
            .unwrap()
    }

    fn machine(&self, name: &str) -> Option<MinikubeMachine> {
        self.store
            .get(&ObjectKey::new(Kind::MinikubeMachine, NS, name))
            .unwrap()
    }

    /// Create Cluster `c1` backed by MinikubeCluster `mc1`
    fn create_cluster(&self, paused: bool) {
        let mut cluster = Cluster::new(
            "c1",
            ClusterSpec {
                paused,
                infrastructure_ref: Some(reference(Kind::MinikubeCluster, "mc1")),
            },
        );
        cluster.metadata = meta("c1");
        self.store.create(&cluster).unwrap();

        let mut mc = MinikubeCluster::new("mc1", MinikubeClusterSpec::default());
        mc.metadata = meta("mc1");
        mc.metadata.owner_references = Some(vec![owner(Kind::Cluster, "c1")]);
        self.store.create(&mc).unwrap();
    }

    /// Create Machine `name` backed by MinikubeMachine `mm-<name>`
    fn create_machine(&self, name: &str, spec: MinikubeMachineSpec) {
        let infra = format!("mm-{name}");
        let mut machine = Machine::new(
            name,
            MachineSpec {
                cluster_name: "c1".to_string(),
                infrastructure_ref: Some(reference(Kind::MinikubeMachine, &infra)),
                version: None,
            },
        );
        machine.metadata = meta(name);
        self.store.create(&machine).unwrap();

        let mut mm = MinikubeMachine::new(&infra, spec);
        mm.metadata = meta(&infra);
        mm.metadata.owner_references = Some(vec![owner(Kind::Machine, name)]);
        mm.metadata.labels = Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            "c1".to_string(),
        )]));
        self.store.create(&mm).unwrap();
    }
}

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NS.to_string()),
        ..Default::default()
    }
}

fn owner(kind: Kind, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: kind.api_version(),
        kind: kind.kind_str().to_string(),
        name: name.to_string(),
        uid: format!("{name}-uid"),
        controller: Some(true),
        ..Default::default()
    }
}

fn reference(kind: Kind, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: kind.api_version(),
        kind: kind.kind_str().to_string(),
        name: name.to_string(),
        namespace: None,
    }
}

/// Poll until `check` holds or fail after a few seconds
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn is_provisioned(mm: &MinikubeMachine) -> bool {
    mm.status
        .as_ref()
        .map(|s| s.phase == Some(MachinePhase::Provisioned) && s.ready)
        .unwrap_or(false)
}

// =============================================================================
// Stories
// =============================================================================

/// Story: a cluster with one machine converges, then both are deleted;
/// the machine's node is removed while the profile itself survives
#[tokio::test]
async fn story_cluster_and_machine_lifecycle() {
    let h = Harness::start(Profiles::with_control_plane("c1"));
    h.create_cluster(false);
    h.create_machine("m1", MinikubeMachineSpec::default());

    eventually("cluster ready", || {
        h.cluster("mc1")
            .and_then(|c| c.status)
            .map(|s| s.ready)
            .unwrap_or(false)
    })
    .await;
    let mc = h.cluster("mc1").unwrap();
    assert_eq!(mc.spec.control_plane_endpoint.to_string(), "192.168.49.2:8443");

    eventually("machine provisioned", || {
        h.machine("mm-m1").map(|m| is_provisioned(&m)).unwrap_or(false)
    })
    .await;
    let mm = h.machine("mm-m1").unwrap();
    assert_eq!(mm.spec.node_name.as_deref(), Some("node-2"));
    assert_eq!(mm.spec.provider_id.as_deref(), Some("minikube://c1/node-2"));
    assert_eq!(h.profiles.node_names("c1"), vec!["node-1", "node-2"]);

    h.store
        .request_delete(Kind::MinikubeMachine, NS, "mm-m1")
        .unwrap();
    eventually("machine removed", || h.machine("mm-m1").is_none()).await;
    assert_eq!(h.profiles.node_names("c1"), vec!["node-1"]);

    h.store
        .request_delete(Kind::MinikubeCluster, NS, "mc1")
        .unwrap();
    eventually("cluster removed", || h.cluster("mc1").is_none()).await;
    assert_eq!(h.profiles.node_names("c1"), vec!["node-1"]);
    assert_eq!(h.profiles.deletes.lock().clone(), vec!["c1/node-2".to_string()]);

    h.stop().await;
}

/// Story: machines created together get distinct, consecutive node names
#[tokio::test]
async fn story_concurrent_machines_get_distinct_names() {
    let h = Harness::start(Profiles::with_control_plane("c1"));
    h.create_cluster(false);
    for name in ["m1", "m2", "m3"] {
        h.create_machine(name, MinikubeMachineSpec::default());
    }

    eventually("all machines provisioned", || {
        ["mm-m1", "mm-m2", "mm-m3"]
            .iter()
            .all(|n| h.machine(n).map(|m| is_provisioned(&m)).unwrap_or(false))
    })
    .await;

    let mut names: Vec<String> = ["mm-m1", "mm-m2", "mm-m3"]
        .iter()
        .filter_map(|n| h.machine(n).and_then(|m| m.spec.node_name))
        .collect();
    names.sort();
    assert_eq!(names, vec!["node-2", "node-3", "node-4"]);
    assert_eq!(h.profiles.node_names("c1").len(), 4);

    h.stop().await;
}

/// Story: nothing happens while the Cluster is paused; unpausing it
/// provisions the waiting machine
#[tokio::test]
async fn story_unpausing_resumes_provisioning() {
    let h = Harness::start(Profiles::with_control_plane("c1"));
    h.create_cluster(true);
    h.create_machine("m1", MinikubeMachineSpec::default());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mm = h.machine("mm-m1").unwrap();
    assert!(mm.metadata.finalizers.unwrap_or_default().is_empty());
    assert_eq!(h.profiles.node_names("c1"), vec!["node-1"]);

    let mut cluster: Cluster = h
        .store
        .get(&ObjectKey::new(Kind::Cluster, NS, "c1"))
        .unwrap()
        .unwrap();
    cluster.spec.paused = false;
    h.store.apply(&cluster).unwrap();

    eventually("machine provisioned after unpause", || {
        h.machine("mm-m1").map(|m| is_provisioned(&m)).unwrap_or(false)
    })
    .await;

    h.stop().await;
}

/// Story: a machine whose profile does not exist yet is marked Failed and
/// recovers once the profile appears
#[tokio::test]
async fn story_missing_profile_recovers() {
    let h = Harness::start(Arc::new(Profiles::default()));
    h.create_cluster(false);
    h.create_machine("m1", MinikubeMachineSpec::default());

    eventually("machine failed", || {
        h.machine("mm-m1")
            .and_then(|m| m.status)
            .map(|s| s.phase == Some(MachinePhase::Failed))
            .unwrap_or(false)
    })
    .await;

    h.profiles.nodes.lock().insert(
        "c1".to_string(),
        vec![NodeRef {
            name: "node-1".to_string(),
            address: "192.168.49.2".to_string(),
        }],
    );

    eventually("machine provisioned after profile appears", || {
        h.machine("mm-m1").map(|m| is_provisioned(&m)).unwrap_or(false)
    })
    .await;
    let status = h.machine("mm-m1").unwrap().status.unwrap();
    assert_eq!(status.failure_reason, None);

    h.stop().await;
}
