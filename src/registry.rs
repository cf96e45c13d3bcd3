//! Kind registry
//!
//! Maps every object kind the provider understands to its codec. The table is
//! built once on first use; there is no dynamic registration.

use std::collections::HashMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::crd::{Cluster, Machine, MinikubeCluster, MinikubeMachine, MinikubeMachineTemplate};
use crate::{Error, Result};

/// Object kinds handled by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    /// MinikubeCluster (infrastructure.cluster.x-k8s.io)
    MinikubeCluster,
    /// MinikubeMachine (infrastructure.cluster.x-k8s.io)
    MinikubeMachine,
    /// MinikubeMachineTemplate (infrastructure.cluster.x-k8s.io)
    MinikubeMachineTemplate,
    /// Cluster (cluster.x-k8s.io)
    Cluster,
    /// Machine (cluster.x-k8s.io)
    Machine,
}

/// All Kind variants for iteration.
pub const ALL_KINDS: &[Kind] = &[
    Kind::MinikubeCluster,
    Kind::MinikubeMachine,
    Kind::MinikubeMachineTemplate,
    Kind::Cluster,
    Kind::Machine,
];

impl Kind {
    /// API group
    pub fn group(&self) -> &'static str {
        match self {
            Self::MinikubeCluster | Self::MinikubeMachine | Self::MinikubeMachineTemplate => {
                "infrastructure.cluster.x-k8s.io"
            }
            Self::Cluster | Self::Machine => "cluster.x-k8s.io",
        }
    }

    /// API version within the group
    pub fn version(&self) -> &'static str {
        match self {
            Self::MinikubeCluster | Self::MinikubeMachine | Self::MinikubeMachineTemplate => {
                "v1alpha1"
            }
            Self::Cluster | Self::Machine => "v1beta1",
        }
    }

    /// Kubernetes Kind string
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::MinikubeCluster => "MinikubeCluster",
            Self::MinikubeMachine => "MinikubeMachine",
            Self::MinikubeMachineTemplate => "MinikubeMachineTemplate",
            Self::Cluster => "Cluster",
            Self::Machine => "Machine",
        }
    }

    /// Plural resource name
    pub fn plural(&self) -> &'static str {
        match self {
            Self::MinikubeCluster => "minikubeclusters",
            Self::MinikubeMachine => "minikubemachines",
            Self::MinikubeMachineTemplate => "minikubemachinetemplates",
            Self::Cluster => "clusters",
            Self::Machine => "machines",
        }
    }

    /// `group/version` string
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group(), self.version())
    }

    /// True for kinds this provider serves (and ships a CRD for)
    pub fn is_served(&self) -> bool {
        matches!(
            self,
            Self::MinikubeCluster | Self::MinikubeMachine | Self::MinikubeMachineTemplate
        )
    }

    /// Look up a kind from an object's `apiVersion` and `kind`
    pub fn from_type_meta(api_version: &str, kind: &str) -> Option<Self> {
        let group = api_version.split_once('/').map(|(g, _)| g)?;
        ALL_KINDS
            .iter()
            .copied()
            .find(|k| k.group() == group && k.kind_str() == kind)
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind_str())
    }
}

/// Serialization entry points for one kind
pub struct KindCodec {
    kind: Kind,
    normalize: fn(Kind, Value) -> Result<Value>,
    crd: Option<fn() -> CustomResourceDefinition>,
}

impl KindCodec {
    /// Kind this codec handles
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Decode a JSON object into the concrete type
    pub fn decode<K: DeserializeOwned>(&self, value: Value) -> Result<K> {
        serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(self.kind.kind_str(), e.to_string()))
    }

    /// Encode a concrete object as JSON
    pub fn encode<K: Serialize>(&self, obj: &K) -> Result<Value> {
        serde_json::to_value(obj)
            .map_err(|e| Error::serialization_for_kind(self.kind.kind_str(), e.to_string()))
    }

    /// Round-trip a JSON object through the concrete type.
    ///
    /// Rejects malformed input and drops fields the type does not model.
    pub fn normalize(&self, value: Value) -> Result<Value> {
        (self.normalize)(self.kind, value)
    }

    /// CRD manifest for served kinds
    pub fn crd(&self) -> Option<CustomResourceDefinition> {
        self.crd.map(|f| f())
    }
}

fn normalize_as<K: Serialize + DeserializeOwned>(kind: Kind, value: Value) -> Result<Value> {
    let obj: K = serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(kind.kind_str(), e.to_string()))?;
    serde_json::to_value(&obj)
        .map_err(|e| Error::serialization_for_kind(kind.kind_str(), e.to_string()))
}

static REGISTRY: Lazy<HashMap<Kind, KindCodec>> = Lazy::new(|| {
    let entries = [
        KindCodec {
            kind: Kind::MinikubeCluster,
            normalize: normalize_as::<MinikubeCluster>,
            crd: Some(MinikubeCluster::crd),
        },
        KindCodec {
            kind: Kind::MinikubeMachine,
            normalize: normalize_as::<MinikubeMachine>,
            crd: Some(MinikubeMachine::crd),
        },
        KindCodec {
            kind: Kind::MinikubeMachineTemplate,
            normalize: normalize_as::<MinikubeMachineTemplate>,
            crd: Some(MinikubeMachineTemplate::crd),
        },
        KindCodec {
            kind: Kind::Cluster,
            normalize: normalize_as::<Cluster>,
            crd: None,
        },
        KindCodec {
            kind: Kind::Machine,
            normalize: normalize_as::<Machine>,
            crd: None,
        },
    ];
    entries.into_iter().map(|c| (c.kind, c)).collect()
});

/// Codec for a kind
pub fn codec(kind: Kind) -> &'static KindCodec {
    // Every Kind variant is inserted above.
    &REGISTRY[&kind]
}

/// Multi-document YAML of every CRD this provider serves
pub fn crd_manifests() -> Result<String> {
    let mut docs = Vec::new();
    for kind in ALL_KINDS {
        if let Some(crd) = codec(*kind).crd() {
            let yaml = serde_yaml::to_string(&crd).map_err(|e| {
                Error::serialization_for_kind(kind.kind_str(), e.to_string())
            })?;
            docs.push(yaml);
        }
    }
    Ok(docs.join("---\n"))
}
