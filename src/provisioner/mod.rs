//! Node provisioner abstraction
//!
//! The provisioner owns the actual nodes of a minikube profile. Reconcilers
//! only talk to it through [`NodeProvisioner`]; the bundled implementation is
//! [`ExecProvisioner`], which drives an external bridge executable.

mod exec;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::{Result, PROVIDER_ID_SCHEME};

pub use exec::{ExecProvisioner, DEFAULT_BRIDGE_BIN};

/// Prefix of canonical node names (`node-<ordinal>`)
pub const NODE_NAME_PREFIX: &str = "node-";

/// One node of a profile
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeRef {
    /// Node name
    pub name: String,
    /// Node IP address
    #[serde(default)]
    pub address: String,
}

/// Current configuration of a profile
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    /// Nodes in creation order
    #[serde(default)]
    pub nodes: Vec<NodeRef>,
    /// Port the API server listens on
    #[serde(default)]
    pub api_server_port: i32,
    /// Kubernetes version of the profile
    #[serde(default)]
    pub kubernetes_version: String,
}

impl ProfileConfig {
    /// Address of the first node with a non-empty address
    pub fn first_node_address(&self) -> Option<&str> {
        self.nodes
            .first()
            .map(|n| n.address.as_str())
            .filter(|a| !a.is_empty())
    }

    /// True if a node with this name exists
    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }
}

/// Request to add one node to a profile
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSpec {
    /// Node name
    pub name: String,
    /// Whether the node schedules workloads
    pub worker: bool,
    /// Whether the node runs a control-plane instance
    pub control_plane: bool,
    /// Kubernetes version, inherited from the profile
    pub kubernetes_version: String,
}

/// Live state of one node
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Provider identifier
    #[serde(default, rename = "providerID")]
    pub provider_id: String,
    /// Node IP address
    #[serde(default)]
    pub address: String,
    /// Whether the node is running
    #[serde(default)]
    pub running: bool,
}

/// Operations over the nodes of a profile
///
/// Failures are [`Error::Provisioner`](crate::Error::Provisioner) values
/// whose kind tells `NotFound`, `Unavailable` and `Provision` apart.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Read the profile's node list, API server port and Kubernetes version
    async fn get_profile_config(&self, profile: &str) -> Result<ProfileConfig>;

    /// Add a node to the profile
    async fn add_node(&self, profile: &str, spec: &NodeSpec, delete_on_failure: bool)
        -> Result<()>;

    /// Delete a node from the profile
    async fn delete_node(&self, profile: &str, node: &str) -> Result<()>;

    /// Describe one node
    async fn describe_node(&self, profile: &str, node: &str) -> Result<NodeInfo>;
}

/// Canonical node name for an ordinal
pub fn node_name(ordinal: u32) -> String {
    format!("{NODE_NAME_PREFIX}{ordinal}")
}

/// Ordinal of a canonical node name (`node-3` → 3)
pub fn parse_node_ordinal(name: &str) -> Option<u32> {
    name.strip_prefix(NODE_NAME_PREFIX)?.parse().ok()
}

/// Name for the next node of a profile.
///
/// The last node's ordinal plus one; if the last name does not parse, its
/// ordinal is at `u32::MAX`, or there are no nodes, the node count plus one.
pub fn next_node_name(nodes: &[NodeRef]) -> String {
    let ordinal = nodes
        .last()
        .and_then(|n| parse_node_ordinal(&n.name))
        .and_then(|last| last.checked_add(1))
        .unwrap_or_else(|| nodes.len().saturating_add(1).min(u32::MAX as usize) as u32);
    node_name(ordinal)
}

/// Provider identifier for a node (`minikube://<profile>/<node>`)
pub fn provider_id(profile: &str, node: &str) -> String {
    format!("{PROVIDER_ID_SCHEME}{profile}/{node}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeRef> {
        names
            .iter()
            .map(|n| NodeRef {
                name: n.to_string(),
                address: String::new(),
            })
            .collect()
    }

    #[test]
    fn test_next_node_name_follows_last_ordinal() {
        assert_eq!(next_node_name(&nodes(&["node-1", "node-2"])), "node-3");
        assert_eq!(next_node_name(&nodes(&["node-1", "node-7"])), "node-8");
    }

    #[test]
    fn test_next_node_name_first_node() {
        assert_eq!(next_node_name(&[]), "node-1");
    }

    #[test]
    fn test_next_node_name_falls_back_to_count() {
        assert_eq!(next_node_name(&nodes(&["node-1", "dev"])), "node-3");
        assert_eq!(next_node_name(&nodes(&["minikube"])), "node-2");
    }

    #[test]
    fn test_next_node_name_at_ordinal_limit_falls_back_to_count() {
        assert_eq!(next_node_name(&nodes(&["node-4294967295"])), "node-2");
        assert_eq!(
            next_node_name(&nodes(&["node-1", "node-4294967295"])),
            "node-3"
        );
    }

    #[test]
    fn test_parse_node_ordinal() {
        assert_eq!(parse_node_ordinal("node-12"), Some(12));
        assert_eq!(parse_node_ordinal("node-"), None);
        assert_eq!(parse_node_ordinal("node-x"), None);
        assert_eq!(parse_node_ordinal("m02"), None);
    }

    #[test]
    fn test_profile_config_decodes_bridge_output() {
        let cfg: ProfileConfig = serde_json::from_str(
            r#"{"nodes":[{"name":"node-1","address":"10.0.0.5"}],"apiServerPort":8443,"kubernetesVersion":"v1.30.0"}"#,
        )
        .unwrap();
        assert_eq!(cfg.first_node_address(), Some("10.0.0.5"));
        assert_eq!(cfg.api_server_port, 8443);
        assert!(cfg.has_node("node-1"));
        assert!(!cfg.has_node("node-2"));
    }

    #[test]
    fn test_first_node_address_ignores_empty() {
        let cfg = ProfileConfig {
            nodes: nodes(&["node-1"]),
            ..Default::default()
        };
        assert_eq!(cfg.first_node_address(), None);
    }

    #[test]
    fn test_provider_id_format() {
        assert_eq!(provider_id("dev", "node-2"), "minikube://dev/node-2");
    }
}
