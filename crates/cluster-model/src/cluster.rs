//! Cluster (desired state)
//!
//! The declared cluster configuration. Administrators write it through the
//! KV gateway; the controller only reads it. Every write bumps the KV
//! revision, which serves as the document's `RevisionID`.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Declared cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster name
    pub name: String,

    /// Hosts that make up the cluster
    pub nodes: Vec<Node>,

    /// CIDR for Kubernetes service IPs
    pub service_subnet: String,

    /// CIDR for pod IPs
    pub pod_subnet: String,

    /// DNS servers handed to kubelet
    #[serde(default)]
    pub dns_servers: Vec<String>,

    /// Per-component options
    #[serde(default)]
    pub options: Options,

    /// Certificate lifetimes
    #[serde(default)]
    pub tls: TlsOptions,
}

/// A host managed by the controller. `address` is the node identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// IP address or resolvable name; unique within a cluster
    pub address: String,

    /// Host name registered with Kubernetes (defaults to the address)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// SSH user
    #[serde(default = "default_user")]
    pub user: String,

    /// Whether the node runs etcd and the Kubernetes control plane
    #[serde(default)]
    pub control_plane: bool,

    /// Kubernetes node labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Free-form annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

fn default_user() -> String {
    "cke".to_string()
}

impl Node {
    /// Create a node with default user and no labels
    pub fn new(address: impl Into<String>, control_plane: bool) -> Self {
        Self {
            address: address.into(),
            hostname: None,
            user: default_user(),
            control_plane,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Name the node registers under in Kubernetes
    pub fn node_name(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.address)
    }
}

/// Extra parameters for a containerised component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParams {
    /// Additional command-line arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,

    /// Additional host bind mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_binds: Vec<BindMount>,

    /// Additional environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_env: BTreeMap<String, String>,
}

/// Host path bound into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Host path
    pub source: String,

    /// Path inside the container
    pub destination: String,

    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

/// kubelet parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeletParams {
    /// Common service parameters
    #[serde(flatten)]
    pub service: ServiceParams,

    /// Cluster DNS domain
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Allow kubelet to run with swap enabled
    #[serde(default)]
    pub allow_swap: bool,
}

fn default_domain() -> String {
    "cluster.local".to_string()
}

impl Default for KubeletParams {
    fn default() -> Self {
        Self {
            service: ServiceParams::default(),
            domain: default_domain(),
            allow_swap: false,
        }
    }
}

/// Options for each control-plane and node component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// etcd
    #[serde(default)]
    pub etcd: ServiceParams,

    /// kube-apiserver
    #[serde(default)]
    pub kube_api: ServiceParams,

    /// kube-controller-manager
    #[serde(default)]
    pub kube_controller_manager: ServiceParams,

    /// kube-scheduler
    #[serde(default)]
    pub kube_scheduler: ServiceParams,

    /// kube-proxy
    #[serde(default)]
    pub kube_proxy: ServiceParams,

    /// kubelet
    #[serde(default)]
    pub kubelet: KubeletParams,
}

/// Certificate lifetimes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Validity of each certificate authority
    #[serde(with = "crate::duration", default = "default_ca_validity")]
    pub ca_validity: Duration,

    /// Validity of issued leaf certificates
    #[serde(with = "crate::duration", default = "default_validity")]
    pub validity: Duration,

    /// Re-issue a certificate once its remaining lifetime is within this window
    #[serde(with = "crate::duration", default = "default_renewal_window")]
    pub renewal_window: Duration,
}

fn default_ca_validity() -> Duration {
    Duration::from_secs(10 * 365 * 24 * 3600)
}

fn default_validity() -> Duration {
    Duration::from_secs(365 * 24 * 3600)
}

fn default_renewal_window() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            ca_validity: default_ca_validity(),
            validity: default_validity(),
            renewal_window: default_renewal_window(),
        }
    }
}

impl Cluster {
    /// Parse a cluster document from YAML (JSON is accepted too)
    pub fn from_yaml(data: &str) -> Result<Self, ModelError> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String, ModelError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the structural invariants of the document.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::Validation("cluster name is empty".to_string()));
        }
        if self.service_subnet.trim().is_empty() || self.pod_subnet.trim().is_empty() {
            return Err(ModelError::Validation(
                "service_subnet and pod_subnet are required".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if node.address.trim().is_empty() {
                return Err(ModelError::Validation("node address is empty".to_string()));
            }
            if !seen.insert(node.address.as_str()) {
                return Err(ModelError::Validation(format!(
                    "duplicate node address: {}",
                    node.address
                )));
            }
        }

        if !self.nodes.iter().any(|n| n.control_plane) {
            return Err(ModelError::Validation(
                "at least one control-plane node is required".to_string(),
            ));
        }

        if self.tls.renewal_window >= self.tls.validity {
            return Err(ModelError::Validation(
                "tls.renewal_window must be shorter than tls.validity".to_string(),
            ));
        }

        Ok(())
    }

    /// Look up a node by address
    pub fn node(&self, address: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.address == address)
    }

    /// All nodes ordered by address
    pub fn sorted_nodes(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.iter().collect();
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        nodes
    }

    /// Control-plane nodes ordered by address
    pub fn control_planes(&self) -> Vec<&Node> {
        self.sorted_nodes()
            .into_iter()
            .filter(|n| n.control_plane)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_YAML: &str = r#"
name: tokyo
service_subnet: 10.68.0.0/16
pod_subnet: 10.64.0.0/14
dns_servers: ["10.0.0.53"]
nodes:
  - address: 10.0.0.1
    control_plane: true
  - address: 10.0.0.2
    control_plane: true
    labels:
      rack: "2"
  - address: 10.0.0.11
    user: admin
options:
  kubelet:
    extra_args: ["--max-pods=200"]
    domain: tokyo.local
tls:
  validity: 24h
  renewal_window: 1h
"#;

    #[test]
    fn test_parse_applies_defaults() {
        let cluster = Cluster::from_yaml(CLUSTER_YAML).unwrap();
        assert_eq!(cluster.nodes[0].user, "cke");
        assert_eq!(cluster.nodes[2].user, "admin");
        assert_eq!(cluster.options.kubelet.domain, "tokyo.local");
        assert_eq!(cluster.options.kubelet.service.extra_args, vec!["--max-pods=200"]);
        assert_eq!(cluster.tls.validity, Duration::from_secs(24 * 3600));
        assert_eq!(cluster.tls.ca_validity, default_ca_validity());
        cluster.validate().unwrap();
    }

    #[test]
    fn test_yaml_round_trip_is_lossless() {
        let cluster = Cluster::from_yaml(CLUSTER_YAML).unwrap();
        let parsed = Cluster::from_yaml(&cluster.to_yaml().unwrap()).unwrap();
        assert_eq!(cluster, parsed);

        let json = serde_json::to_string(&cluster).unwrap();
        let from_json: Cluster = serde_json::from_str(&json).unwrap();
        assert_eq!(cluster, from_json);
    }

    #[test]
    fn test_validate_rejects_duplicate_addresses() {
        let mut cluster = Cluster::from_yaml(CLUSTER_YAML).unwrap();
        cluster.nodes.push(Node::new("10.0.0.1", false));
        let err = cluster.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate node address"));
    }

    #[test]
    fn test_validate_requires_control_plane() {
        let mut cluster = Cluster::from_yaml(CLUSTER_YAML).unwrap();
        for node in &mut cluster.nodes {
            node.control_plane = false;
        }
        assert!(cluster.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_renewal_window_longer_than_validity() {
        let mut cluster = Cluster::from_yaml(CLUSTER_YAML).unwrap();
        cluster.tls.renewal_window = Duration::from_secs(48 * 3600);
        assert!(cluster.validate().is_err());
    }

    #[test]
    fn test_control_planes_are_sorted() {
        let cluster = Cluster::from_yaml(CLUSTER_YAML).unwrap();
        let addrs: Vec<&str> = cluster.control_planes().iter().map(|n| n.address.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.1", "10.0.0.2"]);
        let all: Vec<&str> = cluster.sorted_nodes().iter().map(|n| n.address.as_str()).collect();
        assert_eq!(all, vec!["10.0.0.1", "10.0.0.11", "10.0.0.2"]);
    }
}
