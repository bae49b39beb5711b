//! ClusterStatus (observed state)
//!
//! Produced fresh by every prober pass and discarded at the end of the
//! tick; never persisted. Maps are ordered so that planning over a status
//! is deterministic.

use crate::certificate::{CaRole, CertificateMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Snapshot of the whole cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Time the probe started; operators use it as "now"
    pub probed_at: DateTime<Utc>,

    /// Per-node status keyed by address
    pub nodes: BTreeMap<String, NodeStatus>,

    /// etcd membership and health
    pub etcd: EtcdStatus,

    /// Kubernetes inventory
    pub kubernetes: KubernetesStatus,

    /// Vault inventory
    pub certificates: CertificateInventory,
}

impl ClusterStatus {
    /// Empty status observed at `now`
    pub fn new(probed_at: DateTime<Utc>) -> Self {
        Self {
            probed_at,
            nodes: BTreeMap::new(),
            etcd: EtcdStatus::default(),
            kubernetes: KubernetesStatus::default(),
            certificates: CertificateInventory::default(),
        }
    }

    /// Status of a node, if it was probed
    pub fn node(&self, address: &str) -> Option<&NodeStatus> {
        self.nodes.get(address)
    }

    /// Whether the node answered the probe
    pub fn is_reachable(&self, address: &str) -> bool {
        self.node(address).is_some_and(|n| n.reachable)
    }
}

/// Observed state of one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Remote shell answered
    pub reachable: bool,

    /// Container engine answered
    pub engine_reachable: bool,

    /// Managed containers by name
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerStatus>,

    /// systemd unit name -> `ActiveState`
    #[serde(default)]
    pub units: BTreeMap<String, String>,

    /// Managed files present on the host (absolute paths)
    #[serde(default)]
    pub files: BTreeSet<String>,

    /// kubelet health endpoint answered
    pub kubelet_ready: bool,

    /// kube-apiserver readiness endpoint answered
    pub apiserver_ready: bool,
}

impl NodeStatus {
    /// Status of a host that could not be reached
    pub fn unreachable() -> Self {
        Self::default()
    }

    /// Container status by name
    pub fn container(&self, name: &str) -> Option<&ContainerStatus> {
        self.containers.get(name)
    }

    /// Whether the named container exists and is running
    pub fn is_running(&self, name: &str) -> bool {
        self.container(name).is_some_and(|c| c.running)
    }

    /// Whether a managed file exists
    pub fn has_file(&self, path: &str) -> bool {
        self.files.contains(path)
    }
}

/// Observed state of one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Container is running
    pub running: bool,

    /// Image reference
    pub image: String,

    /// Hash label written when the container was created
    pub spec_hash: String,
}

/// etcd cluster view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdStatus {
    /// Membership could be read from some endpoint
    pub reachable: bool,

    /// Members keyed by host address
    pub members: BTreeMap<String, EtcdMemberStatus>,
}

impl EtcdStatus {
    /// Number of members answering health checks
    pub fn healthy_count(&self) -> usize {
        self.members.values().filter(|m| m.healthy).count()
    }

    /// Votes needed for quorum with the current membership
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Membership readable and a quorum of members healthy
    pub fn is_healthy(&self) -> bool {
        self.reachable && !self.members.is_empty() && self.healthy_count() >= self.quorum()
    }
}

/// One etcd member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdMemberStatus {
    /// Member id
    pub id: u64,

    /// Member name (empty until the member has started)
    pub name: String,

    /// Host address taken from the peer URL
    pub address: String,

    /// Peer URLs
    pub peer_urls: Vec<String>,

    /// Health endpoint answered
    pub healthy: bool,
}

/// Kubernetes inventory read through the API server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesStatus {
    /// API server answered
    pub reachable: bool,

    /// Registered nodes by name
    pub nodes: BTreeMap<String, KubernetesNodeStatus>,

    /// Resource key -> applied revision
    pub applied: BTreeMap<String, i64>,
}

/// Registered Kubernetes node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesNodeStatus {
    /// Node is cordoned
    pub unschedulable: bool,

    /// Ready condition is true
    pub ready: bool,
}

/// Vault inventory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInventory {
    /// Authorities present in the vault
    pub cas: BTreeSet<CaRole>,

    /// Latest live (not revoked) certificate per target
    pub issued: BTreeMap<String, CertificateMetadata>,

    /// Expired or revoked entries eligible for garbage collection
    pub expired: Vec<CertificateMetadata>,
}

impl CertificateInventory {
    /// Whether every listed authority exists
    pub fn has_cas(&self, roles: &[CaRole]) -> bool {
        roles.iter().all(|r| self.cas.contains(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(address: &str, healthy: bool) -> EtcdMemberStatus {
        EtcdMemberStatus {
            id: 1,
            name: address.to_string(),
            address: address.to_string(),
            peer_urls: vec![format!("https://{address}:2380")],
            healthy,
        }
    }

    #[test]
    fn test_etcd_quorum() {
        let mut etcd = EtcdStatus {
            reachable: true,
            ..Default::default()
        };
        assert!(!etcd.is_healthy(), "no members is not healthy");

        etcd.members.insert("10.0.0.1".into(), member("10.0.0.1", true));
        etcd.members.insert("10.0.0.2".into(), member("10.0.0.2", false));
        etcd.members.insert("10.0.0.3".into(), member("10.0.0.3", true));
        assert_eq!(etcd.quorum(), 2);
        assert!(etcd.is_healthy());

        etcd.members.get_mut("10.0.0.3").unwrap().healthy = false;
        assert!(!etcd.is_healthy());
    }

    #[test]
    fn test_unreachable_node_has_nothing_running() {
        let status = NodeStatus::unreachable();
        assert!(!status.reachable);
        assert!(!status.is_running("etcd"));
    }
}
