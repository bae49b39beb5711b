//! Operators
//!
//! Each operator owns one slice of the cluster lifecycle and, given the
//! declared cluster and the observed status, either declines or returns the
//! plan for the next named state of its slice. Operators are pure: they
//! read nothing but their arguments.
//!
//! The registry, in priority order:
//! - `quarantine`: cordon unreachable nodes while control-plane quorum is at risk
//! - `etcd`: etcd bootstrap, member add, member removal and restart
//! - `certificates`: authorities, renewal and vault housekeeping
//! - `kubernetes`: control plane and node components
//! - `resources`: user-declared Kubernetes objects

pub mod certificates;
pub mod etcd;
pub mod kubernetes;
pub mod quarantine;
pub mod resources;

pub use certificates::{CaBootstrap, CertRenew, CertsGcOperator};
pub use etcd::{EtcdBootstrap, EtcdRepair};
pub use kubernetes::{ControlPlaneBootstrap, ControlPlaneRestart, KubeWorker};
pub use quarantine::UnreachableNodeQuarantine;
pub use resources::ResourceApply;

use crate::commands::Command;
use crate::services::{self, Component};
use cluster_model::{Cluster, ClusterStatus, CommandDescriptor, Node, Resources};
use std::sync::Arc;

/// Ordered commands produced by one operator for one tick
#[derive(Debug, Clone)]
pub struct Plan {
    /// Operation name recorded in the operation record
    pub name: String,
    pub commands: Vec<Arc<dyn Command>>,
}

impl Plan {
    pub fn new(name: impl Into<String>, commands: Vec<Arc<dyn Command>>) -> Self {
        Self {
            name: name.into(),
            commands,
        }
    }

    /// Descriptors of the commands, in order
    pub fn descriptors(&self) -> Vec<CommandDescriptor> {
        self.commands.iter().map(|c| c.descriptor()).collect()
    }

    /// Names of the commands, in order
    pub fn command_names(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.descriptor().name).collect()
    }
}

/// A planning rule over one slice of the cluster
pub trait Operator: Send + Sync {
    /// Operator name, used in metrics
    fn name(&self) -> &'static str;

    /// Lower runs first
    fn priority(&self) -> u32;

    /// Plan for the next state, or `None` when there is nothing to do
    fn next_commands(&self, cluster: &Cluster, status: &ClusterStatus, resources: &Resources) -> Option<Plan>;
}

/// The operators consulted by the planner every tick
pub fn default_operators() -> Vec<Box<dyn Operator>> {
    vec![
        Box::new(UnreachableNodeQuarantine),
        Box::new(EtcdBootstrap),
        Box::new(EtcdRepair),
        Box::new(CaBootstrap),
        Box::new(CertRenew),
        Box::new(ControlPlaneBootstrap),
        Box::new(ControlPlaneRestart),
        Box::new(KubeWorker),
        Box::new(ResourceApply),
    ]
}

/// Observed state of a managed container relative to its desired spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// No such container
    Missing,
    /// Present but not running
    Stopped,
    /// Running with a different spec
    Drifted,
    /// Running with the desired spec
    Current,
}

/// Compare the observed container of `component` on `node` with its desired spec
pub fn container_state(cluster: &Cluster, status: &ClusterStatus, node: &Node, component: Component) -> ContainerState {
    let Some(observed) = status
        .node(&node.address)
        .and_then(|s| s.container(component.container_name()))
    else {
        return ContainerState::Missing;
    };
    if !observed.running {
        return ContainerState::Stopped;
    }
    let desired = services::container_spec(component, cluster, node).spec_hash();
    if observed.spec_hash == desired {
        ContainerState::Current
    } else {
        ContainerState::Drifted
    }
}

/// Reachable nodes matching `filter`, ordered by address
pub(crate) fn reachable_nodes<F>(cluster: &Cluster, status: &ClusterStatus, filter: F) -> Vec<Node>
where
    F: Fn(&Node) -> bool,
{
    cluster
        .sorted_nodes()
        .into_iter()
        .filter(|n| status.is_reachable(&n.address) && filter(n))
        .cloned()
        .collect()
}

/// Client URLs of healthy etcd members
pub(crate) fn healthy_etcd_endpoints(status: &ClusterStatus) -> Vec<String> {
    status
        .etcd
        .members
        .values()
        .filter(|m| m.healthy)
        .map(|m| services::etcd_client_url(&m.address))
        .collect()
}

/// First reachable control-plane node whose apiserver is ready
pub(crate) fn ready_api_node(cluster: &Cluster, status: &ClusterStatus) -> Option<Node> {
    cluster
        .control_planes()
        .into_iter()
        .find(|n| status.node(&n.address).is_some_and(|s| s.reachable && s.apiserver_ready))
        .cloned()
}
