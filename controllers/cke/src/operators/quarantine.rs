//! Unreachable node quarantine

use super::{Operator, Plan, ready_api_node};
use crate::commands::{Command, KubectlCordon};
use cluster_model::{Cluster, ClusterStatus, Resources};
use std::sync::Arc;

/// Cordon unreachable nodes while etcd has no failure margin left
///
/// Keeps the scheduler away from a node that may be about to be removed
/// from etcd. Nodes already cordoned, or unknown to Kubernetes, are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnreachableNodeQuarantine;

impl Operator for UnreachableNodeQuarantine {
    fn name(&self) -> &'static str {
        "unreachable-node-quarantine"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn next_commands(&self, cluster: &Cluster, status: &ClusterStatus, _resources: &Resources) -> Option<Plan> {
        let etcd = &status.etcd;
        let at_risk = etcd.reachable && !etcd.members.is_empty() && etcd.healthy_count() <= etcd.quorum();
        if !at_risk || !status.kubernetes.reachable {
            return None;
        }
        let api_node = ready_api_node(cluster, status)?;

        let commands: Vec<Arc<dyn Command>> = cluster
            .sorted_nodes()
            .into_iter()
            .filter(|n| !status.is_reachable(&n.address))
            .filter(|n| {
                status
                    .kubernetes
                    .nodes
                    .get(n.node_name())
                    .is_some_and(|k| !k.unschedulable)
            })
            .map(|n| {
                Arc::new(KubectlCordon {
                    node: api_node.clone(),
                    target: n.node_name().to_string(),
                }) as Arc<dyn Command>
            })
            .collect();
        if commands.is_empty() {
            return None;
        }
        Some(Plan::new(self.name(), commands))
    }
}
