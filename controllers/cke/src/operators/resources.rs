//! User-declared Kubernetes resources

use super::{Operator, Plan, ready_api_node};
use crate::commands::KubectlApply;
use cluster_model::{Cluster, ClusterStatus, ResourceDefinition, Resources};
use std::sync::Arc;

/// Apply resources whose declared revision is newer than the one in the cluster
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceApply;

impl Operator for ResourceApply {
    fn name(&self) -> &'static str {
        "resource-apply"
    }

    fn priority(&self) -> u32 {
        60
    }

    fn next_commands(&self, cluster: &Cluster, status: &ClusterStatus, resources: &Resources) -> Option<Plan> {
        if !status.kubernetes.reachable {
            return None;
        }
        let node = ready_api_node(cluster, status)?;
        let pending: Vec<ResourceDefinition> = resources
            .iter()
            .filter(|r| {
                status
                    .kubernetes
                    .applied
                    .get(&r.key())
                    .is_none_or(|applied| *applied < r.revision)
            })
            .cloned()
            .collect();
        if pending.is_empty() {
            return None;
        }
        Some(Plan::new(
            self.name(),
            vec![Arc::new(KubectlApply {
                node,
                resources: pending,
            })],
        ))
    }
}
