//! Certificate operators

use super::{ContainerState, Operator, Plan, container_state};
use crate::commands::{CertsGc, Command, CreateCa, IssueCertificate, RestartContainer};
use crate::services::{self, CertPlan, Component};
use cluster_model::{CaRole, Cluster, ClusterStatus, Node, Resources};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Create the authority of every role
#[derive(Debug, Clone, Copy, Default)]
pub struct CaBootstrap;

impl Operator for CaBootstrap {
    fn name(&self) -> &'static str {
        "ca-bootstrap"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn next_commands(&self, cluster: &Cluster, status: &ClusterStatus, _resources: &Resources) -> Option<Plan> {
        let missing: Vec<CaRole> = CaRole::ALL
            .into_iter()
            .filter(|r| !status.certificates.cas.contains(r))
            .collect();
        if missing.is_empty() {
            return None;
        }
        Some(Plan::new(
            self.name(),
            vec![Arc::new(CreateCa {
                roles: missing,
                validity: cluster.tls.ca_validity,
            })],
        ))
    }
}

/// Re-issue certificates of deployed components that are missing, due or absent from the node
///
/// Components that are not deployed yet get their certificates from the
/// operator that bootstraps them. Running containers using a re-issued
/// certificate are restarted.
#[derive(Debug, Clone, Copy, Default)]
pub struct CertRenew;

impl CertRenew {
    fn stale(&self, cluster: &Cluster, status: &ClusterStatus, node: &Node, plan: &CertPlan) -> bool {
        let target = services::cert_target(node, plan.name);
        let Some(issued) = status.certificates.issued.get(&target) else {
            return true;
        };
        if issued.needs_renewal(status.probed_at, cluster.tls.renewal_window) {
            return true;
        }
        let Some(observed) = status.node(&node.address) else {
            return true;
        };
        !observed.has_file(&services::cert_path(plan.name)) || !observed.has_file(&services::key_path(plan.name))
    }
}

impl Operator for CertRenew {
    fn name(&self) -> &'static str {
        "cert-renew"
    }

    fn priority(&self) -> u32 {
        31
    }

    fn next_commands(&self, cluster: &Cluster, status: &ClusterStatus, _resources: &Resources) -> Option<Plan> {
        if !status.certificates.has_cas(&CaRole::ALL) {
            return None;
        }

        let mut entries: Vec<(Node, Vec<CertPlan>)> = Vec::new();
        let mut restarts: BTreeMap<Component, Vec<Node>> = BTreeMap::new();
        for node in cluster.sorted_nodes() {
            if !status.is_reachable(&node.address) {
                continue;
            }
            let mut stale: Vec<CertPlan> = Vec::new();
            for component in Component::ALL {
                if !component.runs_on(node) {
                    continue;
                }
                let state = container_state(cluster, status, node, component);
                if state == ContainerState::Missing {
                    continue;
                }
                let due: Vec<CertPlan> = services::component_certificates(cluster, node, &[component])
                    .into_iter()
                    .filter(|p| self.stale(cluster, status, node, p))
                    .collect();
                if due.is_empty() {
                    continue;
                }
                if state != ContainerState::Stopped {
                    restarts.entry(component).or_default().push(node.clone());
                }
                for plan in due {
                    if !stale.iter().any(|p| p.name == plan.name) {
                        stale.push(plan);
                    }
                }
            }
            if !stale.is_empty() {
                entries.push((node.clone(), stale));
            }
        }
        if entries.is_empty() {
            return None;
        }

        let mut commands: Vec<Arc<dyn Command>> = vec![Arc::new(IssueCertificate::new(
            entries,
            cluster.tls.validity,
            cluster.tls.renewal_window,
        ))];
        for (component, nodes) in restarts {
            commands.push(Arc::new(RestartContainer {
                nodes,
                name: component.container_name().to_string(),
            }));
        }
        Some(Plan::new(self.name(), commands))
    }
}

/// Collect revoked and expired certificates; run by the housekeeping timer
#[derive(Debug, Clone, Copy, Default)]
pub struct CertsGcOperator;

impl Operator for CertsGcOperator {
    fn name(&self) -> &'static str {
        "certs-gc"
    }

    fn priority(&self) -> u32 {
        0
    }

    fn next_commands(&self, _cluster: &Cluster, status: &ClusterStatus, _resources: &Resources) -> Option<Plan> {
        if status.certificates.expired.is_empty() {
            return None;
        }
        Some(Plan::new(self.name(), vec![Arc::new(CertsGc)]))
    }
}
