//! Kubernetes component operators

use super::{ContainerState, Operator, Plan, container_state, reachable_nodes, ready_api_node};
use crate::commands::{Command, ImagePull, IssueCertificate, MakeDirs, RunKubeComponent};
use crate::services::{self, Component};
use cluster_model::{CaRole, Cluster, ClusterStatus, Node, Resources};
use std::sync::Arc;

/// Commands that deploy `components` on `nodes` from scratch
fn deploy(cluster: &Cluster, nodes: Vec<Node>, components: &[Component]) -> Vec<Arc<dyn Command>> {
    let cluster = Arc::new(cluster.clone());
    let mut commands: Vec<Arc<dyn Command>> = vec![
        Arc::new(ImagePull {
            nodes: nodes.clone(),
            image: services::KUBERNETES_IMAGE.to_string(),
        }),
        Arc::new(MakeDirs {
            nodes: nodes.clone(),
            dirs: services::dirs_for(components),
        }),
        Arc::new(IssueCertificate::new(
            nodes
                .iter()
                .map(|n| (n.clone(), services::component_certificates(&cluster, n, components)))
                .collect(),
            cluster.tls.validity,
            cluster.tls.renewal_window,
        )),
    ];
    for component in components {
        commands.push(Arc::new(RunKubeComponent {
            component: *component,
            cluster: Arc::clone(&cluster),
            nodes: nodes.clone(),
        }));
    }
    commands
}

/// Commands that bring stopped or drifted `components` back to their desired spec
fn converge(cluster: &Cluster, status: &ClusterStatus, candidates: &[Node], components: &[Component]) -> Vec<Arc<dyn Command>> {
    let shared = Arc::new(cluster.clone());
    let mut commands: Vec<Arc<dyn Command>> = Vec::new();
    for component in components {
        let nodes: Vec<Node> = candidates
            .iter()
            .filter(|n| {
                matches!(
                    container_state(cluster, status, n, *component),
                    ContainerState::Stopped | ContainerState::Drifted
                )
            })
            .cloned()
            .collect();
        if !nodes.is_empty() {
            commands.push(Arc::new(RunKubeComponent {
                component: *component,
                cluster: Arc::clone(&shared),
                nodes,
            }));
        }
    }
    commands
}

fn any_missing(cluster: &Cluster, status: &ClusterStatus, node: &Node, components: &[Component]) -> bool {
    components
        .iter()
        .any(|c| container_state(cluster, status, node, *c) == ContainerState::Missing)
}

/// Deploy the API server, controller manager and scheduler
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlPlaneBootstrap;

impl Operator for ControlPlaneBootstrap {
    fn name(&self) -> &'static str {
        "control-plane-bootstrap"
    }

    fn priority(&self) -> u32 {
        40
    }

    fn next_commands(&self, cluster: &Cluster, status: &ClusterStatus, _resources: &Resources) -> Option<Plan> {
        if !status.etcd.is_healthy() || !status.certificates.has_cas(&CaRole::ALL) {
            return None;
        }
        let nodes = reachable_nodes(cluster, status, |n| {
            n.control_plane && any_missing(cluster, status, n, &Component::CONTROL_PLANE)
        });
        if nodes.is_empty() {
            return None;
        }
        Some(Plan::new(self.name(), deploy(cluster, nodes, &Component::CONTROL_PLANE)))
    }
}

/// Restart stopped control-plane components and replace drifted ones
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlPlaneRestart;

impl Operator for ControlPlaneRestart {
    fn name(&self) -> &'static str {
        "control-plane-restart"
    }

    fn priority(&self) -> u32 {
        41
    }

    fn next_commands(&self, cluster: &Cluster, status: &ClusterStatus, _resources: &Resources) -> Option<Plan> {
        if !status.certificates.has_cas(&CaRole::ALL) {
            return None;
        }
        let nodes = reachable_nodes(cluster, status, |n| n.control_plane);
        let commands = converge(cluster, status, &nodes, &Component::CONTROL_PLANE);
        if commands.is_empty() {
            return None;
        }
        Some(Plan::new(self.name(), commands))
    }
}

/// Deploy and maintain kubelet and kube-proxy on every node
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeWorker;

impl Operator for KubeWorker {
    fn name(&self) -> &'static str {
        "kube-worker"
    }

    fn priority(&self) -> u32 {
        50
    }

    fn next_commands(&self, cluster: &Cluster, status: &ClusterStatus, _resources: &Resources) -> Option<Plan> {
        if !status.certificates.has_cas(&CaRole::ALL) {
            return None;
        }
        ready_api_node(cluster, status)?;

        let missing = reachable_nodes(cluster, status, |n| any_missing(cluster, status, n, &Component::WORKER));
        if !missing.is_empty() {
            return Some(Plan::new(
                "kube-worker-bootstrap",
                deploy(cluster, missing, &Component::WORKER),
            ));
        }

        let nodes = reachable_nodes(cluster, status, |_| true);
        let commands = converge(cluster, status, &nodes, &Component::WORKER);
        if commands.is_empty() {
            return None;
        }
        Some(Plan::new("kube-worker-restart", commands))
    }
}
