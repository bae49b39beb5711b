//! etcd operators

use super::{ContainerState, Operator, Plan, container_state, healthy_etcd_endpoints};
use crate::commands::{
    Command, EtcdAddMember, EtcdRemoveMember, EtcdWaitHealthy, ImagePull, IssueCertificate, MakeDirs,
    RestartContainer, RevokeCertificate, RunContainer,
};
use crate::services::{self, Component};
use cluster_model::{CaRole, Cluster, ClusterStatus, EtcdMemberStatus, Node, Resources};
use host_client::ContainerSpec;
use std::sync::Arc;

/// Authorities etcd needs before any member can start
const ETCD_CAS: [CaRole; 3] = [CaRole::Server, CaRole::EtcdPeer, CaRole::EtcdClient];

fn etcd_spec(cluster: &Cluster, node: &Node, initial: &[(String, String)], new_cluster: bool) -> ContainerSpec {
    let mut spec = services::container_spec(Component::Etcd, cluster, node);
    spec.bootstrap_args = services::etcd_bootstrap_args(initial, new_cluster);
    spec
}

fn issue_etcd_certificates(cluster: &Cluster, nodes: &[Node]) -> IssueCertificate {
    IssueCertificate::new(
        nodes
            .iter()
            .map(|n| {
                (
                    n.clone(),
                    services::component_certificates(cluster, n, &[Component::Etcd]),
                )
            })
            .collect(),
        cluster.tls.validity,
        cluster.tls.renewal_window,
    )
}

fn member_initial_cluster(status: &ClusterStatus) -> Vec<(String, String)> {
    status
        .etcd
        .members
        .values()
        .map(|m| {
            let peer = m
                .peer_urls
                .first()
                .cloned()
                .unwrap_or_else(|| services::etcd_peer_url(&m.address));
            let name = if m.name.is_empty() { m.address.clone() } else { m.name.clone() };
            (name, peer)
        })
        .collect()
}

/// Establish the etcd cluster and grow it to every control-plane node
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdBootstrap;

impl EtcdBootstrap {
    fn bootstrap(&self, cluster: &Cluster, status: &ClusterStatus) -> Option<Plan> {
        let control_planes: Vec<Node> = cluster.control_planes().into_iter().cloned().collect();
        // A partial initial cluster could not be grown later with the same token
        if !control_planes.iter().all(|n| status.is_reachable(&n.address)) {
            return None;
        }
        let initial: Vec<(String, String)> = control_planes
            .iter()
            .map(|n| (n.address.clone(), services::etcd_peer_url(&n.address)))
            .collect();
        let endpoints: Vec<String> = control_planes
            .iter()
            .map(|n| services::etcd_client_url(&n.address))
            .collect();

        let commands: Vec<Arc<dyn Command>> = vec![
            Arc::new(ImagePull {
                nodes: control_planes.clone(),
                image: services::ETCD_IMAGE.to_string(),
            }),
            Arc::new(MakeDirs {
                nodes: control_planes.clone(),
                dirs: services::component_dirs(Component::Etcd),
            }),
            Arc::new(issue_etcd_certificates(cluster, &control_planes)),
            Arc::new(RunContainer {
                specs: control_planes
                    .iter()
                    .map(|n| (n.clone(), etcd_spec(cluster, n, &initial, true)))
                    .collect(),
            }),
            Arc::new(EtcdWaitHealthy {
                endpoints,
                expected: control_planes.len(),
            }),
        ];
        Some(Plan::new("etcd-bootstrap", commands))
    }

    fn add_member(&self, cluster: &Cluster, status: &ClusterStatus) -> Option<Plan> {
        let members = &status.etcd.members;
        let nodes: Vec<Node> = cluster
            .control_planes()
            .into_iter()
            .filter(|n| status.is_reachable(&n.address))
            .filter(|n| members.get(&n.address).is_none_or(|m| m.name.is_empty()))
            .cloned()
            .collect();
        if nodes.is_empty() {
            return None;
        }

        let healthy = healthy_etcd_endpoints(status);
        let mut wait_endpoints = healthy.clone();
        wait_endpoints.extend(nodes.iter().map(|n| services::etcd_client_url(&n.address)));
        let expected = members.len() + nodes.iter().filter(|n| !members.contains_key(&n.address)).count();

        let commands: Vec<Arc<dyn Command>> = vec![
            Arc::new(ImagePull {
                nodes: nodes.clone(),
                image: services::ETCD_IMAGE.to_string(),
            }),
            Arc::new(issue_etcd_certificates(cluster, &nodes)),
            Arc::new(EtcdAddMember {
                cluster: Arc::new(cluster.clone()),
                nodes,
                endpoints: healthy,
            }),
            Arc::new(EtcdWaitHealthy {
                endpoints: wait_endpoints,
                expected,
            }),
        ];
        Some(Plan::new("etcd-add-member", commands))
    }
}

impl Operator for EtcdBootstrap {
    fn name(&self) -> &'static str {
        "etcd-bootstrap"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn next_commands(&self, cluster: &Cluster, status: &ClusterStatus, _resources: &Resources) -> Option<Plan> {
        if !status.certificates.has_cas(&ETCD_CAS) {
            return None;
        }
        let any_container = cluster
            .control_planes()
            .into_iter()
            .any(|n| container_state(cluster, status, n, Component::Etcd) != ContainerState::Missing);

        if status.etcd.members.is_empty() && !any_container {
            return self.bootstrap(cluster, status);
        }
        if status.etcd.is_healthy() {
            return self.add_member(cluster, status);
        }
        None
    }
}

/// Remove members that no longer belong and restart broken ones
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdRepair;

impl EtcdRepair {
    /// Members to remove, in address order
    fn removal_candidates<'a>(&self, cluster: &Cluster, status: &'a ClusterStatus) -> Vec<&'a EtcdMemberStatus> {
        status
            .etcd
            .members
            .values()
            .filter(|m| match cluster.node(&m.address) {
                Some(node) if node.control_plane => {
                    !status.is_reachable(&m.address)
                        || container_state(cluster, status, node, Component::Etcd) == ContainerState::Missing
                }
                _ => true,
            })
            .collect()
    }

    fn remove_member(&self, cluster: &Cluster, status: &ClusterStatus) -> Option<Plan> {
        let etcd = &status.etcd;
        let member = self.removal_candidates(cluster, status).into_iter().find(|m| {
            let remaining = etcd.members.len() - 1;
            let healthy_remaining = etcd.healthy_count() - usize::from(m.healthy);
            remaining > 0 && healthy_remaining > remaining / 2
        })?;

        let endpoints: Vec<String> = etcd
            .members
            .values()
            .filter(|m| m.healthy && m.address != member.address)
            .map(|m| services::etcd_client_url(&m.address))
            .collect();
        let commands: Vec<Arc<dyn Command>> = vec![
            Arc::new(EtcdRemoveMember {
                member_id: member.id,
                address: member.address.clone(),
                node: cluster.node(&member.address).cloned(),
                endpoints,
            }),
            Arc::new(RevokeCertificate {
                prefix: format!("{}/etcd-", member.address),
            }),
        ];
        Some(Plan::new("etcd-remove-member", commands))
    }

    fn restart(&self, cluster: &Cluster, status: &ClusterStatus) -> Option<Plan> {
        let etcd = &status.etcd;
        let initial = member_initial_cluster(status);
        let all_healthy = etcd.healthy_count() == etcd.members.len();

        for node in cluster.control_planes() {
            let Some(member) = etcd.members.get(&node.address) else {
                continue;
            };
            if !status.is_reachable(&node.address) {
                continue;
            }
            let command: Arc<dyn Command> = match container_state(cluster, status, node, Component::Etcd) {
                ContainerState::Stopped => Arc::new(RunContainer {
                    specs: vec![(node.clone(), etcd_spec(cluster, node, &initial, false))],
                }),
                ContainerState::Drifted if all_healthy => Arc::new(RunContainer {
                    specs: vec![(node.clone(), etcd_spec(cluster, node, &initial, false))],
                }),
                ContainerState::Current if !member.healthy && !member.name.is_empty() => Arc::new(RestartContainer {
                    nodes: vec![node.clone()],
                    name: Component::Etcd.container_name().to_string(),
                }),
                _ => continue,
            };
            let endpoints: Vec<String> = etcd
                .members
                .values()
                .map(|m| services::etcd_client_url(&m.address))
                .collect();
            return Some(Plan::new(
                "etcd-restart",
                vec![
                    command,
                    Arc::new(EtcdWaitHealthy {
                        endpoints,
                        expected: etcd.members.len(),
                    }),
                ],
            ));
        }
        None
    }

    /// Start stopped etcd containers when the cluster cannot be reached at all
    fn revive(&self, cluster: &Cluster, status: &ClusterStatus) -> Option<Plan> {
        let initial: Vec<(String, String)> = cluster
            .control_planes()
            .iter()
            .map(|n| (n.address.clone(), services::etcd_peer_url(&n.address)))
            .collect();
        let specs: Vec<(Node, ContainerSpec)> = cluster
            .control_planes()
            .into_iter()
            .filter(|n| status.is_reachable(&n.address))
            .filter(|n| container_state(cluster, status, n, Component::Etcd) == ContainerState::Stopped)
            .map(|n| (n.clone(), etcd_spec(cluster, n, &initial, false)))
            .collect();
        if specs.is_empty() {
            return None;
        }
        Some(Plan::new("etcd-restart", vec![Arc::new(RunContainer { specs })]))
    }
}

impl Operator for EtcdRepair {
    fn name(&self) -> &'static str {
        "etcd-repair"
    }

    fn priority(&self) -> u32 {
        21
    }

    fn next_commands(&self, cluster: &Cluster, status: &ClusterStatus, _resources: &Resources) -> Option<Plan> {
        if !status.etcd.reachable {
            return self.revive(cluster, status);
        }
        self.remove_member(cluster, status)
            .or_else(|| self.restart(cluster, status))
    }
}
