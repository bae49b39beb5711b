//! Status prober
//!
//! Builds a fresh `ClusterStatus` every tick. Nodes are probed concurrently
//! under the bounded fan-out; a node that cannot be probed in time is
//! reported unreachable and never fails the pass. Only errors of the KV
//! gateway (vault inventory) propagate, since nothing can be planned
//! without it.

use crate::error::ControllerError;
use crate::fanout::map_nodes;
use crate::infrastructure::Infrastructure;
use crate::services::{self, Component};
use cluster_model::{
    CaRole, CertificateInventory, Cluster, ClusterStatus, ContainerStatus, EtcdMemberStatus, EtcdStatus,
    KubernetesNodeStatus, KubernetesStatus, Node, NodeStatus, REVISION_ANNOTATION, Resources,
};
use kv_client::KvError;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<Object>,
}

#[derive(Debug, Default, Deserialize)]
struct Object {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: serde_json::Value,
    #[serde(default)]
    status: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

/// Observes hosts, etcd, Kubernetes and the vault
pub struct Prober {
    infra: Arc<dyn Infrastructure>,
    max_parallelism: usize,
    timeout: Duration,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("max_parallelism", &self.max_parallelism)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Prober {
    /// `timeout` bounds a whole probe pass
    pub fn new(infra: Arc<dyn Infrastructure>, max_parallelism: usize, timeout: Duration) -> Self {
        Self {
            infra,
            max_parallelism,
            timeout,
        }
    }

    /// Probe the whole cluster
    ///
    /// The pass shares one deadline of `timeout`. The vault inventory is
    /// read first and fails the pass if it cannot be read in time; any
    /// later stage still running at the deadline yields its empty status.
    pub async fn probe(
        &self,
        cluster: &Cluster,
        resources: &Resources,
        cancel: &CancellationToken,
    ) -> Result<ClusterStatus, ControllerError> {
        let mut status = ClusterStatus::new(self.infra.now());
        let deadline = Instant::now() + self.timeout;

        status.certificates = tokio::select! {
            () = cancel.cancelled() => return Err(ControllerError::Cancelled),
            vault = tokio::time::timeout_at(deadline, self.probe_vault(status.probed_at)) => match vault {
                Ok(inventory) => inventory?,
                Err(_) => {
                    return Err(ControllerError::Kv(KvError::Timeout(
                        "vault inventory exceeded the probe deadline".to_string(),
                    )));
                }
            }
        };

        let infra = Arc::clone(&self.infra);
        let nodes = tokio::select! {
            () = cancel.cancelled() => return Err(ControllerError::Cancelled),
            nodes = map_nodes(&cluster.nodes, self.max_parallelism, |node| {
                let infra = Arc::clone(&infra);
                async move {
                    match tokio::time::timeout_at(deadline, probe_node(infra.as_ref(), &node)).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!("Probe of {} timed out", node.address);
                            NodeStatus::unreachable()
                        }
                    }
                }
            }) => nodes,
        };
        status.nodes = nodes.into_iter().collect();

        status.etcd = tokio::select! {
            () = cancel.cancelled() => return Err(ControllerError::Cancelled),
            etcd = tokio::time::timeout_at(deadline, self.probe_etcd(cluster, &status.nodes)) => {
                etcd.unwrap_or_else(|_| {
                    warn!("etcd probe timed out");
                    EtcdStatus::default()
                })
            }
        };

        status.kubernetes = tokio::select! {
            () = cancel.cancelled() => return Err(ControllerError::Cancelled),
            kubernetes = tokio::time::timeout_at(deadline, self.probe_kubernetes(cluster, &status.nodes, resources)) => {
                kubernetes.unwrap_or_else(|_| {
                    warn!("Kubernetes probe timed out");
                    KubernetesStatus::default()
                })
            }
        };

        Ok(status)
    }

    async fn probe_etcd(&self, cluster: &Cluster, nodes: &BTreeMap<String, NodeStatus>) -> EtcdStatus {
        let endpoints: Vec<String> = cluster
            .control_planes()
            .iter()
            .filter(|n| nodes.get(&n.address).is_some_and(|s| s.is_running(Component::Etcd.container_name())))
            .map(|n| services::etcd_client_url(&n.address))
            .collect();
        if endpoints.is_empty() {
            return EtcdStatus::default();
        }

        let client = match self.infra.etcd_members(&endpoints).await {
            Ok(client) => client,
            Err(e) => {
                debug!("etcd member client unavailable: {}", e);
                return EtcdStatus::default();
            }
        };
        let members = match client.member_list().await {
            Ok(members) => members,
            Err(e) => {
                debug!("etcd member list failed: {}", e);
                return EtcdStatus::default();
            }
        };

        let mut status = EtcdStatus {
            reachable: true,
            members: BTreeMap::new(),
        };
        for member in members {
            let Some(peer) = member.peer_urls.first() else {
                continue;
            };
            let address = services::url_host(peer);
            let mut healthy = false;
            if !member.name.is_empty() {
                for url in &member.client_urls {
                    if client.endpoint_health(url).await.unwrap_or(false) {
                        healthy = true;
                        break;
                    }
                }
            }
            status.members.insert(
                address.clone(),
                EtcdMemberStatus {
                    id: member.id,
                    name: member.name,
                    address,
                    peer_urls: member.peer_urls,
                    healthy,
                },
            );
        }
        status
    }

    async fn kubectl_json(&self, node: &Node, args: &[&str]) -> Option<ObjectList> {
        let engine = self.infra.engine(node).await.ok()?;
        let out = match engine
            .run(
                services::KUBERNETES_IMAGE,
                &services::kubectl_mounts(),
                &services::kubectl_args(args),
                None,
            )
            .await
        {
            Ok(out) => out,
            Err(e) => {
                debug!("kubectl {} on {} failed: {}", args.join(" "), node.address, e);
                return None;
            }
        };
        match serde_json::from_str(&out) {
            Ok(list) => Some(list),
            Err(e) => {
                warn!("Unparseable kubectl output on {}: {}", node.address, e);
                None
            }
        }
    }

    async fn probe_kubernetes(
        &self,
        cluster: &Cluster,
        nodes: &BTreeMap<String, NodeStatus>,
        resources: &Resources,
    ) -> KubernetesStatus {
        let Some(api_node) = cluster
            .control_planes()
            .into_iter()
            .find(|n| nodes.get(&n.address).is_some_and(|s| s.reachable && s.apiserver_ready))
        else {
            return KubernetesStatus::default();
        };

        let Some(list) = self.kubectl_json(api_node, &["get", "nodes", "-o", "json"]).await else {
            return KubernetesStatus::default();
        };
        let mut status = KubernetesStatus {
            reachable: true,
            ..Default::default()
        };
        for item in list.items {
            let unschedulable = item.spec.get("unschedulable").and_then(|v| v.as_bool()).unwrap_or(false);
            let ready = item
                .status
                .get("conditions")
                .and_then(|c| c.as_array())
                .is_some_and(|conditions| {
                    conditions.iter().any(|c| {
                        c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                            && c.get("status").and_then(|s| s.as_str()) == Some("True")
                    })
                });
            status
                .nodes
                .insert(item.metadata.name, KubernetesNodeStatus { unschedulable, ready });
        }

        let kinds: BTreeSet<&str> = resources.iter().map(|r| r.kind.as_str()).collect();
        if kinds.is_empty() {
            return status;
        }
        let kinds = kinds.into_iter().collect::<Vec<_>>().join(",");
        if let Some(list) = self.kubectl_json(api_node, &["get", &kinds, "-A", "-o", "json"]).await {
            for item in list.items {
                let Some(revision) = item
                    .metadata
                    .annotations
                    .get(REVISION_ANNOTATION)
                    .and_then(|r| r.parse::<i64>().ok())
                else {
                    continue;
                };
                let key = format!(
                    "{}/{}/{}",
                    item.kind,
                    item.metadata.namespace.unwrap_or_default(),
                    item.metadata.name
                );
                status.applied.insert(key, revision);
            }
        }
        status
    }

    async fn probe_vault(&self, now: chrono::DateTime<chrono::Utc>) -> Result<CertificateInventory, ControllerError> {
        let storage = self.infra.storage();
        let certificates = self.infra.certificates();
        let mut inventory = CertificateInventory::default();
        for role in CaRole::ALL {
            if storage.get_ca(role).await?.is_some() {
                inventory.cas.insert(role);
            }
            for metadata in certificates.list(role).await? {
                if metadata.revoked || metadata.is_expired(now) {
                    inventory.expired.push(metadata);
                    continue;
                }
                let newer = inventory
                    .issued
                    .get(&metadata.target)
                    .is_none_or(|current| current.not_after < metadata.not_after);
                if newer {
                    inventory.issued.insert(metadata.target.clone(), metadata);
                }
            }
        }
        Ok(inventory)
    }
}

async fn probe_node(infra: &dyn Infrastructure, node: &Node) -> NodeStatus {
    let shell = match infra.shell(node).await {
        Ok(shell) => shell,
        Err(e) => {
            debug!("{} unreachable: {}", node.address, e);
            if e.is_connection() {
                infra.evict(&node.address).await;
            }
            return NodeStatus::unreachable();
        }
    };

    let shell_probe = async {
        let unit = shell.unit_state(services::RUNTIME_UNIT).await?;
        let files = shell
            .list_files(&[services::PKI_DIR.to_string(), services::KUBE_DIR.to_string()])
            .await?;
        Ok::<_, host_client::HostError>((unit, files))
    };
    let engine_probe = async {
        let engine = infra.engine(node).await?;
        engine.ping().await?;
        engine.containers().await
    };
    let kubelet_url = services::kubelet_health_url(&node.address);
    let kubelet_probe = infra.http_ready(&kubelet_url);
    let apiserver_probe = async {
        if node.control_plane {
            infra.http_ready(&services::apiserver_ready_url(&node.address)).await
        } else {
            false
        }
    };

    let (shell_result, engine_result, kubelet_ready, apiserver_ready) =
        tokio::join!(shell_probe, engine_probe, kubelet_probe, apiserver_probe);

    let (unit, files) = match shell_result {
        Ok(found) => found,
        Err(e) => {
            debug!("{} shell probe failed: {}", node.address, e);
            if e.is_connection() {
                infra.evict(&node.address).await;
            }
            return NodeStatus::unreachable();
        }
    };

    let mut status = NodeStatus {
        reachable: true,
        units: BTreeMap::from([(services::RUNTIME_UNIT.to_string(), unit)]),
        files,
        kubelet_ready,
        apiserver_ready,
        ..Default::default()
    };
    match engine_result {
        Ok(containers) => {
            status.engine_reachable = true;
            status.containers = containers
                .into_values()
                .filter(|c| Component::from_container_name(&c.name).is_some())
                .map(|c| {
                    (
                        c.name,
                        ContainerStatus {
                            running: c.running,
                            image: c.image,
                            spec_hash: c.spec_hash,
                        },
                    )
                })
                .collect();
        }
        Err(e) => debug!("{} engine probe failed: {}", node.address, e),
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{SimulatedCluster, sample_cluster};

    #[tokio::test]
    async fn test_unreachable_node_does_not_fail_the_pass() {
        let cluster = sample_cluster(1, 2);
        let sim = SimulatedCluster::new(&cluster).await;
        sim.host("10.0.0.3").set_reachable(false);

        let prober = Prober::new(sim.infra(), 32, Duration::from_secs(5));
        let status = prober
            .probe(&cluster, &Resources::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(status.is_reachable("10.0.0.1"));
        assert!(status.is_reachable("10.0.0.2"));
        assert!(!status.is_reachable("10.0.0.3"));
        assert!(!status.etcd.reachable, "no etcd has been started yet");
        assert!(status.certificates.cas.is_empty());
    }

    #[tokio::test]
    async fn test_node_inventory() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::new(&cluster).await;
        let host = sim.host("10.0.0.1");
        host.put_file("/etc/cke/pki/kubelet.crt", "PEM");
        host.put_file("/var/tmp/unrelated", "x");

        let prober = Prober::new(sim.infra(), 32, Duration::from_secs(5));
        let status = prober
            .probe(&cluster, &Resources::default(), &CancellationToken::new())
            .await
            .unwrap();

        let node = status.node("10.0.0.1").unwrap();
        assert!(node.engine_reachable);
        assert!(node.has_file("/etc/cke/pki/kubelet.crt"));
        assert!(!node.has_file("/var/tmp/unrelated"));
        assert_eq!(node.units.get("docker.service").map(String::as_str), Some("active"));
        assert!(!node.kubelet_ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_stages_share_one_deadline() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::new(&cluster).await;
        let node = &cluster.nodes[0];
        let etcd = services::container_spec(Component::Etcd, &cluster, node);
        host_client::ContainerEngine::run_system(&sim.host(&node.address), &etcd)
            .await
            .unwrap();
        sim.set_http_latency(Duration::from_millis(800));
        sim.set_etcd_latency(Duration::from_millis(800));

        let prober = Prober::new(sim.infra(), 32, Duration::from_secs(1));
        let started = Instant::now();
        let status = prober
            .probe(&cluster, &Resources::default(), &CancellationToken::new())
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed <= Duration::from_millis(1100), "probe took {elapsed:?}");
        assert!(status.is_reachable("10.0.0.1"));
        assert!(!status.etcd.reachable);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_pass() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::new(&cluster).await;
        sim.set_http_latency(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let prober = Prober::new(sim.infra(), 32, Duration::from_secs(60));
        let err = prober
            .probe(&cluster, &Resources::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Cancelled), "{err:?}");
    }

    #[tokio::test]
    async fn test_store_outage_fails_the_pass() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::new(&cluster).await;
        sim.kv.set_unavailable(true);

        let prober = Prober::new(sim.infra(), 32, Duration::from_secs(5));
        let err = prober
            .probe(&cluster, &Resources::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }
}
