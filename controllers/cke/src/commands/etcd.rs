//! etcd membership commands

use super::{Command, RunContext, node_target};
use crate::error::CommandError;
use crate::fanout::serial_over_nodes;
use crate::services::{self, Component};
use cluster_model::{Cluster, CommandDescriptor, Node};
use kv_client::{KvError, Member};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll period of `etcd-wait-healthy`
const HEALTH_POLL: Duration = Duration::from_secs(1);

/// `--initial-cluster` entries of a member list; unstarted members are named after their peer host
pub fn initial_cluster(members: &[Member]) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = members
        .iter()
        .filter_map(|m| {
            let peer = m.peer_urls.first()?;
            let name = if m.name.is_empty() {
                services::url_host(peer)
            } else {
                m.name.clone()
            };
            Some((name, peer.clone()))
        })
        .collect();
    entries.sort();
    entries
}

/// Add control-plane nodes to the running etcd cluster
///
/// Nodes are added one at a time in address order, and each new member must
/// be healthy before the next is registered. For every node any stale
/// container and data directory are discarded, the member is registered
/// unless already present, and etcd is started with
/// `--initial-cluster-state=existing`.
#[derive(Debug, Clone)]
pub struct EtcdAddMember {
    pub cluster: Arc<Cluster>,
    pub nodes: Vec<Node>,
    /// Client URLs of healthy members
    pub endpoints: Vec<String>,
}

impl EtcdAddMember {
    async fn add(&self, ctx: &RunContext, node: &Node) -> Result<(), CommandError> {
        let peer_url = services::etcd_peer_url(&node.address);
        let members = ctx.infra.etcd_members(&self.endpoints).await?;
        let listed = members.member_list().await?;
        let existing = listed.iter().find(|m| m.peer_urls.contains(&peer_url));

        let engine = ctx.engine(node).await?;
        let shell = ctx.shell(node).await?;
        let name = Component::Etcd.container_name();

        if existing.is_some_and(|m| !m.name.is_empty()) {
            let running = match engine.containers().await {
                Ok(containers) => containers.get(name).is_some_and(|c| c.running),
                Err(e) => return Err(ctx.host_failure(node, e).await),
            };
            if running {
                debug!("{} is already an etcd member", node.address);
                return Ok(());
            }
        }

        let reset = async {
            if engine.exists(name).await? {
                engine.stop(name).await?;
                engine.remove(name).await?;
            }
            shell.remove_paths(&[services::ETCD_DATA_DIR.to_string()]).await?;
            shell.make_dirs(&services::component_dirs(Component::Etcd)).await
        }
        .await;
        if let Err(e) = reset {
            return Err(ctx.host_failure(node, e).await);
        }

        let mut all = listed.clone();
        if existing.is_none() {
            let added = members.member_add(vec![peer_url.clone()]).await?;
            info!("Added etcd member {:x} for {}", added.id, node.address);
            all.push(added);
        }

        let mut spec = services::container_spec(Component::Etcd, &self.cluster, node);
        spec.bootstrap_args = services::etcd_bootstrap_args(&initial_cluster(&all), false);
        let started = async {
            engine.pull_image(&spec.image).await?;
            engine.run_system(&spec).await
        }
        .await;
        if let Err(e) = started {
            return Err(ctx.host_failure(node, e).await);
        }
        info!("Started etcd on {}", node.address);

        let client_url = services::etcd_client_url(&node.address);
        loop {
            let joined = match members.member_list().await {
                Ok(listed) => listed
                    .iter()
                    .any(|m| !m.name.is_empty() && m.peer_urls.contains(&peer_url)),
                Err(e) if e.is_transport() => false,
                Err(e) => return Err(e.into()),
            };
            if joined && members.endpoint_health(&client_url).await.unwrap_or(false) {
                return Ok(());
            }
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(CommandError::Cancelled),
                () = tokio::time::sleep(HEALTH_POLL) => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl Command for EtcdAddMember {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("etcd-add-member", node_target(&self.nodes))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        serial_over_nodes(&self.nodes, &ctx.cancel, |node| async move { self.add(ctx, &node).await }).await
    }
}

/// Remove a member from the etcd cluster and stop its container if reachable
#[derive(Debug, Clone)]
pub struct EtcdRemoveMember {
    pub member_id: u64,
    pub address: String,
    /// Node to stop etcd on, when it is still known
    pub node: Option<Node>,
    /// Client URLs of healthy members
    pub endpoints: Vec<String>,
}

#[async_trait::async_trait]
impl Command for EtcdRemoveMember {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("etcd-remove-member", format!("{} ({:x})", self.address, self.member_id))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        let members = ctx.infra.etcd_members(&self.endpoints).await?;
        match members.member_remove(self.member_id).await {
            Ok(()) => info!("Removed etcd member {:x} ({})", self.member_id, self.address),
            Err(KvError::NotFound(_)) => debug!("etcd member {:x} already removed", self.member_id),
            Err(e) => return Err(e.into()),
        }

        // The host is often down; leaving the container behind is harmless
        // because it no longer belongs to the cluster.
        if let Some(node) = &self.node {
            let stopped = async {
                let engine = ctx.infra.engine(node).await?;
                engine.stop(Component::Etcd.container_name()).await
            }
            .await;
            if let Err(e) = stopped {
                warn!("Could not stop etcd on {}: {}", self.address, e);
                if e.is_connection() {
                    ctx.infra.evict(&node.address).await;
                }
            }
        }
        Ok(())
    }
}

/// Wait until every member is started and healthy and at least `expected` exist
#[derive(Debug, Clone)]
pub struct EtcdWaitHealthy {
    pub endpoints: Vec<String>,
    pub expected: usize,
}

impl EtcdWaitHealthy {
    async fn healthy(&self, ctx: &RunContext) -> Result<bool, CommandError> {
        let members = ctx.infra.etcd_members(&self.endpoints).await?;
        let listed = match members.member_list().await {
            Ok(listed) => listed,
            Err(e) if e.is_transport() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if listed.len() < self.expected || listed.iter().any(|m| m.name.is_empty()) {
            return Ok(false);
        }
        for member in &listed {
            for url in &member.client_urls {
                if !members.endpoint_health(url).await.unwrap_or(false) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Command for EtcdWaitHealthy {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("etcd-wait-healthy", self.endpoints.join(","))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        loop {
            if self.healthy(ctx).await? {
                info!("etcd cluster is healthy");
                return Ok(());
            }
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(CommandError::Cancelled),
                () = tokio::time::sleep(HEALTH_POLL) => {}
            }
        }
    }
}
