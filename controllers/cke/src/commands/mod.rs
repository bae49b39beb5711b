//! Commands
//!
//! A command is one idempotent step of a plan. Operators build them; the
//! executor runs them in order against a `RunContext`. Commands are
//! grouped by what they touch:
//! - `node`: images, directories, files and containers on hosts
//! - `certificate`: authorities, leaf certificates and vault housekeeping
//! - `kubectl`: Kubernetes objects through kubectl on a control-plane node
//! - `etcd`: membership and health of the managed etcd cluster

pub mod certificate;
pub mod etcd;
pub mod kubectl;
pub mod node;

pub use certificate::{CertsGc, CreateCa, IssueCertificate, RevokeCertificate};
pub use etcd::{EtcdAddMember, EtcdRemoveMember, EtcdWaitHealthy};
pub use kubectl::{KubectlApply, KubectlCordon};
pub use node::{
    ImagePull, KillContainer, MakeDirs, RestartContainer, RunContainer, RunKubeComponent, StopContainer,
    WriteFiles,
};

use crate::error::CommandError;
use crate::infrastructure::Infrastructure;
use cluster_model::{CommandDescriptor, Node};
use host_client::{ContainerEngine, HostError, RemoteShell};
use kv_client::LeaderKey;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a running command may use
#[derive(Clone)]
pub struct RunContext {
    /// Hosts, etcd, vault and clock
    pub infra: Arc<dyn Infrastructure>,
    /// Cancelled on shutdown, admin cancel, deadline or leadership loss
    pub cancel: CancellationToken,
    /// Width of per-node fan-out
    pub max_parallelism: usize,
    /// Leader guard attached to every KV write
    pub guard: LeaderKey,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("max_parallelism", &self.max_parallelism)
            .field("guard", &self.guard)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Shell channel to a node; channels are evicted after connection failures
    pub async fn shell(&self, node: &Node) -> Result<Arc<dyn RemoteShell>, CommandError> {
        match self.infra.shell(node).await {
            Ok(shell) => Ok(shell),
            Err(e) => Err(self.host_failure(node, e).await),
        }
    }

    /// Container engine channel to a node
    pub async fn engine(&self, node: &Node) -> Result<Arc<dyn ContainerEngine>, CommandError> {
        match self.infra.engine(node).await {
            Ok(engine) => Ok(engine),
            Err(e) => Err(self.host_failure(node, e).await),
        }
    }

    /// Map a host error, dropping cached channels when the connection broke
    pub async fn host_failure(&self, node: &Node, error: HostError) -> CommandError {
        if error.is_connection() {
            self.infra.evict(&node.address).await;
        }
        CommandError::Host(error)
    }
}

/// One step of a plan
#[async_trait::async_trait]
pub trait Command: Send + Sync + std::fmt::Debug {
    /// Name and target recorded in the operation record
    fn descriptor(&self) -> CommandDescriptor;

    /// Execute; running a command whose effect is already in place is a no-op
    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError>;
}

/// Comma-separated node addresses for command targets
pub(crate) fn node_target(nodes: &[Node]) -> String {
    let mut addresses: Vec<&str> = nodes.iter().map(|n| n.address.as_str()).collect();
    addresses.sort_unstable();
    addresses.join(",")
}
