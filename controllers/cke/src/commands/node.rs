//! Host-level commands: images, directories, files and containers

use super::{Command, RunContext, node_target};
use crate::error::CommandError;
use crate::fanout::for_each_node;
use crate::services::{self, Component};
use cluster_model::{CaRole, Cluster, CommandDescriptor, Node};
use host_client::ContainerSpec;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Pull an image on every node
#[derive(Debug, Clone)]
pub struct ImagePull {
    pub nodes: Vec<Node>,
    pub image: String,
}

#[async_trait::async_trait]
impl Command for ImagePull {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("image-pull", format!("{} {}", self.image, node_target(&self.nodes)))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        for_each_node(&self.nodes, ctx.max_parallelism, &ctx.cancel, |node| {
            let ctx = ctx.clone();
            let image = self.image.clone();
            async move {
                let engine = ctx.engine(&node).await?;
                if let Err(e) = engine.pull_image(&image).await {
                    return Err(ctx.host_failure(&node, e).await);
                }
                debug!("Pulled {} on {}", image, node.address);
                Ok(())
            }
        })
        .await
    }
}

/// Create directories on every node
#[derive(Debug, Clone)]
pub struct MakeDirs {
    pub nodes: Vec<Node>,
    pub dirs: Vec<String>,
}

#[async_trait::async_trait]
impl Command for MakeDirs {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("make-dirs", node_target(&self.nodes))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        for_each_node(&self.nodes, ctx.max_parallelism, &ctx.cancel, |node| {
            let ctx = ctx.clone();
            let dirs = self.dirs.clone();
            async move {
                let shell = ctx.shell(&node).await?;
                match shell.make_dirs(&dirs).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(ctx.host_failure(&node, e).await),
                }
            }
        })
        .await
    }
}

/// A file to install on a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub mode: u32,
}

impl FileContent {
    /// World-readable file
    pub fn public(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: 0o644,
        }
    }

    /// Owner-only file
    pub fn secret(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: 0o600,
        }
    }
}

/// Install per-node file sets
#[derive(Debug, Clone)]
pub struct WriteFiles {
    pub nodes: Vec<Node>,
    /// Files keyed by node address
    pub files: BTreeMap<String, Vec<FileContent>>,
}

impl WriteFiles {
    pub fn new(entries: Vec<(Node, Vec<FileContent>)>) -> Self {
        let mut nodes = Vec::with_capacity(entries.len());
        let mut files = BTreeMap::new();
        for (node, content) in entries {
            files.insert(node.address.clone(), content);
            nodes.push(node);
        }
        Self { nodes, files }
    }
}

#[async_trait::async_trait]
impl Command for WriteFiles {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("write-files", node_target(&self.nodes))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        let files = Arc::new(self.files.clone());
        for_each_node(&self.nodes, ctx.max_parallelism, &ctx.cancel, |node| {
            let ctx = ctx.clone();
            let files = Arc::clone(&files);
            async move {
                let Some(set) = files.get(&node.address) else {
                    return Ok(());
                };
                let shell = ctx.shell(&node).await?;
                for file in set {
                    match shell.write_file(&file.path, file.content.as_bytes(), file.mode).await {
                        Ok(true) => debug!("Wrote {} on {}", file.path, node.address),
                        Ok(false) => {}
                        Err(e) => return Err(ctx.host_failure(&node, e).await),
                    }
                }
                Ok(())
            }
        })
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerAction {
    Stop,
    Kill,
    Restart,
}

async fn container_action(
    ctx: &RunContext,
    nodes: &[Node],
    name: &str,
    action: ContainerAction,
) -> Result<(), CommandError> {
    for_each_node(nodes, ctx.max_parallelism, &ctx.cancel, |node| {
        let ctx = ctx.clone();
        let name = name.to_string();
        async move {
            let engine = ctx.engine(&node).await?;
            let result = async {
                // Absent containers are nothing to act on
                if !engine.exists(&name).await? {
                    return Ok(());
                }
                match action {
                    ContainerAction::Stop => engine.stop(&name).await,
                    ContainerAction::Kill => engine.kill(&name).await,
                    ContainerAction::Restart => engine.restart(&name).await,
                }
            }
            .await;
            match result {
                Ok(()) => Ok(()),
                Err(e) => Err(ctx.host_failure(&node, e).await),
            }
        }
    })
    .await
}

/// Stop a container on every node
#[derive(Debug, Clone)]
pub struct StopContainer {
    pub nodes: Vec<Node>,
    pub name: String,
}

#[async_trait::async_trait]
impl Command for StopContainer {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("stop-container", format!("{} {}", self.name, node_target(&self.nodes)))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        container_action(ctx, &self.nodes, &self.name, ContainerAction::Stop).await
    }
}

/// Kill a container on every node
#[derive(Debug, Clone)]
pub struct KillContainer {
    pub nodes: Vec<Node>,
    pub name: String,
}

#[async_trait::async_trait]
impl Command for KillContainer {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("kill-container", format!("{} {}", self.name, node_target(&self.nodes)))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        container_action(ctx, &self.nodes, &self.name, ContainerAction::Kill).await
    }
}

/// Restart a container on every node
#[derive(Debug, Clone)]
pub struct RestartContainer {
    pub nodes: Vec<Node>,
    pub name: String,
}

#[async_trait::async_trait]
impl Command for RestartContainer {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("restart-container", format!("{} {}", self.name, node_target(&self.nodes)))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        container_action(ctx, &self.nodes, &self.name, ContainerAction::Restart).await
    }
}

/// Converge a system container to a fully rendered per-node spec
#[derive(Debug, Clone)]
pub struct RunContainer {
    pub specs: Vec<(Node, ContainerSpec)>,
}

#[async_trait::async_trait]
impl Command for RunContainer {
    fn descriptor(&self) -> CommandDescriptor {
        let name = self.specs.first().map_or("", |(_, s)| s.name.as_str());
        let nodes: Vec<Node> = self.specs.iter().map(|(n, _)| n.clone()).collect();
        CommandDescriptor::new("run-container", format!("{} {}", name, node_target(&nodes)))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        let nodes: Vec<Node> = self.specs.iter().map(|(n, _)| n.clone()).collect();
        let specs: Arc<BTreeMap<String, ContainerSpec>> = Arc::new(
            self.specs
                .iter()
                .map(|(n, s)| (n.address.clone(), s.clone()))
                .collect(),
        );
        for_each_node(&nodes, ctx.max_parallelism, &ctx.cancel, |node| {
            let ctx = ctx.clone();
            let specs = Arc::clone(&specs);
            async move {
                let Some(spec) = specs.get(&node.address) else {
                    return Ok(());
                };
                let engine = ctx.engine(&node).await?;
                let result = async {
                    engine.pull_image(&spec.image).await?;
                    engine.run_system(spec).await
                }
                .await;
                match result {
                    Ok(()) => {
                        info!("Container {} converged on {}", spec.name, node.address);
                        Ok(())
                    }
                    Err(e) => Err(ctx.host_failure(&node, e).await),
                }
            }
        })
        .await
    }
}

/// Install the kubeconfig of a Kubernetes component and converge its container
#[derive(Debug, Clone)]
pub struct RunKubeComponent {
    pub component: Component,
    pub cluster: Arc<Cluster>,
    pub nodes: Vec<Node>,
}

#[async_trait::async_trait]
impl Command for RunKubeComponent {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new(
            "run-kube-component",
            format!("{} {}", self.component.container_name(), node_target(&self.nodes)),
        )
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        let server_ca = ctx
            .infra
            .certificates()
            .ca_certificate(CaRole::Server)
            .await?
            .ok_or_else(|| CommandError::Certificate("server CA is missing".to_string()))?;
        let component = self.component;
        let cluster = Arc::clone(&self.cluster);
        let server_ca = Arc::new(server_ca);

        for_each_node(&self.nodes, ctx.max_parallelism, &ctx.cancel, |node| {
            let ctx = ctx.clone();
            let cluster = Arc::clone(&cluster);
            let server_ca = Arc::clone(&server_ca);
            async move {
                let shell = ctx.shell(&node).await?;
                let engine = ctx.engine(&node).await?;
                let spec = services::container_spec(component, &cluster, &node);
                let result = async {
                    shell.make_dirs(&services::component_dirs(component)).await?;
                    if let Some((path, content)) = services::kubeconfig_file(&cluster, &node, component, &server_ca) {
                        shell.write_file(&path, content.as_bytes(), 0o600).await?;
                    }
                    engine.pull_image(&spec.image).await?;
                    engine.run_system(&spec).await
                }
                .await;
                match result {
                    Ok(()) => {
                        info!("{} converged on {}", component.container_name(), node.address);
                        Ok(())
                    }
                    Err(e) => Err(ctx.host_failure(&node, e).await),
                }
            }
        })
        .await
    }
}
