//! kubectl commands
//!
//! kubectl runs as a one-shot container from the Kubernetes image on a
//! control-plane node, authenticated by the admin kubeconfig.

use super::{Command, RunContext};
use crate::error::CommandError;
use crate::services;
use cluster_model::{CommandDescriptor, Node, REVISION_ANNOTATION, ResourceDefinition};
use serde_json::Value;
use tracing::info;

/// Run kubectl on `node` with optional stdin and return its output
pub(crate) async fn kubectl(
    ctx: &RunContext,
    node: &Node,
    args: &[&str],
    stdin: Option<&[u8]>,
) -> Result<String, CommandError> {
    let engine = ctx.engine(node).await?;
    let mounts = services::kubectl_mounts();
    let args = services::kubectl_args(args);
    let run = engine.run(services::KUBERNETES_IMAGE, &mounts, &args, stdin);
    let result = tokio::select! {
        () = ctx.cancel.cancelled() => return Err(CommandError::Cancelled),
        result = run => result,
    };
    match result {
        Ok(out) => Ok(out),
        Err(e) => Err(CommandError::on_node(&node.address, ctx.host_failure(node, e).await)),
    }
}

/// Render a manifest as JSON carrying the revision annotation
pub fn annotate(definition: &ResourceDefinition) -> Result<String, CommandError> {
    let mut object: Value = serde_yaml::from_str(&definition.manifest)
        .map_err(|e| CommandError::Failed(format!("{}: invalid manifest: {}", definition.key(), e)))?;
    let Some(root) = object.as_object_mut() else {
        return Err(CommandError::Failed(format!("{}: manifest is not an object", definition.key())));
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    let Some(metadata) = metadata.as_object_mut() else {
        return Err(CommandError::Failed(format!("{}: metadata is not an object", definition.key())));
    };
    let annotations = metadata
        .entry("annotations")
        .or_insert_with(|| Value::Object(Default::default()));
    let Some(annotations) = annotations.as_object_mut() else {
        return Err(CommandError::Failed(format!("{}: annotations is not an object", definition.key())));
    };
    annotations.insert(
        REVISION_ANNOTATION.to_string(),
        Value::String(definition.revision.to_string()),
    );
    serde_json::to_string(&object).map_err(|e| CommandError::Failed(format!("{}: {}", definition.key(), e)))
}

/// Apply resource definitions, in key order
#[derive(Debug, Clone)]
pub struct KubectlApply {
    /// Control-plane node to run kubectl on
    pub node: Node,
    pub resources: Vec<ResourceDefinition>,
}

#[async_trait::async_trait]
impl Command for KubectlApply {
    fn descriptor(&self) -> CommandDescriptor {
        let keys: Vec<String> = self.resources.iter().map(ResourceDefinition::key).collect();
        CommandDescriptor::new("kubectl-apply", keys.join(","))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        for definition in &self.resources {
            let manifest = annotate(definition)?;
            kubectl(ctx, &self.node, &["apply", "-f", "-"], Some(manifest.as_bytes())).await?;
            info!("Applied {} at revision {}", definition.key(), definition.revision);
        }
        Ok(())
    }
}

/// Mark a Kubernetes node unschedulable
#[derive(Debug, Clone)]
pub struct KubectlCordon {
    /// Control-plane node to run kubectl on
    pub node: Node,
    /// Kubernetes node name to cordon
    pub target: String,
}

#[async_trait::async_trait]
impl Command for KubectlCordon {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("kubectl-cordon", self.target.clone())
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        kubectl(ctx, &self.node, &["cordon", &self.target], None).await?;
        info!("Cordoned {}", self.target);
        Ok(())
    }
}
