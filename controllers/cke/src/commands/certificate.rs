//! Certificate commands

use super::{Command, RunContext, node_target};
use crate::certs::IssueRequest;
use crate::error::CommandError;
use crate::fanout::for_each_node;
use crate::services::{self, CertPlan};
use cluster_model::{CaRole, CommandDescriptor, Node};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Create missing authorities
#[derive(Debug, Clone)]
pub struct CreateCa {
    pub roles: Vec<CaRole>,
    pub validity: Duration,
}

#[async_trait::async_trait]
impl Command for CreateCa {
    fn descriptor(&self) -> CommandDescriptor {
        let roles: Vec<&str> = self.roles.iter().map(|r| r.as_str()).collect();
        CommandDescriptor::new("create-ca", roles.join(","))
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        let certificates = ctx.infra.certificates();
        for role in &self.roles {
            if ctx.cancel.is_cancelled() {
                return Err(CommandError::Cancelled);
            }
            certificates
                .ensure_ca(*role, self.validity, ctx.infra.now(), &ctx.guard)
                .await?;
        }
        Ok(())
    }
}

/// Issue node certificates and install them together with the authority files
///
/// A certificate is left alone when the vault holds a live one for the
/// target outside the renewal window and the node carries exactly that
/// certificate plus a key.
#[derive(Debug, Clone)]
pub struct IssueCertificate {
    pub nodes: Vec<Node>,
    /// Certificates keyed by node address
    pub plans: BTreeMap<String, Vec<CertPlan>>,
    pub validity: Duration,
    pub renewal_window: Duration,
}

impl IssueCertificate {
    pub fn new(entries: Vec<(Node, Vec<CertPlan>)>, validity: Duration, renewal_window: Duration) -> Self {
        let mut nodes = Vec::with_capacity(entries.len());
        let mut plans = BTreeMap::new();
        for (node, certs) in entries {
            plans.insert(node.address.clone(), certs);
            nodes.push(node);
        }
        Self {
            nodes,
            plans,
            validity,
            renewal_window,
        }
    }
}

#[async_trait::async_trait]
impl Command for IssueCertificate {
    fn descriptor(&self) -> CommandDescriptor {
        let mut names: Vec<&str> = self.plans.values().flatten().map(|p| p.name).collect();
        names.sort_unstable();
        names.dedup();
        CommandDescriptor::new(
            "issue-certificate",
            format!("{} {}", names.join(","), node_target(&self.nodes)),
        )
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        let certificates = ctx.infra.certificates();
        let mut authorities = Vec::new();
        for role in CaRole::ALL {
            if let Some(pem) = certificates.ca_certificate(role).await? {
                authorities.push((services::ca_path(role), pem));
            }
        }
        let authorities = Arc::new(authorities);
        let plans = Arc::new(self.plans.clone());
        let validity = self.validity;
        let window = self.renewal_window;

        for_each_node(&self.nodes, ctx.max_parallelism, &ctx.cancel, |node| {
            let ctx = ctx.clone();
            let authorities = Arc::clone(&authorities);
            let plans = Arc::clone(&plans);
            async move {
                let shell = ctx.shell(&node).await?;
                for (path, pem) in authorities.iter() {
                    if let Err(e) = shell.write_file(path, pem.as_bytes(), 0o644).await {
                        return Err(ctx.host_failure(&node, e).await);
                    }
                }

                let certificates = ctx.infra.certificates();
                for plan in plans.get(&node.address).into_iter().flatten() {
                    let target = services::cert_target(&node, plan.name);
                    let crt = services::cert_path(plan.name);
                    let key = services::key_path(plan.name);
                    let now = ctx.infra.now();

                    if let Some(current) = certificates.latest(plan.role, &target).await? {
                        let installed = match shell.read_file(&crt).await {
                            Ok(content) => content,
                            Err(e) => return Err(ctx.host_failure(&node, e).await),
                        };
                        let has_key = match shell.list_files(&[services::PKI_DIR.to_string()]).await {
                            Ok(files) => files.contains(&key),
                            Err(e) => return Err(ctx.host_failure(&node, e).await),
                        };
                        if !current.metadata.needs_renewal(now, window)
                            && installed.as_deref() == Some(current.certificate.as_str())
                            && has_key
                        {
                            debug!("Certificate {} is current", target);
                            continue;
                        }
                    }

                    let request = IssueRequest {
                        target: target.clone(),
                        common_name: plan.common_name.clone(),
                        organization: plan.organization.clone(),
                        alt_names: plan.alt_names.clone(),
                        validity,
                    };
                    let issued = certificates.issue(plan.role, &request, now, &ctx.guard).await?;
                    let written = async {
                        shell.write_file(&key, issued.private_key.as_bytes(), 0o600).await?;
                        shell.write_file(&crt, issued.certificate.as_bytes(), 0o644).await
                    }
                    .await;
                    if let Err(e) = written {
                        return Err(ctx.host_failure(&node, e).await);
                    }
                    info!("Installed certificate {} ({})", target, issued.metadata.serial);
                }
                Ok(())
            }
        })
        .await
    }
}

/// Revoke every live certificate whose target starts with a prefix
#[derive(Debug, Clone)]
pub struct RevokeCertificate {
    pub prefix: String,
}

impl RevokeCertificate {
    /// Every certificate of a node
    pub fn for_node(address: &str) -> Self {
        Self {
            prefix: format!("{address}/"),
        }
    }
}

#[async_trait::async_trait]
impl Command for RevokeCertificate {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("revoke-certificate", self.prefix.clone())
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        let revoked = ctx.infra.certificates().revoke_targets(&self.prefix, &ctx.guard).await?;
        if revoked > 0 {
            info!("Revoked {} certificates under {}", revoked, self.prefix);
        }
        Ok(())
    }
}

/// Delete revoked and expired vault entries
#[derive(Debug, Clone, Default)]
pub struct CertsGc;

#[async_trait::async_trait]
impl Command for CertsGc {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("certs-gc", "vault")
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), CommandError> {
        ctx.infra.certificates().gc(ctx.infra.now(), &ctx.guard).await?;
        Ok(())
    }
}
