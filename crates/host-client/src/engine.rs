//! Container engine
//!
//! Drives the Docker CLI on a host through its `RemoteShell`. System
//! containers carry a label with the hash of their spec so drift can be
//! detected without parsing `docker inspect` output.

use crate::error::HostError;
use crate::shell::{RemoteShell, shell_join, shell_quote};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Label carrying the spec hash of a system container
pub const SPEC_HASH_LABEL: &str = "cke.spec-hash";

/// Bind mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    /// Host path
    pub source: String,
    /// Container path
    pub destination: String,
    /// Mount read-only
    pub read_only: bool,
}

impl Mount {
    /// Read-only bind mount
    pub fn ro(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            read_only: true,
        }
    }

    /// Read-write bind mount
    pub fn rw(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            read_only: false,
        }
    }

    fn to_arg(&self) -> String {
        let mut arg = format!("--volume={}:{}", self.source, self.destination);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Desired state of a long-running system container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Environment
    pub env: BTreeMap<String, String>,
    /// Bind mounts
    pub mounts: Vec<Mount>,
    /// Run privileged
    pub privileged: bool,
    /// Arguments used only when the container is created; not part of the hash
    #[serde(skip)]
    pub bootstrap_args: Vec<String>,
}

impl ContainerSpec {
    /// Hex SHA-256 of the spec (excluding bootstrap arguments)
    pub fn spec_hash(&self) -> String {
        // Serializing a struct of strings, maps and bools cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&json))
    }
}

/// One container as reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Container name
    pub name: String,
    /// Container is running
    pub running: bool,
    /// Image reference
    pub image: String,
    /// Value of the spec hash label (empty for foreign containers)
    pub spec_hash: String,
}

/// Container engine operations on one host
#[async_trait::async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Whether the engine daemon answers
    async fn ping(&self) -> Result<(), HostError>;

    /// Pull an image unless already present
    async fn pull_image(&self, image: &str) -> Result<(), HostError>;

    /// Run a one-shot container and return its stdout
    async fn run(
        &self,
        image: &str,
        mounts: &[Mount],
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<String, HostError>;

    /// Converge a system container to `spec`
    ///
    /// No-op when a container with the same spec hash is running; starts it
    /// when stopped; otherwise replaces it.
    async fn run_system(&self, spec: &ContainerSpec) -> Result<(), HostError>;

    /// Every container on the host by name
    async fn containers(&self) -> Result<BTreeMap<String, ContainerInfo>, HostError>;

    /// Whether a container with this name exists
    async fn exists(&self, name: &str) -> Result<bool, HostError> {
        Ok(self.containers().await?.contains_key(name))
    }

    /// Stop a container (no-op if absent)
    async fn stop(&self, name: &str) -> Result<(), HostError>;

    /// Kill a container (no-op if absent)
    async fn kill(&self, name: &str) -> Result<(), HostError>;

    /// Restart a container
    async fn restart(&self, name: &str) -> Result<(), HostError>;

    /// Remove a container (no-op if absent)
    async fn remove(&self, name: &str) -> Result<(), HostError>;
}

/// Docker CLI driven over a remote shell
pub struct DockerEngine {
    shell: Arc<dyn RemoteShell>,
}

impl std::fmt::Debug for DockerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerEngine")
            .field("address", &self.shell.address())
            .finish()
    }
}

impl DockerEngine {
    /// Wrap a shell
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self { shell }
    }

    async fn docker(&self, args: &[String]) -> Result<String, HostError> {
        self.shell.run(&format!("docker {}", shell_join(args))).await
    }
}

/// Arguments for `docker run` of a system container
pub fn system_run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        format!("--name={}", spec.name),
        "--restart=unless-stopped".to_string(),
        "--network=host".to_string(),
        "--log-driver=journald".to_string(),
        format!("--label={}={}", SPEC_HASH_LABEL, spec.spec_hash()),
    ];
    if spec.privileged {
        args.push("--privileged".to_string());
    }
    for (k, v) in &spec.env {
        args.push(format!("--env={k}={v}"));
    }
    args.extend(spec.mounts.iter().map(Mount::to_arg));
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args.extend(spec.bootstrap_args.iter().cloned());
    args
}

/// Parse `docker ps --format` lines of `name|state|image|hash`
fn parse_ps(output: &str) -> Result<BTreeMap<String, ContainerInfo>, HostError> {
    let mut containers = BTreeMap::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.trim().splitn(4, '|').collect();
        let [name, state, image, hash] = fields.as_slice() else {
            return Err(HostError::Decode(format!("unexpected docker ps line: {line}")));
        };
        containers.insert(
            (*name).to_string(),
            ContainerInfo {
                name: (*name).to_string(),
                running: *state == "running",
                image: (*image).to_string(),
                spec_hash: (*hash).to_string(),
            },
        );
    }
    Ok(containers)
}

#[async_trait::async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), HostError> {
        self.shell
            .run("docker version --format '{{.Server.Version}}'")
            .await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), HostError> {
        let img = shell_quote(image);
        self.shell
            .run(&format!(
                "docker image inspect {img} >/dev/null 2>&1 || docker pull -q {img}"
            ))
            .await?;
        Ok(())
    }

    async fn run(
        &self,
        image: &str,
        mounts: &[Mount],
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<String, HostError> {
        let mut cmd = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--network=host".to_string(),
            "--log-driver=none".to_string(),
        ];
        cmd.extend(mounts.iter().map(Mount::to_arg));
        cmd.push(image.to_string());
        cmd.extend(args.iter().cloned());
        let command = format!("docker {}", shell_join(&cmd));
        let output = self.shell.exec(&command, stdin).await?;
        if !output.success() {
            return Err(HostError::Exec {
                address: self.shell.address().to_string(),
                command,
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn run_system(&self, spec: &ContainerSpec) -> Result<(), HostError> {
        let hash = spec.spec_hash();
        if let Some(current) = self.containers().await?.remove(&spec.name) {
            if current.spec_hash == hash {
                if !current.running {
                    info!("Starting stopped container {} on {}", spec.name, self.shell.address());
                    self.docker(&["start".to_string(), spec.name.clone()]).await?;
                }
                return Ok(());
            }
            debug!("Container {} on {} drifted; replacing", spec.name, self.shell.address());
            self.docker(&["rm".to_string(), "-f".to_string(), spec.name.clone()])
                .await?;
        }
        info!("Creating container {} on {}", spec.name, self.shell.address());
        self.docker(&system_run_args(spec)).await?;
        Ok(())
    }

    async fn containers(&self) -> Result<BTreeMap<String, ContainerInfo>, HostError> {
        let format = format!("{{{{.Names}}}}|{{{{.State}}}}|{{{{.Image}}}}|{{{{.Label \"{SPEC_HASH_LABEL}\"}}}}");
        let output = self
            .docker(&[
                "ps".to_string(),
                "-a".to_string(),
                "--no-trunc".to_string(),
                format!("--format={format}"),
            ])
            .await?;
        parse_ps(&output)
    }

    async fn stop(&self, name: &str) -> Result<(), HostError> {
        if self.exists(name).await? {
            self.docker(&["stop".to_string(), name.to_string()]).await?;
        }
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), HostError> {
        let containers = self.containers().await?;
        if containers.get(name).is_some_and(|c| c.running) {
            self.docker(&["kill".to_string(), name.to_string()]).await?;
        }
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<(), HostError> {
        self.docker(&["restart".to_string(), name.to_string()]).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), HostError> {
        if self.exists(name).await? {
            self.docker(&["rm".to_string(), "-f".to_string(), name.to_string()])
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "etcd".into(),
            image: "quay.io/cybozu/etcd:3.5".into(),
            args: vec!["etcd".into(), "--name=10.0.0.1".into()],
            env: BTreeMap::from([("ETCDCTL_API".into(), "3".into())]),
            mounts: vec![Mount::rw("/var/lib/etcd", "/var/lib/etcd"), Mount::ro("/etc/cke/pki", "/etc/cke/pki")],
            privileged: false,
            bootstrap_args: vec!["--initial-cluster-state=new".into()],
        }
    }

    #[test]
    fn test_spec_hash_ignores_bootstrap_args() {
        let a = spec();
        let mut b = spec();
        b.bootstrap_args = vec!["--initial-cluster-state=existing".into()];
        assert_eq!(a.spec_hash(), b.spec_hash());

        b.args.push("--quota-backend-bytes=8589934592".into());
        assert_ne!(a.spec_hash(), b.spec_hash());
    }

    #[test]
    fn test_system_run_args() {
        let s = spec();
        let args = system_run_args(&s);
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--name=etcd".to_string()));
        assert!(args.contains(&format!("--label={}={}", SPEC_HASH_LABEL, s.spec_hash())));
        assert!(args.contains(&"--volume=/etc/cke/pki:/etc/cke/pki:ro".to_string()));
        let image_pos = args.iter().position(|a| a == &s.image).unwrap();
        assert_eq!(args[image_pos + 1], "etcd");
        assert_eq!(args.last().unwrap(), "--initial-cluster-state=new");
    }

    #[test]
    fn test_parse_ps() {
        let out = "etcd|running|quay.io/cybozu/etcd:3.5|abc\nold|exited|busybox|\n";
        let containers = parse_ps(out).unwrap();
        assert_eq!(containers.len(), 2);
        assert!(containers["etcd"].running);
        assert_eq!(containers["etcd"].spec_hash, "abc");
        assert!(!containers["old"].running);
        assert!(containers["old"].spec_hash.is_empty());
        assert!(parse_ps("garbage").is_err());
    }
}
