//! Mock host for testing
//!
//! `MockHost` implements both `RemoteShell` and `ContainerEngine` over an
//! in-memory model of a machine: files, systemd units, images and
//! containers. `MockConnector` hands out registered hosts.

use crate::engine::{ContainerEngine, ContainerInfo, ContainerSpec, Mount};
use crate::error::HostError;
use crate::pool::Connector;
use crate::shell::{ExecOutput, RemoteShell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handler for one-shot `run` invocations: `(image, args, stdin) -> stdout`
pub type RunHandler = Arc<dyn Fn(&str, &[String], Option<&[u8]>) -> Result<String, HostError> + Send + Sync>;

/// Handler for raw shell commands
pub type ExecHandler = Arc<dyn Fn(&str, Option<&[u8]>) -> ExecOutput + Send + Sync>;

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    running: bool,
    creations: u32,
    restarts: u32,
}

#[derive(Default)]
struct MockHostState {
    reachable: bool,
    engine_up: bool,
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    units: BTreeMap<String, String>,
    images: BTreeSet<String>,
    pulls: HashMap<String, u32>,
    failing_images: BTreeSet<String>,
    containers: BTreeMap<String, MockContainer>,
    commands: Vec<String>,
    run_handler: Option<RunHandler>,
    exec_handler: Option<ExecHandler>,
}

/// In-memory host
#[derive(Clone)]
pub struct MockHost {
    address: String,
    state: Arc<Mutex<MockHostState>>,
}

impl std::fmt::Debug for MockHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHost").field("address", &self.address).finish()
    }
}

impl MockHost {
    /// A reachable host with a running engine
    pub fn new(address: impl Into<String>) -> Self {
        let state = MockHostState {
            reachable: true,
            engine_up: true,
            units: BTreeMap::from([("docker.service".to_string(), "active".to_string())]),
            ..Default::default()
        };
        Self {
            address: address.into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockHostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(&self) -> Result<MutexGuard<'_, MockHostState>, HostError> {
        let state = self.lock();
        if state.reachable {
            Ok(state)
        } else {
            Err(HostError::Unreachable(self.address.clone()))
        }
    }

    fn engine_state(&self) -> Result<MutexGuard<'_, MockHostState>, HostError> {
        let state = self.check_reachable()?;
        if state.engine_up {
            Ok(state)
        } else {
            Err(HostError::Exec {
                address: self.address.clone(),
                command: "docker".to_string(),
                code: 1,
                stderr: "Cannot connect to the Docker daemon".to_string(),
            })
        }
    }

    /// Host address
    pub fn host_address(&self) -> &str {
        &self.address
    }

    /// Power the host on or off
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Whether the host is powered on
    pub fn is_reachable(&self) -> bool {
        self.lock().reachable
    }

    /// Start or stop the container engine
    pub fn set_engine_up(&self, up: bool) {
        self.lock().engine_up = up;
    }

    /// Make pulls of an image fail
    pub fn fail_image(&self, image: &str, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.failing_images.insert(image.to_string());
        } else {
            state.failing_images.remove(image);
        }
    }

    /// Install a handler for one-shot container runs
    pub fn set_run_handler(&self, handler: RunHandler) {
        self.lock().run_handler = Some(handler);
    }

    /// Install a handler for raw shell commands
    pub fn set_exec_handler(&self, handler: ExecHandler) {
        self.lock().exec_handler = Some(handler);
    }

    /// Commands issued so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Whether an image is present
    pub fn has_image(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    /// Number of actual pulls of an image
    pub fn pulls(&self, image: &str) -> u32 {
        self.lock().pulls.get(image).copied().unwrap_or(0)
    }

    /// File content
    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    /// Place a file
    pub fn put_file(&self, path: &str, content: &str) {
        self.lock().files.insert(path.to_string(), content.to_string());
    }

    /// Remove a file
    pub fn delete_file(&self, path: &str) {
        self.lock().files.remove(path);
    }

    /// Whether a directory was created
    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    /// Set a systemd unit state
    pub fn set_unit(&self, unit: &str, state: &str) {
        self.lock().units.insert(unit.to_string(), state.to_string());
    }

    /// Container as the engine reports it
    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.lock().containers.get(name).map(|c| info(name, c))
    }

    /// Spec a container was created with
    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(name).map(|c| c.spec.clone())
    }

    /// Names of running containers
    pub fn running_containers(&self) -> Vec<String> {
        self.lock()
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Times a container was (re)created
    pub fn creations(&self, name: &str) -> u32 {
        self.lock().containers.get(name).map_or(0, |c| c.creations)
    }

    /// Times a container was restarted
    pub fn restarts(&self, name: &str) -> u32 {
        self.lock().containers.get(name).map_or(0, |c| c.restarts)
    }

    /// Simulate a container crash
    pub fn crash_container(&self, name: &str) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.running = false;
        }
    }
}

fn info(name: &str, c: &MockContainer) -> ContainerInfo {
    ContainerInfo {
        name: name.to_string(),
        running: c.running,
        image: c.spec.image.clone(),
        spec_hash: c.spec.spec_hash(),
    }
}

#[async_trait::async_trait]
impl RemoteShell for MockHost {
    fn address(&self) -> &str {
        &self.address
    }

    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, HostError> {
        let handler = {
            let mut state = self.check_reachable()?;
            state.commands.push(command.to_string());
            state.exec_handler.clone()
        };
        Ok(handler.map_or_else(ExecOutput::default, |h| h(command, stdin)))
    }

    async fn make_dirs(&self, paths: &[String]) -> Result<(), HostError> {
        let mut state = self.check_reachable()?;
        state.commands.push(format!("mkdir -p {}", paths.join(" ")));
        state.dirs.extend(paths.iter().cloned());
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &[u8], _mode: u32) -> Result<bool, HostError> {
        let mut state = self.check_reachable()?;
        let content = String::from_utf8_lossy(content).into_owned();
        if state.files.get(path) == Some(&content) {
            return Ok(false);
        }
        state.commands.push(format!("install {path}"));
        state.files.insert(path.to_string(), content);
        Ok(true)
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>, HostError> {
        Ok(self.check_reachable()?.files.get(path).cloned())
    }

    async fn list_files(&self, dirs: &[String]) -> Result<BTreeSet<String>, HostError> {
        let state = self.check_reachable()?;
        Ok(state
            .files
            .keys()
            .filter(|p| {
                dirs.iter().any(|d| {
                    p.strip_prefix(d.trim_end_matches('/'))
                        .and_then(|rest| rest.strip_prefix('/'))
                        .is_some_and(|name| !name.contains('/'))
                })
            })
            .cloned()
            .collect())
    }

    async fn remove_paths(&self, paths: &[String]) -> Result<(), HostError> {
        let mut state = self.check_reachable()?;
        state.commands.push(format!("rm -rf {}", paths.join(" ")));
        for path in paths {
            let dir = format!("{}/", path.trim_end_matches('/'));
            state.files.retain(|p, _| p != path && !p.starts_with(&dir));
            state.dirs.retain(|p| p != path && !p.starts_with(&dir));
        }
        Ok(())
    }

    async fn unit_state(&self, unit: &str) -> Result<String, HostError> {
        let state = self.check_reachable()?;
        Ok(state
            .units
            .get(unit)
            .cloned()
            .unwrap_or_else(|| "inactive".to_string()))
    }
}

#[async_trait::async_trait]
impl ContainerEngine for MockHost {
    async fn ping(&self) -> Result<(), HostError> {
        self.engine_state().map(|_| ())
    }

    async fn pull_image(&self, image: &str) -> Result<(), HostError> {
        let mut state = self.engine_state()?;
        if state.images.contains(image) {
            return Ok(());
        }
        state.commands.push(format!("docker pull {image}"));
        if state.failing_images.contains(image) {
            return Err(HostError::Exec {
                address: self.address.clone(),
                command: format!("docker pull {image}"),
                code: 1,
                stderr: format!("manifest for {image} not found"),
            });
        }
        state.images.insert(image.to_string());
        *state.pulls.entry(image.to_string()).or_default() += 1;
        Ok(())
    }

    async fn run(
        &self,
        image: &str,
        _mounts: &[Mount],
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<String, HostError> {
        let handler = {
            let mut state = self.engine_state()?;
            state.commands.push(format!("docker run --rm {} {}", image, args.join(" ")));
            state.run_handler.clone()
        };
        match handler {
            Some(h) => h(image, args, stdin),
            None => Ok(String::new()),
        }
    }

    async fn run_system(&self, spec: &ContainerSpec) -> Result<(), HostError> {
        let mut state = self.engine_state()?;
        let hash = spec.spec_hash();
        if let Some(current) = state.containers.get_mut(&spec.name) {
            if current.spec.spec_hash() == hash {
                current.running = true;
                return Ok(());
            }
        }
        state.commands.push(format!("docker run -d --name={}", spec.name));
        let creations = state.containers.get(&spec.name).map_or(0, |c| c.creations);
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                spec: spec.clone(),
                running: true,
                creations: creations + 1,
                restarts: 0,
            },
        );
        Ok(())
    }

    async fn containers(&self) -> Result<BTreeMap<String, ContainerInfo>, HostError> {
        let state = self.engine_state()?;
        Ok(state
            .containers
            .iter()
            .map(|(n, c)| (n.clone(), info(n, c)))
            .collect())
    }

    async fn stop(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.engine_state()?;
        state.commands.push(format!("docker stop {name}"));
        if let Some(c) = state.containers.get_mut(name) {
            c.running = false;
        }
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.engine_state()?;
        state.commands.push(format!("docker kill {name}"));
        if let Some(c) = state.containers.get_mut(name) {
            c.running = false;
        }
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.engine_state()?;
        state.commands.push(format!("docker restart {name}"));
        match state.containers.get_mut(name) {
            Some(c) => {
                c.running = true;
                c.restarts += 1;
                Ok(())
            }
            None => Err(HostError::Exec {
                address: self.address.clone(),
                command: format!("docker restart {name}"),
                code: 1,
                stderr: format!("No such container: {name}"),
            }),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.engine_state()?;
        state.commands.push(format!("docker rm -f {name}"));
        state.containers.remove(name);
        Ok(())
    }
}

/// Connector handing out registered `MockHost`s
#[derive(Clone, Default)]
pub struct MockConnector {
    hosts: Arc<Mutex<BTreeMap<String, MockHost>>>,
    connects: Arc<Mutex<HashMap<String, u32>>>,
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector").finish_non_exhaustive()
    }
}

impl MockConnector {
    /// Empty connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host
    pub fn add_host(&self, host: MockHost) {
        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host.host_address().to_string(), host);
    }

    /// Registered host by address
    pub fn host(&self, address: &str) -> Option<MockHost> {
        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }

    /// Connection attempts made to a host
    pub fn connects(&self, address: &str) -> u32 {
        self.connects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn shell(&self, address: &str, _user: &str) -> Result<Arc<dyn RemoteShell>, HostError> {
        *self
            .connects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(address.to_string())
            .or_default() += 1;
        // Let concurrent callers pile up behind the first attempt.
        tokio::task::yield_now().await;
        let host = self.host(address).ok_or_else(|| HostError::Connect {
            address: address.to_string(),
            message: "no route to host".to_string(),
        })?;
        if !host.is_reachable() {
            return Err(HostError::Connect {
                address: address.to_string(),
                message: "connection timed out".to_string(),
            });
        }
        Ok(Arc::new(host))
    }

    async fn engine(&self, shell: Arc<dyn RemoteShell>) -> Result<Arc<dyn ContainerEngine>, HostError> {
        let host = self.host(shell.address()).ok_or_else(|| HostError::Connect {
            address: shell.address().to_string(),
            message: "no route to host".to_string(),
        })?;
        Ok(Arc::new(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(args: &[&str]) -> ContainerSpec {
        ContainerSpec {
            name: "kube-apiserver".into(),
            image: "quay.io/cybozu/kubernetes:1.30".into(),
            args: args.iter().map(|s| (*s).to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_system_idempotent_and_replaces_on_drift() {
        let host = MockHost::new("10.0.0.1");
        host.run_system(&spec(&["apiserver"])).await.unwrap();
        host.run_system(&spec(&["apiserver"])).await.unwrap();
        assert_eq!(host.creations("kube-apiserver"), 1);

        host.crash_container("kube-apiserver");
        host.run_system(&spec(&["apiserver"])).await.unwrap();
        assert_eq!(host.creations("kube-apiserver"), 1);
        assert!(host.container("kube-apiserver").unwrap().running);

        host.run_system(&spec(&["apiserver", "--v=2"])).await.unwrap();
        assert_eq!(host.creations("kube-apiserver"), 2);
    }

    #[tokio::test]
    async fn test_pull_image_is_idempotent() {
        let host = MockHost::new("10.0.0.1");
        host.pull_image("busybox").await.unwrap();
        host.pull_image("busybox").await.unwrap();
        assert_eq!(host.pulls("busybox"), 1);

        host.fail_image("broken", true);
        assert!(host.pull_image("broken").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let host = MockHost::new("10.0.0.1");
        host.set_reachable(false);
        let err = host.ping().await.unwrap_err();
        assert!(err.is_connection());
        assert!(RemoteShell::run(&host, "true").await.is_err());
    }

    #[tokio::test]
    async fn test_files() {
        let host = MockHost::new("10.0.0.1");
        assert!(host.write_file("/etc/cke/pki/ca.crt", b"A", 0o644).await.unwrap());
        assert!(!host.write_file("/etc/cke/pki/ca.crt", b"A", 0o644).await.unwrap());
        host.put_file("/etc/cke/pki/sub/x", "nested");
        let files = host.list_files(&["/etc/cke/pki".to_string()]).await.unwrap();
        assert_eq!(files.into_iter().collect::<Vec<_>>(), vec!["/etc/cke/pki/ca.crt".to_string()]);

        host.remove_paths(&["/etc/cke/pki".to_string()]).await.unwrap();
        assert!(host.read_file("/etc/cke/pki/ca.crt").await.unwrap().is_none());
    }
}
