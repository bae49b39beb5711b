//! Test helpers
//!
//! `SimulatedCluster` stands in for a whole data centre: an in-memory KV
//! store, one `MockHost` per node, an etcd membership model driven by the
//! etcd containers running on those hosts, and a small Kubernetes API
//! answering the kubectl invocations the controller makes.

use crate::certs::CertificateManager;
use crate::infrastructure::Infrastructure;
use crate::services::{self, Component};
use crate::storage::Storage;
use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use cluster_model::{Cluster, Node, REVISION_ANNOTATION};
use host_client::mock::RunHandler;
use host_client::{ContainerEngine, HostError, HostPool, MockConnector, MockHost, RemoteShell};
use kv_client::{Election, KvError, LeaderKey, Member, MemberClientTrait, MockKvClient, Session};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Election value used by `elect`
pub const TEST_LEADER: &str = "test-controller";

/// A cluster of `control_planes` + `workers` nodes at 10.0.0.1, 10.0.0.2, ...
pub fn sample_cluster(control_planes: usize, workers: usize) -> Cluster {
    let nodes = (0..control_planes + workers)
        .map(|i| Node::new(format!("10.0.0.{}", i + 1), i < control_planes))
        .collect();
    Cluster {
        name: "test".to_string(),
        nodes,
        service_subnet: "10.68.0.0/16".to_string(),
        pod_subnet: "10.64.0.0/14".to_string(),
        dns_servers: vec![],
        options: Default::default(),
        tls: Default::default(),
    }
}

/// Become leader on `storage`
pub async fn elect(storage: &Storage) -> (Session, LeaderKey) {
    let session = Session::new(storage.client(), Duration::from_secs(60)).await.unwrap();
    let election = Election::new(storage.client(), storage.leader_prefix());
    let leader = election
        .campaign(&session, TEST_LEADER, &CancellationToken::new())
        .await
        .unwrap();
    (session, leader)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn etcd_running(host: &MockHost) -> bool {
    host.is_reachable()
        && host
            .container(Component::Etcd.container_name())
            .is_some_and(|c| c.running)
}

#[derive(Debug, Default)]
struct EtcdState {
    members: BTreeMap<u64, Member>,
    next_id: u64,
}

/// etcd membership derived from the etcd containers on the hosts
///
/// The first etcd started with `--initial-cluster-state=new` seeds the
/// member list from its `--initial-cluster`. A member gets its name once
/// etcd runs on its host, and is healthy while the host is up and etcd
/// runs. The API is unavailable without a healthy quorum.
#[derive(Clone)]
struct SimulatedEtcd {
    connector: MockConnector,
    addresses: Vec<String>,
    state: Arc<Mutex<EtcdState>>,
    endpoints: Vec<String>,
    latency: Duration,
}

impl SimulatedEtcd {
    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn host_healthy(&self, address: &str) -> bool {
        self.connector.host(address).is_some_and(|h| etcd_running(&h))
    }

    fn sync(&self) -> MutexGuard<'_, EtcdState> {
        let mut state = lock(&self.state);
        if state.members.is_empty() {
            let seed = self.addresses.iter().find_map(|address| {
                let host = self.connector.host(address)?;
                if !etcd_running(&host) {
                    return None;
                }
                let spec = host.container_spec(Component::Etcd.container_name())?;
                if !spec.bootstrap_args.iter().any(|a| a == "--initial-cluster-state=new") {
                    return None;
                }
                spec.bootstrap_args
                    .iter()
                    .find_map(|a| a.strip_prefix("--initial-cluster="))
                    .map(str::to_string)
            });
            if let Some(initial) = seed {
                for entry in initial.split(',') {
                    let Some((_, peer)) = entry.split_once('=') else {
                        continue;
                    };
                    state.next_id += 1;
                    let id = state.next_id;
                    state.members.insert(
                        id,
                        Member {
                            id,
                            peer_urls: vec![peer.to_string()],
                            ..Default::default()
                        },
                    );
                }
            }
        }
        let names: Vec<(u64, String)> = state
            .members
            .values()
            .filter(|m| m.name.is_empty())
            .filter_map(|m| {
                let host = services::url_host(m.peer_urls.first()?);
                self.host_healthy(&host).then_some((m.id, host))
            })
            .collect();
        for (id, host) in names {
            if let Some(member) = state.members.get_mut(&id) {
                member.client_urls = vec![services::etcd_client_url(&host)];
                member.name = host;
            }
        }
        state
    }

    fn available(&self, state: &EtcdState) -> Result<(), KvError> {
        let reachable = self
            .endpoints
            .iter()
            .any(|e| self.host_healthy(&services::url_host(e)));
        let healthy = state
            .members
            .values()
            .filter(|m| !m.name.is_empty() && self.host_healthy(&m.name))
            .count();
        if !reachable || healthy < state.members.len() / 2 + 1 {
            return Err(KvError::Unavailable("etcd has no quorum".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MemberClientTrait for SimulatedEtcd {
    async fn member_list(&self) -> Result<Vec<Member>, KvError> {
        self.delay().await;
        let state = self.sync();
        self.available(&state)?;
        Ok(state.members.values().cloned().collect())
    }

    async fn member_add(&self, peer_urls: Vec<String>) -> Result<Member, KvError> {
        let mut state = self.sync();
        self.available(&state)?;
        if state
            .members
            .values()
            .any(|m| m.peer_urls.iter().any(|p| peer_urls.contains(p)))
        {
            return Err(KvError::Conflict("peer URL already registered".to_string()));
        }
        state.next_id += 1;
        let member = Member {
            id: state.next_id,
            peer_urls,
            ..Default::default()
        };
        state.members.insert(member.id, member.clone());
        Ok(member)
    }

    async fn member_remove(&self, id: u64) -> Result<(), KvError> {
        let mut state = self.sync();
        self.available(&state)?;
        state
            .members
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| KvError::NotFound(format!("member {id:x}")))
    }

    async fn endpoint_health(&self, endpoint: &str) -> Result<bool, KvError> {
        self.delay().await;
        Ok(self.host_healthy(&services::url_host(endpoint)))
    }
}

/// The Kubernetes API as seen through kubectl
#[derive(Debug, Default)]
pub struct SimulatedKubernetes {
    cordoned: Mutex<BTreeSet<String>>,
    objects: Mutex<BTreeMap<String, Value>>,
    applies: Mutex<u32>,
}

impl SimulatedKubernetes {
    /// Whether `kubectl cordon` was run for a node name
    pub fn is_cordoned(&self, name: &str) -> bool {
        lock(&self.cordoned).contains(name)
    }

    /// Revision annotation of an applied object
    pub fn applied_revision(&self, key: &str) -> Option<i64> {
        lock(&self.objects)
            .get(key)?
            .pointer("/metadata/annotations")?
            .get(REVISION_ANNOTATION)?
            .as_str()?
            .parse()
            .ok()
    }

    /// Number of objects applied so far
    pub fn applies(&self) -> u32 {
        *lock(&self.applies)
    }

    fn node_list(&self, connector: &MockConnector, nodes: &[Node]) -> Value {
        let cordoned = lock(&self.cordoned);
        let items: Vec<Value> = nodes
            .iter()
            .filter_map(|node| {
                let host = connector.host(&node.address)?;
                let kubelet = host.container(Component::Kubelet.container_name())?;
                let ready = if host.is_reachable() && kubelet.running { "True" } else { "False" };
                Some(json!({
                    "kind": "Node",
                    "metadata": { "name": node.node_name() },
                    "spec": { "unschedulable": cordoned.contains(node.node_name()) },
                    "status": {
                        "conditions": [{ "type": "Ready", "status": ready }]
                    }
                }))
            })
            .collect();
        json!({ "items": items })
    }

    fn apply(&self, stdin: Option<&[u8]>) -> anyhow::Result<String> {
        let object: Value = serde_json::from_slice(stdin.context("apply without stdin")?)?;
        let kind = object["kind"].as_str().context("object without kind")?.to_string();
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .context("object without name")?
            .to_string();
        let namespace = object
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        lock(&self.objects).insert(format!("{kind}/{namespace}/{name}"), object);
        *lock(&self.applies) += 1;
        Ok(format!("{} {} configured", kind.to_lowercase(), name))
    }

    fn get_kinds(&self, kinds: &str) -> Value {
        let kinds: BTreeSet<&str> = kinds.split(',').collect();
        let items: Vec<Value> = lock(&self.objects)
            .values()
            .filter(|o| o["kind"].as_str().is_some_and(|k| kinds.contains(k)))
            .cloned()
            .collect();
        json!({ "items": items })
    }

    fn kubectl(
        &self,
        host: &MockHost,
        connector: &MockConnector,
        nodes: &[Node],
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> anyhow::Result<String> {
        let running = host
            .container(Component::ApiServer.container_name())
            .is_some_and(|c| c.running);
        if !running {
            bail!("The connection to the server 127.0.0.1:6443 was refused");
        }
        let rest: Vec<&str> = args
            .iter()
            .skip_while(|a| a.as_str() == "kubectl" || a.starts_with("--kubeconfig"))
            .map(String::as_str)
            .collect();
        match rest.as_slice() {
            ["get", "nodes", "-o", "json"] => Ok(self.node_list(connector, nodes).to_string()),
            ["get", kinds, "-A", "-o", "json"] => Ok(self.get_kinds(kinds).to_string()),
            ["cordon", name] => {
                lock(&self.cordoned).insert((*name).to_string());
                Ok(format!("node/{name} cordoned"))
            }
            ["apply", "-f", "-"] => self.apply(stdin),
            other => Err(anyhow!("unsupported kubectl invocation: {}", other.join(" "))),
        }
    }
}

#[derive(Debug)]
struct Clock {
    offset: chrono::Duration,
}

#[derive(Debug, Default)]
struct Latency {
    etcd: Duration,
    http: Duration,
}

/// In-memory stand-in for the hosts, etcd, Kubernetes and the KV store
#[derive(Clone)]
pub struct SimulatedCluster {
    pub kv: MockKvClient,
    pub storage: Arc<Storage>,
    pub certificates: Arc<CertificateManager>,
    pub connector: MockConnector,
    pub pool: Arc<HostPool>,
    pub kubernetes: Arc<SimulatedKubernetes>,
    nodes: Vec<Node>,
    etcd: Arc<Mutex<EtcdState>>,
    clock: Arc<Mutex<Clock>>,
    latency: Arc<Mutex<Latency>>,
}

impl SimulatedCluster {
    /// Hosts for every node of `cluster`, with `cluster` stored as the declared document
    pub async fn new(cluster: &Cluster) -> Self {
        let sim = Self::unconfigured(cluster).await;
        sim.storage.put_cluster(cluster, 0).await.unwrap();
        sim
    }

    /// Hosts for every node of `cluster`, with no cluster document stored
    pub async fn unconfigured(cluster: &Cluster) -> Self {
        let kv = MockKvClient::new();
        let storage = Arc::new(Storage::new(Arc::new(kv.clone()), "/cke/", Duration::from_secs(2)));
        let connector = MockConnector::new();
        let sim = Self {
            certificates: Arc::new(CertificateManager::new(Arc::clone(&storage))),
            pool: Arc::new(HostPool::new(Arc::new(connector.clone()), Duration::from_secs(300))),
            kv,
            storage,
            connector,
            kubernetes: Arc::new(SimulatedKubernetes::default()),
            nodes: cluster.nodes.clone(),
            etcd: Arc::new(Mutex::new(EtcdState::default())),
            clock: Arc::new(Mutex::new(Clock {
                offset: chrono::Duration::zero(),
            })),
            latency: Arc::new(Mutex::new(Latency::default())),
        };
        for node in &cluster.nodes {
            sim.add_host(node);
        }
        sim
    }

    /// Register a host for `node` with the fake kubectl installed
    pub fn add_host(&self, node: &Node) -> MockHost {
        let host = MockHost::new(node.address.clone());
        let kubernetes = Arc::clone(&self.kubernetes);
        let connector = self.connector.clone();
        let nodes = self.nodes.clone();
        let this = host.clone();
        let handler: RunHandler = Arc::new(move |image: &str, args: &[String], stdin: Option<&[u8]>| {
            if image != services::KUBERNETES_IMAGE {
                return Ok(String::new());
            }
            kubernetes
                .kubectl(&this, &connector, &nodes, args, stdin)
                .map_err(|e| HostError::Exec {
                    address: this.host_address().to_string(),
                    command: args.join(" "),
                    code: 1,
                    stderr: e.to_string(),
                })
        });
        host.set_run_handler(handler);
        self.connector.add_host(host.clone());
        host
    }

    /// Host of a node
    pub fn host(&self, address: &str) -> MockHost {
        self.connector
            .host(address)
            .unwrap_or_else(|| panic!("no simulated host {address}"))
    }

    /// This simulation as the controller's infrastructure
    pub fn infra(&self) -> Arc<dyn Infrastructure> {
        Arc::new(self.clone())
    }

    /// Move the simulated clock forward
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).expect("duration in range");
        let mut clock = lock(&self.clock);
        clock.offset += by;
    }

    /// Delay every etcd membership call
    pub fn set_etcd_latency(&self, latency: Duration) {
        lock(&self.latency).etcd = latency;
    }

    /// Delay every HTTP readiness check
    pub fn set_http_latency(&self, latency: Duration) {
        lock(&self.latency).http = latency;
    }

    /// Current etcd members as the simulation sees them
    pub fn etcd_member_list(&self) -> Vec<Member> {
        let client = self.member_client(vec![]);
        let state = client.sync();
        state.members.values().cloned().collect()
    }

    fn member_client(&self, endpoints: Vec<String>) -> SimulatedEtcd {
        SimulatedEtcd {
            connector: self.connector.clone(),
            addresses: self.nodes.iter().map(|n| n.address.clone()).collect(),
            state: Arc::clone(&self.etcd),
            endpoints,
            latency: lock(&self.latency).etcd,
        }
    }
}

#[async_trait::async_trait]
impl Infrastructure for SimulatedCluster {
    async fn shell(&self, node: &Node) -> Result<Arc<dyn RemoteShell>, HostError> {
        self.pool.shell(&node.address, &node.user).await
    }

    async fn engine(&self, node: &Node) -> Result<Arc<dyn ContainerEngine>, HostError> {
        self.pool.engine(&node.address, &node.user).await
    }

    async fn evict(&self, address: &str) {
        self.pool.evict(address).await;
    }

    async fn etcd_members(
        &self,
        endpoints: &[String],
    ) -> Result<Arc<dyn MemberClientTrait>, crate::error::ControllerError> {
        Ok(Arc::new(self.member_client(endpoints.to_vec())))
    }

    async fn http_ready(&self, url: &str) -> bool {
        let latency = lock(&self.latency).http;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let address = services::url_host(url);
        let component = if url == services::kubelet_health_url(&address) {
            Component::Kubelet
        } else if url == services::apiserver_ready_url(&address) {
            Component::ApiServer
        } else {
            return false;
        };
        self.connector.host(&address).is_some_and(|h| {
            h.is_reachable() && h.container(component.container_name()).is_some_and(|c| c.running)
        })
    }

    fn storage(&self) -> Arc<Storage> {
        Arc::clone(&self.storage)
    }

    fn certificates(&self) -> Arc<CertificateManager> {
        Arc::clone(&self.certificates)
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + lock(&self.clock).offset
    }
}
