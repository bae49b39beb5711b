//! Managed components
//!
//! Desired container specs, certificate plans, directories and kubeconfig
//! files of every component the controller runs on a node. Everything here
//! is a pure function of the cluster document, so operators can compare it
//! against observed state.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cluster_model::{BindMount, CaRole, Cluster, Node, ServiceParams};
use host_client::{ContainerSpec, Mount};
use std::net::Ipv4Addr;

/// Certificates and keys on every node
pub const PKI_DIR: &str = "/etc/cke/pki";
/// kubeconfig files
pub const KUBE_DIR: &str = "/etc/kubernetes";
/// etcd data
pub const ETCD_DATA_DIR: &str = "/var/lib/etcd";
/// kubelet state
pub const KUBELET_DIR: &str = "/var/lib/kubelet";
/// Log directory shared by the components
pub const LOG_DIR: &str = "/var/log/kubernetes";

/// etcd image
pub const ETCD_IMAGE: &str = "quay.io/cybozu/etcd:3.5.15.1";
/// Image bundling every Kubernetes binary, kubectl included
pub const KUBERNETES_IMAGE: &str = "quay.io/cybozu/kubernetes:1.30.5.1";

/// Container runtime unit checked by the prober
pub const RUNTIME_UNIT: &str = "docker.service";

/// etcd client port
pub const ETCD_CLIENT_PORT: u16 = 2379;
/// etcd peer port
pub const ETCD_PEER_PORT: u16 = 2380;
/// kube-apiserver secure port
pub const APISERVER_PORT: u16 = 6443;
/// kubelet healthz port
pub const KUBELET_HEALTHZ_PORT: u16 = 10248;

/// kubeconfig with cluster-admin rights, present on control-plane nodes
pub const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// A containerised component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// etcd
    Etcd,
    /// kube-apiserver
    ApiServer,
    /// kube-controller-manager
    ControllerManager,
    /// kube-scheduler
    Scheduler,
    /// kubelet
    Kubelet,
    /// kube-proxy
    Proxy,
}

impl Component {
    /// Control-plane components other than etcd, in start order
    pub const CONTROL_PLANE: [Component; 3] = [Component::ApiServer, Component::ControllerManager, Component::Scheduler];

    /// Components on every node, in start order
    pub const WORKER: [Component; 2] = [Component::Kubelet, Component::Proxy];

    /// Every component
    pub const ALL: [Component; 6] = [
        Component::Etcd,
        Component::ApiServer,
        Component::ControllerManager,
        Component::Scheduler,
        Component::Kubelet,
        Component::Proxy,
    ];

    /// Container name
    pub fn container_name(&self) -> &'static str {
        match self {
            Component::Etcd => "etcd",
            Component::ApiServer => "kube-apiserver",
            Component::ControllerManager => "kube-controller-manager",
            Component::Scheduler => "kube-scheduler",
            Component::Kubelet => "kubelet",
            Component::Proxy => "kube-proxy",
        }
    }

    /// Image the component runs from
    pub fn image(&self) -> &'static str {
        match self {
            Component::Etcd => ETCD_IMAGE,
            _ => KUBERNETES_IMAGE,
        }
    }

    /// Whether the component runs on `node`
    pub fn runs_on(&self, node: &Node) -> bool {
        match self {
            Component::Kubelet | Component::Proxy => true,
            _ => node.control_plane,
        }
    }

    fn params<'a>(&self, cluster: &'a Cluster) -> &'a ServiceParams {
        let o = &cluster.options;
        match self {
            Component::Etcd => &o.etcd,
            Component::ApiServer => &o.kube_api,
            Component::ControllerManager => &o.kube_controller_manager,
            Component::Scheduler => &o.kube_scheduler,
            Component::Kubelet => &o.kubelet.service,
            Component::Proxy => &o.kube_proxy,
        }
    }

    /// Certificate names the component reads
    pub fn certificates(&self) -> &'static [&'static str] {
        match self {
            Component::Etcd => &["etcd-server", "etcd-peer"],
            Component::ApiServer => &["apiserver", "apiserver-etcd-client"],
            Component::ControllerManager => &["controller-manager"],
            Component::Scheduler => &["scheduler"],
            Component::Kubelet => &["kubelet"],
            Component::Proxy => &["proxy"],
        }
    }

    /// Look up a component by container name
    pub fn from_container_name(name: &str) -> Option<Component> {
        Component::ALL.into_iter().find(|c| c.container_name() == name)
    }
}

/// Certificate file of a leaf
pub fn cert_path(name: &str) -> String {
    format!("{PKI_DIR}/{name}.crt")
}

/// Private key file of a leaf
pub fn key_path(name: &str) -> String {
    format!("{PKI_DIR}/{name}.key")
}

/// Certificate file of an authority
pub fn ca_path(role: CaRole) -> String {
    format!("{PKI_DIR}/ca-{}.crt", role.as_str())
}

/// Vault target of a node certificate
pub fn cert_target(node: &Node, name: &str) -> String {
    format!("{}/{}", node.address, name)
}

/// Client URL of etcd on a node
pub fn etcd_client_url(address: &str) -> String {
    format!("https://{address}:{ETCD_CLIENT_PORT}")
}

/// Peer URL of etcd on a node
pub fn etcd_peer_url(address: &str) -> String {
    format!("https://{address}:{ETCD_PEER_PORT}")
}

/// Host part of an etcd URL
pub fn url_host(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let host_port = rest.split('/').next().unwrap_or(rest);
    match host_port.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => host_port.to_string(),
    }
}

/// kube-apiserver URL of a control-plane node
pub fn apiserver_url(address: &str) -> String {
    format!("https://{address}:{APISERVER_PORT}")
}

/// kubelet health URL
pub fn kubelet_health_url(address: &str) -> String {
    format!("http://{address}:{KUBELET_HEALTHZ_PORT}/healthz")
}

/// kube-apiserver readiness URL
pub fn apiserver_ready_url(address: &str) -> String {
    format!("{}/readyz", apiserver_url(address))
}

/// Client endpoints of etcd on the control planes
pub fn etcd_endpoints(cluster: &Cluster) -> Vec<String> {
    cluster
        .control_planes()
        .iter()
        .map(|n| etcd_client_url(&n.address))
        .collect()
}

/// First address of the service subnet (the `kubernetes` service IP)
fn first_service_ip(subnet: &str) -> Option<String> {
    let (base, _) = subnet.split_once('/')?;
    let ip: Ipv4Addr = base.parse().ok()?;
    Some(Ipv4Addr::from(u32::from(ip).checked_add(1)?).to_string())
}

/// One leaf certificate a node needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPlan {
    /// File base name and vault target suffix
    pub name: &'static str,
    /// Issuing authority
    pub role: CaRole,
    /// Subject CN
    pub common_name: String,
    /// Subject O
    pub organization: Option<String>,
    /// SANs
    pub alt_names: Vec<String>,
}

/// Certificate a component needs on a node, by name
pub fn cert_plan(cluster: &Cluster, node: &Node, name: &'static str) -> Option<CertPlan> {
    let addr = node.address.clone();
    let plan = |role: CaRole, cn: &str, org: Option<&str>, alt: Vec<String>| CertPlan {
        name,
        role,
        common_name: cn.to_string(),
        organization: org.map(str::to_string),
        alt_names: alt,
    };
    let local = vec![addr.clone(), "127.0.0.1".to_string(), "localhost".to_string()];
    Some(match name {
        "etcd-server" => plan(CaRole::Server, &addr, None, local),
        "etcd-peer" => plan(CaRole::EtcdPeer, &addr, None, vec![addr.clone()]),
        "apiserver" => {
            let domain = &cluster.options.kubelet.domain;
            let mut alt = local;
            alt.extend([
                "kubernetes".to_string(),
                "kubernetes.default".to_string(),
                "kubernetes.default.svc".to_string(),
                format!("kubernetes.default.svc.{domain}"),
            ]);
            alt.extend(first_service_ip(&cluster.service_subnet));
            plan(CaRole::Server, "kube-apiserver", None, alt)
        }
        "apiserver-etcd-client" => plan(CaRole::EtcdClient, "kube-apiserver", None, vec![]),
        "controller-manager" => plan(CaRole::Kubernetes, "system:kube-controller-manager", None, vec![]),
        "scheduler" => plan(CaRole::Kubernetes, "system:kube-scheduler", None, vec![]),
        "admin" => plan(CaRole::Kubernetes, "admin", Some("system:masters"), vec![]),
        "kubelet" => {
            let mut alt = vec![addr.clone()];
            if node.node_name() != addr {
                alt.push(node.node_name().to_string());
            }
            plan(
                CaRole::Kubernetes,
                &format!("system:node:{}", node.node_name()),
                Some("system:nodes"),
                alt,
            )
        }
        "proxy" => plan(CaRole::Kubernetes, "system:kube-proxy", None, vec![]),
        _ => return None,
    })
}

/// Certificates for the given components on a node (admin included on control planes)
pub fn component_certificates(cluster: &Cluster, node: &Node, components: &[Component]) -> Vec<CertPlan> {
    let mut names: Vec<&'static str> = components
        .iter()
        .filter(|c| c.runs_on(node))
        .flat_map(|c| c.certificates().iter().copied())
        .collect();
    if node.control_plane && components.contains(&Component::ApiServer) {
        names.push("admin");
    }
    names.sort_unstable();
    names.dedup();
    names.into_iter().filter_map(|n| cert_plan(cluster, node, n)).collect()
}

/// Every certificate a node needs
pub fn node_certificates(cluster: &Cluster, node: &Node) -> Vec<CertPlan> {
    component_certificates(cluster, node, &Component::ALL)
}

/// Directories a component needs on the host
pub fn component_dirs(component: Component) -> Vec<String> {
    let mut dirs = vec![PKI_DIR.to_string(), LOG_DIR.to_string()];
    match component {
        Component::Etcd => dirs.push(ETCD_DATA_DIR.to_string()),
        Component::Kubelet => {
            dirs.push(KUBE_DIR.to_string());
            dirs.push(KUBELET_DIR.to_string());
        }
        _ => dirs.push(KUBE_DIR.to_string()),
    }
    dirs
}

/// Directories of several components, deduplicated and sorted
pub fn dirs_for(components: &[Component]) -> Vec<String> {
    let mut dirs: Vec<String> = components.iter().flat_map(|c| component_dirs(*c)).collect();
    dirs.sort();
    dirs.dedup();
    dirs
}

fn kubeconfig(cluster: &Cluster, server: &str, user: &str, cert_name: &str, ca_pem: &str) -> String {
    let ca = STANDARD.encode(ca_pem);
    format!(
        "apiVersion: v1\n\
         kind: Config\n\
         clusters:\n\
         - name: {cluster}\n  \
           cluster:\n    \
             server: {server}\n    \
             certificate-authority-data: {ca}\n\
         users:\n\
         - name: {user}\n  \
           user:\n    \
             client-certificate: {cert}\n    \
             client-key: {key}\n\
         contexts:\n\
         - name: default\n  \
           context:\n    \
             cluster: {cluster}\n    \
             user: {user}\n\
         current-context: default\n",
        cluster = cluster.name,
        cert = cert_path(cert_name),
        key = key_path(cert_name),
    )
}

/// kube-apiserver endpoint used by components on `node`
fn api_endpoint(cluster: &Cluster, node: &Node) -> String {
    if node.control_plane {
        return apiserver_url("127.0.0.1");
    }
    cluster
        .control_planes()
        .first()
        .map_or_else(|| apiserver_url("127.0.0.1"), |cp| apiserver_url(&cp.address))
}

/// kubeconfig file of a component (`None` for components without one)
pub fn kubeconfig_file(cluster: &Cluster, node: &Node, component: Component, server_ca: &str) -> Option<(String, String)> {
    let (file, user, cert) = match component {
        Component::ControllerManager => ("controller-manager.conf", "system:kube-controller-manager", "controller-manager"),
        Component::Scheduler => ("scheduler.conf", "system:kube-scheduler", "scheduler"),
        Component::Kubelet => ("kubelet.conf", "kubelet", "kubelet"),
        Component::Proxy => ("proxy.conf", "system:kube-proxy", "proxy"),
        Component::ApiServer => ("admin.conf", "admin", "admin"),
        Component::Etcd => return None,
    };
    let server = api_endpoint(cluster, node);
    Some((
        format!("{KUBE_DIR}/{file}"),
        kubeconfig(cluster, &server, user, cert, server_ca),
    ))
}

fn base_mounts(component: Component) -> Vec<Mount> {
    let mut mounts = vec![
        Mount::ro(PKI_DIR, PKI_DIR),
        Mount::rw(LOG_DIR, LOG_DIR),
        Mount::ro("/etc/hostname", "/etc/machine-id"),
    ];
    match component {
        Component::Etcd => mounts.push(Mount::rw(ETCD_DATA_DIR, ETCD_DATA_DIR)),
        Component::Kubelet => {
            mounts.push(Mount::ro(KUBE_DIR, KUBE_DIR));
            mounts.push(Mount::rw(KUBELET_DIR, KUBELET_DIR));
            mounts.push(Mount::rw("/var/run/docker.sock", "/var/run/docker.sock"));
        }
        _ => mounts.push(Mount::ro(KUBE_DIR, KUBE_DIR)),
    }
    mounts
}

fn bind(b: &BindMount) -> Mount {
    Mount {
        source: b.source.clone(),
        destination: b.destination.clone(),
        read_only: b.read_only,
    }
}

fn args_for(component: Component, cluster: &Cluster, node: &Node) -> Vec<String> {
    let addr = &node.address;
    let pki = |name: &str| cert_path(name);
    let key = |name: &str| key_path(name);
    match component {
        Component::Etcd => vec![
            "etcd".to_string(),
            format!("--name={addr}"),
            format!("--data-dir={ETCD_DATA_DIR}"),
            format!("--listen-client-urls=https://0.0.0.0:{ETCD_CLIENT_PORT}"),
            format!("--listen-peer-urls=https://0.0.0.0:{ETCD_PEER_PORT}"),
            format!("--advertise-client-urls={}", etcd_client_url(addr)),
            format!("--initial-advertise-peer-urls={}", etcd_peer_url(addr)),
            format!("--cert-file={}", pki("etcd-server")),
            format!("--key-file={}", key("etcd-server")),
            format!("--trusted-ca-file={}", ca_path(CaRole::EtcdClient)),
            "--client-cert-auth=true".to_string(),
            format!("--peer-cert-file={}", pki("etcd-peer")),
            format!("--peer-key-file={}", key("etcd-peer")),
            format!("--peer-trusted-ca-file={}", ca_path(CaRole::EtcdPeer)),
            "--peer-client-cert-auth=true".to_string(),
            "--initial-cluster-token=cke".to_string(),
        ],
        Component::ApiServer => vec![
            "apiserver".to_string(),
            format!("--advertise-address={addr}"),
            format!("--secure-port={APISERVER_PORT}"),
            format!("--etcd-servers={}", etcd_endpoints(cluster).join(",")),
            format!("--etcd-cafile={}", ca_path(CaRole::Server)),
            format!("--etcd-certfile={}", pki("apiserver-etcd-client")),
            format!("--etcd-keyfile={}", key("apiserver-etcd-client")),
            format!("--tls-cert-file={}", pki("apiserver")),
            format!("--tls-private-key-file={}", key("apiserver")),
            format!("--client-ca-file={}", ca_path(CaRole::Kubernetes)),
            format!("--service-cluster-ip-range={}", cluster.service_subnet),
            format!("--service-account-key-file={}", key("apiserver")),
            format!("--service-account-signing-key-file={}", key("apiserver")),
            "--service-account-issuer=https://kubernetes.default.svc".to_string(),
            "--authorization-mode=Node,RBAC".to_string(),
        ],
        Component::ControllerManager => vec![
            "controller-manager".to_string(),
            format!("--kubeconfig={KUBE_DIR}/controller-manager.conf"),
            format!("--cluster-name={}", cluster.name),
            format!("--cluster-cidr={}", cluster.pod_subnet),
            format!("--service-cluster-ip-range={}", cluster.service_subnet),
            format!("--root-ca-file={}", ca_path(CaRole::Kubernetes)),
            format!("--service-account-private-key-file={}", key("apiserver")),
            "--use-service-account-credentials=true".to_string(),
        ],
        Component::Scheduler => vec![
            "scheduler".to_string(),
            format!("--kubeconfig={KUBE_DIR}/scheduler.conf"),
        ],
        Component::Kubelet => {
            let kubelet = &cluster.options.kubelet;
            let mut args = vec![
                "kubelet".to_string(),
                format!("--kubeconfig={KUBE_DIR}/kubelet.conf"),
                format!("--hostname-override={}", node.node_name()),
                format!("--node-ip={addr}"),
                format!("--cluster-domain={}", kubelet.domain),
                format!("--fail-swap-on={}", !kubelet.allow_swap),
                "--healthz-bind-address=0.0.0.0".to_string(),
                format!("--healthz-port={KUBELET_HEALTHZ_PORT}"),
                format!("--tls-cert-file={}", pki("kubelet")),
                format!("--tls-private-key-file={}", key("kubelet")),
                format!("--client-ca-file={}", ca_path(CaRole::Kubernetes)),
            ];
            if !cluster.dns_servers.is_empty() {
                args.push(format!("--cluster-dns={}", cluster.dns_servers.join(",")));
            }
            if !node.labels.is_empty() {
                let labels: Vec<String> = node.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
                args.push(format!("--node-labels={}", labels.join(",")));
            }
            args
        }
        Component::Proxy => vec![
            "proxy".to_string(),
            format!("--kubeconfig={KUBE_DIR}/proxy.conf"),
            format!("--cluster-cidr={}", cluster.pod_subnet),
            format!("--hostname-override={}", node.node_name()),
        ],
    }
}

/// Desired container spec of a component on a node
pub fn container_spec(component: Component, cluster: &Cluster, node: &Node) -> ContainerSpec {
    let params = component.params(cluster);
    let mut args = args_for(component, cluster, node);
    args.extend(params.extra_args.iter().cloned());
    let mut mounts = base_mounts(component);
    mounts.extend(params.extra_binds.iter().map(bind));
    ContainerSpec {
        name: component.container_name().to_string(),
        image: component.image().to_string(),
        args,
        env: params.extra_env.clone(),
        mounts,
        privileged: matches!(component, Component::Kubelet | Component::Proxy),
        bootstrap_args: Vec::new(),
    }
}

/// etcd arguments used only when the member is first created
pub fn etcd_bootstrap_args(initial_cluster: &[(String, String)], new_cluster: bool) -> Vec<String> {
    let members: Vec<String> = initial_cluster
        .iter()
        .map(|(name, peer)| format!("{name}={peer}"))
        .collect();
    vec![
        format!("--initial-cluster={}", members.join(",")),
        format!(
            "--initial-cluster-state={}",
            if new_cluster { "new" } else { "existing" }
        ),
    ]
}

/// Mounts for one-shot kubectl runs on a control-plane node
pub fn kubectl_mounts() -> Vec<Mount> {
    vec![Mount::ro(PKI_DIR, PKI_DIR), Mount::ro(KUBE_DIR, KUBE_DIR)]
}

/// `kubectl` argument prefix using the admin kubeconfig
pub fn kubectl_args(rest: &[&str]) -> Vec<String> {
    let mut args = vec!["kubectl".to_string(), format!("--kubeconfig={ADMIN_KUBECONFIG}")];
    args.extend(rest.iter().map(|s| (*s).to_string()));
    args
}
