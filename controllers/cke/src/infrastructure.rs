//! Infrastructure facade
//!
//! Everything a command or the prober needs to touch the outside world:
//! host channels, the managed etcd cluster, HTTP readiness endpoints, the
//! KV gateway and the certificate manager. `HostInfrastructure` is the real
//! implementation; tests substitute a simulated cluster.

use crate::certs::{CertificateManager, IssueRequest};
use crate::error::ControllerError;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use cluster_model::{CaRole, Node};
use host_client::{ContainerEngine, HostError, HostPool, RemoteShell};
use kv_client::{EtcdClient, EtcdConfig, MemberClientTrait};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Timeout of readiness probes
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifetime of the client certificate used to administer etcd
const ETCD_CLIENT_VALIDITY: Duration = Duration::from_secs(3600);

/// Access to hosts and cluster services
#[async_trait::async_trait]
pub trait Infrastructure: Send + Sync {
    /// Shell channel to a node
    async fn shell(&self, node: &Node) -> Result<Arc<dyn RemoteShell>, HostError>;

    /// Container engine channel to a node
    async fn engine(&self, node: &Node) -> Result<Arc<dyn ContainerEngine>, HostError>;

    /// Forget channels to a node after a connection failure
    async fn evict(&self, address: &str);

    /// Member administration client for the managed etcd cluster
    async fn etcd_members(&self, endpoints: &[String]) -> Result<Arc<dyn MemberClientTrait>, ControllerError>;

    /// Whether an HTTP(S) health endpoint answers with a success status
    async fn http_ready(&self, url: &str) -> bool;

    /// KV gateway
    fn storage(&self) -> Arc<Storage>;

    /// Certificate manager
    fn certificates(&self) -> Arc<CertificateManager>;

    /// Current time
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Production infrastructure: SSH pool, etcd gateway and reqwest
pub struct HostInfrastructure {
    pool: Arc<HostPool>,
    storage: Arc<Storage>,
    certificates: Arc<CertificateManager>,
    http: reqwest::Client,
    etcd_timeout: Duration,
}

impl std::fmt::Debug for HostInfrastructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostInfrastructure")
            .field("pool", &self.pool)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl HostInfrastructure {
    /// Assemble the facade
    pub fn new(pool: Arc<HostPool>, storage: Arc<Storage>, etcd_timeout: Duration) -> Result<Self, ControllerError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(true)
            .timeout(READY_TIMEOUT)
            .build()
            .map_err(|e| ControllerError::Http(e.to_string()))?;
        Ok(Self {
            certificates: Arc::new(CertificateManager::new(Arc::clone(&storage))),
            pool,
            storage,
            http,
            etcd_timeout,
        })
    }
}

#[async_trait::async_trait]
impl Infrastructure for HostInfrastructure {
    async fn shell(&self, node: &Node) -> Result<Arc<dyn RemoteShell>, HostError> {
        self.pool.shell(&node.address, &node.user).await
    }

    async fn engine(&self, node: &Node) -> Result<Arc<dyn ContainerEngine>, HostError> {
        self.pool.engine(&node.address, &node.user).await
    }

    async fn evict(&self, address: &str) {
        self.pool.evict(address).await;
    }

    async fn etcd_members(&self, endpoints: &[String]) -> Result<Arc<dyn MemberClientTrait>, ControllerError> {
        let request = IssueRequest {
            target: "cke/etcd-client".to_string(),
            common_name: "root".to_string(),
            organization: None,
            alt_names: vec![],
            validity: ETCD_CLIENT_VALIDITY,
        };
        let client_cert = self
            .certificates
            .issue_ephemeral(CaRole::EtcdClient, &request, self.now())
            .await?;
        let server_ca = self
            .certificates
            .ca_certificate(CaRole::Server)
            .await?
            .ok_or_else(|| ControllerError::NotFound("server CA".to_string()))?;

        let client = EtcdClient::new(EtcdConfig {
            endpoints: endpoints.to_vec(),
            ca_pem: Some(server_ca.into_bytes()),
            cert_pem: Some(client_cert.certificate.into_bytes()),
            key_pem: Some(client_cert.private_key.into_bytes()),
            timeout: self.etcd_timeout,
            ..Default::default()
        })?;
        Ok(Arc::new(client))
    }

    async fn http_ready(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("{} not ready: {}", url, e);
                false
            }
        }
    }

    fn storage(&self) -> Arc<Storage> {
        Arc::clone(&self.storage)
    }

    fn certificates(&self) -> Arc<CertificateManager> {
        Arc::clone(&self.certificates)
    }
}
