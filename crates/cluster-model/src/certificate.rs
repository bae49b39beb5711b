//! Certificate metadata kept in the vault

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Certificate authorities managed by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaRole {
    /// Serving certificates (etcd client port, kube-apiserver)
    Server,
    /// etcd peer traffic
    EtcdPeer,
    /// Clients of etcd (kube-apiserver, the controller itself)
    EtcdClient,
    /// Kubernetes client certificates (admin, scheduler, kubelet, ...)
    Kubernetes,
}

impl CaRole {
    /// Every role, in a fixed order
    pub const ALL: [CaRole; 4] = [
        CaRole::Server,
        CaRole::EtcdPeer,
        CaRole::EtcdClient,
        CaRole::Kubernetes,
    ];

    /// Name used in vault keys and file names
    pub fn as_str(&self) -> &'static str {
        match self {
            CaRole::Server => "server",
            CaRole::EtcdPeer => "etcd-peer",
            CaRole::EtcdClient => "etcd-client",
            CaRole::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for CaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CaRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown CA role: {s}"))
    }
}

/// Bookkeeping for one issued certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMetadata {
    /// Issuing authority
    pub role: CaRole,

    /// Hex serial number
    pub serial: String,

    /// What the certificate is for: `<node address>/<certificate name>`
    pub target: String,

    /// Subject common name
    pub common_name: String,

    /// Subject alternative names
    #[serde(default)]
    pub alt_names: Vec<String>,

    /// Organization, when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    /// Start of validity
    pub not_before: DateTime<Utc>,

    /// End of validity
    pub not_after: DateTime<Utc>,

    /// Revoked by the controller (superseded or owner removed)
    #[serde(default)]
    pub revoked: bool,
}

impl CertificateMetadata {
    /// Whether the certificate must be re-issued at `now`: remaining lifetime
    /// is within `window` (inclusive boundary).
    pub fn needs_renewal(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match chrono::Duration::from_std(window) {
            Ok(window) => now >= self.not_after - window,
            Err(_) => true,
        }
    }

    /// Whether the certificate has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// Seconds of validity remaining at `now` (negative once expired)
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_seconds()
    }
}
