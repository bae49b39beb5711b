//! Configuration
//!
//! Two layers: command-line flags (each with a `CKE_*` environment
//! fallback) for process behaviour, and a YAML file describing how to reach
//! the replicated KV store.

use crate::error::ControllerError;
use clap::Parser;
use kv_client::EtcdConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line flags
#[derive(Debug, Clone, Parser)]
#[command(name = "cke", version, about = "Kubernetes cluster lifecycle controller")]
pub struct Args {
    /// Listen address of the HTTP server
    #[arg(long, env = "CKE_HTTP", default_value = "0.0.0.0:10180")]
    pub http: SocketAddr,

    /// KV connection config file
    #[arg(long, env = "CKE_CONFIG", default_value = "/etc/cke/config.yml")]
    pub config: PathBuf,

    /// Maximum wait between ticks
    #[arg(long, env = "CKE_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Interval of certificate garbage collection
    #[arg(long, env = "CKE_CERTS_GC_INTERVAL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub certs_gc_interval: Duration,

    /// TTL of the leader session lease
    #[arg(long, env = "CKE_SESSION_TTL", default_value = "60s", value_parser = humantime::parse_duration)]
    pub session_ttl: Duration,

    /// Deadline of one tick
    #[arg(long, env = "CKE_TICK_TIMEOUT", default_value = "30m", value_parser = humantime::parse_duration)]
    pub tick_timeout: Duration,

    /// Deadline of one command
    #[arg(long, env = "CKE_COMMAND_TIMEOUT", default_value = "10m", value_parser = humantime::parse_duration)]
    pub command_timeout: Duration,

    /// Share of the interval the prober may use
    #[arg(long, env = "CKE_PROBE_TIMEOUT_RATIO", default_value_t = 0.5)]
    pub probe_timeout_ratio: f64,

    /// Maximum concurrent per-node operations
    #[arg(long, env = "CKE_MAX_PARALLELISM", default_value_t = 32)]
    pub max_parallelism: usize,

    /// Operation records kept in the store
    #[arg(long, env = "CKE_RECORDS_RETENTION", default_value_t = 1000)]
    pub records_retention: usize,

    /// Close host connections idle for this long
    #[arg(long, env = "CKE_IDLE_TIMEOUT", default_value = "5m", value_parser = humantime::parse_duration)]
    pub idle_timeout: Duration,

    /// SSH private key used to reach nodes
    #[arg(long, env = "CKE_SSH_KEY")]
    pub ssh_key: Option<PathBuf>,
}

impl Args {
    /// Loop settings derived from the flags
    pub fn settings(&self) -> Result<Settings, ControllerError> {
        if !(self.probe_timeout_ratio > 0.0 && self.probe_timeout_ratio <= 1.0) {
            return Err(ControllerError::InvalidConfig(format!(
                "--probe-timeout-ratio must be in (0, 1], got {}",
                self.probe_timeout_ratio
            )));
        }
        for (flag, value) in [
            ("--interval", self.interval),
            ("--certs-gc-interval", self.certs_gc_interval),
            ("--session-ttl", self.session_ttl),
            ("--tick-timeout", self.tick_timeout),
            ("--command-timeout", self.command_timeout),
        ] {
            if value.is_zero() {
                return Err(ControllerError::InvalidConfig(format!("{flag} must be positive")));
            }
        }
        if self.records_retention == 0 {
            return Err(ControllerError::InvalidConfig(
                "--records-retention must be at least 1".to_string(),
            ));
        }
        Ok(Settings {
            interval: self.interval,
            certs_gc_interval: self.certs_gc_interval,
            session_ttl: self.session_ttl,
            tick_timeout: self.tick_timeout,
            command_timeout: self.command_timeout,
            probe_timeout: self.interval.mul_f64(self.probe_timeout_ratio),
            max_parallelism: self.max_parallelism.max(1),
            records_retention: self.records_retention,
        })
    }
}

/// Settings of the leader loop
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum wait between ticks
    pub interval: Duration,
    /// Certificate garbage collection period
    pub certs_gc_interval: Duration,
    /// Session lease TTL
    pub session_ttl: Duration,
    /// Deadline of one tick
    pub tick_timeout: Duration,
    /// Deadline of one command
    pub command_timeout: Duration,
    /// Deadline of one prober pass
    pub probe_timeout: Duration,
    /// Fan-out width cap
    pub max_parallelism: usize,
    /// Records kept after truncation
    pub records_retention: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            certs_gc_interval: Duration::from_secs(3600),
            session_ttl: Duration::from_secs(60),
            tick_timeout: Duration::from_secs(30 * 60),
            command_timeout: Duration::from_secs(10 * 60),
            probe_timeout: Duration::from_secs(30),
            max_parallelism: 32,
            records_retention: 1000,
        }
    }
}

fn default_prefix() -> String {
    "/cke/".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Connection settings of the replicated KV store (`config.yml`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KvConfig {
    /// Client URLs
    pub endpoints: Vec<String>,

    /// Key prefix of every controller key
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Per-request deadline
    #[serde(with = "cluster_model::duration", default = "default_timeout")]
    pub timeout: Duration,

    /// User for password authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for password authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// CA bundle file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ca: Option<PathBuf>,

    /// Client certificate file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,

    /// Client private key file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,
}

impl KvConfig {
    /// Parse YAML text
    pub fn from_yaml(data: &str) -> Result<Self, ControllerError> {
        let mut config: KvConfig = serde_yaml::from_str(data)
            .map_err(|e| ControllerError::InvalidConfig(format!("config file: {e}")))?;
        if config.endpoints.is_empty() {
            return Err(ControllerError::InvalidConfig("endpoints must not be empty".to_string()));
        }
        if !config.prefix.ends_with('/') {
            config.prefix.push('/');
        }
        Ok(config)
    }

    /// Read and parse the config file
    pub async fn load(path: &Path) -> Result<Self, ControllerError> {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ControllerError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&data)
    }

    /// Build the etcd client settings, reading the PEM files
    pub async fn etcd_config(&self) -> Result<EtcdConfig, ControllerError> {
        Ok(EtcdConfig {
            endpoints: self.endpoints.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            ca_pem: read_optional(self.tls_ca.as_deref()).await?,
            cert_pem: read_optional(self.tls_cert.as_deref()).await?,
            key_pem: read_optional(self.tls_key.as_deref()).await?,
            timeout: self.timeout,
        })
    }
}

async fn read_optional(path: Option<&Path>) -> Result<Option<Vec<u8>>, ControllerError> {
    match path {
        Some(p) => tokio::fs::read(p)
            .await
            .map(Some)
            .map_err(|e| ControllerError::InvalidConfig(format!("{}: {}", p.display(), e))),
        None => Ok(None),
    }
}
