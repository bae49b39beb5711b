//! CKE Controller
//!
//! Leader-elected controller that keeps a set of hosts running a declared
//! Kubernetes cluster:
//! - etcd, control-plane and worker components as host containers
//! - per-role certificate authorities and leaf certificates
//! - user-declared resources applied to the cluster
//!
//! All state lives in a replicated KV store; any number of instances may run
//! and exactly one of them acts at a time.

mod backoff;
mod certs;
mod commands;
mod config;
mod controller;
mod error;
mod executor;
mod fanout;
mod infrastructure;
mod metrics;
mod operators;
mod planner;
mod prober;
mod server;
mod services;
mod storage;
mod watcher;

#[cfg(test)]
mod scenarios_test;
#[cfg(test)]
mod storage_test;
#[cfg(test)]
mod test_utils;

use crate::config::{Args, KvConfig};
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::infrastructure::HostInfrastructure;
use crate::metrics::Metrics;
use crate::storage::Storage;
use clap::Parser;
use host_client::{HostPool, SshConfig, SshConnector};
use kv_client::EtcdClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting CKE Controller");

    let args = Args::parse();
    let settings = args.settings()?;
    let kv_config = KvConfig::load(&args.config).await?;

    info!("Configuration:");
    info!("  KV endpoints: {}", kv_config.endpoints.join(","));
    info!("  KV prefix: {}", kv_config.prefix);
    info!("  HTTP: {}", args.http);
    info!("  Interval: {:?}", settings.interval);

    let client = EtcdClient::new(kv_config.etcd_config().await?)?;
    let storage = Arc::new(Storage::new(Arc::new(client), kv_config.prefix.clone(), kv_config.timeout));

    let ssh = SshConfig {
        identity_file: args.ssh_key.clone(),
        ..SshConfig::default()
    };
    let pool = Arc::new(HostPool::new(Arc::new(SshConnector::new(ssh)), args.idle_timeout));
    let infra = Arc::new(HostInfrastructure::new(Arc::clone(&pool), Arc::clone(&storage), kv_config.timeout)?);

    let metrics = Metrics::new()?;
    let name = std::env::var("HOSTNAME").unwrap_or_else(|_| format!("cke-{}", uuid::Uuid::new_v4()));
    let controller = Controller::new(infra, settings, metrics.clone(), name);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    let reaper = Arc::clone(&pool).spawn_reaper(cancel.clone());

    let state = server::ApiState::new(Arc::clone(&storage), controller.executor(), metrics);
    let http = tokio::spawn(server::serve(args.http, state, cancel.clone()));

    let result = controller.run(cancel.clone()).await;
    cancel.cancel();

    match http.await {
        Ok(Err(e)) => warn!("HTTP server exited with error: {}", e),
        Err(e) => warn!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = reaper.await {
        warn!("Connection reaper task failed: {}", e);
    }
    pool.close_all().await;

    result
}

/// Cancel `cancel` on SIGINT or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown requested");
    cancel.cancel();
}
