//! Per-host channel pool
//!
//! Channels are keyed by `(address, kind)`. Concurrent requests for a
//! missing channel share a single connection attempt; idle channels are
//! closed by a background reaper.

use crate::engine::{ContainerEngine, DockerEngine};
use crate::error::HostError;
use crate::shell::{RemoteShell, SshConfig, SshShell};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Kind of pooled channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Remote shell
    Shell,
    /// Container engine
    Engine,
}

/// Opens channels to hosts
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a shell to `user@address`
    async fn shell(&self, address: &str, user: &str) -> Result<Arc<dyn RemoteShell>, HostError>;

    /// Open an engine channel layered on an existing shell
    async fn engine(&self, shell: Arc<dyn RemoteShell>) -> Result<Arc<dyn ContainerEngine>, HostError> {
        Ok(Arc::new(DockerEngine::new(shell)))
    }
}

/// Connector using the system `ssh` binary
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    /// Create a connector
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Connector for SshConnector {
    async fn shell(&self, address: &str, user: &str) -> Result<Arc<dyn RemoteShell>, HostError> {
        let shell = SshShell::connect(address, user, self.config.clone()).await?;
        Ok(Arc::new(shell))
    }
}

#[derive(Clone)]
enum Channel {
    Shell(Arc<dyn RemoteShell>),
    Engine(Arc<dyn ContainerEngine>),
}

struct Slot {
    channel: OnceCell<Channel>,
    last_used: Mutex<Instant>,
}

impl Slot {
    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

type Key = (String, ChannelKind);

/// Pool of host channels
pub struct HostPool {
    connector: Arc<dyn Connector>,
    idle_timeout: Duration,
    slots: Mutex<HashMap<Key, Arc<Slot>>>,
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool")
            .field("idle_timeout", &self.idle_timeout)
            .field("channels", &self.len())
            .finish()
    }
}

impl HostPool {
    /// Create a pool
    pub fn new(connector: Arc<dyn Connector>, idle_timeout: Duration) -> Self {
        Self {
            connector,
            idle_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, address: &str, kind: ChannelKind) -> Arc<Slot> {
        let mut slots = self.lock();
        Arc::clone(slots.entry((address.to_string(), kind)).or_insert_with(|| {
            Arc::new(Slot {
                channel: OnceCell::new(),
                last_used: Mutex::new(Instant::now()),
            })
        }))
    }

    /// Number of open channels
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| s.channel.initialized())
            .count()
    }

    /// Whether no channel is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shell channel to a host, opened on first use
    pub async fn shell(&self, address: &str, user: &str) -> Result<Arc<dyn RemoteShell>, HostError> {
        let slot = self.slot(address, ChannelKind::Shell);
        let channel = slot
            .channel
            .get_or_try_init(|| async {
                debug!("Connecting shell to {}", address);
                self.connector.shell(address, user).await.map(Channel::Shell)
            })
            .await?;
        slot.touch();
        match channel {
            Channel::Shell(shell) => Ok(Arc::clone(shell)),
            Channel::Engine(_) => Err(HostError::Decode(format!("channel mismatch for {address}"))),
        }
    }

    /// Engine channel to a host, opened on first use
    pub async fn engine(&self, address: &str, user: &str) -> Result<Arc<dyn ContainerEngine>, HostError> {
        let slot = self.slot(address, ChannelKind::Engine);
        let channel = slot
            .channel
            .get_or_try_init(|| async {
                let shell = self.shell(address, user).await?;
                self.connector.engine(shell).await.map(Channel::Engine)
            })
            .await?;
        slot.touch();
        // The engine rides on the shell channel; keep it alive too.
        if let Some(shell) = self.lock().get(&(address.to_string(), ChannelKind::Shell)) {
            shell.touch();
        }
        match channel {
            Channel::Engine(engine) => Ok(Arc::clone(engine)),
            Channel::Shell(_) => Err(HostError::Decode(format!("channel mismatch for {address}"))),
        }
    }

    /// Drop every channel to a host (after a connection failure)
    pub async fn evict(&self, address: &str) {
        let removed: Vec<Arc<Slot>> = {
            let mut slots = self.lock();
            let keys: Vec<Key> = slots.keys().filter(|(a, _)| a == address).cloned().collect();
            keys.into_iter().filter_map(|k| slots.remove(&k)).collect()
        };
        close_slots(removed).await;
    }

    /// Close channels idle for longer than the idle timeout
    pub async fn evict_idle(&self) -> usize {
        let removed: Vec<Arc<Slot>> = {
            let mut slots = self.lock();
            let keys: Vec<Key> = slots
                .iter()
                .filter(|(_, s)| s.idle_for() >= self.idle_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter().filter_map(|k| slots.remove(&k)).collect()
        };
        let count = removed.len();
        if count > 0 {
            info!("Closing {} idle host channels", count);
        }
        close_slots(removed).await;
        count
    }

    /// Close every channel
    pub async fn close_all(&self) {
        let removed: Vec<Arc<Slot>> = self.lock().drain().map(|(_, s)| s).collect();
        close_slots(removed).await;
    }

    /// Periodically evict idle channels until `cancel` fires
    pub fn spawn_reaper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = (self.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(period) => {
                        self.evict_idle().await;
                    }
                }
            }
            self.close_all().await;
        })
    }
}

async fn close_slots(slots: Vec<Arc<Slot>>) {
    for slot in slots {
        if let Some(Channel::Shell(shell)) = slot.channel.get() {
            if let Err(e) = shell.close().await {
                warn!("Failed to close channel to {}: {}", shell.address(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockHost};

    fn pool(connector: &MockConnector, idle: Duration) -> HostPool {
        HostPool::new(Arc::new(connector.clone()), idle)
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_connection() {
        let connector = MockConnector::new();
        connector.add_host(MockHost::new("10.0.0.1"));
        let pool = Arc::new(pool(&connector, Duration::from_secs(300)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.engine("10.0.0.1", "cke").await.map(|_| ()) }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(connector.connects("10.0.0.1"), 1);
        assert_eq!(pool.len(), 2, "shell and engine channels");
    }

    #[tokio::test]
    async fn test_failed_connection_is_retried() {
        let connector = MockConnector::new();
        let host = MockHost::new("10.0.0.2");
        host.set_reachable(false);
        connector.add_host(host.clone());
        let pool = pool(&connector, Duration::from_secs(300));

        assert!(pool.shell("10.0.0.2", "cke").await.is_err());
        host.set_reachable(true);
        assert!(pool.shell("10.0.0.2", "cke").await.is_ok());
        assert_eq!(connector.connects("10.0.0.2"), 2);
    }

    #[tokio::test]
    async fn test_idle_channels_are_evicted() {
        let connector = MockConnector::new();
        connector.add_host(MockHost::new("10.0.0.3"));
        let pool = pool(&connector, Duration::from_millis(20));

        pool.shell("10.0.0.3", "cke").await.unwrap();
        assert_eq!(pool.evict_idle().await, 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.evict_idle().await, 1);
        assert!(pool.is_empty());

        pool.shell("10.0.0.3", "cke").await.unwrap();
        assert_eq!(connector.connects("10.0.0.3"), 2);
    }

    #[tokio::test]
    async fn test_evict_host() {
        let connector = MockConnector::new();
        connector.add_host(MockHost::new("10.0.0.4"));
        connector.add_host(MockHost::new("10.0.0.5"));
        let pool = pool(&connector, Duration::from_secs(300));
        pool.engine("10.0.0.4", "cke").await.unwrap();
        pool.engine("10.0.0.5", "cke").await.unwrap();

        pool.evict("10.0.0.4").await;
        assert_eq!(pool.len(), 2);
    }
}
