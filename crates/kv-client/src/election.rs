//! Sessions and leader election
//!
//! A `Session` owns a lease kept alive in the background. `Election`
//! implements the usual etcd recipe: every candidate writes a key under the
//! election prefix attached to its lease, and the candidate with the lowest
//! create revision is the leader. Others wait for the deletion of their
//! immediate predecessor.

use crate::error::KvError;
use crate::kv_trait::KvClientTrait;
use crate::models::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease-backed session
///
/// `lost()` is cancelled as soon as the lease can no longer be refreshed.
pub struct Session {
    client: Arc<dyn KvClientTrait>,
    lease: i64,
    id: String,
    lost: CancellationToken,
    keepalive: JoinHandle<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("lost", &self.lost.is_cancelled())
            .finish()
    }
}

impl Session {
    /// Grant a lease and start refreshing it every `ttl / 3`
    pub async fn new(client: Arc<dyn KvClientTrait>, ttl: Duration) -> Result<Self, KvError> {
        let lease = client.grant_lease(ttl).await?;
        let lost = CancellationToken::new();
        let keepalive = tokio::spawn(keep_alive_loop(
            Arc::clone(&client),
            lease,
            ttl,
            lost.clone(),
        ));
        info!("Session {:x} started (ttl {:?})", lease, ttl);
        Ok(Self {
            client,
            lease,
            id: format!("{lease:x}"),
            lost,
            keepalive,
        })
    }

    /// Lease id
    pub fn lease_id(&self) -> i64 {
        self.lease
    }

    /// Session id recorded in operation records
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled when the lease is lost
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Whether the lease is still believed to be alive
    pub fn is_alive(&self) -> bool {
        !self.lost.is_cancelled()
    }

    /// Stop refreshing and revoke the lease
    pub async fn close(self) -> Result<(), KvError> {
        self.keepalive.abort();
        self.lost.cancel();
        self.client.revoke_lease(self.lease).await?;
        info!("Session {} closed", self.id);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

async fn keep_alive_loop(client: Arc<dyn KvClientTrait>, lease: i64, ttl: Duration, lost: CancellationToken) {
    let interval = (ttl / 3).max(Duration::from_millis(100));
    let mut last_success = Instant::now();
    loop {
        tokio::select! {
            () = lost.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        match client.keep_alive(lease).await {
            Ok(_) => last_success = Instant::now(),
            Err(KvError::LeaseExpired(_)) => {
                warn!("Lease {:x} expired", lease);
                lost.cancel();
                return;
            }
            Err(e) => {
                warn!("Failed to refresh lease {:x}: {}", lease, e);
                if last_success.elapsed() >= ttl {
                    lost.cancel();
                    return;
                }
            }
        }
    }
}

/// Key held by the current leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderKey {
    /// Full key under the election prefix
    pub key: String,
    /// Create revision of the key
    pub create_revision: i64,
}

impl LeaderKey {
    /// Transaction guard that holds only while this leadership is current
    pub fn guard(&self) -> Compare {
        Compare::CreateRevision(self.key.clone(), self.create_revision)
    }
}

/// Election on a key prefix
#[derive(Clone)]
pub struct Election {
    client: Arc<dyn KvClientTrait>,
    prefix: String,
}

impl std::fmt::Debug for Election {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Election").field("prefix", &self.prefix).finish()
    }
}

impl Election {
    /// Create an election under `prefix`
    pub fn new(client: Arc<dyn KvClientTrait>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { client, prefix }
    }

    /// Election prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Block until this session becomes the leader
    ///
    /// Returns `Cancelled` if `cancel` fires first and `LeaseExpired` if the
    /// session is lost while waiting.
    pub async fn campaign(
        &self,
        session: &Session,
        value: &str,
        cancel: &CancellationToken,
    ) -> Result<LeaderKey, KvError> {
        let key = format!("{}{}", self.prefix, session.id());
        let resp = self
            .client
            .txn(
                vec![Compare::CreateRevision(key.clone(), 0)],
                vec![TxnOp::Put {
                    key: key.clone(),
                    value: value.as_bytes().to_vec(),
                    lease: session.lease_id(),
                }],
                vec![],
            )
            .await?;
        let create_revision = if resp.succeeded {
            resp.revision
        } else {
            self.client
                .get(&key)
                .await?
                .map(|kv| kv.create_revision)
                .ok_or_else(|| KvError::Conflict(format!("election key {key} vanished")))?
        };
        let mine = LeaderKey { key, create_revision };
        debug!("Campaigning as {} (revision {})", mine.key, create_revision);

        let lost = session.lost();
        loop {
            let options = RangeOptions {
                prefix: true,
                limit: 1,
                sort: Some((SortTarget::Create, SortOrder::Descend)),
                max_create_revision: Some(create_revision - 1),
            };
            let preds = self.client.range(&self.prefix, options).await?;
            let Some(pred) = preds.kvs.into_iter().next() else {
                info!("Elected leader as {}", mine.key);
                return Ok(mine);
            };

            debug!("Waiting for predecessor {} to go away", pred.key);
            let mut stream = self.client.watch(&pred.key, false, preds.revision + 1).await?;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = self.resign(&mine).await;
                        return Err(KvError::Cancelled);
                    }
                    () = lost.cancelled() => {
                        return Err(KvError::LeaseExpired(session.lease_id()));
                    }
                    batch = stream.recv() => match batch {
                        Some(Ok(events)) => {
                            if events.iter().any(|e| e.kind == EventType::Delete) {
                                break;
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
            }
        }
    }

    /// Current leader key, if any
    pub async fn leader(&self) -> Result<Option<KeyValue>, KvError> {
        let options = RangeOptions::prefix()
            .with_limit(1)
            .sorted(SortTarget::Create, SortOrder::Ascend);
        let resp = self.client.range(&self.prefix, options).await?;
        Ok(resp.kvs.into_iter().next())
    }

    /// Give up leadership by deleting the leader key
    pub async fn resign(&self, leader: &LeaderKey) -> Result<(), KvError> {
        self.client
            .txn(vec![leader.guard()], vec![TxnOp::delete(leader.key.clone())], vec![])
            .await?;
        info!("Resigned leadership held by {}", leader.key);
        Ok(())
    }
}
