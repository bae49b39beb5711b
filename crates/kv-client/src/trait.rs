//! KV client traits for mocking
//!
//! These traits abstract the etcd client so the controller can be unit
//! tested against the in-memory `MockKvClient`.

use crate::error::KvError;
use crate::models::*;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stream of watch batches. The channel closes when the watch ends.
pub type WatchStream = mpsc::Receiver<Result<Vec<WatchEvent>, KvError>>;

/// Key-value operations on the replicated store
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait KvClientTrait: Send + Sync {
    /// Range read
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse, KvError>;

    /// Atomic compare-and-swap transaction
    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnResponse, KvError>;

    /// Grant a lease with the given TTL and return its id
    async fn grant_lease(&self, ttl: Duration) -> Result<i64, KvError>;

    /// Refresh a lease; returns the remaining TTL, `LeaseExpired` if gone
    async fn keep_alive(&self, lease: i64) -> Result<Duration, KvError>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke_lease(&self, lease: i64) -> Result<(), KvError>;

    /// Watch a key (or prefix) starting at `start_revision` (0 = now)
    async fn watch(&self, key: &str, prefix: bool, start_revision: i64) -> Result<WatchStream, KvError>;

    /// Read a single key
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        let resp = self.range(key, RangeOptions::default()).await?;
        Ok(resp.kvs.into_iter().next())
    }
}

/// etcd cluster membership administration
#[async_trait::async_trait]
pub trait MemberClientTrait: Send + Sync {
    /// Current members
    async fn member_list(&self) -> Result<Vec<Member>, KvError>;

    /// Add a (not yet started) member
    async fn member_add(&self, peer_urls: Vec<String>) -> Result<Member, KvError>;

    /// Remove a member by id
    async fn member_remove(&self, id: u64) -> Result<(), KvError>;

    /// Whether the given client endpoint reports healthy
    async fn endpoint_health(&self, endpoint: &str) -> Result<bool, KvError>;
}
