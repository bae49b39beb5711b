//! KV data models
//!
//! Client-side representation of etcd v3 keys, transactions, watch events
//! and cluster members, independent of the wire encoding.

use serde::{Deserialize, Serialize};

/// A stored key/value pair with its revision metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Key
    pub key: String,
    /// Raw value
    pub value: Vec<u8>,
    /// Revision at which the key was created
    pub create_revision: i64,
    /// Revision of the last modification
    pub mod_revision: i64,
    /// Number of modifications since creation
    pub version: i64,
    /// Attached lease (0 when none)
    pub lease: i64,
}

/// Sort field for range requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortTarget {
    /// By key
    Key,
    /// By creation revision
    Create,
    /// By modification revision
    Mod,
}

/// Sort direction for range requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending
    Ascend,
    /// Descending
    Descend,
}

/// Options for a range request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeOptions {
    /// Treat the key as a prefix
    pub prefix: bool,
    /// Maximum number of keys (0 = unlimited)
    pub limit: i64,
    /// Sort field and direction
    pub sort: Option<(SortTarget, SortOrder)>,
    /// Only keys created at or before this revision
    pub max_create_revision: Option<i64>,
}

impl RangeOptions {
    /// All keys under a prefix, key-ordered
    pub fn prefix() -> Self {
        Self {
            prefix: true,
            ..Default::default()
        }
    }

    /// Set the limit
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Set the sort
    pub fn sorted(mut self, target: SortTarget, order: SortOrder) -> Self {
        self.sort = Some((target, order));
        self
    }
}

/// Result of a range request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResponse {
    /// Matching keys
    pub kvs: Vec<KeyValue>,
    /// Store revision at the time of the read
    pub revision: i64,
    /// Total number of matching keys (ignoring the limit)
    pub count: i64,
}

/// Transaction guard; every variant tests for equality
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// `create_revision(key) == n` (0 means the key does not exist)
    CreateRevision(String, i64),
    /// `mod_revision(key) == n`
    ModRevision(String, i64),
    /// `version(key) == n`
    Version(String, i64),
}

impl Compare {
    /// Key the comparison applies to
    pub fn key(&self) -> &str {
        match self {
            Compare::CreateRevision(k, _) | Compare::ModRevision(k, _) | Compare::Version(k, _) => k,
        }
    }
}

/// Transaction operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Put a value, optionally attached to a lease
    Put {
        /// Key
        key: String,
        /// Value
        value: Vec<u8>,
        /// Lease id (0 = none)
        lease: i64,
    },
    /// Delete a key, or every key under it when `prefix` is set
    Delete {
        /// Key or prefix
        key: String,
        /// Prefix delete
        prefix: bool,
    },
}

impl TxnOp {
    /// Put without lease
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: 0,
        }
    }

    /// Delete a single key
    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete {
            key: key.into(),
            prefix: false,
        }
    }
}

/// Result of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether the compares held and the success branch ran
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: i64,
}

/// Watch event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Key created or modified
    Put,
    /// Key deleted
    Delete,
}

/// One watch event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Event kind
    pub kind: EventType,
    /// Key state after the event (value empty for deletes)
    pub kv: KeyValue,
}

/// etcd cluster member
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Member {
    /// Member id
    pub id: u64,
    /// Member name (empty until started)
    pub name: String,
    /// Peer URLs
    pub peer_urls: Vec<String>,
    /// Client URLs
    pub client_urls: Vec<String>,
}

/// Compute the exclusive range end that selects every key under `prefix`
pub fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: select to the end of the keyspace.
    vec![0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end("/cke/records/"), b"/cke/records0".to_vec());
        assert_eq!(prefix_range_end("a"), b"b".to_vec());
    }
}
