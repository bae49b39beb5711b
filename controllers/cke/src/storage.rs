//! Typed KV gateway
//!
//! Maps the controller's objects onto keys under the configured prefix:
//!
//! | key | value |
//! |-----|-------|
//! | `cluster` | `Cluster` (JSON) |
//! | `records/<016 id>` | `Record` (JSON) |
//! | `record-id` | last allocated record id |
//! | `vault/<role>/ca` | `CaBundle` (JSON) |
//! | `vault/<role>/<serial>` | `VaultEntry` (JSON) |
//! | `resources/<kind>/<namespace>/<name>` | `ResourceDefinition` (JSON) |
//! | `leader/<lease>` | election keys |
//!
//! Every write made on behalf of the leader carries its guard, so a deposed
//! leader cannot modify anything.

use crate::error::ControllerError;
use cluster_model::{CaRole, CertificateMetadata, Cluster, Record, ResourceDefinition, Resources};
use kv_client::{
    Compare, KeyValue, KvClientTrait, KvError, LeaderKey, RangeOptions, SortOrder, SortTarget, TxnOp,
    WatchStream,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// KV mod-revision of the cluster document
pub type RevisionId = i64;

const CLUSTER_KEY: &str = "cluster";
const RECORDS_PREFIX: &str = "records/";
const RECORD_ID_KEY: &str = "record-id";
const VAULT_PREFIX: &str = "vault/";
const RESOURCES_PREFIX: &str = "resources/";
const LEADER_PREFIX: &str = "leader/";

/// Attempts at allocating a record id before giving up
const APPEND_ATTEMPTS: usize = 5;

/// Certificate authority kept in the vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaBundle {
    /// Role of the authority
    pub role: CaRole,
    /// PEM certificate
    pub certificate: String,
    /// PEM private key
    pub private_key: String,
}

/// Issued certificate kept in the vault (the private key is never stored)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEntry {
    /// Bookkeeping
    pub metadata: CertificateMetadata,
    /// PEM certificate
    pub certificate: String,
}

/// Typed access to the replicated KV store
pub struct Storage {
    client: Arc<dyn KvClientTrait>,
    prefix: String,
    timeout: Duration,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Storage {
    /// Create a gateway over `client` rooted at `prefix`
    pub fn new(client: Arc<dyn KvClientTrait>, prefix: impl Into<String>, timeout: Duration) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            client,
            prefix,
            timeout,
        }
    }

    /// Raw client
    pub fn client(&self) -> Arc<dyn KvClientTrait> {
        Arc::clone(&self.client)
    }

    /// Full key for a suffix
    pub fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    /// Election prefix
    pub fn leader_prefix(&self) -> String {
        self.key(LEADER_PREFIX)
    }

    fn record_key(&self, id: i64) -> String {
        self.key(&format!("{RECORDS_PREFIX}{id:016x}"))
    }

    fn vault_key(&self, role: CaRole, name: &str) -> String {
        self.key(&format!("{VAULT_PREFIX}{}/{}", role.as_str(), name))
    }

    async fn call<T, F>(&self, what: &str, fut: F) -> Result<T, ControllerError>
    where
        F: Future<Output = Result<T, KvError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ControllerError::Kv(KvError::Timeout(what.to_string()))),
        }
    }

    async fn get_raw(&self, key: &str) -> Result<Option<KeyValue>, ControllerError> {
        self.call(key, self.client.get(key)).await
    }

    async fn range_prefix(&self, prefix: &str, options: RangeOptions) -> Result<Vec<KeyValue>, ControllerError> {
        let resp = self.call(prefix, self.client.range(prefix, options)).await?;
        Ok(resp.kvs)
    }

    /// Fail with `LeadershipLost` unless the guard key still exists with its create revision
    pub async fn check_guard(&self, guard: &LeaderKey) -> Result<(), ControllerError> {
        match self.get_raw(&guard.key).await? {
            Some(kv) if kv.create_revision == guard.create_revision => Ok(()),
            _ => Err(ControllerError::LeadershipLost),
        }
    }

    /// Run a guarded transaction, mapping a failed guard to `LeadershipLost`
    /// and any other failed compare to `Conflict`
    async fn guarded_txn(
        &self,
        what: &str,
        guard: &LeaderKey,
        mut compares: Vec<Compare>,
        ops: Vec<TxnOp>,
    ) -> Result<RevisionId, ControllerError> {
        compares.push(guard.guard());
        let resp = self.call(what, self.client.txn(compares, ops, vec![])).await?;
        if resp.succeeded {
            return Ok(resp.revision);
        }
        self.check_guard(guard).await?;
        Err(ControllerError::Conflict(what.to_string()))
    }

    /// Current cluster document and its revision
    pub async fn get_cluster(&self) -> Result<Option<(Cluster, RevisionId)>, ControllerError> {
        let Some(kv) = self.get_raw(&self.key(CLUSTER_KEY)).await? else {
            return Ok(None);
        };
        let cluster: Cluster = decode(&kv)?;
        Ok(Some((cluster, kv.mod_revision)))
    }

    /// Replace the cluster document if its revision is still `if_revision`
    ///
    /// Revision 0 means the document must not exist yet.
    pub async fn put_cluster(&self, cluster: &Cluster, if_revision: RevisionId) -> Result<RevisionId, ControllerError> {
        cluster.validate()?;
        let key = self.key(CLUSTER_KEY);
        let value = serde_json::to_vec(cluster).map_err(KvError::from)?;
        let resp = self
            .call(
                &key,
                self.client.txn(
                    vec![Compare::ModRevision(key.clone(), if_revision)],
                    vec![TxnOp::put(key.clone(), value)],
                    vec![],
                ),
            )
            .await?;
        if !resp.succeeded {
            return Err(ControllerError::Conflict(format!(
                "cluster changed since revision {if_revision}"
            )));
        }
        info!("Stored cluster {} at revision {}", cluster.name, resp.revision);
        Ok(resp.revision)
    }

    /// Most recent records, newest first
    pub async fn records(&self, limit: usize) -> Result<Vec<Record>, ControllerError> {
        let options = RangeOptions::prefix()
            .with_limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .sorted(SortTarget::Key, SortOrder::Descend);
        let kvs = self.range_prefix(&self.key(RECORDS_PREFIX), options).await?;
        kvs.iter().map(decode).collect()
    }

    /// One record by id
    pub async fn record(&self, id: i64) -> Result<Option<Record>, ControllerError> {
        self.get_raw(&self.record_key(id))
            .await?
            .map(|kv| decode(&kv))
            .transpose()
    }

    /// Records still in the `running` state
    pub async fn running_records(&self) -> Result<Vec<Record>, ControllerError> {
        let kvs = self
            .range_prefix(&self.key(RECORDS_PREFIX), RangeOptions::prefix())
            .await?;
        let mut running = Vec::new();
        for kv in &kvs {
            let record: Record = decode(kv)?;
            if !record.status.is_final() {
                running.push(record);
            }
        }
        Ok(running)
    }

    /// Persist a new record with the next id
    ///
    /// Ids come from the `record-id` counter, which survives truncation, so
    /// they never repeat even when every record has been deleted.
    pub async fn append_record(&self, mut record: Record, guard: &LeaderKey) -> Result<Record, ControllerError> {
        let counter = self.key(RECORD_ID_KEY);
        for _ in 0..APPEND_ATTEMPTS {
            let (last, counter_compare) = match self.get_raw(&counter).await? {
                Some(kv) => (decode::<i64>(&kv)?, Compare::ModRevision(counter.clone(), kv.mod_revision)),
                None => {
                    let latest = self.records(1).await?;
                    (latest.first().map_or(0, |r| r.id), Compare::CreateRevision(counter.clone(), 0))
                }
            };
            record.id = last + 1;
            let key = self.record_key(record.id);
            let value = serde_json::to_vec(&record).map_err(KvError::from)?;
            let next = serde_json::to_vec(&record.id).map_err(KvError::from)?;
            match self
                .guarded_txn(
                    &key,
                    guard,
                    vec![counter_compare, Compare::CreateRevision(key.clone(), 0)],
                    vec![TxnOp::put(key.clone(), value), TxnOp::put(counter.clone(), next)],
                )
                .await
            {
                Ok(_) => {
                    debug!("Appended record {} ({})", record.id, record.operation);
                    return Ok(record);
                }
                Err(ControllerError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ControllerError::Conflict("could not allocate a record id".to_string()))
    }

    /// Read-modify-write a record under the leader guard
    pub async fn update_record<F>(&self, id: i64, guard: &LeaderKey, mutate: F) -> Result<Record, ControllerError>
    where
        F: FnOnce(&mut Record),
    {
        let key = self.record_key(id);
        let kv = self
            .get_raw(&key)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("record {id}")))?;
        let mut record: Record = decode(&kv)?;
        mutate(&mut record);
        let value = serde_json::to_vec(&record).map_err(KvError::from)?;
        self.guarded_txn(
            &key,
            guard,
            vec![Compare::ModRevision(key.clone(), kv.mod_revision)],
            vec![TxnOp::put(key.clone(), value)],
        )
        .await?;
        Ok(record)
    }

    /// Delete all but the newest `keep` records; returns how many were deleted
    pub async fn truncate_records(&self, keep: usize, guard: &LeaderKey) -> Result<usize, ControllerError> {
        let options = RangeOptions::prefix().sorted(SortTarget::Key, SortOrder::Descend);
        let kvs = self.range_prefix(&self.key(RECORDS_PREFIX), options).await?;
        if kvs.len() <= keep {
            return Ok(0);
        }
        let ops: Vec<TxnOp> = kvs[keep..].iter().map(|kv| TxnOp::delete(kv.key.clone())).collect();
        let count = ops.len();
        self.guarded_txn("records truncation", guard, vec![], ops).await?;
        info!("Truncated {} old records", count);
        Ok(count)
    }

    /// Certificate authority of a role
    pub async fn get_ca(&self, role: CaRole) -> Result<Option<CaBundle>, ControllerError> {
        self.get_raw(&self.vault_key(role, "ca"))
            .await?
            .map(|kv| decode(&kv))
            .transpose()
    }

    /// Store a new authority; returns `false` if one already exists
    pub async fn put_ca(&self, bundle: &CaBundle, guard: &LeaderKey) -> Result<bool, ControllerError> {
        let key = self.vault_key(bundle.role, "ca");
        let value = serde_json::to_vec(bundle).map_err(KvError::from)?;
        match self
            .guarded_txn(
                &key,
                guard,
                vec![Compare::CreateRevision(key.clone(), 0)],
                vec![TxnOp::put(key.clone(), value)],
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(ControllerError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Store (or overwrite) an issued certificate
    pub async fn put_certificate(&self, entry: &VaultEntry, guard: &LeaderKey) -> Result<(), ControllerError> {
        let key = self.vault_key(entry.metadata.role, &entry.metadata.serial);
        let value = serde_json::to_vec(entry).map_err(KvError::from)?;
        self.guarded_txn(&key, guard, vec![], vec![TxnOp::put(key.clone(), value)])
            .await?;
        Ok(())
    }

    /// Every issued certificate of a role (the authority excluded)
    pub async fn list_certificates(&self, role: CaRole) -> Result<Vec<VaultEntry>, ControllerError> {
        let prefix = self.vault_key(role, "");
        let ca_key = self.vault_key(role, "ca");
        let kvs = self.range_prefix(&prefix, RangeOptions::prefix()).await?;
        kvs.iter().filter(|kv| kv.key != ca_key).map(decode).collect()
    }

    /// Delete issued certificates by serial
    pub async fn delete_certificates(
        &self,
        role: CaRole,
        serials: &[String],
        guard: &LeaderKey,
    ) -> Result<usize, ControllerError> {
        if serials.is_empty() {
            return Ok(0);
        }
        let ops: Vec<TxnOp> = serials
            .iter()
            .map(|s| TxnOp::delete(self.vault_key(role, s)))
            .collect();
        self.guarded_txn("vault cleanup", guard, vec![], ops).await?;
        Ok(serials.len())
    }

    /// Declared Kubernetes resources
    pub async fn resources(&self) -> Result<Resources, ControllerError> {
        let kvs = self
            .range_prefix(&self.key(RESOURCES_PREFIX), RangeOptions::prefix())
            .await?;
        let mut resources = Resources::default();
        for kv in &kvs {
            let def: ResourceDefinition = decode(kv)?;
            resources.definitions.insert(def.key(), def);
        }
        Ok(resources)
    }

    /// Declare or update a resource
    pub async fn put_resource(&self, def: &ResourceDefinition) -> Result<(), ControllerError> {
        let key = self.key(&format!("{}{}", RESOURCES_PREFIX, def.key()));
        let value = serde_json::to_vec(def).map_err(KvError::from)?;
        self.call(&key, self.client.txn(vec![], vec![TxnOp::put(key.clone(), value)], vec![]))
            .await?;
        Ok(())
    }

    /// Value written by the current leader, if any
    pub async fn leader(&self) -> Result<Option<String>, ControllerError> {
        let options = RangeOptions::prefix()
            .with_limit(1)
            .sorted(SortTarget::Create, SortOrder::Ascend);
        let kvs = self.range_prefix(&self.leader_prefix(), options).await?;
        Ok(kvs
            .into_iter()
            .next()
            .map(|kv| String::from_utf8_lossy(&kv.value).into_owned()))
    }

    /// Watch the cluster document
    pub async fn watch_cluster(&self, start_revision: i64) -> Result<WatchStream, ControllerError> {
        let key = self.key(CLUSTER_KEY);
        Ok(self.client.watch(&key, false, start_revision).await?)
    }

    /// Watch the records prefix
    pub async fn watch_records(&self, start_revision: i64) -> Result<WatchStream, ControllerError> {
        let key = self.key(RECORDS_PREFIX);
        Ok(self.client.watch(&key, true, start_revision).await?)
    }
}

fn decode<T: DeserializeOwned>(kv: &KeyValue) -> Result<T, ControllerError> {
    serde_json::from_slice(&kv.value)
        .map_err(|e| ControllerError::Kv(KvError::Decode(format!("{}: {}", kv.key, e))))
}
