//! Mock KV client for testing
//!
//! In-memory revisioned key-value store with leases, transactions, watches
//! and a small member registry. State is shared between clones so several
//! controllers can contend on the same store.

use crate::error::KvError;
use crate::kv_trait::{KvClientTrait, MemberClientTrait, WatchStream};
use crate::models::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

struct Watcher {
    key: String,
    prefix: bool,
    tx: mpsc::Sender<Result<Vec<WatchEvent>, KvError>>,
}

impl Watcher {
    fn matches(&self, key: &str) -> bool {
        if self.prefix { key.starts_with(&self.key) } else { key == self.key }
    }
}

#[derive(Default)]
struct MockState {
    data: BTreeMap<String, KeyValue>,
    revision: i64,
    leases: HashMap<i64, Duration>,
    next_lease: i64,
    history: Vec<(i64, WatchEvent)>,
    watchers: Vec<Watcher>,
    unavailable: bool,
    members: Vec<Member>,
    next_member: u64,
    unhealthy: BTreeSet<String>,
}

impl MockState {
    fn check_available(&self) -> Result<(), KvError> {
        if self.unavailable {
            Err(KvError::Unavailable("mock store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn compare(&self, compare: &Compare) -> bool {
        let kv = self.data.get(compare.key());
        match compare {
            Compare::CreateRevision(_, n) => kv.map_or(0, |kv| kv.create_revision) == *n,
            Compare::ModRevision(_, n) => kv.map_or(0, |kv| kv.mod_revision) == *n,
            Compare::Version(_, n) => kv.map_or(0, |kv| kv.version) == *n,
        }
    }

    /// Apply ops at `revision`, returning the events produced
    fn apply(&mut self, ops: &[TxnOp], revision: i64) -> Result<Vec<WatchEvent>, KvError> {
        let mut events = Vec::new();
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    if *lease != 0 && !self.leases.contains_key(lease) {
                        return Err(KvError::LeaseExpired(*lease));
                    }
                    let kv = match self.data.get(key) {
                        Some(old) => KeyValue {
                            value: value.clone(),
                            mod_revision: revision,
                            version: old.version + 1,
                            lease: *lease,
                            ..old.clone()
                        },
                        None => KeyValue {
                            key: key.clone(),
                            value: value.clone(),
                            create_revision: revision,
                            mod_revision: revision,
                            version: 1,
                            lease: *lease,
                        },
                    };
                    self.data.insert(key.clone(), kv.clone());
                    events.push(WatchEvent { kind: EventType::Put, kv });
                }
                TxnOp::Delete { key, prefix } => {
                    let doomed: Vec<String> = self
                        .data
                        .keys()
                        .filter(|k| if *prefix { k.starts_with(key.as_str()) } else { *k == key })
                        .cloned()
                        .collect();
                    for k in doomed {
                        self.data.remove(&k);
                        events.push(deleted(k, revision));
                    }
                }
            }
        }
        Ok(events)
    }

    fn publish(&mut self, revision: i64, events: Vec<WatchEvent>) {
        for event in &events {
            self.history.push((revision, event.clone()));
        }
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|e| watcher.matches(&e.kv.key))
                .cloned()
                .collect();
            if !batch.is_empty() {
                let _ = watcher.tx.try_send(Ok(batch));
            }
        }
    }

    fn drop_lease(&mut self, lease: i64) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }
        let keys: Vec<String> = self
            .data
            .values()
            .filter(|kv| kv.lease == lease)
            .map(|kv| kv.key.clone())
            .collect();
        if !keys.is_empty() {
            self.revision += 1;
            let revision = self.revision;
            let events: Vec<WatchEvent> = keys
                .into_iter()
                .map(|k| {
                    self.data.remove(&k);
                    deleted(k, revision)
                })
                .collect();
            self.publish(revision, events);
        }
        true
    }
}

fn deleted(key: String, revision: i64) -> WatchEvent {
    WatchEvent {
        kind: EventType::Delete,
        kv: KeyValue {
            key,
            value: Vec::new(),
            create_revision: 0,
            mod_revision: revision,
            version: 0,
            lease: 0,
        },
    }
}

/// Mock KV client for testing
#[derive(Clone, Default)]
pub struct MockKvClient {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockKvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockKvClient").finish_non_exhaustive()
    }
}

impl MockKvClient {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    /// Snapshot of every key
    pub fn keys(&self) -> Vec<String> {
        self.lock().data.keys().cloned().collect()
    }

    /// Value of a key as UTF-8, for assertions
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock()
            .data
            .get(key)
            .map(|kv| String::from_utf8_lossy(&kv.value).into_owned())
    }

    /// Make every request fail with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Expire a lease as if its TTL ran out
    pub fn expire_lease(&self, lease: i64) {
        self.lock().drop_lease(lease);
    }

    /// Register a started member (name set, as after a successful join)
    pub fn add_started_member(&self, name: &str, peer_url: &str, client_url: &str) -> u64 {
        let mut state = self.lock();
        state.next_member += 1;
        let id = state.next_member;
        state.members.push(Member {
            id,
            name: name.to_string(),
            peer_urls: vec![peer_url.to_string()],
            client_urls: vec![client_url.to_string()],
        });
        id
    }

    /// Mark a client endpoint healthy or not
    pub fn set_endpoint_health(&self, endpoint: &str, healthy: bool) {
        let mut state = self.lock();
        if healthy {
            state.unhealthy.remove(endpoint);
        } else {
            state.unhealthy.insert(endpoint.to_string());
        }
    }
}

#[async_trait::async_trait]
impl KvClientTrait for MockKvClient {
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse, KvError> {
        let state = self.lock();
        state.check_available()?;
        let mut kvs: Vec<KeyValue> = state
            .data
            .values()
            .filter(|kv| if options.prefix { kv.key.starts_with(key) } else { kv.key == key })
            .filter(|kv| options.max_create_revision.is_none_or(|max| kv.create_revision <= max))
            .cloned()
            .collect();
        let count = i64::try_from(kvs.len()).unwrap_or(i64::MAX);
        if let Some((target, order)) = options.sort {
            match target {
                SortTarget::Key => kvs.sort_by(|a, b| a.key.cmp(&b.key)),
                SortTarget::Create => kvs.sort_by_key(|kv| kv.create_revision),
                SortTarget::Mod => kvs.sort_by_key(|kv| kv.mod_revision),
            }
            if order == SortOrder::Descend {
                kvs.reverse();
            }
        }
        if options.limit > 0 {
            kvs.truncate(usize::try_from(options.limit).unwrap_or(usize::MAX));
        }
        Ok(RangeResponse {
            kvs,
            revision: state.revision,
            count,
        })
    }

    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnResponse, KvError> {
        let mut state = self.lock();
        state.check_available()?;
        let succeeded = compares.iter().all(|c| state.compare(c));
        let ops = if succeeded { &success } else { &failure };
        if ops.is_empty() {
            return Ok(TxnResponse {
                succeeded,
                revision: state.revision,
            });
        }

        let revision = state.revision + 1;
        let snapshot = state.data.clone();
        match state.apply(ops, revision) {
            Ok(events) if events.is_empty() => {}
            Ok(events) => {
                state.revision = revision;
                state.publish(revision, events);
            }
            Err(e) => {
                state.data = snapshot;
                return Err(e);
            }
        }
        Ok(TxnResponse {
            succeeded,
            revision: state.revision,
        })
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<i64, KvError> {
        let mut state = self.lock();
        state.check_available()?;
        state.next_lease += 1;
        let id = 0x1000 + state.next_lease;
        state.leases.insert(id, ttl);
        Ok(id)
    }

    async fn keep_alive(&self, lease: i64) -> Result<Duration, KvError> {
        let state = self.lock();
        state.check_available()?;
        state.leases.get(&lease).copied().ok_or(KvError::LeaseExpired(lease))
    }

    async fn revoke_lease(&self, lease: i64) -> Result<(), KvError> {
        let mut state = self.lock();
        state.check_available()?;
        state.drop_lease(lease);
        Ok(())
    }

    async fn watch(&self, key: &str, prefix: bool, start_revision: i64) -> Result<WatchStream, KvError> {
        let mut state = self.lock();
        state.check_available()?;
        let (tx, rx) = mpsc::channel(1024);
        let watcher = Watcher {
            key: key.to_string(),
            prefix,
            tx,
        };

        if start_revision > 0 {
            let mut batches: BTreeMap<i64, Vec<WatchEvent>> = BTreeMap::new();
            for (rev, event) in &state.history {
                if *rev >= start_revision && watcher.matches(&event.kv.key) {
                    batches.entry(*rev).or_default().push(event.clone());
                }
            }
            for batch in batches.into_values() {
                let _ = watcher.tx.try_send(Ok(batch));
            }
        }
        state.watchers.push(watcher);
        Ok(rx)
    }
}

#[async_trait::async_trait]
impl MemberClientTrait for MockKvClient {
    async fn member_list(&self) -> Result<Vec<Member>, KvError> {
        let state = self.lock();
        state.check_available()?;
        Ok(state.members.clone())
    }

    async fn member_add(&self, peer_urls: Vec<String>) -> Result<Member, KvError> {
        let mut state = self.lock();
        state.check_available()?;
        state.next_member += 1;
        let member = Member {
            id: state.next_member,
            name: String::new(),
            peer_urls,
            client_urls: Vec::new(),
        };
        state.members.push(member.clone());
        Ok(member)
    }

    async fn member_remove(&self, id: u64) -> Result<(), KvError> {
        let mut state = self.lock();
        state.check_available()?;
        let before = state.members.len();
        state.members.retain(|m| m.id != id);
        if state.members.len() == before {
            return Err(KvError::NotFound(format!("member {id:x}")));
        }
        Ok(())
    }

    async fn endpoint_health(&self, endpoint: &str) -> Result<bool, KvError> {
        let state = self.lock();
        state.check_available()?;
        Ok(!state.unhealthy.contains(endpoint))
    }
}
