//! Store watchers.
//!
//! Two watches feed the leader loop: one on the cluster document and one on
//! the records prefix. Each watch turns every non-empty batch of events into
//! a `Wake` on a small bounded channel. Wakes are hints, so a full channel
//! simply drops the new one; the loop re-reads everything on each tick.
//!
//! A broken watch is reopened after `RETRY_DELAY` until the token is
//! cancelled.

use crate::error::ControllerError;
use crate::storage::Storage;
use kv_client::WatchStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the wake channel
const WAKE_CAPACITY: usize = 16;

/// Delay before reopening a failed watch
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Why the leader loop should run a tick early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The cluster document changed
    Cluster,
    /// An operation record was written or deleted
    Records,
}

impl Wake {
    fn as_str(self) -> &'static str {
        match self {
            Wake::Cluster => "cluster",
            Wake::Records => "records",
        }
    }
}

/// Start both watches; they stop when `cancel` fires
pub fn spawn(storage: Arc<Storage>, cancel: CancellationToken) -> (mpsc::Receiver<Wake>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(WAKE_CAPACITY);
    let handles = [Wake::Cluster, Wake::Records]
        .into_iter()
        .map(|kind| {
            let storage = Arc::clone(&storage);
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { watch(storage, kind, tx, cancel).await })
        })
        .collect();
    (rx, handles)
}

async fn open(storage: &Storage, kind: Wake) -> Result<WatchStream, ControllerError> {
    match kind {
        Wake::Cluster => storage.watch_cluster(0).await,
        Wake::Records => storage.watch_records(0).await,
    }
}

async fn watch(storage: Arc<Storage>, kind: Wake, tx: mpsc::Sender<Wake>, cancel: CancellationToken) {
    info!("Starting {} watcher", kind.as_str());
    loop {
        match open(&storage, kind).await {
            Ok(mut stream) => {
                if let Err(e) = forward(&mut stream, kind, &tx, &cancel).await {
                    warn!("{} watch ended: {}", kind.as_str(), e);
                }
            }
            Err(e) => warn!("Failed to open {} watch: {}", kind.as_str(), e),
        }

        if tx.is_closed() {
            debug!("Wake receiver dropped, stopping {} watcher", kind.as_str());
            return;
        }
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Stopping {} watcher", kind.as_str());
                return;
            }
            () = tokio::time::sleep(RETRY_DELAY) => {}
        }
    }
}

/// Forward batches until the stream ends or the token fires
async fn forward(
    stream: &mut WatchStream,
    kind: Wake,
    tx: &mpsc::Sender<Wake>,
    cancel: &CancellationToken,
) -> Result<(), ControllerError> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            batch = stream.recv() => match batch {
                Some(Ok(events)) if events.is_empty() => {}
                Some(Ok(events)) => {
                    debug!("{} watch delivered {} event(s)", kind.as_str(), events.len());
                    // A full channel already holds a pending wake.
                    let _ = tx.try_send(kind);
                }
                Some(Err(e)) => return Err(ControllerError::Watch(e.to_string())),
                None => return Err(ControllerError::Watch("stream closed".to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{elect, sample_cluster};
    use kv_client::MockKvClient;

    #[tokio::test]
    async fn test_cluster_edit_wakes() {
        let kv = MockKvClient::new();
        let storage = Arc::new(Storage::new(Arc::new(kv.clone()), "/cke/", Duration::from_secs(1)));
        let cancel = CancellationToken::new();
        let (mut wakes, handles) = spawn(Arc::clone(&storage), cancel.clone());

        // Let both watches open before writing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        storage.put_cluster(&sample_cluster(1, 0), 0).await.unwrap();

        let wake = tokio::time::timeout(Duration::from_secs(2), wakes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wake, Wake::Cluster);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_record_write_wakes() {
        let kv = MockKvClient::new();
        let storage = Arc::new(Storage::new(Arc::new(kv.clone()), "/cke/", Duration::from_secs(1)));
        let (_session, leader) = elect(&storage).await;
        let cancel = CancellationToken::new();
        let (mut wakes, _handles) = spawn(Arc::clone(&storage), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = cluster_model::Record::new("ca-bootstrap", vec![], "leader", chrono::Utc::now());
        storage.append_record(record, &leader).await.unwrap();

        let wake = tokio::time::timeout(Duration::from_secs(2), wakes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wake, Wake::Records);
        cancel.cancel();
    }
}
