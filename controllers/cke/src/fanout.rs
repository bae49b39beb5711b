//! Bounded fan-out over nodes
//!
//! Per-node work is spawned on a `JoinSet` and gated by a semaphore whose
//! width is `min(nodes, max_parallelism)`. Every task is joined before
//! returning, so no work outlives the call.

use crate::error::CommandError;
use cluster_model::Node;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default cap on concurrent per-node operations
pub const DEFAULT_MAX_PARALLELISM: usize = 32;

fn width(nodes: usize, max_parallelism: usize) -> usize {
    nodes.min(max_parallelism.max(1)).max(1)
}

/// Run `f` on every node concurrently
///
/// All tasks are joined. The first error in completion order is returned,
/// wrapped with the failing node's address. Cancelling `cancel` aborts
/// in-flight work and yields `Cancelled`.
pub async fn for_each_node<F, Fut>(
    nodes: &[Node],
    max_parallelism: usize,
    cancel: &CancellationToken,
    f: F,
) -> Result<(), CommandError>
where
    F: Fn(Node) -> Fut,
    Fut: Future<Output = Result<(), CommandError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(width(nodes.len(), max_parallelism)));
    let mut set = JoinSet::new();

    for node in nodes {
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.child_token();
        let address = node.address.clone();
        let work = f(node.clone());
        set.spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => Err(CommandError::Cancelled),
                result = async {
                    let _permit = semaphore.acquire_owned().await.map_err(|_closed| CommandError::Cancelled)?;
                    work.await
                } => result,
            };
            result.map_err(|e| CommandError::on_node(&address, e))
        });
    }

    let mut first: Option<CommandError> = None;
    while let Some(joined) = set.join_next().await {
        let result = joined.unwrap_or_else(|e| Err(CommandError::Failed(format!("node task failed: {e}"))));
        if let Err(e) = result {
            if first.is_none() {
                first = Some(e);
            } else {
                warn!("Additional fan-out failure: {}", e);
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(CommandError::Cancelled);
    }
    first.map_or(Ok(()), Err)
}

/// Run `f` on each node one at a time, ordered by address, stopping at the first error
pub async fn serial_over_nodes<F, Fut>(nodes: &[Node], cancel: &CancellationToken, f: F) -> Result<(), CommandError>
where
    F: Fn(Node) -> Fut,
    Fut: Future<Output = Result<(), CommandError>>,
{
    let mut sorted: Vec<&Node> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.address.cmp(&b.address));
    for node in sorted {
        if cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }
        let result = tokio::select! {
            () = cancel.cancelled() => Err(CommandError::Cancelled),
            result = f(node.clone()) => result,
        };
        result.map_err(|e| CommandError::on_node(&node.address, e))?;
    }
    Ok(())
}

/// Run `f` on every node concurrently and collect the outputs keyed by address
///
/// Infallible per node: failures must be folded into `T` by the caller.
pub async fn map_nodes<T, F, Fut>(nodes: &[Node], max_parallelism: usize, f: F) -> Vec<(String, T)>
where
    T: Send + 'static,
    F: Fn(Node) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(width(nodes.len(), max_parallelism)));
    let mut set = JoinSet::new();
    for node in nodes {
        let semaphore = Arc::clone(&semaphore);
        let address = node.address.clone();
        let work = f(node.clone());
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (address, work.await)
        });
    }

    let mut out = Vec::with_capacity(nodes.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(item) => out.push(item),
            Err(e) => warn!("Node task failed: {}", e),
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn nodes(n: usize) -> Vec<Node> {
        (1..=n).map(|i| Node::new(format!("10.0.0.{i}"), false)).collect()
    }

    #[tokio::test]
    async fn test_width_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        for_each_node(&nodes(10), 3, &cancel, |_node| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_all_nodes_run_despite_a_failure() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let err = for_each_node(&nodes(5), 32, &cancel, |node| {
            let visited = Arc::clone(&visited);
            async move {
                visited.lock().unwrap().push(node.address.clone());
                if node.address == "10.0.0.3" {
                    Err(CommandError::Failed("manifest unknown".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap_err();

        assert_eq!(visited.lock().unwrap().len(), 5);
        assert_eq!(err.to_string(), "10.0.0.3: manifest unknown");
    }

    #[tokio::test]
    async fn test_cancellation_stops_in_flight_work() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = for_each_node(&nodes(3), 32, &cancel, |_node| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_serial_stops_at_first_error_in_address_order() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let mut shuffled = nodes(4);
        shuffled.reverse();

        let err = serial_over_nodes(&shuffled, &cancel, |node| {
            let visited = Arc::clone(&visited);
            async move {
                visited.lock().unwrap().push(node.address.clone());
                if node.address == "10.0.0.2" {
                    Err(CommandError::Failed("boom".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap_err();

        assert_eq!(*visited.lock().unwrap(), vec!["10.0.0.1", "10.0.0.2"]);
        assert!(err.to_string().starts_with("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_map_nodes_collects_in_address_order() {
        let out = map_nodes(&nodes(3), 2, |node| async move { node.address.len() }).await;
        let addresses: Vec<&str> = out.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }
}
