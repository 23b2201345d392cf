//! Change notifications and live queries over the conversation store.
//!
//! Every committed transaction publishes one [`Change`] per touched table. A
//! [`LiveQuery`] subscribes to the feed, keeps the latest result of its query
//! and re-runs it whenever a relevant change arrives.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::StorageResult;

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Threads,
    Messages,
    MessageSummaries,
}

/// A committed mutation. `thread_id` is the thread the rows belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub table: Table,
    pub thread_id: Option<Uuid>,
}

impl Change {
    pub fn new(table: Table, thread_id: Uuid) -> Self {
        Self {
            table,
            thread_id: Some(thread_id),
        }
    }

    pub fn touches(&self, table: Table, thread_id: Uuid) -> bool {
        self.table == table && self.thread_id.map_or(true, |id| id == thread_id)
    }
}

/// Fan-out of committed changes. Publishing never blocks.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<Change>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, change: Change) {
        log::debug!("Publishing change: {:?}", change);
        // No subscribers is fine.
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.tx.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

pub type QueryFn<T> = Arc<dyn Fn() -> BoxFuture<'static, StorageResult<T>> + Send + Sync>;

/// The latest result of a query, re-evaluated on every relevant commit.
///
/// Dropping the handle stops the re-evaluation task.
pub struct LiveQuery<T> {
    rx: watch::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T> LiveQuery<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Subscribes to `feed` before the first evaluation, so a commit racing
    /// with creation is still observed.
    pub async fn spawn<F>(feed: &ChangeFeed, filter: F, query: QueryFn<T>) -> StorageResult<Self>
    where
        F: Fn(&Change) -> bool + Send + 'static,
    {
        let mut changes = feed.subscribe();
        let initial = query().await?;
        let (tx, rx) = watch::channel(initial);

        let task = tokio::spawn(async move {
            loop {
                let rerun = match changes.recv().await {
                    Ok(change) => filter(&change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Live query lagged by {} changes, re-evaluating", skipped);
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !rerun {
                    continue;
                }
                match query().await {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("Live query re-evaluation failed: {:?}", e),
                }
            }
        });

        Ok(Self { rx, task })
    }

    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Waits for the next re-evaluation. `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
