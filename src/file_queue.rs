//! Per-path operation queue.
//!
//! Every path maps to the tail of its operation chain. A new operation
//! replaces the tail and waits for the previous one to settle before it
//! runs, so operations on one path execute strictly in submission order.
//! Paths never block each other.

use dashmap::DashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use crate::error::{AppError, AppResult};

struct Tail {
    id: u64,
    done: watch::Receiver<bool>,
}

type Tails = Arc<DashMap<PathBuf, Tail>>;

/// Marks an operation settled when dropped, even if it panicked, and
/// releases the path's slot unless a newer operation has taken it.
struct Settle {
    tails: Tails,
    path: PathBuf,
    id: u64,
    done: watch::Sender<bool>,
}

impl Drop for Settle {
    fn drop(&mut self) {
        self.done.send_replace(true);
        self.tails.remove_if(&self.path, |_, tail| tail.id == self.id);
    }
}

#[derive(Default)]
pub struct FileOperationsQueue {
    tails: Tails,
    next_id: AtomicU64,
}

impl FileOperationsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` after every operation previously enqueued on `path`
    /// has settled, successfully or not.
    ///
    /// The operation runs on its own task: if the caller stops waiting, it
    /// still completes and later operations still wait for it.
    pub async fn enqueue<F, Fut, T>(&self, path: &Path, operation: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(false);
        let previous = self.tails.insert(path.to_path_buf(), Tail { id, done: done_rx });

        let settle = Settle {
            tails: self.tails.clone(),
            path: path.to_path_buf(),
            id,
            done: done_tx,
        };

        let handle = tokio::spawn(async move {
            let _settle = settle;
            if let Some(mut previous) = previous {
                // A dropped sender means the previous operation is gone too.
                let _ = previous.done.wait_for(|done| *done).await;
            }
            operation().await
        });

        handle.await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!(
                "Operation on {} did not complete: {}",
                path.display(),
                e
            ))
        })?
    }

    /// Wait for the current tail operation on `path` to settle without
    /// joining the queue.
    pub async fn wait_for(&self, path: &Path) {
        let done = self.tails.get(path).map(|tail| tail.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|done| *done).await;
        }
    }

    pub fn is_busy(&self, path: &Path) -> bool {
        self.tails.contains_key(path)
    }

    /// Number of paths with operations in flight.
    pub fn len(&self) -> usize {
        self.tails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }
}
