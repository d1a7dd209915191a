//! File operations façade: queued disk I/O plus state bookkeeping.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::file_queue::FileOperationsQueue;
use crate::file_state::{FileStateManager, FileStatus};
use crate::state::ServerEvent;
use crate::vault::FileInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Create,
    Delete,
    Rename,
}

pub struct FileOperationsManager {
    root: PathBuf,
    queue: Arc<FileOperationsQueue>,
    states: Arc<FileStateManager>,
    events: broadcast::Sender<ServerEvent>,
    autosave_debounce: Duration,
}

impl FileOperationsManager {
    pub fn new(
        root: impl Into<PathBuf>,
        states: Arc<FileStateManager>,
        events: broadcast::Sender<ServerEvent>,
        autosave_debounce: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            queue: Arc::new(FileOperationsQueue::new()),
            states,
            events,
            autosave_debounce,
        }
    }

    pub fn states(&self) -> &Arc<FileStateManager> {
        &self.states
    }

    /// Record an unsaved edit.
    pub fn mark_dirty(&self, path: &Path) {
        self.states.mark_dirty(path);
    }

    pub async fn read_file(&self, path: &Path) -> AppResult<String> {
        let states = self.states.clone();
        let root = self.root.clone();
        let target = path.to_path_buf();

        self.run(FileOperation::Read, path, move || async move {
            if !states.is_tracked(&target) && target.is_file() {
                states.track(FileInfo::from_path(&target, &root)?);
            }
            let loading = states.mark_loading(&target);
            let result = tokio::fs::read_to_string(&target).await;
            if loading {
                states.mark_loaded(&target);
            }
            match result {
                Ok(content) => Ok(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(AppError::FileNotFound(target.to_string_lossy().to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Persist `content` if the file has unsaved changes when called.
    /// Returns whether a write happened.
    pub async fn write_file(&self, path: &Path, content: String) -> AppResult<bool> {
        let has_changes = self
            .states
            .get(path)
            .is_some_and(|s| s.has_unsaved_changes());
        if !has_changes {
            debug!("Skipping write of {}: nothing unsaved", path.display());
            return Ok(false);
        }

        let states = self.states.clone();
        let root = self.root.clone();
        let target = path.to_path_buf();

        self.run(FileOperation::Write, path, move || async move {
            // Admitted writes always run: the last one queued wins on disk.
            states.mark_saving(&target);
            match write_to_disk(&target, &content).await {
                Ok(()) => {
                    states.mark_saved(&target, FileInfo::from_path(&target, &root).ok());
                    Ok(true)
                }
                Err(e) => {
                    states.mark_error(&target, e.to_string());
                    Err(e)
                }
            }
        })
        .await
    }

    /// Write only once the file has been dirty for the debounce window.
    pub async fn auto_save(&self, path: &Path, content: String) -> AppResult<bool> {
        let due = self.states.status(path) == Some(FileStatus::Dirty)
            && self
                .states
                .dirty_for(path)
                .is_some_and(|age| age >= self.autosave_debounce);
        if !due {
            return Ok(false);
        }
        self.write_file(path, content).await
    }

    pub async fn create_file(&self, path: &Path, content: String) -> AppResult<FileInfo> {
        let states = self.states.clone();
        let root = self.root.clone();
        let target = path.to_path_buf();

        self.run(FileOperation::Create, path, move || async move {
            if tokio::fs::try_exists(&target).await? {
                return Err(AppError::BadRequest(format!(
                    "{} already exists",
                    target.display()
                )));
            }
            write_to_disk(&target, &content).await?;
            let info = FileInfo::from_path(&target, &root)?;
            states.track(info.clone());
            Ok(info)
        })
        .await
    }

    /// Delete a file, or a directory and everything in it.
    pub async fn delete_file(&self, path: &Path) -> AppResult<()> {
        let states = self.states.clone();
        let target = path.to_path_buf();

        self.run(FileOperation::Delete, path, move || async move {
            let metadata = tokio::fs::metadata(&target)
                .await
                .map_err(|_| AppError::FileNotFound(target.to_string_lossy().to_string()))?;
            if metadata.is_dir() {
                tokio::fs::remove_dir_all(&target).await?;
                for state in states.snapshot() {
                    if state.file.path.starts_with(&target) {
                        states.remove(&state.file.path);
                    }
                }
            } else {
                tokio::fs::remove_file(&target).await?;
                states.remove(&target);
            }
            Ok(())
        })
        .await
    }

    /// Rename a tracked file. Returns `Ok(false)` without touching anything
    /// when `old` is untracked or `new` is already tracked.
    pub async fn rename_file(&self, old: &Path, new: &Path) -> AppResult<bool> {
        if !self.rename_allowed(old, new) {
            info!(
                "Rename {} -> {} refused: source untracked or destination in use",
                old.display(),
                new.display()
            );
            return Ok(false);
        }

        self.queue.wait_for(old).await;
        self.queue.wait_for(new).await;

        let states = self.states.clone();
        let from = old.to_path_buf();
        let to = new.to_path_buf();

        self.run(FileOperation::Rename, old, move || async move {
            // Re-check: the queues may have changed things while we waited.
            if !states.is_tracked(&from) || states.is_tracked(&to) {
                return Ok(false);
            }
            if tokio::fs::try_exists(&to).await? {
                return Err(AppError::BadRequest(format!("{} already exists", to.display())));
            }
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&from, &to).await?;
            Ok(states.rename(&from, &to))
        })
        .await
    }

    fn rename_allowed(&self, old: &Path, new: &Path) -> bool {
        self.states.is_tracked(old) && !self.states.is_tracked(new)
    }

    /// Enqueue `operation` on `path`, announcing start and completion.
    async fn run<F, Fut, T>(&self, operation: FileOperation, path: &Path, f: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let path_str = path.to_string_lossy().to_string();
        let _ = self.events.send(ServerEvent::FileOperationStarted {
            operation,
            path: path_str.clone(),
        });

        let result = self.queue.enqueue(path, f).await;

        if let Err(e) = &result {
            warn!("{:?} of {} failed: {}", operation, path_str, e);
        }
        let _ = self.events.send(ServerEvent::FileOperationCompleted {
            operation,
            path: path_str,
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }
}

async fn write_to_disk(path: &Path, content: &str) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        ops: FileOperationsManager,
        events: broadcast::Receiver<ServerEvent>,
    }

    fn fixture(debounce: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let (tx, rx) = broadcast::channel(256);
        let states = Arc::new(FileStateManager::new(root.clone(), tx.clone()));
        Fixture {
            ops: FileOperationsManager::new(root.clone(), states, tx, debounce),
            root,
            _dir: dir,
            events: rx,
        }
    }

    #[tokio::test]
    async fn test_write_is_noop_when_clean() {
        let f = fixture(Duration::from_secs(5));
        let path = f.root.join("a.md");
        std::fs::write(&path, "disk").unwrap();
        f.ops.states().track(FileInfo::from_path(&path, &f.root).unwrap());

        assert!(!f.ops.write_file(&path, "edited".into()).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "disk");
    }

    #[tokio::test]
    async fn test_dirty_write_saves_and_cleans() {
        let mut f = fixture(Duration::from_secs(5));
        let path = f.root.join("notes/a.md");
        f.ops.mark_dirty(&path);

        assert!(f.ops.write_file(&path, "hello".into()).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert_eq!(f.ops.states().status(&path), Some(FileStatus::Clean));

        let mut saw_complete = false;
        while let Ok(event) = f.events.try_recv() {
            if let ServerEvent::FileOperationCompleted { operation, error, .. } = event {
                assert_eq!(operation, FileOperation::Write);
                assert!(error.is_none());
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn test_queued_writes_land_in_order() {
        let f = fixture(Duration::from_secs(5));
        let path = f.root.join("a.md");
        f.ops.mark_dirty(&path);

        let (older, newer) = tokio::join!(f.ops.write_file(&path, "older".into()), async {
            f.ops.mark_dirty(&path);
            f.ops.write_file(&path, "newer".into()).await
        });

        assert!(older.unwrap());
        assert!(newer.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "newer");
        assert_eq!(f.ops.states().status(&path), Some(FileStatus::Clean));
    }

    #[tokio::test]
    async fn test_failed_write_marks_error() {
        let f = fixture(Duration::from_secs(5));
        // A directory where the file should be makes the write fail.
        let path = f.root.join("blocked.md");
        std::fs::create_dir_all(&path).unwrap();
        f.ops.mark_dirty(&path);

        assert!(f.ops.write_file(&path, "x".into()).await.is_err());
        let state = f.ops.states().get(&path).unwrap();
        assert_eq!(state.status, FileStatus::Error);
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn test_autosave_waits_for_debounce_window() {
        let f = fixture(Duration::from_millis(200));
        let path = f.root.join("a.md");
        f.ops.mark_dirty(&path);

        assert!(!f.ops.auto_save(&path, "one".into()).await.unwrap());
        assert!(!f.ops.auto_save(&path, "two".into()).await.unwrap());
        assert!(!path.exists());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(f.ops.auto_save(&path, "three".into()).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "three");
        assert_eq!(f.ops.states().status(&path), Some(FileStatus::Clean));

        // Clean now, so nothing more to do.
        assert!(!f.ops.auto_save(&path, "four".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_moves_file_and_state() {
        let f = fixture(Duration::from_secs(5));
        let old = f.root.join("old.md");
        let new = f.root.join("sub/new.md");
        f.ops.create_file(&old, "body".into()).await.unwrap();

        assert!(f.ops.rename_file(&old, &new).await.unwrap());
        assert!(!old.exists());
        assert_eq!(std::fs::read_to_string(&new).unwrap(), "body");
        assert!(f.ops.states().is_tracked(&new));
        assert!(!f.ops.states().is_tracked(&old));
    }

    #[tokio::test]
    async fn test_rename_refused_for_untracked_or_taken() {
        let f = fixture(Duration::from_secs(5));
        let a = f.root.join("a.md");
        let b = f.root.join("b.md");
        std::fs::write(&a, "a").unwrap();

        // Untracked source.
        assert!(!f.ops.rename_file(&a, &b).await.unwrap());
        assert!(a.exists());

        f.ops.create_file(&b, "b".into()).await.unwrap();
        f.ops.states().track(FileInfo::from_path(&a, &f.root).unwrap());
        // Destination tracked.
        assert!(!f.ops.rename_file(&a, &b).await.unwrap());
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let f = fixture(Duration::from_secs(5));
        let path = f.root.join("dir/new.md");
        let info = f.ops.create_file(&path, "fresh".into()).await.unwrap();
        assert_eq!(info.relative_path, "dir/new.md");
        assert!(f.ops.create_file(&path, "again".into()).await.is_err());

        assert_eq!(f.ops.read_file(&path).await.unwrap(), "fresh");
        assert_eq!(f.ops.states().status(&path), Some(FileStatus::Clean));

        f.ops.delete_file(&f.root.join("dir")).await.unwrap();
        assert!(!path.exists());
        assert!(!f.ops.states().is_tracked(&path));
        assert!(matches!(
            f.ops.read_file(&path).await,
            Err(AppError::FileNotFound(_))
        ));
    }
}
