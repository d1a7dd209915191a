//! In-memory sync status of every open or tracked note.
//!
//! Synchronous and lock-guarded; every transition is announced on the
//! server event channel.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::state::ServerEvent;
use crate::vault::FileInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Clean,
    Dirty,
    Loading,
    Saving,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileState {
    pub file: FileInfo,
    pub status: FileStatus,
    /// When the file first became dirty since it was last clean.
    pub dirty_timestamp: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl FileState {
    fn clean(file: FileInfo) -> Self {
        Self {
            file,
            status: FileStatus::Clean,
            dirty_timestamp: None,
            error: None,
        }
    }

    /// Unsaved edits exist (dirty, or a failed save).
    pub fn has_unsaved_changes(&self) -> bool {
        matches!(self.status, FileStatus::Dirty | FileStatus::Error)
    }
}

pub struct FileStateManager {
    root: PathBuf,
    states: Mutex<HashMap<PathBuf, FileState>>,
    events: broadcast::Sender<ServerEvent>,
}

impl FileStateManager {
    pub fn new(root: impl Into<PathBuf>, events: broadcast::Sender<ServerEvent>) -> Self {
        Self {
            root: root.into(),
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Listen for state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Start tracking files found on disk as clean. Already tracked paths
    /// keep their state.
    pub fn track_all(&self, files: impl IntoIterator<Item = FileInfo>) {
        let mut states = self.states.lock();
        for file in files {
            states
                .entry(file.path.clone())
                .or_insert_with(|| FileState::clean(file));
        }
    }

    pub fn track(&self, file: FileInfo) {
        self.track_all(std::iter::once(file));
    }

    pub fn get(&self, path: &Path) -> Option<FileState> {
        self.states.lock().get(path).cloned()
    }

    pub fn status(&self, path: &Path) -> Option<FileStatus> {
        self.states.lock().get(path).map(|s| s.status)
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.states.lock().contains_key(path)
    }

    pub fn snapshot(&self) -> Vec<FileState> {
        let mut all: Vec<FileState> = self.states.lock().values().cloned().collect();
        all.sort_by(|a, b| a.file.path.cmp(&b.file.path));
        all
    }

    /// How long the file has had unsaved changes.
    pub fn dirty_for(&self, path: &Path) -> Option<Duration> {
        let since = self.states.lock().get(path)?.dirty_timestamp?;
        (Utc::now() - since).to_std().ok()
    }

    /// Record an edit. Re-marking a dirty file keeps its original timestamp.
    /// An untracked path starts being tracked as dirty.
    pub fn mark_dirty(&self, path: &Path) {
        let changed = {
            let mut states = self.states.lock();
            let state = states
                .entry(path.to_path_buf())
                .or_insert_with(|| FileState::clean(FileInfo::unsaved(path, &self.root)));
            if state.status == FileStatus::Dirty {
                None
            } else {
                state.status = FileStatus::Dirty;
                state.dirty_timestamp.get_or_insert_with(Utc::now);
                Some(state.clone())
            }
        };
        if let Some(state) = changed {
            self.emit_changed(&state);
        }
    }

    /// Any → saving. A write admitted while the file was dirty may start
    /// after an earlier queued write already cleaned it. Returns false only
    /// for untracked paths.
    pub fn mark_saving(&self, path: &Path) -> bool {
        self.transition(path, |s| {
            s.status = FileStatus::Saving;
            s.error = None;
            true
        })
    }

    /// Saving → clean. A file edited while the save ran stays dirty.
    pub fn mark_saved(&self, path: &Path, file: Option<FileInfo>) {
        self.transition(path, |s| {
            if let Some(file) = file {
                s.file = file;
            }
            if s.status != FileStatus::Saving {
                return false;
            }
            s.status = FileStatus::Clean;
            s.dirty_timestamp = None;
            true
        });
    }

    /// Clean → loading. Unsaved files are never reloaded over.
    pub fn mark_loading(&self, path: &Path) -> bool {
        self.transition(path, |s| {
            if s.status != FileStatus::Clean {
                return false;
            }
            s.status = FileStatus::Loading;
            true
        })
    }

    pub fn mark_loaded(&self, path: &Path) {
        self.transition(path, |s| {
            if s.status != FileStatus::Loading {
                return false;
            }
            s.status = FileStatus::Clean;
            true
        });
    }

    /// Any → error. The dirty timestamp survives so autosave can retry.
    pub fn mark_error(&self, path: &Path, error: impl Into<String>) {
        let error = error.into();
        self.transition(path, |s| {
            s.status = FileStatus::Error;
            s.error = Some(error);
            true
        });
    }

    pub fn remove(&self, path: &Path) -> Option<FileState> {
        let removed = self.states.lock().remove(path);
        if removed.is_some() {
            let _ = self.events.send(ServerEvent::FileStateRemoved {
                path: path.to_string_lossy().to_string(),
            });
        }
        removed
    }

    /// Move a tracked state to a new path. A no-op returning false when
    /// `old` is untracked or `new` is already tracked.
    pub fn rename(&self, old: &Path, new: &Path) -> bool {
        {
            let mut states = self.states.lock();
            if states.contains_key(new) {
                return false;
            }
            let Some(mut state) = states.remove(old) else {
                return false;
            };
            state.file = state.file.moved_to(new, &self.root);
            states.insert(new.to_path_buf(), state);
        }
        let _ = self.events.send(ServerEvent::FileStateRenamed {
            old_path: old.to_string_lossy().to_string(),
            new_path: new.to_string_lossy().to_string(),
        });
        true
    }

    /// Apply `change` to a tracked state; emit if it reports a transition.
    fn transition(&self, path: &Path, change: impl FnOnce(&mut FileState) -> bool) -> bool {
        let changed = {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(path) else {
                return false;
            };
            if !change(state) {
                return false;
            }
            state.clone()
        };
        self.emit_changed(&changed);
        true
    }

    fn emit_changed(&self, state: &FileState) {
        // No subscribers is fine.
        let _ = self.events.send(ServerEvent::FileStateChanged {
            path: state.file.path.to_string_lossy().to_string(),
            status: state.status,
            error: state.error.clone(),
        });
    }
}
