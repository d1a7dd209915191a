use crate::file_state::FileStateManager;
use crate::indexer::IndexManager;
use crate::state::ServerEvent;
use crate::vault::{FileInfo, Vault};
use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, DebouncedEvent, new_debouncer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Minimum interval between re-index operations for the same note (in ms).
/// Saves inside the window collapse into one trailing re-index.
const REINDEX_COOLDOWN_MS: u64 = 2000;

pub struct FileWatcherManager {
    watcher: Mutex<Option<WatcherHandle>>,
    debounce_ms: u64,
    event_tx: broadcast::Sender<ServerEvent>,
}

struct WatcherHandle {
    root: PathBuf,
    _watcher: notify_debouncer_full::Debouncer<
        notify::RecommendedWatcher,
        notify_debouncer_full::RecommendedCache,
    >,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Create,
    Modify,
    Remove,
}

impl ChangeKind {
    fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Modify => "modify",
            ChangeKind::Remove => "remove",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Reindex {
    Now,
    /// Inside the cooldown; re-index once it has passed.
    After(Duration),
    /// A trailing re-index is already scheduled.
    Scheduled,
}

struct CooldownEntry {
    last: Instant,
    trailing: bool,
}

/// Per-note cooldown tracker to avoid redundant re-indexing
struct ReindexCooldownTracker {
    cooldown: Duration,
    entries: HashMap<PathBuf, CooldownEntry>,
}

impl ReindexCooldownTracker {
    fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            entries: HashMap::new(),
        }
    }

    fn check(&mut self, path: &Path, now: Instant) -> Reindex {
        match self.entries.get_mut(path) {
            Some(entry) if entry.trailing => Reindex::Scheduled,
            Some(entry) if now.duration_since(entry.last) < self.cooldown => {
                entry.trailing = true;
                Reindex::After(self.cooldown - now.duration_since(entry.last))
            }
            _ => {
                self.entries.insert(
                    path.to_path_buf(),
                    CooldownEntry {
                        last: now,
                        trailing: false,
                    },
                );
                Reindex::Now
            }
        }
    }

    /// The trailing re-index for `path` is starting.
    fn fire(&mut self, path: &Path, now: Instant) {
        self.entries.insert(
            path.to_path_buf(),
            CooldownEntry {
                last: now,
                trailing: false,
            },
        );
    }

    fn forget(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Periodically clean up stale entries to avoid memory growth
    fn cleanup_stale(&mut self, now: Instant) {
        let keep = self.cooldown.max(Duration::from_secs(60));
        self.entries
            .retain(|_, e| e.trailing || now.duration_since(e.last) < keep);
    }
}

impl FileWatcherManager {
    pub fn new(debounce_ms: u64, event_tx: broadcast::Sender<ServerEvent>) -> Self {
        Self {
            watcher: Mutex::new(None),
            debounce_ms,
            event_tx,
        }
    }

    /// Watch the vault recursively, keeping the index and the file states
    /// in step with changes made outside the application.
    pub fn start_watching(
        &self,
        vault: Arc<Vault>,
        index_manager: Arc<IndexManager>,
        states: Option<Arc<FileStateManager>>,
    ) -> Result<(), notify::Error> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(()); // Already watching
        }

        let event_tx = self.event_tx.clone();
        let root = vault.root().to_path_buf();
        let cooldown = Arc::new(Mutex::new(ReindexCooldownTracker::new(Duration::from_millis(
            REINDEX_COOLDOWN_MS,
        ))));
        let cleanup_counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let Ok(rt_handle) = tokio::runtime::Handle::try_current() else {
            return Err(notify::Error::generic("File watcher needs a tokio runtime"));
        };

        let watch_root = root.clone();
        let mut debouncer = new_debouncer(
            Duration::from_millis(self.debounce_ms),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let count = cleanup_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if count % 50 == 0 {
                        cooldown.lock().cleanup_stale(Instant::now());
                    }

                    for (path, change) in collapse_events(&events) {
                        if !is_relevant(&vault, &path, change) {
                            continue;
                        }
                        let relative = path
                            .strip_prefix(&watch_root)
                            .unwrap_or(&path)
                            .to_string_lossy()
                            .replace('\\', "/");
                        let _ = event_tx.send(ServerEvent::FileChanged {
                            path: relative,
                            change_type: change.as_str().to_string(),
                        });

                        let task = WatchTask {
                            vault: vault.clone(),
                            index: index_manager.clone(),
                            states: states.clone(),
                            cooldown: cooldown.clone(),
                        };
                        rt_handle.spawn(async move { task.apply(path, change).await });
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!("File watcher error: {:?}", e);
                    }
                }
            },
        )?;

        debouncer
            .watch(root.as_path(), RecursiveMode::Recursive)
            .map_err(|e| notify::Error::generic(&format!("Watch failed: {}", e)))?;

        info!(
            "Started watching vault at {} (debounce: {}ms)",
            root.display(),
            self.debounce_ms
        );
        *slot = Some(WatcherHandle {
            root,
            _watcher: debouncer,
        });
        Ok(())
    }

    pub fn stop_watching(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            info!("Stopped watching vault at {}", handle.root.display());
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }
}

/// Everything a spawned change handler needs.
struct WatchTask {
    vault: Arc<Vault>,
    index: Arc<IndexManager>,
    states: Option<Arc<FileStateManager>>,
    cooldown: Arc<Mutex<ReindexCooldownTracker>>,
}

impl WatchTask {
    async fn apply(self, path: PathBuf, change: ChangeKind) {
        if change == ChangeKind::Remove || !path.exists() {
            self.cooldown.lock().forget(&path);
            if let Some(states) = &self.states {
                states.remove(&path);
            }
            if let Err(e) = self.index.delete_file_paths(std::slice::from_ref(&path)).await {
                warn!("Failed to drop index rows for {}: {}", path.display(), e);
            }
            return;
        }

        if path.is_dir() {
            return;
        }

        if let Some(states) = &self.states {
            if !states.is_tracked(&path) {
                match FileInfo::from_path(&path, self.vault.root()) {
                    Ok(file) => states.track(file),
                    Err(e) => debug!("Not tracking {}: {}", path.display(), e),
                }
            }
        }

        let decision = self.cooldown.lock().check(&path, Instant::now());
        match decision {
            Reindex::Now => {}
            Reindex::Scheduled => return,
            Reindex::After(wait) => {
                tokio::time::sleep(wait).await;
                self.cooldown.lock().fire(&path, Instant::now());
            }
        }

        if let Err(e) = self.index.index_single_file(&path).await {
            debug!("Incremental re-index of {} skipped: {}", path.display(), e);
        }
    }
}

/// Last change wins per path; renames split into a removal and a creation.
fn collapse_events(events: &[DebouncedEvent]) -> HashMap<PathBuf, ChangeKind> {
    use notify::event::{ModifyKind, RenameMode};
    use notify::EventKind;

    let mut changes = HashMap::new();
    for event in events {
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                changes.insert(event.paths[0].clone(), ChangeKind::Remove);
                changes.insert(event.paths[1].clone(), ChangeKind::Create);
            }
            kind => {
                let Some(change) = classify_event_kind(&kind) else {
                    continue;
                };
                for path in &event.paths {
                    changes.insert(path.clone(), change);
                }
            }
        }
    }
    changes
}

/// Classify an event kind into a change, `None` for access and other noise.
fn classify_event_kind(kind: &notify::EventKind) -> Option<ChangeKind> {
    use notify::EventKind;
    use notify::event::{ModifyKind, RenameMode};
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Remove),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeKind::Create),
        EventKind::Modify(_) => Some(ChangeKind::Modify),
        EventKind::Remove(_) => Some(ChangeKind::Remove),
        _ => None,
    }
}

/// Notes the vault would list, and removals that may have been a note or a
/// directory of notes.
fn is_relevant(vault: &Vault, path: &Path, change: ChangeKind) -> bool {
    let Ok(relative) = path.strip_prefix(vault.root()) else {
        return false;
    };
    let hidden_or_excluded = relative.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        name.starts_with('.') || crate::config::is_excluded_directory(&name)
    });
    if hidden_or_excluded {
        return false;
    }
    match change {
        ChangeKind::Remove => Vault::is_note(path) || path.extension().is_none(),
        ChangeKind::Create | ChangeKind::Modify => Vault::is_note(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, EventAttributes, ModifyKind, RemoveKind, RenameMode};
    use notify::{Event, EventKind};

    fn debounced(kind: EventKind, paths: &[&str]) -> DebouncedEvent {
        let event = Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: EventAttributes::new(),
        };
        DebouncedEvent::new(event, Instant::now())
    }

    #[test]
    fn test_cooldown_schedules_one_trailing_reindex() {
        let mut tracker = ReindexCooldownTracker::new(Duration::from_millis(100));
        let path = Path::new("/v/a.md");
        let start = Instant::now();

        assert_eq!(tracker.check(path, start), Reindex::Now);
        assert_eq!(
            tracker.check(path, start + Duration::from_millis(40)),
            Reindex::After(Duration::from_millis(60))
        );
        assert_eq!(
            tracker.check(path, start + Duration::from_millis(50)),
            Reindex::Scheduled
        );

        tracker.fire(path, start + Duration::from_millis(100));
        assert_eq!(
            tracker.check(path, start + Duration::from_millis(250)),
            Reindex::Now
        );
        // Other paths are independent.
        assert_eq!(tracker.check(Path::new("/v/b.md"), start), Reindex::Now);
    }

    #[test]
    fn test_cleanup_keeps_pending_trailing_entries() {
        let mut tracker = ReindexCooldownTracker::new(Duration::from_millis(100));
        let start = Instant::now();
        tracker.check(Path::new("/v/a.md"), start);
        tracker.check(Path::new("/v/b.md"), start);
        tracker.check(Path::new("/v/b.md"), start + Duration::from_millis(10));

        tracker.cleanup_stale(start + Duration::from_secs(120));
        assert!(!tracker.entries.contains_key(Path::new("/v/a.md")));
        assert!(tracker.entries.contains_key(Path::new("/v/b.md")));
    }

    #[test]
    fn test_collapse_last_change_wins_and_splits_renames() {
        let events = vec![
            debounced(EventKind::Create(CreateKind::File), &["/v/a.md"]),
            debounced(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/v/a.md"],
            ),
            debounced(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/v/old.md", "/v/new.md"],
            ),
            debounced(EventKind::Remove(RemoveKind::File), &["/v/gone.md"]),
            debounced(EventKind::Access(notify::event::AccessKind::Any), &["/v/read.md"]),
        ];

        let changes = collapse_events(&events);
        assert_eq!(changes.get(Path::new("/v/a.md")), Some(&ChangeKind::Modify));
        assert_eq!(changes.get(Path::new("/v/old.md")), Some(&ChangeKind::Remove));
        assert_eq!(changes.get(Path::new("/v/new.md")), Some(&ChangeKind::Create));
        assert_eq!(changes.get(Path::new("/v/gone.md")), Some(&ChangeKind::Remove));
        assert!(!changes.contains_key(Path::new("/v/read.md")));
    }

    #[test]
    fn test_relevance_filters_hidden_and_non_notes() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path(), &[], 1024).unwrap();
        let root = vault.root().to_path_buf();

        assert!(is_relevant(&vault, &root.join("a.md"), ChangeKind::Modify));
        assert!(!is_relevant(&vault, &root.join("image.png"), ChangeKind::Create));
        assert!(!is_relevant(&vault, &root.join(".obsidian/workspace.md"), ChangeKind::Modify));
        assert!(!is_relevant(&vault, &root.join(".git/HEAD"), ChangeKind::Remove));
        // A removed directory may have held notes.
        assert!(is_relevant(&vault, &root.join("projects"), ChangeKind::Remove));
        assert!(!is_relevant(&vault, Path::new("/elsewhere/a.md"), ChangeKind::Modify));
    }
}
