//! End-to-end reconciliation scenarios against an in-memory vector store and
//! a deterministic embedding backend.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use vault_sync::embedder::{EmbeddingBackend, EmbeddingFunction, EmbeddingOptions};
use vault_sync::error::{AppError, AppResult};
use vault_sync::table::notepath_in;
use vault_sync::{Chunker, IndexManager, SearchFilter, ServerEvent, Vault, VectorDb};

/// Bag-of-words vectors: every word bumps one hashed dimension.
struct HashingBackend {
    dim: usize,
    calls: AtomicUsize,
    delay: Duration,
    /// Texts containing this word fail to embed.
    poison: Option<&'static str>,
}

impl HashingBackend {
    fn new(dim: usize) -> Self {
        Self {
            dim,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            poison: None,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingBackend for HashingBackend {
    fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        texts
            .iter()
            .map(|text| {
                if let Some(poison) = self.poison {
                    if text.contains(poison) {
                        return Err(AppError::Embedding(format!("cannot embed '{}'", poison)));
                    }
                }
                let mut vector = vec![0.0f32; self.dim];
                for word in text.split_whitespace() {
                    let slot = word
                        .to_lowercase()
                        .bytes()
                        .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
                    vector[slot % self.dim] += 1.0;
                }
                // Keep empty texts off the zero vector.
                vector[0] += 0.01;
                Ok(vector)
            })
            .collect()
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    vault: Arc<Vault>,
    db: VectorDb,
    events: broadcast::Sender<ServerEvent>,
}

impl Fixture {
    fn new(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            write(dir.path(), rel, content);
        }
        let vault = Arc::new(Vault::open(dir.path(), &[], 1024 * 1024).unwrap());
        let (events, _) = broadcast::channel(256);
        Self {
            _dir: dir,
            vault,
            db: VectorDb::open_in_memory().unwrap(),
            events,
        }
    }

    fn root(&self) -> &Path {
        self.vault.root()
    }

    fn notepath(&self, rel: &str) -> String {
        self.root().join(rel).to_string_lossy().to_string()
    }

    async fn manager(&self, name: &str, backend: Arc<HashingBackend>) -> IndexManager {
        let embedding = EmbeddingFunction::from_backend(
            name,
            backend,
            EmbeddingOptions {
                batch_size: 4,
                parallelism: 2,
            },
        )
        .unwrap();
        IndexManager::open(
            &self.db,
            self.vault.clone(),
            Arc::new(embedding),
            Chunker::new(60),
            2,
            None,
            self.events.clone(),
        )
        .await
        .unwrap()
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn drain(rx: &mut broadcast::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn rows_for(manager: &IndexManager, notepath: &str) -> usize {
    manager
        .table()
        .count_rows(Some(&notepath_in(&[notepath])))
        .await
        .unwrap()
}

const NOTES: &[(&str, &str)] = &[
    ("alpha.md", "# Alpha\n\napples and pears grow in the orchard"),
    ("journal/beta.md", "# Beta\n\nrivers flow to the sea\n\n- boats\n- nets"),
    ("journal/gamma.md", "plain gamma note about mountains and snow"),
];

#[tokio::test]
async fn test_fresh_vault_is_fully_indexed_with_final_progress() {
    let fx = Fixture::new(NOTES);
    let backend = Arc::new(HashingBackend::new(16));
    let manager = fx.manager("hash-16", backend).await;
    let mut rx = fx.events.subscribe();

    let progress = Mutex::new(Vec::new());
    let summary = manager
        .index_directory(|p| progress.lock().push(p))
        .await
        .unwrap()
        .expect("no pass was running");

    assert_eq!(summary.indexed_files, 3);
    assert_eq!(summary.deleted_paths, 0);
    assert_eq!(summary.unchanged_files, 0);
    assert!(summary.inserted_rows >= 3);

    let progress = progress.into_inner();
    assert_eq!(progress.last().copied(), Some(1.0));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    for (rel, _) in NOTES {
        assert!(rows_for(&manager, &fx.notepath(rel)).await > 0, "{} has rows", rel);
    }
    assert_eq!(
        manager.table().count_rows(None).await.unwrap(),
        summary.inserted_rows
    );

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(ServerEvent::IndexingStarted)));
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::IndexingCompleted { indexed_files: 3, .. })));
    assert!(matches!(events.last(), Some(ServerEvent::SearchReady)));
}

#[tokio::test]
async fn test_second_pass_is_a_noop() {
    let fx = Fixture::new(NOTES);
    let backend = Arc::new(HashingBackend::new(16));
    let manager = fx.manager("hash-16", backend.clone()).await;

    let first = manager.index_directory(|_| {}).await.unwrap().unwrap();
    let rows = manager.table().count_rows(None).await.unwrap();
    let calls = backend.calls();

    let progress = Mutex::new(Vec::new());
    let second = manager
        .index_directory(|p| progress.lock().push(p))
        .await
        .unwrap()
        .unwrap();

    assert!(second.is_noop());
    assert_eq!(second.unchanged_files, first.indexed_files);
    assert_eq!(manager.table().count_rows(None).await.unwrap(), rows);
    assert_eq!(backend.calls(), calls, "nothing re-embedded");
    assert_eq!(progress.into_inner(), vec![1.0]);
}

#[tokio::test]
async fn test_deleted_note_loses_its_rows() {
    let fx = Fixture::new(NOTES);
    let manager = fx.manager("hash-16", Arc::new(HashingBackend::new(16))).await;
    manager.index_directory(|_| {}).await.unwrap();

    std::fs::remove_file(fx.root().join("journal/beta.md")).unwrap();
    let summary = manager.index_directory(|_| {}).await.unwrap().unwrap();

    assert_eq!(summary.deleted_paths, 1);
    assert_eq!(summary.indexed_files, 0);
    assert_eq!(rows_for(&manager, &fx.notepath("journal/beta.md")).await, 0);
    assert!(rows_for(&manager, &fx.notepath("alpha.md")).await > 0);
}

#[tokio::test]
async fn test_modified_note_is_replaced_not_appended() {
    let fx = Fixture::new(NOTES);
    let manager = fx.manager("hash-16", Arc::new(HashingBackend::new(16))).await;
    manager.index_directory(|_| {}).await.unwrap();

    let updated = "# Alpha\n\nfirst paragraph about apples\n\n## More\n\nsecond part about pears\n\n## Last\n\nthird";
    write(fx.root(), "alpha.md", updated);
    let summary = manager.index_directory(|_| {}).await.unwrap().unwrap();

    assert_eq!(summary.indexed_files, 1);
    assert_eq!(summary.unchanged_files, 2);
    let expected = Chunker::new(60).chunk(updated).len();
    assert_eq!(rows_for(&manager, &fx.notepath("alpha.md")).await, expected);

    let rows = manager
        .table()
        .rows_for_path(&fx.notepath("alpha.md"))
        .await
        .unwrap();
    let mut indices: Vec<usize> = rows.iter().map(|r| r.subnote_index).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..expected).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_touched_note_is_replaced_even_with_same_text() {
    let fx = Fixture::new(NOTES);
    let manager = fx.manager("hash-16", Arc::new(HashingBackend::new(16))).await;
    manager.index_directory(|_| {}).await.unwrap();
    let path = fx.notepath("journal/beta.md");
    let before = rows_for(&manager, &path).await;

    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(fx.root().join("journal/beta.md"))
        .unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
    drop(file);

    let summary = manager.index_directory(|_| {}).await.unwrap().unwrap();
    assert_eq!(summary.indexed_files, 1);
    assert_eq!(summary.unchanged_files, 2);
    assert_eq!(summary.inserted_rows, before);

    let content = NOTES[1].1;
    assert_eq!(rows_for(&manager, &path).await, Chunker::new(60).chunk(content).len());
}

#[tokio::test]
async fn test_emptied_note_loses_its_rows() {
    let fx = Fixture::new(NOTES);
    let manager = fx.manager("hash-16", Arc::new(HashingBackend::new(16))).await;
    manager.index_directory(|_| {}).await.unwrap();
    assert!(rows_for(&manager, &fx.notepath("alpha.md")).await > 0);

    write(fx.root(), "alpha.md", "");
    let summary = manager.index_directory(|_| {}).await.unwrap().unwrap();

    assert_eq!(summary.deleted_paths, 1);
    assert_eq!(summary.indexed_files, 0);
    assert_eq!(rows_for(&manager, &fx.notepath("alpha.md")).await, 0);
    assert!(rows_for(&manager, &fx.notepath("journal/gamma.md")).await > 0);

    let again = manager.index_directory(|_| {}).await.unwrap().unwrap();
    assert!(again.is_noop());
}

#[tokio::test]
async fn test_empty_note_is_skipped() {
    let fx = Fixture::new(&[("empty.md", "  \n\n"), ("full.md", "some words here")]);
    let manager = fx.manager("hash-16", Arc::new(HashingBackend::new(16))).await;

    let summary = manager.index_directory(|_| {}).await.unwrap().unwrap();
    assert_eq!(summary.indexed_files, 1);
    assert_eq!(rows_for(&manager, &fx.notepath("empty.md")).await, 0);
}

#[tokio::test]
async fn test_model_change_rebuilds_from_scratch() {
    let fx = Fixture::new(NOTES);
    let old = fx.manager("hash-16", Arc::new(HashingBackend::new(16))).await;
    let old_summary = old.index_directory(|_| {}).await.unwrap().unwrap();
    let old_table = old.table().name().to_string();

    // Same model name, different width: the live schema no longer matches.
    let resized = fx.manager("hash-16", Arc::new(HashingBackend::new(24))).await;
    assert_eq!(resized.table().name(), old_table);
    assert_eq!(resized.table().count_rows(None).await.unwrap(), 0);
    assert_eq!(resized.table().schema().vector_dim(), Some(24));

    // A different model gets its own table; the previous one is dropped.
    let other = fx.manager("hash-8", Arc::new(HashingBackend::new(8))).await;
    assert_ne!(other.table().name(), old_table);
    assert!(!fx.db.table_names().await.unwrap().contains(&old_table));

    let summary = other.index_directory(|_| {}).await.unwrap().unwrap();
    assert_eq!(summary.indexed_files, old_summary.indexed_files);
    assert_eq!(summary.deleted_paths, 0);
}

#[tokio::test]
async fn test_concurrent_passes_are_coalesced() {
    let fx = Fixture::new(NOTES);
    let mut backend = HashingBackend::new(16);
    backend.delay = Duration::from_millis(20);
    let manager = fx.manager("hash-16", Arc::new(backend)).await;

    let (a, b) = tokio::join!(
        manager.index_directory(|_| {}),
        manager.index_directory(|_| {})
    );
    let ran = [a.unwrap(), b.unwrap()];
    assert_eq!(ran.iter().filter(|s| s.is_some()).count(), 1);
    assert!(!manager.is_indexing());
}

#[tokio::test]
async fn test_embedding_failure_still_reports_completion() {
    let fx = Fixture::new(&[("ok.md", "calm words"), ("bad.md", "boom goes the note")]);
    let mut backend = HashingBackend::new(16);
    backend.poison = Some("boom");
    let manager = fx.manager("hash-16", Arc::new(backend)).await;
    let mut rx = fx.events.subscribe();

    let progress = Mutex::new(Vec::new());
    let result = manager.index_directory(|p| progress.lock().push(p)).await;

    assert!(result.is_err());
    assert_eq!(progress.into_inner().last().copied(), Some(1.0));
    assert!(!manager.is_indexing());
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::IndexingError { .. })));
    assert!(manager.status().await.unwrap().last_error.is_some());
}

#[tokio::test]
async fn test_search_finds_exact_note_and_honours_filter() {
    let fx = Fixture::new(NOTES);
    let manager = fx.manager("hash-16", Arc::new(HashingBackend::new(16))).await;
    manager.index_directory(|_| {}).await.unwrap();

    let hits = manager
        .search("plain gamma note about mountains and snow", 3, None)
        .await
        .unwrap();
    assert_eq!(hits[0].entry.notepath, fx.notepath("journal/gamma.md"));
    assert!(hits[0].distance.abs() < 1e-5);
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));

    let filter = SearchFilter {
        paths: Some(vec![fx.notepath("alpha.md")]),
        under: None,
    };
    let predicate = filter.to_predicate();
    let hits = manager
        .search("mountains and snow", 5, predicate.as_deref())
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.entry.notepath == fx.notepath("alpha.md")));

    assert!(matches!(
        manager.search("   ", 3, None).await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn test_single_file_delete_and_rename_operations() {
    let fx = Fixture::new(NOTES);
    let manager = fx.manager("hash-16", Arc::new(HashingBackend::new(16))).await;
    manager.index_directory(|_| {}).await.unwrap();

    // New note picked up on its own.
    write(fx.root(), "journal/delta.md", "delta words");
    let delta = fx.root().join("journal/delta.md");
    let chunks = manager.index_single_file(&delta).await.unwrap();
    assert_eq!(chunks, 1);
    assert_eq!(rows_for(&manager, &fx.notepath("journal/delta.md")).await, 1);

    // Directory rename moves every row beneath it.
    let moved = manager
        .rename_file_path(&fx.root().join("journal"), &fx.root().join("diary"))
        .await
        .unwrap();
    assert!(moved >= 3);
    assert_eq!(rows_for(&manager, &fx.notepath("journal/beta.md")).await, 0);
    assert!(rows_for(&manager, &fx.notepath("diary/beta.md")).await > 0);

    // Directory delete removes everything under it and nothing else.
    manager
        .delete_file_paths(&[fx.root().join("diary")])
        .await
        .unwrap();
    assert_eq!(rows_for(&manager, &fx.notepath("diary/gamma.md")).await, 0);
    assert!(rows_for(&manager, &fx.notepath("alpha.md")).await > 0);

    // A vanished note just loses its rows.
    std::fs::remove_file(fx.root().join("alpha.md")).unwrap();
    assert_eq!(
        manager
            .index_single_file(&fx.root().join("alpha.md"))
            .await
            .unwrap(),
        0
    );
    assert_eq!(manager.table().count_rows(None).await.unwrap(), 0);
}
