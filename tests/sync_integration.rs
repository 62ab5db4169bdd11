//! Sync and persistence integration tests against an on-disk vault

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use weft::config::{Config, HydrationConfig};
use weft::embedding::{anchor_hash, HashingProvider};
use weft::hydrate::{HydrationStatus, ResultHydrator};
use weft::index::{ChunkRef, LoadOutcome};
use weft::source::{ChangeEvent, FsDocumentSource, InMemorySource};
use weft::storage::{ShardKey, ShardStore, Tier};
use weft::sync::SyncOrchestrator;
use weft::worker::{IndexWorker, Mutation, MutationOutcome};

fn config(dimension: usize) -> Config {
    let mut config = Config::default();
    config.embedding.provider = "hashing".to_string();
    config.embedding.dimension = dimension;
    config.sync.debounce = "20ms".to_string();
    config.sync.save_idle = "1h".to_string();
    config
}

fn write(vault: &Path, path: &str, text: &str) {
    let full = vault.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(full, text).unwrap();
}

struct Fixture {
    _dir: TempDir,
    vault: std::path::PathBuf,
    data: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let vault = dir.path().join("vault");
        let data = dir.path().join("data");
        std::fs::create_dir_all(&vault).unwrap();
        write(&vault, "Topics/Rust.md", "# Rust\nTopic note.");
        write(
            &vault,
            "ownership.md",
            "---\ntopic: \"[[Rust]]\"\n---\n# Ownership\nBorrowing rules and lifetimes.",
        );
        write(
            &vault,
            "async.md",
            "---\ntopic: \"[[Rust]]\"\n---\n# Async\nExecutors, wakers and pinning.",
        );
        Self {
            _dir: dir,
            vault,
            data,
        }
    }

    fn store(&self) -> ShardStore {
        ShardStore::with_roots(&self.data.join("cache"), &self.vault.join(".weft")).unwrap()
    }

    async fn start(&self, dimension: usize) -> (SyncOrchestrator, weft::sync::LoadReport) {
        let source = Arc::new(FsDocumentSource::new(&self.vault).unwrap());
        SyncOrchestrator::start(
            config(dimension),
            source,
            Arc::new(HashingProvider::new(dimension)),
            self.store(),
        )
        .await
        .unwrap()
    }
}

#[tokio::test]
async fn test_reindexing_unchanged_vault_is_a_no_op() {
    let fixture = Fixture::new();
    let (sync, report) = fixture.start(64).await;
    assert_eq!(report.scan.indexed, 3);
    let before = sync.status().await.unwrap().engine;

    let again = sync.rescan().await.unwrap();
    assert_eq!(again.indexed, 0);
    assert_eq!(again.skipped, 3);

    let after = sync.status().await.unwrap().engine;
    assert_eq!(before.index.documents, after.index.documents);
    assert_eq!(before.index.chunks, after.index.chunks);
    assert_eq!(before.graph.edges, after.graph.edges);
    sync.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shards_persist_across_restarts_per_identity() {
    let fixture = Fixture::new();
    let (sync, _) = fixture.start(64).await;
    sync.shutdown().await.unwrap();
    assert!(fixture.vault.join(".weft").join("shards").is_dir());

    let (sync, report) = fixture.start(64).await;
    assert_eq!(report.tier, Some(Tier::Cache));
    assert_eq!(report.scan.indexed, 0);
    sync.shutdown().await.unwrap();

    // A different dimension gets its own shard and rebuilds
    let (sync, report) = fixture.start(32).await;
    assert_eq!(report.tier, None);
    assert_eq!(report.scan.indexed, 3);
    sync.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wrong_dimension_snapshot_is_incompatible() {
    let fixture = Fixture::new();
    let (sync, _) = fixture.start(64).await;
    let bytes = sync.worker().await.snapshot(false).await.unwrap();
    sync.shutdown().await.unwrap();

    let narrow = IndexWorker::spawn(1, &config(32), Arc::new(HashingProvider::new(32))).unwrap();
    let before = narrow.stats().await.unwrap().index.documents;
    let outcome = narrow.apply(Mutation::Restore(bytes)).await.unwrap();
    assert!(matches!(
        outcome,
        MutationOutcome::Loaded(LoadOutcome::Incompatible { .. })
    ));
    assert_eq!(narrow.stats().await.unwrap().index.documents, before);

    let garbage = narrow.apply(Mutation::Restore(vec![7; 40])).await.unwrap();
    assert!(matches!(garbage, MutationOutcome::Loaded(ref o) if !matches!(o, LoadOutcome::Loaded { .. })));
    narrow.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_file_edits_flow_through_notify() {
    let fixture = Fixture::new();
    let (sync, _) = fixture.start(64).await;

    write(&fixture.vault, "traits.md", "# Traits\nTrait objects and generics.");
    std::fs::remove_file(fixture.vault.join("async.md")).unwrap();
    sync.notify(ChangeEvent::Modify("traits.md".to_string())).unwrap();
    sync.notify(ChangeEvent::Delete("async.md".to_string())).unwrap();
    sync.flush().await.unwrap();

    let documents = sync.worker().await.list_documents().await.unwrap();
    assert!(documents.contains_key("traits.md"));
    assert!(!documents.contains_key("async.md"));

    let hits = sync.search("trait objects", 5).await.unwrap();
    assert_eq!(hits[0].path, "traits.md");
    sync.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shifted_chunk_heals_on_search() {
    let fixture = Fixture::new();
    let (sync, _) = fixture.start(64).await;

    // No change notification, so the index still holds the old offsets
    let path = fixture.vault.join("ownership.md");
    let original = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, format!("Preface added later.\n{}", original)).unwrap();

    let hits = sync.search("borrowing rules lifetimes", 5).await.unwrap();
    let hit = hits.iter().find(|h| h.path == "ownership.md").unwrap();
    assert!(hit
        .excerpt
        .as_deref()
        .unwrap()
        .contains("Borrowing rules and lifetimes."));
    assert_eq!(sync.hydrator().failure_count("ownership.md"), 0);
    sync.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_document_quarantined_after_three_failures() {
    let source = Arc::new(InMemorySource::new());
    let original = "Quarterly goals: ship the importer.";
    let chunk = ChunkRef {
        chunk_id: 1,
        start: 0,
        end: original.len(),
        anchor: anchor_hash(original),
    };
    source.insert("goals.md", "Rewritten from scratch, nothing in common.");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let hydrator = ResultHydrator::new(source.clone(), &HydrationConfig::default())
        .with_drift_sink(tx);

    for attempt in 1..=4 {
        let hydrated = hydrator.hydrate("goals.md", &chunk);
        assert_eq!(hydrated.status, HydrationStatus::Drifted);
        assert_eq!(hydrator.is_quarantined("goals.md"), attempt >= 3);
    }

    let mut signals = 0;
    while rx.try_recv().is_ok() {
        signals += 1;
    }
    assert_eq!(signals, 3);
}

#[tokio::test]
async fn test_work_from_closed_session_is_dropped() {
    let fixture = Fixture::new();
    let (sync, _) = fixture.start(64).await;
    let old = sync.worker().await;

    let mut updated = config(32);
    updated.storage.prune_stale_shards = false;
    sync.reconfigure(updated, Arc::new(HashingProvider::new(32)))
        .await
        .unwrap();
    assert!(!old.is_running());

    let current = sync.worker().await;
    let outcome = current
        .apply_stamped(old.session(), Mutation::Delete(vec!["ownership.md".to_string()]))
        .await
        .unwrap();
    assert!(outcome.is_zombie());
    assert_eq!(sync.status().await.unwrap().engine.index.documents, 3);

    // Both identities keep their shard
    let keys: std::collections::HashSet<String> = fixture
        .store()
        .list_shards()
        .unwrap()
        .into_iter()
        .map(|s| s.key)
        .collect();
    assert!(keys.contains(ShardKey::for_identity(old.identity()).as_str()));
    sync.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rescan_is_superseded_by_newer_rescan() {
    let fixture = Fixture::new();
    let (sync, _) = fixture.start(64).await;
    for i in 0..30 {
        write(&fixture.vault, &format!("daily/{:02}.md", i), &format!("Entry {}", i));
    }

    let (first, second) = tokio::join!(sync.rescan(), sync.rescan());
    assert!(first.unwrap().cancelled);
    let second = second.unwrap();
    assert!(!second.cancelled);
    assert_eq!(second.indexed, 30);
    sync.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreadable_document_counts_as_failed_on_slim_restore() {
    let fixture = Fixture::new();
    let (sync, _) = fixture.start(64).await;
    sync.shutdown().await.unwrap();

    for entry in std::fs::read_dir(fixture.data.join("cache").join("shards")).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }

    // Same size and mtime, but no longer valid UTF-8
    let path = fixture.vault.join("ownership.md");
    let metadata = std::fs::metadata(&path).unwrap();
    std::fs::write(&path, vec![0xFF; metadata.len() as usize]).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(metadata.modified().unwrap())
        .unwrap();

    let (sync, report) = fixture.start(64).await;
    assert_eq!(report.tier, Some(Tier::Portable));
    assert_eq!(report.scan.failed, 1);
    assert_eq!(report.scan.restored, 2);
    assert_eq!(report.scan.indexed, 0);
    sync.shutdown().await.unwrap();
}
