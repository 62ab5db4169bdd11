//! Background synchronisation
//!
//! [`SyncOrchestrator`] keeps the index consistent with a changing corpus.
//! It owns the worker's lifecycle and an event loop that:
//!
//! - coalesces change notifications per path and debounces them (longer for
//!   the document being edited), then dispatches due work in size-bounded
//!   batches
//! - turns drift signals from hydration into forced re-indexes
//! - schedules one idle save after bursts of changes
//!
//! Rescans and reconfiguration run on the caller's task. Every mutation is
//! stamped with the session current at enqueue time, so work queued before
//! a worker restart is dropped instead of landing on the new index.

mod batcher;
mod save;

pub use batcher::{split_batches, ChangeBatcher, DueChange, PendingKind};
pub use save::SaveScheduler;

use crate::config::{Config, ConfigValidator, SyncConfig};
use crate::context::{AssembledContext, ContextAssembler, ContextCandidate};
use crate::embedding::{EmbeddingProvider, ModelIdentity};
use crate::error::{Result, WeftError};
use crate::hydrate::{DriftReason, DriftSignal, ResultHydrator};
use crate::index::LoadOutcome;
use crate::retrieval::{rerank_hits, Reranker, SearchError, SearchHit, SearchPipeline};
use crate::source::{markdown, ChangeEvent, DocumentSource, DocumentStat};
use crate::storage::{SaveReport, ShardKey, ShardStore, Tier};
use crate::worker::{
    DocumentPayload, EngineStats, IndexWorker, Mutation, MutationOutcome, Session, WorkerHandle,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a full rescan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
    /// Slim-loaded documents whose text was re-attached
    pub restored: usize,
    /// Slim-loaded documents that changed and were re-indexed instead
    pub drifted: usize,
    pub zombies: usize,
    /// Superseded by a newer rescan or a reconfiguration
    pub cancelled: bool,
}

/// What happened when the orchestrator (re)attached to a shard
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub shard: String,
    /// Tier the shard came from, `None` when nothing was stored
    pub tier: Option<Tier>,
    pub outcome: Option<String>,
    /// The stored shard was unusable and the index was rebuilt
    pub rebuilt: bool,
    pub scan: ScanReport,
}

/// A point-in-time view of the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub session: Session,
    pub identity: ModelIdentity,
    pub shard: String,
    pub engine: EngineStats,
    pub pending_changes: usize,
    pub scanning: bool,
    pub quarantined: Vec<String>,
    pub dispatched: u64,
    pub zombies_dropped: u64,
    pub saves: u64,
    pub failed_saves: u64,
    pub last_saved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: u64,
    zombies: u64,
    saves: u64,
    failed_saves: u64,
    last_saved_at: Option<DateTime<Utc>>,
}

enum LoopCommand {
    Change(ChangeEvent),
    SetActive(Option<String>),
    Flush(oneshot::Sender<()>),
    RequestSave,
    SaveNow(oneshot::Sender<Result<SaveReport>>),
    Settings(SyncConfig),
    Shutdown(oneshot::Sender<()>),
}

struct Shared {
    config: RwLock<Config>,
    source: Arc<dyn DocumentSource>,
    store: Arc<ShardStore>,
    worker: tokio::sync::RwLock<WorkerHandle>,
    session: AtomicU64,
    hydrator: ResultHydrator,
    scan: Mutex<Option<(u64, CancellationToken)>>,
    scan_generation: AtomicU64,
    scan_lock: tokio::sync::Mutex<()>,
    scanning: AtomicBool,
    pending: AtomicUsize,
    counters: Mutex<Counters>,
}

impl Shared {
    fn config(&self) -> Config {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn worker(&self) -> WorkerHandle {
        self.worker.read().await.clone()
    }

    /// Stamp and apply. Zombies are counted and logged, never surfaced.
    async fn apply(&self, worker: &WorkerHandle, mutation: Mutation) -> Result<MutationOutcome> {
        let session = self.session.load(Ordering::SeqCst);
        let kind = mutation.kind();
        let outcome = worker.apply_stamped(session, mutation).await?;
        self.counters().dispatched += 1;
        if let MutationOutcome::Zombie { stamped, current } = outcome {
            debug!(
                "Dropped zombie {} (stamped {}, worker {})",
                kind, stamped, current
            );
            self.counters().zombies += 1;
        }
        Ok(outcome)
    }

    fn cancel_scan(&self) {
        let scan = self.scan.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((generation, token)) = scan {
            info!("Cancelling rescan #{}", generation);
            token.cancel();
        }
    }
}

pub struct SyncOrchestrator {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<LoopCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl SyncOrchestrator {
    /// Spawn the worker and event loop, then load the stored shard for the
    /// provider's identity (or rebuild) and reconcile with the source.
    pub async fn start(
        config: Config,
        source: Arc<dyn DocumentSource>,
        provider: Arc<dyn EmbeddingProvider>,
        store: ShardStore,
    ) -> Result<(Self, LoadReport)> {
        ConfigValidator::validate(&config)?;
        let session: Session = 1;
        let worker = IndexWorker::spawn(session, &config, provider)?;

        let (drift_tx, drift_rx) = mpsc::unbounded_channel();
        let hydrator =
            ResultHydrator::new(source.clone(), &config.hydration).with_drift_sink(drift_tx);

        let shared = Arc::new(Shared {
            config: RwLock::new(config.clone()),
            source,
            store: Arc::new(store),
            worker: tokio::sync::RwLock::new(worker),
            session: AtomicU64::new(session),
            hydrator,
            scan: Mutex::new(None),
            scan_generation: AtomicU64::new(0),
            scan_lock: tokio::sync::Mutex::new(()),
            scanning: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            counters: Mutex::new(Counters::default()),
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_loop(shared.clone(), command_rx, drift_rx, config.sync));

        let orchestrator = Self {
            shared,
            commands,
            task: Mutex::new(Some(task)),
            reranker: None,
        };
        let report = orchestrator.load_or_rebuild().await?;
        Ok((orchestrator, report))
    }

    /// Re-rank search results with `reranker` after hydration
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(&self) -> Config {
        self.shared.config()
    }

    pub fn session(&self) -> Session {
        self.shared.session.load(Ordering::SeqCst)
    }

    pub async fn worker(&self) -> WorkerHandle {
        self.shared.worker().await
    }

    pub fn hydrator(&self) -> &ResultHydrator {
        &self.shared.hydrator
    }

    /// Queue a change notification from the document source
    pub fn notify(&self, event: ChangeEvent) -> Result<()> {
        self.send(LoopCommand::Change(event))
    }

    /// Mark the document the user is editing; its changes wait longer
    pub fn set_active_document(&self, path: Option<String>) -> Result<()> {
        self.send(LoopCommand::SetActive(path))
    }

    /// Dispatch every pending change now and wait until it is applied
    pub async fn flush(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send(LoopCommand::Flush(ack))?;
        rx.await.map_err(|_| WeftError::WorkerStopped)
    }

    /// Flush, then write the shard to both tiers immediately
    pub async fn save_now(&self) -> Result<SaveReport> {
        let (reply, rx) = oneshot::channel();
        self.send(LoopCommand::SaveNow(reply))?;
        rx.await.map_err(|_| WeftError::WorkerStopped)?
    }

    /// Reconcile the index with the full document list. A rescan already
    /// in flight is cancelled and this one starts once it has stopped.
    pub async fn rescan(&self) -> Result<ScanReport> {
        let report = rescan(&self.shared).await?;
        if report.indexed + report.removed + report.restored + report.drifted > 0 {
            let _ = self.send(LoopCommand::RequestSave);
        }
        Ok(report)
    }

    /// Apply a new configuration. Settings that leave the vectors valid are
    /// swapped in place; an embedding identity or chunking change closes the
    /// session, drains and saves the old shard, and restarts the worker.
    pub async fn reconfigure(
        &self,
        config: Config,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Option<LoadReport>> {
        ConfigValidator::validate(&config)?;
        let current = self.shared.config();
        let worker = self.shared.worker().await;
        let restart = current.embedding_identity_differs(&config)
            || provider.identity() != *worker.identity();

        if !restart {
            self.shared
                .apply(&worker, Mutation::UpdateSettings(Box::new(config.clone())))
                .await?;
            self.install_settings(config);
            info!("Configuration updated in place");
            return Ok(None);
        }

        if provider.dimension() != config.embedding.dimension {
            return Err(crate::embedding::EmbeddingError::DimensionMismatch {
                expected: config.embedding.dimension,
                actual: provider.dimension(),
            }
            .into());
        }

        self.shared.cancel_scan();
        {
            let mut slot = self.shared.worker.write().await;
            let old = slot.clone();
            let old_session = old.session();
            let new_session = self.shared.session.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                "Closing session {} ({}) for {}",
                old_session,
                old.identity(),
                provider.identity()
            );

            // Everything queued under the old session lands before the save
            if let Err(e) = old.apply_stamped(old_session, Mutation::Barrier).await {
                warn!("Failed to drain session {}: {}", old_session, e);
            }
            match save_worker(&self.shared.store, &old).await {
                Ok(report) if report.any() => self.record_save(true),
                Ok(_) => self.record_save(false),
                Err(e) => {
                    warn!("Final save of session {} failed: {}", old_session, e);
                    self.record_save(false);
                }
            }
            old.shutdown().await?;

            *slot = IndexWorker::spawn(new_session, &config, provider.clone())?;
        }

        if config.storage.prune_stale_shards {
            let store = self.shared.store.clone();
            let keep = ShardKey::for_identity(&provider.identity());
            match tokio::task::spawn_blocking(move || store.prune(&keep)).await {
                Ok(Ok(removed)) if removed > 0 => info!("Pruned {} stale shards", removed),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Failed to prune stale shards: {}", e),
                Err(e) => warn!("Shard prune task failed: {}", e),
            }
        }

        self.install_settings(config);
        self.shared.hydrator.reset_session();
        self.load_or_rebuild().await.map(Some)
    }

    /// Hybrid search, hydrated against the live documents and optionally
    /// re-ranked
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let config = self.shared.config();
        let pipeline = SearchPipeline::new(self.shared.worker().await, &config);
        let hits = pipeline.run(query, limit).await?;
        if hits.is_empty() {
            return Ok(hits);
        }

        let shared = self.shared.clone();
        let mut hits = tokio::task::spawn_blocking(move || {
            let mut hits = hits;
            for hit in &mut hits {
                shared.hydrator.hydrate_hit(hit);
            }
            hits
        })
        .await
        .map_err(|e| WeftError::Worker(format!("Hydration task failed: {}", e)))?;

        if let Some(reranker) = &self.reranker {
            let reranker = reranker.clone();
            let query = query.to_string();
            hits = tokio::task::spawn_blocking(move || rerank_hits(reranker.as_ref(), &query, hits))
                .await
                .map_err(|e| WeftError::Worker(format!("Rerank task failed: {}", e)))?
                .map_err(SearchError::from)?;
        }
        Ok(hits)
    }

    /// Search and pack the results into the configured context budget
    pub async fn build_context(&self, query: &str, limit: usize) -> Result<AssembledContext> {
        let budget = self.shared.config().context.budget_chars;
        self.build_context_with_budget(query, limit, budget).await
    }

    pub async fn build_context_with_budget(
        &self,
        query: &str,
        limit: usize,
        budget: usize,
    ) -> Result<AssembledContext> {
        let hits = self.search(query, limit).await?;
        let worker = self.shared.worker().await;
        let summaries = worker
            .summaries(hits.iter().map(|h| h.path.clone()).collect())
            .await?;

        let source = self.shared.source.clone();
        let candidates = tokio::task::spawn_blocking(move || {
            let mut headers: ahash::HashMap<String, Vec<String>> = summaries
                .into_iter()
                .map(|s| (s.path, s.headers))
                .collect();
            hits.into_iter()
                .filter_map(|hit| {
                    let body = match source.read(&hit.path) {
                        Ok(body) => body,
                        Err(e) => {
                            debug!("Skipping {} in context: {}", hit.path, e);
                            return None;
                        }
                    };
                    Some(ContextCandidate {
                        title: hit.display_title().to_string(),
                        headers: headers.remove(&hit.path).unwrap_or_default(),
                        score: hit.score,
                        keyword_match: hit.keyword_match,
                        path: hit.path,
                        body,
                    })
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| WeftError::Worker(format!("Context read task failed: {}", e)))?;

        let assembler = ContextAssembler::new(&self.shared.config().context);
        Ok(assembler.assemble(&candidates, query, budget))
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let worker = self.shared.worker().await;
        let engine = worker.stats().await?;
        let counters = self.shared.counters();
        Ok(SyncStatus {
            session: self.session(),
            identity: worker.identity().clone(),
            shard: ShardKey::for_identity(worker.identity()).to_string(),
            engine,
            pending_changes: self.shared.pending.load(Ordering::SeqCst),
            scanning: self.shared.scanning.load(Ordering::SeqCst),
            quarantined: self.shared.hydrator.quarantined(),
            dispatched: counters.dispatched,
            zombies_dropped: counters.zombies,
            saves: counters.saves,
            failed_saves: counters.failed_saves,
            last_saved_at: counters.last_saved_at,
        })
    }

    /// Flush pending changes, force a save and stop the worker
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.cancel_scan();
        let (ack, rx) = oneshot::channel();
        if self.send(LoopCommand::Shutdown(ack)).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Sync loop ended abnormally: {}", e);
            }
        }
        self.shared.worker().await.shutdown().await?;
        info!("Sync orchestrator stopped");
        Ok(())
    }

    fn send(&self, command: LoopCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| WeftError::WorkerStopped)
    }

    fn install_settings(&self, config: Config) {
        self.shared.hydrator.set_config(&config.hydration);
        let _ = self.send(LoopCommand::Settings(config.sync.clone()));
        *self.shared.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    fn record_save(&self, ok: bool) {
        record_save(&self.shared, ok);
    }

    /// Restore the stored shard for the current identity, rebuilding when
    /// it is missing or unusable, then reconcile with the source
    async fn load_or_rebuild(&self) -> Result<LoadReport> {
        let worker = self.shared.worker().await;
        let key = ShardKey::for_identity(worker.identity());
        let store = self.shared.store.clone();
        let load_key = key.clone();
        let stored = tokio::task::spawn_blocking(move || store.load(&load_key))
            .await
            .map_err(|e| WeftError::Worker(format!("Shard load task failed: {}", e)))?;

        let stored = match stored {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to read shard {}: {}", key, e);
                None
            }
        };

        let mut report = LoadReport {
            shard: key.to_string(),
            tier: None,
            outcome: None,
            rebuilt: false,
            scan: ScanReport::default(),
        };

        if let Some((tier, bytes)) = stored {
            report.tier = Some(tier);
            let outcome = self.shared.apply(&worker, Mutation::Restore(bytes)).await?;
            match outcome {
                MutationOutcome::Loaded(LoadOutcome::Loaded { documents, slim }) => {
                    info!(
                        "Loaded shard {} from {} tier ({} documents{})",
                        key,
                        tier,
                        documents,
                        if slim { ", slim" } else { "" }
                    );
                    report.outcome = Some("loaded".to_string());
                }
                MutationOutcome::Loaded(other) => {
                    warn!("Shard {} unusable ({:?}); rebuilding", key, other);
                    report.outcome = Some(format!("{:?}", other));
                    report.rebuilt = true;
                    self.shared.apply(&worker, Mutation::Reset).await?;
                }
                other => {
                    debug!("Shard restore not applied: {:?}", other);
                }
            }
        } else {
            info!("No stored shard {}; building from scratch", key);
        }

        report.scan = self.rescan().await?;
        Ok(report)
    }
}

fn record_save(shared: &Shared, ok: bool) {
    let mut counters = shared.counters();
    if ok {
        counters.saves += 1;
        counters.last_saved_at = Some(Utc::now());
    } else {
        counters.failed_saves += 1;
    }
}

/// Snapshot `worker` and write both tiers under its identity's key
async fn save_worker(store: &Arc<ShardStore>, worker: &WorkerHandle) -> Result<SaveReport> {
    let key = ShardKey::for_identity(worker.identity());
    let (full, slim) = tokio::try_join!(worker.snapshot(false), worker.snapshot(true))?;
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.save(&key, &full, &slim))
        .await
        .map_err(|e| WeftError::Worker(format!("Save task failed: {}", e)))
}

async fn save_current(shared: &Shared) -> Result<SaveReport> {
    let worker = shared.worker().await;
    let report = save_worker(&shared.store, &worker).await?;
    record_save(shared, report.any());
    Ok(report)
}

/// Read a document for indexing. `None` when it no longer exists.
fn read_payload(
    source: &dyn DocumentSource,
    path: &str,
    force: bool,
) -> Result<Option<DocumentPayload>> {
    let Some(stat) = source.stat(path)? else {
        return Ok(None);
    };
    let text = match source.read(path) {
        Ok(text) => text,
        Err(WeftError::DocumentNotFound { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(Some(DocumentPayload {
        path: path.to_string(),
        title: markdown::document_title(path, &text),
        links: source.links(path)?,
        text,
        stat,
        force,
    }))
}

/// Read several documents off the runtime. Unreadable ones are logged and
/// left out; vanished ones are returned separately.
async fn read_payloads(
    source: Arc<dyn DocumentSource>,
    requests: Vec<(String, bool)>,
) -> Result<(Vec<DocumentPayload>, Vec<String>)> {
    tokio::task::spawn_blocking(move || {
        let mut payloads = Vec::new();
        let mut missing = Vec::new();
        for (path, force) in requests {
            match read_payload(source.as_ref(), &path, force) {
                Ok(Some(payload)) => payloads.push(payload),
                Ok(None) => missing.push(path),
                Err(e) => warn!("Failed to read {}: {}", path, e),
            }
        }
        (payloads, missing)
    })
    .await
    .map_err(|e| WeftError::Worker(format!("Read task failed: {}", e)))
}

/// Turn due changes into mutations: moves first so follow-up content
/// changes land on the moved document, then deletes, then upserts in
/// batches. Returns whether anything changed.
async fn dispatch(shared: &Shared, due: Vec<DueChange>) -> Result<bool> {
    let config = shared.config();
    // Held for the whole dispatch so a restart waits for it to finish
    let worker = shared.worker.read().await;
    let mut changed = false;
    let mut deletes = Vec::new();
    let mut upserts = Vec::new();

    for change in due {
        match change.kind {
            PendingKind::Delete => {
                deletes.extend(change.renamed_from);
                deletes.push(change.path);
            }
            PendingKind::Move | PendingKind::Modify => {
                if let Some(from) = change.renamed_from {
                    let outcome = shared
                        .apply(
                            &worker,
                            Mutation::Rename {
                                from,
                                to: change.path.clone(),
                            },
                        )
                        .await?;
                    changed |= outcome.report().is_some_and(|r| r.changed());
                }
                if change.kind == PendingKind::Modify {
                    upserts.push((change.path, change.force));
                }
            }
        }
    }

    let (payloads, missing) = read_payloads(shared.source.clone(), upserts).await?;
    deletes.extend(missing);

    if !deletes.is_empty() {
        let outcome = shared.apply(&worker, Mutation::Delete(deletes)).await?;
        changed |= outcome.report().is_some_and(|r| r.changed());
    }

    for batch in split_batches(
        payloads,
        config.sync.batch_max_documents,
        config.sync.batch_max_bytes,
    ) {
        let size = batch.len();
        let outcome = shared.apply(&worker, Mutation::Upsert(batch)).await?;
        if let Some(report) = outcome.report() {
            debug!(
                "Batch of {}: {} indexed, {} unchanged, {} failed",
                size, report.indexed, report.skipped, report.failed
            );
            changed |= report.changed();
        }
    }
    Ok(changed)
}

async fn rescan(shared: &Shared) -> Result<ScanReport> {
    let generation = shared.scan_generation.fetch_add(1, Ordering::SeqCst) + 1;
    let token = CancellationToken::new();
    let superseded = shared
        .scan
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .replace((generation, token.clone()));
    if let Some((previous, previous_token)) = superseded {
        info!("Rescan #{} supersedes #{}", generation, previous);
        previous_token.cancel();
    }

    let _scanning = shared.scan_lock.lock().await;
    if token.is_cancelled() {
        return Ok(ScanReport {
            cancelled: true,
            ..ScanReport::default()
        });
    }

    shared.scanning.store(true, Ordering::SeqCst);
    let result = run_scan(shared, &token).await;
    shared.scanning.store(false, Ordering::SeqCst);

    {
        let mut scan = shared.scan.lock().unwrap_or_else(|e| e.into_inner());
        if scan.as_ref().is_some_and(|(g, _)| *g == generation) {
            *scan = None;
        }
    }

    let report = match result {
        Ok(report) => report,
        // The worker was replaced underneath a superseded scan
        Err(WeftError::WorkerStopped) if token.is_cancelled() => ScanReport {
            cancelled: true,
            ..ScanReport::default()
        },
        Err(e) => return Err(e),
    };
    info!(
        "Rescan #{}{}: {} scanned, {} indexed, {} unchanged, {} removed, {} restored",
        generation,
        if report.cancelled { " (cancelled)" } else { "" },
        report.scanned,
        report.indexed,
        report.skipped,
        report.removed,
        report.restored
    );
    Ok(report)
}

async fn run_scan(shared: &Shared, token: &CancellationToken) -> Result<ScanReport> {
    let config = shared.config();
    let worker = shared.worker().await;
    let mut report = ScanReport::default();

    let known = worker.list_documents().await?;
    let source = shared.source.clone();
    let (paths, stats) = tokio::task::spawn_blocking(move || -> Result<_> {
        let paths = source.list()?;
        let mut stats: Vec<(String, Option<DocumentStat>)> = Vec::with_capacity(paths.len());
        for path in &paths {
            stats.push((path.clone(), source.stat(path)?));
        }
        Ok((paths, stats))
    })
    .await
    .map_err(|e| WeftError::Worker(format!("Scan task failed: {}", e)))??;
    report.scanned = paths.len();

    let live: HashSet<&str> = paths.iter().map(String::as_str).collect();
    let stale: Vec<String> = known
        .keys()
        .filter(|path| !live.contains(path.as_str()))
        .cloned()
        .collect();
    if !stale.is_empty() {
        match shared.apply(&worker, Mutation::Delete(stale)).await? {
            MutationOutcome::Applied(applied) => report.removed += applied.removed,
            MutationOutcome::Zombie { .. } => return Ok(zombie(report)),
            MutationOutcome::Loaded(_) => {}
        }
    }

    // Unchanged documents from a slim shard only need their text back
    let mut restore = Vec::new();
    let mut changed = Vec::new();
    for (path, stat) in stats {
        let Some(stat) = stat else { continue };
        match known.get(&path) {
            Some(listing) if listing.stat == stat && listing.needs_content => restore.push(path),
            Some(listing) if listing.stat == stat => report.skipped += 1,
            _ => changed.push(path),
        }
    }

    for group in restore.chunks(config.sync.batch_max_documents.max(1)) {
        if token.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        let source = shared.source.clone();
        let paths = group.to_vec();
        let (texts, unreadable) = tokio::task::spawn_blocking(move || {
            let mut texts = Vec::with_capacity(paths.len());
            let mut unreadable = 0;
            for path in paths {
                match source.read(&path) {
                    Ok(text) => texts.push((path, text)),
                    Err(WeftError::DocumentNotFound { .. }) => {
                        debug!("{} vanished before its content was restored", path)
                    }
                    Err(e) => {
                        warn!("Failed to restore content of {}: {}", path, e);
                        unreadable += 1;
                    }
                }
            }
            (texts, unreadable)
        })
        .await
        .map_err(|e| WeftError::Worker(format!("Read task failed: {}", e)))?;
        report.failed += unreadable;

        match shared.apply(&worker, Mutation::RestoreContent(texts)).await? {
            MutationOutcome::Applied(applied) => {
                report.restored += applied.restored;
                report.drifted += applied.drifted.len();
                changed.extend(applied.drifted);
            }
            MutationOutcome::Zombie { .. } => return Ok(zombie(report)),
            MutationOutcome::Loaded(_) => {}
        }
    }

    let max_documents = config.sync.batch_max_documents.max(1);
    for group in changed.chunks(max_documents) {
        if token.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let mut payloads = Vec::with_capacity(group.len());
        for path in group {
            // Checked between documents, never inside a mutation
            if token.is_cancelled() {
                report.cancelled = true;
                return Ok(report);
            }
            let (mut read, missing) =
                read_payloads(shared.source.clone(), vec![(path.clone(), true)]).await?;
            if !missing.is_empty() {
                debug!("{} vanished during rescan", path);
            }
            payloads.append(&mut read);
        }

        for batch in split_batches(payloads, max_documents, config.sync.batch_max_bytes) {
            match shared.apply(&worker, Mutation::Upsert(batch)).await? {
                MutationOutcome::Applied(applied) => {
                    report.indexed += applied.indexed;
                    report.skipped += applied.skipped;
                    report.failed += applied.failed;
                }
                MutationOutcome::Zombie { .. } => return Ok(zombie(report)),
                MutationOutcome::Loaded(_) => {}
            }
        }
    }

    if report.removed > 0 {
        shared.apply(&worker, Mutation::PruneOrphans).await?;
    }
    Ok(report)
}

fn zombie(mut report: ScanReport) -> ScanReport {
    report.zombies += 1;
    report.cancelled = true;
    report
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<LoopCommand>,
    mut drift: mpsc::UnboundedReceiver<DriftSignal>,
    settings: SyncConfig,
) {
    let mut batcher = ChangeBatcher::new(
        settings.debounce_duration(),
        settings.active_debounce_duration(),
    );
    let mut saves = SaveScheduler::new(settings.save_idle_duration());

    loop {
        shared.pending.store(batcher.len(), Ordering::SeqCst);
        let deadline = earliest(batcher.next_deadline(), saves.deadline());

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    LoopCommand::Change(event) => batcher.push(event, Instant::now()),
                    LoopCommand::SetActive(path) => batcher.set_active(path, Instant::now()),
                    LoopCommand::Flush(ack) => {
                        flush_all(&shared, &mut batcher, &mut saves).await;
                        let _ = ack.send(());
                    }
                    LoopCommand::RequestSave => saves.request(Instant::now()),
                    LoopCommand::SaveNow(reply) => {
                        flush_all(&shared, &mut batcher, &mut saves).await;
                        saves.clear();
                        let _ = reply.send(save_current(&shared).await);
                    }
                    LoopCommand::Settings(settings) => {
                        batcher.set_windows(
                            settings.debounce_duration(),
                            settings.active_debounce_duration(),
                        );
                        saves.set_idle(settings.save_idle_duration());
                    }
                    LoopCommand::Shutdown(ack) => {
                        flush_all(&shared, &mut batcher, &mut saves).await;
                        saves.clear();
                        if let Err(e) = save_current(&shared).await {
                            error!("Final save failed: {}", e);
                        }
                        shared.pending.store(0, Ordering::SeqCst);
                        let _ = ack.send(());
                        break;
                    }
                }
            }
            Some(signal) = drift.recv() => {
                let now = Instant::now();
                match signal.reason {
                    DriftReason::Drifted => {
                        debug!("Drift in {}; queueing re-index", signal.path);
                        batcher.push_reindex(signal.path, now);
                    }
                    DriftReason::Missing => batcher.push(ChangeEvent::Delete(signal.path), now),
                }
            }
            _ = sleep_until(deadline) => {
                let now = Instant::now();
                let due = batcher.take_due(now);
                if !due.is_empty() {
                    match dispatch(&shared, due).await {
                        Ok(true) => saves.request(Instant::now()),
                        Ok(false) => {}
                        Err(e) => warn!("Failed to dispatch changes: {}", e),
                    }
                }
                if saves.take_due(Instant::now()) {
                    if let Err(e) = save_current(&shared).await {
                        warn!("Scheduled save failed, will retry: {}", e);
                        saves.request(Instant::now());
                    }
                }
            }
        }
    }
    debug!("Sync loop stopped");
}

/// Dispatch everything pending and wait for the worker to apply it
async fn flush_all(shared: &Shared, batcher: &mut ChangeBatcher, saves: &mut SaveScheduler) {
    let due = batcher.take_all();
    if !due.is_empty() {
        match dispatch(shared, due).await {
            Ok(true) => saves.request(Instant::now()),
            Ok(false) => {}
            Err(e) => warn!("Failed to dispatch changes: {}", e),
        }
    }
    let worker = shared.worker().await;
    if let Err(e) = shared.apply(&worker, Mutation::Barrier).await {
        debug!("Flush barrier failed: {}", e);
    }
}
