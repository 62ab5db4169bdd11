//! Background index worker
//!
//! The worker is the single writer of the index and graph. Callers talk to
//! it only through a [`WorkerHandle`]:
//!
//! - mutations go through one FIFO channel and are applied strictly one at
//!   a time; each is stamped with a session id and dropped as a zombie when
//!   the stamp no longer matches the worker's session
//! - queries go through a second channel and each one runs on its own task
//!   under a read lock, concurrently with other queries
//!
//! Search answers are hollow: paths, offsets and anchors, never text.

mod engine;

pub use engine::{
    prepare_document, DocumentListing, DocumentPayload, DocumentSummary, EngineSnapshot,
    EngineStats, IndexEngine, PreparedDocument,
};

use crate::config::Config;
use crate::embedding::{EmbeddingProvider, ModelIdentity};
use crate::error::{Result, WeftError};
use crate::graph::{Neighbor, NeighborQuery};
use crate::index::{HollowHit, IndexError, LoadOutcome, RestoreResult};
use ahash::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker generation; bumped whenever the worker is replaced
pub type Session = u64;

/// A write against the index and graph
#[derive(Debug)]
pub enum Mutation {
    Upsert(Vec<DocumentPayload>),
    Delete(Vec<String>),
    Rename { from: String, to: String },
    Reset,
    /// Re-attach live text `(path, text)` after a slim load
    RestoreContent(Vec<(String, String)>),
    /// Replace all state with shard bytes
    Restore(Vec<u8>),
    PruneOrphans,
    /// Settings that leave the embedding identity alone
    UpdateSettings(Box<Config>),
    /// No-op; resolves once everything queued before it has been applied
    Barrier,
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Upsert(_) => "upsert",
            Mutation::Delete(_) => "delete",
            Mutation::Rename { .. } => "rename",
            Mutation::Reset => "reset",
            Mutation::RestoreContent(_) => "restore-content",
            Mutation::Restore(_) => "restore",
            Mutation::PruneOrphans => "prune-orphans",
            Mutation::UpdateSettings(_) => "update-settings",
            Mutation::Barrier => "barrier",
        }
    }

    /// True for mutations that change indexed state
    pub fn is_write(&self) -> bool {
        !matches!(self, Mutation::Barrier | Mutation::UpdateSettings(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationReport {
    pub indexed: usize,
    /// Unchanged documents left alone
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
    pub renamed: usize,
    pub restored: usize,
    /// Documents whose live text no longer matches their anchors
    pub drifted: Vec<String>,
    pub pruned: usize,
}

impl MutationReport {
    pub fn changed(&self) -> bool {
        self.indexed + self.removed + self.renamed + self.restored + self.pruned > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Applied(MutationReport),
    Loaded(LoadOutcome),
    /// Stamped for a session that has since been replaced; not applied
    Zombie { stamped: Session, current: Session },
}

impl MutationOutcome {
    pub fn report(&self) -> Option<&MutationReport> {
        match self {
            MutationOutcome::Applied(report) => Some(report),
            _ => None,
        }
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self, MutationOutcome::Zombie { .. })
    }
}

struct Envelope {
    session: Session,
    mutation: Mutation,
    reply: oneshot::Sender<MutationOutcome>,
}

enum Command {
    Mutate(Envelope),
    Shutdown(oneshot::Sender<()>),
}

type Reply<T> = oneshot::Sender<std::result::Result<T, IndexError>>;

enum Query {
    VectorSearch {
        vector: Vec<f32>,
        limit: usize,
        min_score: f32,
        reply: Reply<Vec<HollowHit>>,
    },
    KeywordSearch {
        query: String,
        limit: usize,
        reply: Reply<Vec<HollowHit>>,
    },
    Neighbors {
        path: String,
        query: NeighborQuery,
        reply: oneshot::Sender<Vec<Neighbor>>,
    },
    Centrality {
        paths: Vec<String>,
        reply: oneshot::Sender<Vec<f32>>,
    },
    Summaries {
        paths: Vec<String>,
        reply: oneshot::Sender<Vec<DocumentSummary>>,
    },
    Snapshot {
        slim: bool,
        reply: Reply<Vec<u8>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    ListDocuments {
        reply: oneshot::Sender<HashMap<String, DocumentListing>>,
    },
}

pub struct IndexWorker;

impl IndexWorker {
    /// Start a worker for `session`. Must be called inside a tokio runtime.
    pub fn spawn(
        session: Session,
        config: &Config,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<WorkerHandle> {
        if provider.dimension() != config.embedding.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: config.embedding.dimension,
                actual: provider.dimension(),
            }
            .into());
        }

        let engine = Arc::new(RwLock::new(IndexEngine::new(config)?));
        let (command_tx, command_rx) = mpsc::channel(config.sync.queue_capacity.max(1));
        let (query_tx, query_rx) = mpsc::channel(config.sync.queue_capacity.max(1));
        let stopped = CancellationToken::new();

        tokio::spawn(run_mutations(
            session,
            engine.clone(),
            provider.clone(),
            command_rx,
            stopped.clone(),
        ));
        tokio::spawn(run_queries(engine, query_rx, stopped.clone()));

        info!(
            "Index worker started (session {}, {})",
            session,
            provider.identity()
        );

        Ok(WorkerHandle {
            session,
            identity: provider.identity(),
            provider,
            commands: command_tx,
            queries: query_tx,
            stopped,
        })
    }
}

/// Cheap, cloneable access to a running worker
#[derive(Clone)]
pub struct WorkerHandle {
    session: Session,
    identity: ModelIdentity,
    provider: Arc<dyn EmbeddingProvider>,
    commands: mpsc::Sender<Command>,
    queries: mpsc::Sender<Query>,
    stopped: CancellationToken,
}

impl WorkerHandle {
    pub fn session(&self) -> Session {
        self.session
    }

    pub fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        self.provider.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.is_cancelled()
    }

    /// Embed a query off the async runtime
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let provider = self.provider.clone();
        let text = text.to_string();
        let vector = tokio::task::spawn_blocking(move || provider.embed_query(&text))
            .await
            .map_err(|e| WeftError::Worker(format!("Embedding task failed: {}", e)))??;
        Ok(vector)
    }

    /// Enqueue a mutation stamped with `session`. The receiver resolves once
    /// the worker has applied (or dropped) it.
    pub async fn submit(
        &self,
        session: Session,
        mutation: Mutation,
    ) -> Result<oneshot::Receiver<MutationOutcome>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Mutate(Envelope {
                session,
                mutation,
                reply,
            }))
            .await
            .map_err(|_| WeftError::WorkerStopped)?;
        Ok(rx)
    }

    /// Apply a mutation stamped with an explicit session
    pub async fn apply_stamped(
        &self,
        session: Session,
        mutation: Mutation,
    ) -> Result<MutationOutcome> {
        let rx = self.submit(session, mutation).await?;
        rx.await.map_err(|_| WeftError::WorkerStopped)
    }

    /// Apply a mutation under this worker's own session
    pub async fn apply(&self, mutation: Mutation) -> Result<MutationOutcome> {
        self.apply_stamped(self.session, mutation).await
    }

    /// Wait until every mutation queued so far has been applied
    pub async fn barrier(&self) -> Result<()> {
        self.apply(Mutation::Barrier).await.map(|_| ())
    }

    /// Stop after everything already queued has been applied. Returns once
    /// the worker no longer accepts messages.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).await.is_ok() {
            let _ = rx.await;
        }
        self.stopped.cancelled().await;
        Ok(())
    }

    async fn ask<T>(&self, query: Query, rx: oneshot::Receiver<T>) -> Result<T> {
        self.queries
            .send(query)
            .await
            .map_err(|_| WeftError::WorkerStopped)?;
        rx.await.map_err(|_| WeftError::WorkerStopped)
    }

    pub async fn vector_search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<HollowHit>> {
        let (reply, rx) = oneshot::channel();
        let hits = self
            .ask(
                Query::VectorSearch {
                    vector,
                    limit,
                    min_score,
                    reply,
                },
                rx,
            )
            .await??;
        Ok(hits)
    }

    pub async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<HollowHit>> {
        let (reply, rx) = oneshot::channel();
        let hits = self
            .ask(
                Query::KeywordSearch {
                    query: query.to_string(),
                    limit,
                    reply,
                },
                rx,
            )
            .await??;
        Ok(hits)
    }

    pub async fn neighbors(&self, path: &str, query: NeighborQuery) -> Result<Vec<Neighbor>> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            Query::Neighbors {
                path: path.to_string(),
                query,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn centralities(&self, paths: Vec<String>) -> Result<Vec<f32>> {
        let (reply, rx) = oneshot::channel();
        self.ask(Query::Centrality { paths, reply }, rx).await
    }

    pub async fn summaries(&self, paths: Vec<String>) -> Result<Vec<DocumentSummary>> {
        let (reply, rx) = oneshot::channel();
        self.ask(Query::Summaries { paths, reply }, rx).await
    }

    /// Encoded shard bytes of the current state
    pub async fn snapshot(&self, slim: bool) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        let bytes = self.ask(Query::Snapshot { slim, reply }, rx).await??;
        Ok(bytes)
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let (reply, rx) = oneshot::channel();
        self.ask(Query::Stats { reply }, rx).await
    }

    pub async fn list_documents(&self) -> Result<HashMap<String, DocumentListing>> {
        let (reply, rx) = oneshot::channel();
        self.ask(Query::ListDocuments { reply }, rx).await
    }
}

async fn run_mutations(
    session: Session,
    engine: Arc<RwLock<IndexEngine>>,
    provider: Arc<dyn EmbeddingProvider>,
    mut commands: mpsc::Receiver<Command>,
    stopped: CancellationToken,
) {
    let mut applied = 0usize;
    let mut zombies = 0usize;

    while let Some(command) = commands.recv().await {
        match command {
            Command::Shutdown(ack) => {
                let _ = ack.send(());
                break;
            }
            Command::Mutate(envelope) => {
                let outcome = if envelope.session != session {
                    debug!(
                        "Dropping zombie {} mutation (stamped session {}, worker session {})",
                        envelope.mutation.kind(),
                        envelope.session,
                        session
                    );
                    zombies += 1;
                    MutationOutcome::Zombie {
                        stamped: envelope.session,
                        current: session,
                    }
                } else {
                    applied += 1;
                    apply_mutation(&engine, &provider, envelope.mutation).await
                };
                let _ = envelope.reply.send(outcome);
            }
        }
    }

    commands.close();
    drop(commands);
    stopped.cancel();
    info!(
        "Index worker stopped (session {}): {} mutations applied, {} zombies dropped",
        session, applied, zombies
    );
}

async fn apply_mutation(
    engine: &RwLock<IndexEngine>,
    provider: &Arc<dyn EmbeddingProvider>,
    mutation: Mutation,
) -> MutationOutcome {
    let mut report = MutationReport::default();

    match mutation {
        Mutation::Upsert(batch) => {
            upsert(engine, provider, batch, &mut report).await;
        }
        Mutation::Delete(paths) => {
            let mut engine = engine.write().await;
            for path in paths {
                if engine.remove(&path) {
                    report.removed += 1;
                }
            }
            commit(&mut engine);
        }
        Mutation::Rename { from, to } => {
            let mut engine = engine.write().await;
            match engine.rename(&from, &to) {
                Ok(true) => report.renamed += 1,
                Ok(false) => debug!("Rename of unindexed document {} ignored", from),
                Err(e) => {
                    warn!("Failed to rename {} -> {}: {}", from, to, e);
                    report.failed += 1;
                }
            }
            commit(&mut engine);
        }
        Mutation::Reset => {
            let mut engine = engine.write().await;
            if let Err(e) = engine.reset() {
                error!("Failed to reset index: {}", e);
                report.failed += 1;
            }
        }
        Mutation::RestoreContent(documents) => {
            let mut engine = engine.write().await;
            for (path, text) in documents {
                match engine.restore_content(&path, &text) {
                    Ok(RestoreResult::Restored) => report.restored += 1,
                    Ok(RestoreResult::Drifted) => report.drifted.push(path),
                    Ok(RestoreResult::Unknown) => {}
                    Err(e) => {
                        warn!("Failed to restore content of {}: {}", path, e);
                        report.failed += 1;
                    }
                }
            }
            commit(&mut engine);
            if !report.drifted.is_empty() {
                debug!(
                    "{} documents drifted since the shard was saved",
                    report.drifted.len()
                );
            }
        }
        Mutation::Restore(bytes) => {
            let outcome = engine.write().await.restore(&bytes);
            return MutationOutcome::Loaded(outcome);
        }
        Mutation::PruneOrphans => {
            report.pruned = engine.write().await.prune_orphans();
        }
        Mutation::UpdateSettings(config) => {
            engine.write().await.update_settings(&config);
        }
        Mutation::Barrier => {}
    }

    MutationOutcome::Applied(report)
}

/// Index a batch. Embedding runs without holding the lock; one document
/// failing does not stop the rest.
async fn upsert(
    engine: &RwLock<IndexEngine>,
    provider: &Arc<dyn EmbeddingProvider>,
    batch: Vec<DocumentPayload>,
    report: &mut MutationReport,
) {
    let (pending, embedding_config) = {
        let engine = engine.read().await;
        let mut pending = Vec::with_capacity(batch.len());
        for payload in batch {
            if !payload.force && engine.is_unchanged(&payload.path, &payload.stat) {
                debug!("Skipping unchanged document {}", payload.path);
                report.skipped += 1;
            } else {
                pending.push(payload);
            }
        }
        (pending, engine.config().embedding.clone())
    };

    for payload in pending {
        let path = payload.path.clone();
        let provider = provider.clone();
        let config = embedding_config.clone();
        let prepared = tokio::task::spawn_blocking(move || {
            prepare_document(payload, provider.as_ref(), &config)
        })
        .await;

        let prepared = match prepared {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => {
                warn!("Failed to embed {}: {}", path, e);
                report.failed += 1;
                continue;
            }
            Err(e) => {
                error!("Embedding task for {} panicked: {}", path, e);
                report.failed += 1;
                continue;
            }
        };

        match engine.write().await.apply(prepared) {
            Ok(()) => report.indexed += 1,
            Err(e) => {
                warn!("Failed to index {}: {}", path, e);
                report.failed += 1;
            }
        }
    }

    commit(&mut *engine.write().await);
    if report.indexed + report.failed > 0 {
        info!(
            "Indexed {} documents ({} unchanged, {} failed)",
            report.indexed, report.skipped, report.failed
        );
    }
}

fn commit(engine: &mut IndexEngine) {
    if let Err(e) = engine.commit() {
        error!("Failed to commit keyword index: {}", e);
    }
}

async fn run_queries(
    engine: Arc<RwLock<IndexEngine>>,
    mut queries: mpsc::Receiver<Query>,
    stopped: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stopped.cancelled() => break,
            query = queries.recv() => {
                let Some(query) = query else { break };
                let engine = engine.clone();
                tokio::spawn(async move {
                    let engine = engine.read().await;
                    answer(&engine, query);
                });
            }
        }
    }
}

fn answer(engine: &IndexEngine, query: Query) {
    match query {
        Query::VectorSearch {
            vector,
            limit,
            min_score,
            reply,
        } => {
            let _ = reply.send(engine.vector_search(&vector, limit, min_score));
        }
        Query::KeywordSearch {
            query,
            limit,
            reply,
        } => {
            let _ = reply.send(engine.keyword_search(&query, limit));
        }
        Query::Neighbors { path, query, reply } => {
            let _ = reply.send(engine.neighbors(&path, query));
        }
        Query::Centrality { paths, reply } => {
            let _ = reply.send(engine.centralities(&paths));
        }
        Query::Summaries { paths, reply } => {
            let _ = reply.send(engine.summaries(&paths));
        }
        Query::Snapshot { slim, reply } => {
            let _ = reply.send(engine.encode(slim));
        }
        Query::Stats { reply } => {
            let _ = reply.send(engine.stats());
        }
        Query::ListDocuments { reply } => {
            let _ = reply.send(engine.listing());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{DocumentEmbedding, EmbeddingError, HashingProvider};
    use crate::source::{markdown, DocumentStat};

    fn stat_of(text: &str, mtime: i64) -> DocumentStat {
        DocumentStat {
            size: text.len() as u64,
            mtime,
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.embedding.provider = "hashing".to_string();
        config.embedding.dimension = 32;
        config
    }

    fn payload(path: &str, text: &str, mtime: i64) -> DocumentPayload {
        DocumentPayload {
            path: path.to_string(),
            title: markdown::document_title(path, text),
            text: text.to_string(),
            stat: stat_of(text, mtime),
            links: markdown::extract_links(text),
            force: false,
        }
    }

    /// Fails every document titled "poison"
    struct PickyProvider(HashingProvider);

    impl EmbeddingProvider for PickyProvider {
        fn embed_query(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            self.0.embed_query(text)
        }

        fn embed_document(
            &self,
            chunks: &[String],
            title: &str,
        ) -> std::result::Result<DocumentEmbedding, EmbeddingError> {
            if title == "poison" {
                return Err(EmbeddingError::GenerationError("refused".to_string()));
            }
            self.0.embed_document(chunks, title)
        }

        fn dimension(&self) -> usize {
            self.0.dimension()
        }

        fn model_name(&self) -> &str {
            self.0.model_name()
        }

        fn provider_name(&self) -> &str {
            self.0.provider_name()
        }
    }

    fn spawn(session: Session) -> WorkerHandle {
        IndexWorker::spawn(session, &config(), Arc::new(HashingProvider::new(32))).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_query() {
        let worker = spawn(1);
        let outcome = worker
            .apply(Mutation::Upsert(vec![
                payload("rust.md", "ownership and borrowing in rust", 1),
                payload("go.md", "goroutines and channels", 1),
            ]))
            .await
            .unwrap();
        assert_eq!(outcome.report().unwrap().indexed, 2);

        let hits = worker.keyword_search("goroutines", 5).await.unwrap();
        assert_eq!(hits[0].path, "go.md");

        let vector = worker.embed_query("borrowing rust").await.unwrap();
        let hits = worker.vector_search(vector, 5, 0.0).await.unwrap();
        assert_eq!(hits[0].path, "rust.md");

        let listing = worker.list_documents().await.unwrap();
        assert_eq!(listing.len(), 2);
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unchanged_documents_are_skipped() {
        let worker = spawn(1);
        let doc = payload("a.md", "stable text", 7);
        worker.apply(Mutation::Upsert(vec![doc.clone()])).await.unwrap();
        let before = worker.snapshot(false).await.unwrap();

        let outcome = worker.apply(Mutation::Upsert(vec![doc.clone()])).await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.indexed, 0);

        let mut forced = doc;
        forced.force = true;
        let outcome = worker.apply(Mutation::Upsert(vec![forced])).await.unwrap();
        assert_eq!(outcome.report().unwrap().indexed, 1);
        assert!(!before.is_empty());
    }

    #[tokio::test]
    async fn test_zombie_mutations_are_dropped() {
        let worker = spawn(5);
        let outcome = worker
            .apply_stamped(4, Mutation::Upsert(vec![payload("a.md", "text", 1)]))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MutationOutcome::Zombie {
                stamped: 4,
                current: 5
            }
        );
        assert_eq!(worker.stats().await.unwrap().index.documents, 0);
    }

    #[tokio::test]
    async fn test_one_failing_document_does_not_abort_batch() {
        let provider = Arc::new(PickyProvider(HashingProvider::new(32)));
        let worker = IndexWorker::spawn(1, &config(), provider).unwrap();

        let outcome = worker
            .apply(Mutation::Upsert(vec![
                payload("one.md", "first", 1),
                payload("poison.md", "bad", 1),
                payload("two.md", "second", 1),
            ]))
            .await
            .unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_mutations_apply_in_order() {
        let worker = spawn(1);
        let first = worker
            .submit(1, Mutation::Upsert(vec![payload("a.md", "alpha", 1)]))
            .await
            .unwrap();
        let second = worker
            .submit(1, Mutation::Delete(vec!["a.md".to_string()]))
            .await
            .unwrap();

        assert_eq!(first.await.unwrap().report().unwrap().indexed, 1);
        assert_eq!(second.await.unwrap().report().unwrap().removed, 1);
        assert!(worker.list_documents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_round_trip_and_shutdown() {
        let worker = spawn(1);
        worker
            .apply(Mutation::Upsert(vec![payload("a.md", "alpha beta", 1)]))
            .await
            .unwrap();
        let bytes = worker.snapshot(true).await.unwrap();
        worker.shutdown().await.unwrap();
        assert!(!worker.is_running());
        assert!(matches!(
            worker.apply(Mutation::Barrier).await,
            Err(WeftError::WorkerStopped)
        ));

        let fresh = spawn(2);
        let outcome = fresh.apply(Mutation::Restore(bytes)).await.unwrap();
        assert_eq!(
            outcome,
            MutationOutcome::Loaded(LoadOutcome::Loaded {
                documents: 1,
                slim: true
            })
        );
        let outcome = fresh
            .apply(Mutation::RestoreContent(vec![(
                "a.md".to_string(),
                "changed entirely".to_string(),
            )]))
            .await
            .unwrap();
        assert_eq!(outcome.report().unwrap().drifted, vec!["a.md".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_rejects_dimension_mismatch() {
        let result = IndexWorker::spawn(1, &config(), Arc::new(HashingProvider::new(16)));
        assert!(result.is_err());
    }
}
