//! State owned by the index worker
//!
//! [`IndexEngine`] ties the document index to the relationship graph. It
//! keeps every document's raw links so edges can be re-resolved whenever a
//! name starts or stops pointing at a document: a note linking to
//! `[[Later]]` gains its edge as soon as `Later.md` is indexed, whatever the
//! order the two arrived in.

use crate::config::{Config, EmbeddingConfig};
use crate::embedding::{chunk_text, EmbeddingProvider};
use crate::error::Result;
use crate::graph::{
    AliasMap, EdgeKind, GraphSnapshot, GraphStats, Neighbor, NeighborQuery, RelationshipGraph,
};
use crate::index::{
    DocumentIndex, HollowHit, IndexError, IndexSnapshot, IndexStats, IndexedChunk, LoadOutcome,
    RestoreResult,
};
use crate::source::markdown::{self, file_stem};
use crate::source::{DocumentStat, OutgoingLink};
use crate::storage::snapshot;
use ahash::{HashMap, HashMapExt, HashSet};
use serde::{Deserialize, Serialize};

/// A document as handed to the worker for indexing
#[derive(Debug, Clone)]
pub struct DocumentPayload {
    pub path: String,
    pub title: String,
    pub text: String,
    pub stat: DocumentStat,
    pub links: Vec<OutgoingLink>,
    /// Re-index even when the stats are unchanged
    pub force: bool,
}

/// A document after chunking and embedding, ready to apply
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub path: String,
    pub title: String,
    pub stat: DocumentStat,
    pub headers: Vec<String>,
    pub links: Vec<OutgoingLink>,
    pub chunks: Vec<IndexedChunk>,
    pub token_count: usize,
}

/// Chunk and embed a document. Blocking; runs off the async runtime.
pub fn prepare_document(
    payload: DocumentPayload,
    provider: &dyn EmbeddingProvider,
    config: &EmbeddingConfig,
) -> Result<PreparedDocument> {
    let chunks = chunk_text(&payload.text, config.chunk_size, config.chunk_overlap);
    let headers = markdown::extract_headers(&payload.text);

    let (vectors, token_count) = if chunks.is_empty() {
        (Vec::new(), 0)
    } else {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedded = provider.embed_document(&texts, &payload.title)?;
        (embedded.vectors, embedded.token_count)
    };

    if vectors.len() != chunks.len() {
        return Err(IndexError::ChunkCountMismatch {
            path: payload.path,
            chunks: chunks.len(),
            vectors: vectors.len(),
        }
        .into());
    }

    Ok(PreparedDocument {
        path: payload.path,
        title: payload.title,
        stat: payload.stat,
        headers,
        links: payload.links,
        chunks: chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexedChunk { chunk, vector })
            .collect(),
        token_count,
    })
}

/// Serialized engine state, the payload of a shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub index: IndexSnapshot,
    pub graph: GraphSnapshot,
    pub aliases: AliasMap,
    pub links: Vec<(String, Vec<OutgoingLink>)>,
    /// Unix milliseconds
    pub saved_at: i64,
}

/// Lightweight view of a document for context assembly
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub path: String,
    pub title: String,
    pub headers: Vec<String>,
    pub token_count: usize,
    pub degree: usize,
}

/// What the engine knows about a document, for rescans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentListing {
    pub stat: DocumentStat,
    /// Loaded from a slim snapshot and still missing chunk text
    pub needs_content: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub index: IndexStats,
    pub graph: GraphStats,
    pub aliases: usize,
    pub unresolved_links: usize,
}

pub struct IndexEngine {
    config: Config,
    index: DocumentIndex,
    graph: RelationshipGraph,
    aliases: AliasMap,
    /// Raw links per source document
    links: HashMap<String, Vec<OutgoingLink>>,
    /// Link key -> documents whose links use it
    referrers: HashMap<String, HashSet<String>>,
}

impl IndexEngine {
    pub fn new(config: &Config) -> std::result::Result<Self, IndexError> {
        Ok(Self {
            config: config.clone(),
            index: DocumentIndex::new(config.embedding.dimension, &config.indexing)?,
            graph: RelationshipGraph::new(&config.graph),
            aliases: AliasMap::new(),
            links: HashMap::new(),
            referrers: HashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Adopt settings that leave the embedding identity alone
    pub fn update_settings(&mut self, config: &Config) {
        self.graph.set_config(&config.graph);
        self.config = config.clone();
    }

    pub fn index(&self) -> &DocumentIndex {
        &self.index
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    pub fn is_unchanged(&self, path: &str, stat: &DocumentStat) -> bool {
        self.index.is_unchanged(path, stat)
    }

    /// Apply an embedded document. A rejected document leaves every
    /// structure untouched.
    pub fn apply(&mut self, doc: PreparedDocument) -> std::result::Result<(), IndexError> {
        let previous_title = self.index.document(&doc.path).map(|d| d.title.clone());
        self.index.upsert_document(
            &doc.path,
            &doc.title,
            doc.stat,
            doc.chunks,
            doc.token_count,
        )?;

        self.graph.upsert_node(&doc.path, &doc.title, doc.headers);
        if previous_title.is_some_and(|t| t != doc.title) {
            self.aliases.unregister(&doc.path);
        }
        self.aliases.register(&doc.path, &doc.title);

        self.set_links(&doc.path, doc.links);
        self.relink(&doc.path);
        self.relink_referrers_of(&doc.path, &doc.title);
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> bool {
        let removed = self.index.remove_document(path);
        let sources = self.graph.remove_node(path);
        self.aliases.unregister(path);
        self.set_links(path, Vec::new());
        for source in sources {
            self.relink(&source);
        }
        removed
    }

    pub fn rename(&mut self, from: &str, to: &str) -> std::result::Result<bool, IndexError> {
        if !self.index.rename_document(from, to)? {
            return Ok(false);
        }
        self.graph.rename_node(from, to);

        let title = self
            .index
            .document(to)
            .map(|d| d.title.clone())
            .unwrap_or_default();
        self.aliases.unregister(from);
        self.aliases.register(to, &title);

        let links = self.links.get(from).cloned().unwrap_or_default();
        self.set_links(from, Vec::new());
        self.set_links(to, links);
        self.relink(to);
        self.relink_referrers_of(to, &title);
        Ok(true)
    }

    pub fn restore_content(
        &mut self,
        path: &str,
        text: &str,
    ) -> std::result::Result<RestoreResult, IndexError> {
        self.index.restore_content(path, text)
    }

    pub fn reset(&mut self) -> std::result::Result<(), IndexError> {
        self.index.clear()?;
        self.graph.clear();
        self.aliases.clear();
        self.links.clear();
        self.referrers.clear();
        Ok(())
    }

    /// Drop graph nodes with no indexed document behind them
    pub fn prune_orphans(&mut self) -> usize {
        let valid: HashSet<String> = self.index.documents().map(|d| d.path.clone()).collect();
        self.graph.prune_orphans(&valid)
    }

    pub fn commit(&mut self) -> std::result::Result<(), IndexError> {
        self.index.commit()
    }

    fn set_links(&mut self, path: &str, links: Vec<OutgoingLink>) {
        if let Some(old) = self.links.remove(path) {
            for link in &old {
                for key in link_keys(&link.target) {
                    if let Some(sources) = self.referrers.get_mut(&key) {
                        sources.remove(path);
                        if sources.is_empty() {
                            self.referrers.remove(&key);
                        }
                    }
                }
            }
        }
        if links.is_empty() {
            return;
        }
        for link in &links {
            for key in link_keys(&link.target) {
                self.referrers
                    .entry(key)
                    .or_default()
                    .insert(path.to_string());
            }
        }
        self.links.insert(path.to_string(), links);
    }

    /// Resolve a document's raw links against the alias map and replace
    /// its outgoing edges
    fn relink(&mut self, source: &str) {
        if !self.graph.contains(source) {
            return;
        }
        let targets: Vec<(String, EdgeKind)> = self
            .links
            .get(source)
            .map(|links| {
                links
                    .iter()
                    .filter_map(|link| {
                        self.aliases
                            .resolve(&link.target)
                            .map(|path| (path.to_string(), link.kind))
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.graph.set_outgoing(source, targets);
    }

    /// Re-resolve every document whose links may now point at `path`
    fn relink_referrers_of(&mut self, path: &str, title: &str) {
        let mut sources: HashSet<String> = HashSet::default();
        for name in AliasMap::names_for(path, title) {
            if let Some(found) = self.referrers.get(&name) {
                sources.extend(found.iter().cloned());
            }
        }
        sources.remove(path);
        for source in sources {
            self.relink(&source);
        }
    }

    pub fn vector_search(
        &self,
        query: &[f32],
        limit: usize,
        min_score: f32,
    ) -> std::result::Result<Vec<HollowHit>, IndexError> {
        self.index.vector_search(query, limit, min_score)
    }

    pub fn keyword_search(
        &self,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<HollowHit>, IndexError> {
        self.index.keyword_search(query, limit, &self.config.scoring)
    }

    pub fn neighbors(&self, path: &str, query: NeighborQuery) -> Vec<Neighbor> {
        self.graph.neighbors(path, query)
    }

    pub fn centralities(&self, paths: &[String]) -> Vec<f32> {
        self.graph.centralities(paths)
    }

    pub fn summaries(&self, paths: &[String]) -> Vec<DocumentSummary> {
        paths
            .iter()
            .filter_map(|path| {
                let doc = self.index.document(path)?;
                let headers = self
                    .graph
                    .node(path)
                    .map(|n| n.headers.clone())
                    .unwrap_or_default();
                Some(DocumentSummary {
                    path: doc.path.clone(),
                    title: doc.title.clone(),
                    headers,
                    token_count: doc.token_count,
                    degree: self.graph.degree(path),
                })
            })
            .collect()
    }

    pub fn listing(&self) -> HashMap<String, DocumentListing> {
        self.index
            .documents()
            .map(|doc| {
                (
                    doc.path.clone(),
                    DocumentListing {
                        stat: doc.stat,
                        needs_content: self.index.needs_content(&doc.path),
                    },
                )
            })
            .collect()
    }

    pub fn stats(&self) -> EngineStats {
        let unresolved_links = self
            .links
            .values()
            .flatten()
            .filter(|link| self.aliases.resolve(&link.target).is_none())
            .count();
        EngineStats {
            index: self.index.stats(),
            graph: self.graph.stats(),
            aliases: self.aliases.len(),
            unresolved_links,
        }
    }

    pub fn to_snapshot(&self, slim: bool) -> EngineSnapshot {
        let mut links: Vec<(String, Vec<OutgoingLink>)> = self
            .links
            .iter()
            .map(|(path, links)| (path.clone(), links.clone()))
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0));

        EngineSnapshot {
            chunk_size: self.config.embedding.chunk_size,
            chunk_overlap: self.config.embedding.chunk_overlap,
            index: self.index.to_snapshot(slim),
            graph: self.graph.to_snapshot(),
            aliases: self.aliases.clone(),
            links,
            saved_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Encode the engine as shard bytes
    pub fn encode(&self, slim: bool) -> std::result::Result<Vec<u8>, IndexError> {
        let bytes = snapshot::encode(
            &self.to_snapshot(slim),
            self.index.dimension(),
            slim,
            self.config.storage.compression_level,
        )?;
        Ok(bytes)
    }

    /// Replace the engine state with decoded shard bytes. Nothing changes
    /// unless the whole shard is usable.
    pub fn restore(&mut self, bytes: &[u8]) -> LoadOutcome {
        let dimension = self.index.dimension();
        let (header, snap) = match snapshot::decode::<EngineSnapshot>(bytes, dimension) {
            Ok(decoded) => decoded,
            Err(e) => return LoadOutcome::from_error(e),
        };

        let embedding = &self.config.embedding;
        if snap.chunk_size != embedding.chunk_size || snap.chunk_overlap != embedding.chunk_overlap
        {
            return LoadOutcome::Outdated(format!(
                "chunking {}/{} in shard, {}/{} configured",
                snap.chunk_size, snap.chunk_overlap, embedding.chunk_size, embedding.chunk_overlap
            ));
        }

        let index = match DocumentIndex::from_snapshot(snap.index, dimension, &self.config.indexing)
        {
            Ok(index) => index,
            Err(e) => return LoadOutcome::Corrupt(e.to_string()),
        };

        self.index = index;
        self.graph = RelationshipGraph::from_snapshot(snap.graph, &self.config.graph);
        self.aliases = snap.aliases;
        self.links.clear();
        self.referrers.clear();
        for (path, links) in snap.links {
            self.set_links(&path, links);
        }

        LoadOutcome::Loaded {
            documents: self.index.len(),
            slim: header.slim,
        }
    }
}

/// Keys a raw link can match an alias under: the full normalised link and
/// its bare stem
fn link_keys(target: &str) -> Vec<String> {
    let key = AliasMap::key(target);
    let stem = file_stem(&key).to_string();
    if stem == key {
        vec![key]
    } else {
        vec![key, stem]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use crate::graph::NeighborMode;

    fn config() -> Config {
        let mut config = Config::default();
        config.embedding.provider = "hashing".to_string();
        config.embedding.dimension = 64;
        config
    }

    fn payload(path: &str, text: &str, mtime: i64) -> DocumentPayload {
        DocumentPayload {
            path: path.to_string(),
            title: markdown::document_title(path, text),
            text: text.to_string(),
            stat: DocumentStat {
                size: text.len() as u64,
                mtime,
            },
            links: markdown::extract_links(text),
            force: false,
        }
    }

    fn apply(engine: &mut IndexEngine, path: &str, text: &str) {
        let provider = HashingProvider::new(64);
        let prepared =
            prepare_document(payload(path, text, 1), &provider, &engine.config().embedding)
                .unwrap();
        engine.apply(prepared).unwrap();
        engine.commit().unwrap();
    }

    #[test]
    fn test_links_resolve_regardless_of_order() {
        let mut engine = IndexEngine::new(&config()).unwrap();
        apply(&mut engine, "a.md", "see [[Later]]");
        assert_eq!(engine.graph().out_degree("a.md"), 0);
        assert_eq!(engine.stats().unresolved_links, 1);

        apply(&mut engine, "notes/Later.md", "the target");
        assert_eq!(engine.graph().out_degree("a.md"), 1);
        assert_eq!(engine.graph().in_degree("notes/Later.md"), 1);
        assert_eq!(engine.stats().unresolved_links, 0);
    }

    #[test]
    fn test_remove_drops_edges_and_name() {
        let mut engine = IndexEngine::new(&config()).unwrap();
        apply(&mut engine, "t.md", "topic");
        apply(&mut engine, "a.md", "links [[t]]");
        assert_eq!(engine.graph().in_degree("t.md"), 1);

        assert!(engine.remove("t.md"));
        assert_eq!(engine.graph().out_degree("a.md"), 0);
        assert_eq!(engine.stats().unresolved_links, 1);
        assert!(!engine.remove("t.md"));

        // Re-creating the target restores the edge
        apply(&mut engine, "t.md", "topic again");
        assert_eq!(engine.graph().in_degree("t.md"), 1);
    }

    #[test]
    fn test_rename_keeps_edges() {
        let mut engine = IndexEngine::new(&config()).unwrap();
        apply(&mut engine, "a.md", "links [[b]]");
        apply(&mut engine, "b.md", "body of b");

        assert!(engine.rename("b.md", "archive/b2.md").unwrap());
        assert_eq!(engine.graph().in_degree("archive/b2.md"), 1);
        assert!(engine.index().document("b.md").is_none());
        assert!(!engine.rename("missing.md", "x.md").unwrap());
    }

    #[test]
    fn test_topic_siblings_through_engine() {
        let mut engine = IndexEngine::new(&config()).unwrap();
        apply(&mut engine, "Topics/Rust.md", "a topic");
        apply(&mut engine, "a.md", "---\ntopic: \"[[Rust]]\"\n---\nalpha");
        apply(&mut engine, "b.md", "---\ntopic: \"[[Rust]]\"\n---\nbeta");

        let neighbors = engine.neighbors(
            "a.md",
            NeighborQuery {
                mode: NeighborMode::Ontology,
                ..Default::default()
            },
        );
        assert!(neighbors.iter().any(|n| n.path == "b.md" && n.hops == 2));
    }

    #[test]
    fn test_snapshot_restore_and_chunking_guard() {
        let mut engine = IndexEngine::new(&config()).unwrap();
        apply(&mut engine, "a.md", "# Head\nsee [[b]]");
        apply(&mut engine, "b.md", "bee");
        let bytes = engine.encode(false).unwrap();

        let mut restored = IndexEngine::new(&config()).unwrap();
        assert_eq!(
            restored.restore(&bytes),
            LoadOutcome::Loaded {
                documents: 2,
                slim: false
            }
        );
        assert_eq!(restored.graph().in_degree("b.md"), 1);
        let summary = &restored.summaries(&["a.md".to_string()])[0];
        assert_eq!(summary.headers, vec!["Head".to_string()]);

        let mut other = config();
        other.embedding.chunk_size = 200;
        let mut rechunked = IndexEngine::new(&other).unwrap();
        assert!(matches!(rechunked.restore(&bytes), LoadOutcome::Outdated(_)));
        assert!(rechunked.index().is_empty());

        let mut wide = config();
        wide.embedding.dimension = 128;
        let mut incompatible = IndexEngine::new(&wide).unwrap();
        assert_eq!(
            incompatible.restore(&bytes),
            LoadOutcome::Incompatible {
                expected: 128,
                found: 64
            }
        );
    }

    #[test]
    fn test_slim_listing_needs_content() {
        let mut engine = IndexEngine::new(&config()).unwrap();
        apply(&mut engine, "a.md", "some words here");
        let slim = engine.encode(true).unwrap();

        let mut restored = IndexEngine::new(&config()).unwrap();
        restored.restore(&slim);
        assert!(restored.listing()["a.md"].needs_content);
        assert_eq!(
            restored.restore_content("a.md", "some words here").unwrap(),
            RestoreResult::Restored
        );
        assert!(!restored.listing()["a.md"].needs_content);
    }
}
