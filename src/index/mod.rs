//! Dual vector + keyword index over document chunks
//!
//! [`DocumentIndex`] keeps per-document and per-chunk records next to the
//! two search structures. Results are "hollow": they carry the chunk's
//! offsets and anchor hash but no text, which is read back from the live
//! document at hydration time.

mod keyword_index;
mod vector_index;

pub use keyword_index::{Bm25Hit, KeywordIndex, KeywordIndexError};
pub use vector_index::{SearchResult, VectorIndex, VectorIndexError};

use crate::config::{IndexingConfig, ScoringConfig};
use crate::embedding::{anchor_hash, TextChunk};
use crate::retrieval::scoring::{self, KeywordMatch};
use crate::source::DocumentStat;
use crate::storage::snapshot::{self, SnapshotError};
use ahash::{HashMap, HashMapExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Vector index error: {0}")]
    Vector(#[from] VectorIndexError),

    #[error("Keyword index error: {0}")]
    Keyword(#[from] KeywordIndexError),

    #[error("Dimension mismatch: index holds {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{path}: {chunks} chunks but {vectors} vectors")]
    ChunkCountMismatch {
        path: String,
        chunks: usize,
        vectors: usize,
    },

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Position of a chunk inside its document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: u64,
    pub start: usize,
    pub end: usize,
    pub anchor: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: u64,
    pub path: String,
    pub start: usize,
    pub end: usize,
    pub anchor: u64,
    /// Chunk text; `None` after loading a slim snapshot until restored
    pub text: Option<String>,
}

impl ChunkRecord {
    pub fn chunk_ref(&self) -> ChunkRef {
        ChunkRef {
            chunk_id: self.id,
            start: self.start,
            end: self.end,
            anchor: self.anchor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub path: String,
    pub title: String,
    pub stat: DocumentStat,
    pub chunk_ids: Vec<u64>,
    pub token_count: usize,
}

/// A chunk with its embedding, ready to be indexed
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: TextChunk,
    pub vector: Vec<f32>,
}

/// Search hit without text
#[derive(Debug, Clone)]
pub struct HollowHit {
    pub path: String,
    pub chunk: ChunkRef,
    pub score: f32,
    /// Set for keyword-engine hits
    pub keyword: Option<KeywordMatch>,
}

/// Result of loading a serialized index
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded { documents: usize, slim: bool },
    /// Vectors of another dimension; the caller must rebuild
    Incompatible { expected: usize, found: usize },
    /// Written with other chunking parameters; vectors no longer line up
    /// with fresh chunks
    Outdated(String),
    Corrupt(String),
}

impl LoadOutcome {
    pub fn from_error(error: SnapshotError) -> Self {
        match error {
            SnapshotError::DimensionMismatch { expected, found } => {
                LoadOutcome::Incompatible { expected, found }
            }
            other => LoadOutcome::Corrupt(other.to_string()),
        }
    }
}

/// Outcome of re-attaching text to a slim-loaded document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreResult {
    Restored,
    /// Live text no longer matches the recorded anchors
    Drifted,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub record: ChunkRecord,
    pub vector: Vec<f32>,
}

/// Serializable form of a [`DocumentIndex`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub documents: Vec<DocumentRecord>,
    pub chunks: Vec<StoredChunk>,
    pub next_chunk_id: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
    pub keyword_chunks: u64,
    pub chunks_missing_text: usize,
    pub approximate_search: bool,
}

pub struct DocumentIndex {
    dimension: usize,
    config: IndexingConfig,
    vectors: VectorIndex,
    keywords: KeywordIndex,
    documents: HashMap<String, DocumentRecord>,
    chunks: HashMap<u64, ChunkRecord>,
    next_chunk_id: u64,
}

impl DocumentIndex {
    pub fn new(dimension: usize, config: &IndexingConfig) -> Result<Self, IndexError> {
        Ok(Self {
            dimension,
            config: config.clone(),
            vectors: VectorIndex::new(dimension, config),
            keywords: KeywordIndex::new(config.keyword_writer_memory)?,
            documents: HashMap::new(),
            chunks: HashMap::new(),
            next_chunk_id: 1,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// True when the document is indexed with exactly these stats
    pub fn is_unchanged(&self, path: &str, stat: &DocumentStat) -> bool {
        self.documents
            .get(path)
            .is_some_and(|doc| &doc.stat == stat)
    }

    /// Replace a document's chunks. Vectors are validated before anything
    /// is touched, so a rejected document leaves the index as it was.
    /// Keyword changes become visible on the next [`commit`](Self::commit).
    pub fn upsert_document(
        &mut self,
        path: &str,
        title: &str,
        stat: DocumentStat,
        chunks: Vec<IndexedChunk>,
        token_count: usize,
    ) -> Result<(), IndexError> {
        for chunk in &chunks {
            if chunk.vector.len() != self.dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dimension,
                    actual: chunk.vector.len(),
                });
            }
        }

        self.remove_document(path);

        let mut chunk_ids = Vec::with_capacity(chunks.len());
        for IndexedChunk { chunk, vector } in chunks {
            let id = self.next_chunk_id;
            self.next_chunk_id += 1;

            if let Err(e) = self.vectors.insert(id, &vector) {
                self.discard_partial(path, &chunk_ids);
                return Err(e.into());
            }
            if let Err(e) = self.keywords.insert(id, path, title, &chunk.text) {
                chunk_ids.push(id);
                self.discard_partial(path, &chunk_ids);
                return Err(e.into());
            }
            self.chunks.insert(
                id,
                ChunkRecord {
                    id,
                    path: path.to_string(),
                    start: chunk.start,
                    end: chunk.end,
                    anchor: chunk.anchor,
                    text: Some(chunk.text),
                },
            );
            chunk_ids.push(id);
        }

        self.documents.insert(
            path.to_string(),
            DocumentRecord {
                path: path.to_string(),
                title: title.to_string(),
                stat,
                chunk_ids,
                token_count,
            },
        );
        Ok(())
    }

    /// Undo the chunks a failed upsert already added
    fn discard_partial(&mut self, path: &str, ids: &[u64]) {
        for id in ids {
            self.vectors.remove(*id);
            self.chunks.remove(id);
        }
        self.keywords.delete_path(path);
    }

    /// Remove a document and its chunks. Returns false when unknown.
    pub fn remove_document(&mut self, path: &str) -> bool {
        let Some(doc) = self.documents.remove(path) else {
            return false;
        };
        for id in &doc.chunk_ids {
            self.vectors.remove(*id);
            self.chunks.remove(id);
        }
        self.keywords.delete_path(path);
        true
    }

    /// Move a document to a new path, keeping its vectors
    pub fn rename_document(&mut self, from: &str, to: &str) -> Result<bool, IndexError> {
        let Some(mut doc) = self.documents.remove(from) else {
            return Ok(false);
        };
        self.remove_document(to);
        self.keywords.delete_path(from);

        doc.path = to.to_string();
        for id in &doc.chunk_ids {
            if let Some(chunk) = self.chunks.get_mut(id) {
                chunk.path = to.to_string();
                if let Some(text) = &chunk.text {
                    self.keywords.insert(*id, to, &doc.title, text)?;
                }
            }
        }
        self.documents.insert(to.to_string(), doc);
        Ok(true)
    }

    /// Re-attach live text to a document loaded from a slim snapshot. Every
    /// chunk's anchor must still match; otherwise nothing changes.
    pub fn restore_content(&mut self, path: &str, text: &str) -> Result<RestoreResult, IndexError> {
        let Some(doc) = self.documents.get(path) else {
            return Ok(RestoreResult::Unknown);
        };

        let mut restored = Vec::with_capacity(doc.chunk_ids.len());
        for id in &doc.chunk_ids {
            let Some(chunk) = self.chunks.get(id) else {
                return Ok(RestoreResult::Drifted);
            };
            match text.get(chunk.start..chunk.end) {
                Some(span) if anchor_hash(span) == chunk.anchor => {
                    restored.push((*id, span.to_string()))
                }
                _ => return Ok(RestoreResult::Drifted),
            }
        }

        let title = doc.title.clone();
        self.keywords.delete_path(path);
        for (id, span) in restored {
            self.keywords.insert(id, path, &title, &span)?;
            if let Some(chunk) = self.chunks.get_mut(&id) {
                chunk.text = Some(span);
            }
        }
        Ok(RestoreResult::Restored)
    }

    /// True when any chunk of the document lacks text
    pub fn needs_content(&self, path: &str) -> bool {
        self.documents.get(path).is_some_and(|doc| {
            doc.chunk_ids
                .iter()
                .any(|id| self.chunks.get(id).is_some_and(|c| c.text.is_none()))
        })
    }

    /// Publish staged keyword changes
    pub fn commit(&mut self) -> Result<(), IndexError> {
        self.keywords.commit()?;
        Ok(())
    }

    pub fn document(&self, path: &str) -> Option<&DocumentRecord> {
        self.documents.get(path)
    }

    pub fn chunk(&self, id: u64) -> Option<&ChunkRecord> {
        self.chunks.get(&id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentRecord> {
        self.documents.values()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Best chunk per document by vector similarity
    pub fn vector_search(
        &self,
        query: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<HollowHit>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let raw = self.vectors.search(query, (limit * 4).max(16), min_score)?;
        let mut best: HashMap<&str, HollowHit> = HashMap::new();
        for result in raw {
            let Some(chunk) = self.chunks.get(&result.id) else {
                continue;
            };
            let entry = best.entry(chunk.path.as_str()).or_insert_with(|| HollowHit {
                path: chunk.path.clone(),
                chunk: chunk.chunk_ref(),
                score: result.score,
                keyword: None,
            });
            if result.score > entry.score {
                entry.chunk = chunk.chunk_ref();
                entry.score = result.score;
            }
        }

        Ok(finish(best.into_values().collect(), limit))
    }

    /// Documents matched by the keyword engine, scored by the title / exact
    /// phrase / fuzzy token strategies
    pub fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        scoring_config: &ScoringConfig,
    ) -> Result<Vec<HollowHit>, IndexError> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let raw = self.keywords.search(query, (limit * 4).max(16))?;
        let mut best: HashMap<&str, HollowHit> = HashMap::new();

        for result in raw {
            let Some(chunk) = self.chunks.get(&result.chunk_id) else {
                continue;
            };
            let Some(doc) = self.documents.get(&chunk.path) else {
                continue;
            };

            let matched = match &chunk.text {
                Some(text) => scoring::keyword_score(query, &doc.title, text, scoring_config),
                None => scoring::keyword_score(query, &doc.title, "", scoring_config)
                    .or_else(|| Some(KeywordMatch::from_bm25(result.bm25, scoring_config))),
            };
            let Some(matched) = matched else {
                continue;
            };

            let entry = best.entry(chunk.path.as_str()).or_insert_with(|| HollowHit {
                path: chunk.path.clone(),
                chunk: chunk.chunk_ref(),
                score: matched.score,
                keyword: Some(matched.clone()),
            });
            if matched.score > entry.score {
                entry.chunk = chunk.chunk_ref();
                entry.score = matched.score;
                entry.keyword = Some(matched);
            }
        }

        // Exact titles always qualify, even if BM25 ranked them out
        for doc in self.documents.values() {
            if best.contains_key(doc.path.as_str()) {
                continue;
            }
            let Some(first) = doc.chunk_ids.first().and_then(|id| self.chunks.get(id)) else {
                continue;
            };
            if let Some(matched) = scoring::title_exact(query, &doc.title, scoring_config) {
                best.insert(
                    doc.path.as_str(),
                    HollowHit {
                        path: doc.path.clone(),
                        chunk: first.chunk_ref(),
                        score: matched.score,
                        keyword: Some(matched),
                    },
                );
            }
        }

        Ok(finish(best.into_values().collect(), limit))
    }

    pub fn clear(&mut self) -> Result<(), IndexError> {
        self.vectors.clear();
        self.keywords.clear()?;
        self.documents.clear();
        self.chunks.clear();
        Ok(())
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            documents: self.documents.len(),
            chunks: self.chunks.len(),
            keyword_chunks: self.keywords.len(),
            chunks_missing_text: self.chunks.values().filter(|c| c.text.is_none()).count(),
            approximate_search: self.vectors.uses_ann(),
        }
    }

    /// Snapshot of the index. A slim snapshot drops chunk text.
    pub fn to_snapshot(&self, slim: bool) -> IndexSnapshot {
        let mut documents: Vec<DocumentRecord> = self.documents.values().cloned().collect();
        documents.sort_by(|a, b| a.path.cmp(&b.path));

        let mut chunks: Vec<StoredChunk> = self
            .chunks
            .values()
            .filter_map(|record| {
                let vector = self.vectors.get(record.id)?.to_vec();
                let mut record = record.clone();
                if slim {
                    record.text = None;
                }
                Some(StoredChunk { record, vector })
            })
            .collect();
        chunks.sort_by_key(|c| c.record.id);

        IndexSnapshot {
            documents,
            chunks,
            next_chunk_id: self.next_chunk_id,
        }
    }

    /// Rebuild an index from a snapshot. Chunks without text are searchable
    /// by vector only until their content is restored.
    pub fn from_snapshot(
        snapshot: IndexSnapshot,
        dimension: usize,
        config: &IndexingConfig,
    ) -> Result<Self, IndexError> {
        let mut index = Self::new(dimension, config)?;

        let titles: HashMap<String, String> = snapshot
            .documents
            .iter()
            .map(|d| (d.path.clone(), d.title.clone()))
            .collect();

        for StoredChunk { record, vector } in snapshot.chunks {
            index.vectors.insert(record.id, &vector)?;
            if let Some(text) = &record.text {
                let title = titles.get(&record.path).map(String::as_str).unwrap_or("");
                index.keywords.insert(record.id, &record.path, title, text)?;
            }
            index.chunks.insert(record.id, record);
        }
        for doc in snapshot.documents {
            index.documents.insert(doc.path.clone(), doc);
        }

        let max_id = index.chunks.keys().copied().max().unwrap_or(0);
        index.next_chunk_id = snapshot.next_chunk_id.max(max_id + 1);
        index.keywords.commit()?;
        Ok(index)
    }

    /// Serialize the index on its own
    pub fn save(&self, slim: bool, compression_level: i32) -> Result<Vec<u8>, IndexError> {
        let bytes = snapshot::encode(
            &self.to_snapshot(slim),
            self.dimension,
            slim,
            compression_level,
        )?;
        Ok(bytes)
    }

    /// Replace this index with a serialized one. On any failure the current
    /// state is left untouched.
    pub fn load(&mut self, bytes: &[u8]) -> LoadOutcome {
        let (header, payload) = match snapshot::decode::<IndexSnapshot>(bytes, self.dimension) {
            Ok(decoded) => decoded,
            Err(e) => return LoadOutcome::from_error(e),
        };

        match Self::from_snapshot(payload, self.dimension, &self.config) {
            Ok(index) => {
                *self = index;
                LoadOutcome::Loaded {
                    documents: self.documents.len(),
                    slim: header.slim,
                }
            }
            Err(e) => LoadOutcome::Corrupt(e.to_string()),
        }
    }
}

fn finish(mut hits: Vec<HollowHit>, limit: usize) -> Vec<HollowHit> {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    hits.truncate(limit);
    hits
}
