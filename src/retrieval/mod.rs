//! Hybrid retrieval
//!
//! Semantic and keyword seeds are merged with the hybrid boost, expanded
//! through the relationship graph and ranked with GARS. An optional
//! re-ranker (local cross-encoder or an LLM) can reorder the final list.

mod fusion;
mod pipeline;
mod reranker;
pub mod scoring;

pub use fusion::{hybrid_merge, SeedCandidate};
pub use pipeline::{PipelineTrace, SearchPipeline, Stage};
pub use reranker::{
    parse_verdicts, rerank_hits, CrossEncoderReranker, LlmClient, LlmReranker, RerankCandidate,
    RerankError, RerankPayload, RerankVerdict, Reranker,
};

use crate::index::ChunkRef;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Reranking failed: {0}")]
    Rerank(#[from] RerankError),
}

/// How a hit entered the candidate set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HitOrigin {
    /// Found by vector or keyword search
    Seed,
    /// Discovered only through graph expansion
    Graph,
}

/// A ranked search result
///
/// Comes out of the pipeline hollow (`excerpt` is `None`); hydration fills
/// the excerpt from the live document.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub path: String,
    /// Final GARS score (or re-rank score once re-ranked)
    pub score: f32,
    /// Seed-stage hybrid score, 0 for graph discoveries
    pub similarity: f32,
    pub centrality: f32,
    /// Spreading activation inherited from a seed, 0 for seeds
    pub activation: f32,
    pub origin: HitOrigin,
    pub keyword_match: bool,
    pub title_match: bool,
    /// Best matching chunk; `None` for graph discoveries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
    /// Re-ranker's explanation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl SearchHit {
    /// Title if known, otherwise the path
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.path)
    }
}
