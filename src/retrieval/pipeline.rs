//! Three-stage search: Seeding -> Expanding -> Scoring
//!
//! The pipeline owns no index state. Every lookup is a query message to the
//! worker, so a search can run while a mutation batch is being applied.

use crate::config::{Config, GraphConfig, ScoringConfig};
use crate::error::Result;
use crate::graph::{Direction, NeighborMode, NeighborQuery};
use crate::index::ChunkRef;
use crate::retrieval::fusion::{hybrid_merge, SeedCandidate};
use crate::retrieval::scoring::gars;
use crate::retrieval::{HitOrigin, SearchHit};
use crate::worker::WorkerHandle;
use ahash::{HashMap, HashMapExt};
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Seeding,
    Expanding,
    Scoring,
    Done,
}

/// Stages visited and candidate counts of one run
#[derive(Debug, Clone, Default)]
pub struct PipelineTrace {
    pub stages: Vec<Stage>,
    pub seeds: usize,
    pub discovered: usize,
    pub scored: usize,
}

impl PipelineTrace {
    fn enter(&mut self, stage: Stage) {
        self.stages.push(stage);
    }
}

struct Candidate {
    similarity: f32,
    activation: f32,
    origin: HitOrigin,
    chunk: Option<ChunkRef>,
    keyword_match: bool,
    title_match: bool,
}

impl Candidate {
    fn from_seed(seed: &SeedCandidate) -> Self {
        Self {
            similarity: seed.score,
            activation: 0.0,
            origin: HitOrigin::Seed,
            chunk: Some(seed.chunk),
            keyword_match: seed.keyword.is_some(),
            title_match: seed.keyword.as_ref().is_some_and(|k| k.title_match),
        }
    }

    fn discovered(activation: f32) -> Self {
        Self {
            similarity: 0.0,
            activation,
            origin: HitOrigin::Graph,
            chunk: None,
            keyword_match: false,
            title_match: false,
        }
    }
}

pub struct SearchPipeline {
    worker: WorkerHandle,
    scoring: ScoringConfig,
    graph: GraphConfig,
}

impl SearchPipeline {
    pub fn new(worker: WorkerHandle, config: &Config) -> Self {
        Self {
            worker,
            scoring: config.scoring.clone(),
            graph: config.graph.clone(),
        }
    }

    pub async fn run(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        Ok(self.run_traced(query, limit).await?.0)
    }

    pub async fn run_traced(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<(Vec<SearchHit>, PipelineTrace)> {
        let mut trace = PipelineTrace::default();
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            trace.enter(Stage::Done);
            return Ok((Vec::new(), trace));
        }

        trace.enter(Stage::Seeding);
        let seeds = self.seed(query, limit * 2).await?;
        trace.seeds = seeds.len();
        if seeds.is_empty() {
            trace.enter(Stage::Done);
            return Ok((Vec::new(), trace));
        }

        trace.enter(Stage::Expanding);
        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        for seed in &seeds {
            candidates.insert(seed.path.clone(), Candidate::from_seed(seed));
        }
        trace.discovered = self.expand(&seeds, &mut candidates).await;

        trace.enter(Stage::Scoring);
        let hits = self.score(candidates, limit).await?;
        trace.scored = hits.len();
        trace.enter(Stage::Done);

        debug!(
            "Search '{}': {} seeds, {} discovered, {} returned",
            query, trace.seeds, trace.discovered, trace.scored
        );
        Ok((hits, trace))
    }

    /// Vector and keyword search run concurrently over a pool of `pool`
    async fn seed(&self, query: &str, pool: usize) -> Result<Vec<SeedCandidate>> {
        let recall_floor = self.scoring.recall_floor;
        let (vector_hits, keyword_hits) = tokio::join!(
            async {
                let vector = self.worker.embed_query(query).await?;
                self.worker.vector_search(vector, pool, recall_floor).await
            },
            self.worker.keyword_search(query, pool),
        );

        let mut seeds = hybrid_merge(vector_hits?, keyword_hits?, &self.scoring);
        seeds.truncate(pool);
        Ok(seeds)
    }

    /// Expand the top seeds through the graph. Activation from several
    /// parents takes the maximum. Returns the number of new candidates.
    async fn expand(
        &self,
        seeds: &[SeedCandidate],
        candidates: &mut HashMap<String, Candidate>,
    ) -> usize {
        let query = NeighborQuery {
            direction: Direction::Both,
            mode: NeighborMode::Ontology,
            decay: Some(self.graph.decay),
        };

        let mut lookups = JoinSet::new();
        for seed in seeds.iter().take(self.graph.expansion_seeds) {
            let worker = self.worker.clone();
            let path = seed.path.clone();
            let parent_score = seed.score;
            lookups.spawn(async move {
                let neighbors = worker.neighbors(&path, query).await;
                (path, parent_score, neighbors)
            });
        }

        let mut discovered = 0;
        while let Some(joined) = lookups.join_next().await {
            let (path, parent_score, neighbors) = match joined {
                Ok((path, score, Ok(neighbors))) => (path, score, neighbors),
                Ok((path, _, Err(e))) => {
                    warn!("Graph expansion of {} failed: {}", path, e);
                    continue;
                }
                Err(e) => {
                    warn!("Graph expansion task failed: {}", e);
                    continue;
                }
            };

            for neighbor in neighbors {
                let activation = parent_score * neighbor.score;
                match candidates.get_mut(&neighbor.path) {
                    Some(existing) if existing.origin == HitOrigin::Graph => {
                        existing.activation = existing.activation.max(activation);
                    }
                    Some(_) => {}
                    None => {
                        debug!(
                            "{} discovered through {} (activation {:.3})",
                            neighbor.path, path, activation
                        );
                        candidates.insert(neighbor.path, Candidate::discovered(activation));
                        discovered += 1;
                    }
                }
            }
        }
        discovered
    }

    /// GARS over every candidate, best first, truncated to `limit`
    async fn score(
        &self,
        candidates: HashMap<String, Candidate>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let paths: Vec<String> = candidates.keys().cloned().collect();
        let centralities = self.worker.centralities(paths.clone()).await?;

        let mut candidates = candidates;
        let mut hits: Vec<SearchHit> = paths
            .into_iter()
            .zip(centralities)
            .filter_map(|(path, centrality)| {
                let c = candidates.remove(&path)?;
                Some(SearchHit {
                    score: gars(c.similarity, centrality, c.activation, &self.scoring),
                    path,
                    similarity: c.similarity,
                    centrality,
                    activation: c.activation,
                    origin: c.origin,
                    keyword_match: c.keyword_match,
                    title_match: c.title_match,
                    chunk: c.chunk,
                    excerpt: None,
                    title: None,
                    token_count: None,
                    reasoning: None,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
        hits.truncate(limit);

        let summaries = self
            .worker
            .summaries(hits.iter().map(|h| h.path.clone()).collect())
            .await?;
        let mut by_path: HashMap<String, (String, usize)> = HashMap::new();
        for summary in summaries {
            by_path.insert(summary.path, (summary.title, summary.token_count));
        }
        for hit in &mut hits {
            if let Some((title, tokens)) = by_path.remove(&hit.path) {
                hit.title = Some(title);
                hit.token_count = Some(tokens);
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use crate::source::{markdown, DocumentStat};
    use crate::worker::{DocumentPayload, IndexWorker, Mutation};
    use std::sync::Arc;

    fn config() -> Config {
        let mut config = Config::default();
        config.embedding.provider = "hashing".to_string();
        config.embedding.dimension = 128;
        config
    }

    fn doc(path: &str, text: &str) -> DocumentPayload {
        DocumentPayload {
            path: path.to_string(),
            title: markdown::document_title(path, text),
            text: text.to_string(),
            stat: DocumentStat {
                size: text.len() as u64,
                mtime: 1,
            },
            links: markdown::extract_links(text),
            force: false,
        }
    }

    async fn pipeline(docs: Vec<DocumentPayload>) -> SearchPipeline {
        pipeline_with(config(), docs).await
    }

    async fn pipeline_with(config: Config, docs: Vec<DocumentPayload>) -> SearchPipeline {
        let worker =
            IndexWorker::spawn(1, &config, Arc::new(HashingProvider::new(128))).unwrap();
        worker.apply(Mutation::Upsert(docs)).await.unwrap();
        SearchPipeline::new(worker, &config)
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let pipeline = pipeline(vec![doc("a.md", "anything")]).await;
        let (hits, trace) = pipeline.run_traced("   ", 5).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(trace.stages, vec![Stage::Done]);
    }

    #[tokio::test]
    async fn test_no_seeds_skips_expansion() {
        // A floor no unrelated hashed vector can reach
        let mut config = config();
        config.scoring.recall_floor = 0.99;
        let pipeline = pipeline_with(config, vec![doc("a.md", "apples and pears")]).await;
        let (hits, trace) = pipeline.run_traced("zeppelin", 5).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(trace.stages, vec![Stage::Seeding, Stage::Done]);
    }

    #[tokio::test]
    async fn test_stages_and_graph_discovery() {
        // Floor above any single-bucket hash collision so sqlite.md is not a seed
        let mut config = config();
        config.scoring.recall_floor = 0.4;
        let pipeline = pipeline_with(config, vec![
            doc("Topics/Databases.md", "# Databases\nA topic note."),
            doc(
                "postgres.md",
                "---\ntopic: \"[[Databases]]\"\n---\nPostgres vacuum tuning notes",
            ),
            doc(
                "sqlite.md",
                "---\ntopic: \"[[Databases]]\"\n---\nEmbedded storage engine",
            ),
        ])
        .await;

        let (hits, trace) = pipeline.run_traced("vacuum tuning", 10).await.unwrap();
        assert_eq!(
            trace.stages,
            vec![Stage::Seeding, Stage::Expanding, Stage::Scoring, Stage::Done]
        );
        assert_eq!(hits[0].path, "postgres.md");
        assert_eq!(hits[0].origin, HitOrigin::Seed);
        assert_eq!(hits[0].activation, 0.0);

        let sibling = hits.iter().find(|h| h.path == "sqlite.md").unwrap();
        assert_eq!(sibling.origin, HitOrigin::Graph);
        assert_eq!(sibling.similarity, 0.0);
        assert!(sibling.activation > 0.0);
        assert!(sibling.chunk.is_none());
        assert!(hits.iter().any(|h| h.path == "Topics/Databases.md"));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(hits[0].title.is_some());
    }
}
