//! Merging vector and keyword seeds

use crate::config::ScoringConfig;
use crate::index::{ChunkRef, HollowHit};
use crate::retrieval::scoring::{hybrid_score, KeywordMatch, MatchStrategy};
use ahash::{HashMap, HashMapExt};

/// A document found by at least one seed engine
#[derive(Debug, Clone)]
pub struct SeedCandidate {
    pub path: String,
    pub chunk: ChunkRef,
    pub vector: Option<f32>,
    pub keyword: Option<KeywordMatch>,
    /// Hybrid score
    pub score: f32,
}

/// Merge both engines' hits per document with the hybrid boost rule.
///
/// The vector engine's chunk is kept unless the keyword engine found the
/// query verbatim in a chunk, which then makes a better excerpt.
pub fn hybrid_merge(
    vector_hits: Vec<HollowHit>,
    keyword_hits: Vec<HollowHit>,
    config: &ScoringConfig,
) -> Vec<SeedCandidate> {
    let mut merged: HashMap<String, SeedCandidate> = HashMap::new();

    for hit in vector_hits {
        let entry = merged.entry(hit.path.clone()).or_insert(SeedCandidate {
            path: hit.path,
            chunk: hit.chunk,
            vector: None,
            keyword: None,
            score: 0.0,
        });
        if entry.vector.map_or(true, |v| hit.score > v) {
            entry.vector = Some(hit.score);
            entry.chunk = hit.chunk;
        }
    }

    for hit in keyword_hits {
        let Some(matched) = hit.keyword else {
            continue;
        };
        match merged.get_mut(&hit.path) {
            Some(entry) => {
                if entry.keyword.as_ref().map_or(true, |k| matched.score > k.score) {
                    if matched.strategy == MatchStrategy::BodyExact {
                        entry.chunk = hit.chunk;
                    }
                    entry.keyword = Some(matched);
                }
            }
            None => {
                merged.insert(
                    hit.path.clone(),
                    SeedCandidate {
                        path: hit.path,
                        chunk: hit.chunk,
                        vector: None,
                        keyword: Some(matched),
                        score: 0.0,
                    },
                );
            }
        }
    }

    let mut seeds: Vec<SeedCandidate> = merged
        .into_values()
        .map(|mut seed| {
            seed.score = hybrid_score(seed.vector, seed.keyword.as_ref(), config);
            seed
        })
        .collect();
    seeds.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    seeds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u64) -> ChunkRef {
        ChunkRef {
            chunk_id: id,
            start: 0,
            end: 10,
            anchor: id,
        }
    }

    fn vector_hit(path: &str, id: u64, score: f32) -> HollowHit {
        HollowHit {
            path: path.to_string(),
            chunk: chunk(id),
            score,
            keyword: None,
        }
    }

    fn keyword_hit(path: &str, id: u64, strategy: MatchStrategy, title: bool) -> HollowHit {
        let score = match strategy {
            MatchStrategy::TitleExact => 1.0,
            MatchStrategy::BodyExact => 0.7,
            _ => 0.4,
        };
        HollowHit {
            path: path.to_string(),
            chunk: chunk(id),
            score,
            keyword: Some(KeywordMatch {
                strategy,
                score,
                title_match: title,
            }),
        }
    }

    #[test]
    fn test_double_match_outranks_single_signals() {
        let config = ScoringConfig::default();
        let seeds = hybrid_merge(
            vec![vector_hit("similar.md", 1, 0.8), vector_hit("alpha.md", 2, 0.6)],
            vec![keyword_hit("alpha.md", 3, MatchStrategy::TitleExact, true)],
            &config,
        );

        assert_eq!(seeds[0].path, "alpha.md");
        assert!(seeds[0].score > seeds[1].score);
        assert_eq!(seeds[0].vector, Some(0.6));
        // title match keeps the vector chunk
        assert_eq!(seeds[0].chunk.chunk_id, 2);
    }

    #[test]
    fn test_body_exact_match_moves_excerpt_chunk() {
        let config = ScoringConfig::default();
        let seeds = hybrid_merge(
            vec![vector_hit("a.md", 1, 0.5)],
            vec![keyword_hit("a.md", 9, MatchStrategy::BodyExact, false)],
            &config,
        );
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].chunk.chunk_id, 9);
    }

    #[test]
    fn test_keyword_only_seed_uses_keyword_score() {
        let config = ScoringConfig::default();
        let seeds = hybrid_merge(
            Vec::new(),
            vec![keyword_hit("k.md", 1, MatchStrategy::Fuzzy, false)],
            &config,
        );
        assert_eq!(seeds[0].vector, None);
        assert!((seeds[0].score - 0.4).abs() < 1e-6);
    }
}
