//! Pure scoring functions
//!
//! Nothing here touches an index; every function maps numbers (or strings)
//! to a score so the ranking model can be tested in isolation.

use crate::analysis;
use crate::config::ScoringConfig;
use ahash::HashSet;
use serde::Serialize;

/// Which keyword strategy produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchStrategy {
    /// Document title equals the query
    TitleExact,
    /// Query occurs verbatim in the chunk body
    BodyExact,
    /// Enough query tokens occur in title or body
    Fuzzy,
    /// Only the engine's BM25 score was available (chunk text not loaded)
    Bm25,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordMatch {
    pub strategy: MatchStrategy,
    pub score: f32,
    /// Every query token appears in the title
    pub title_match: bool,
}

impl KeywordMatch {
    /// Squash an unbounded BM25 score into the fuzzy range
    pub fn from_bm25(bm25: f32, config: &ScoringConfig) -> Self {
        let bm25 = bm25.max(0.0);
        Self {
            strategy: MatchStrategy::Bm25,
            score: config.fuzzy_max_score * bm25 / (bm25 + 1.0),
            title_match: false,
        }
    }
}

/// Exact (case-insensitive, trimmed) title match
pub fn title_exact(query: &str, title: &str, config: &ScoringConfig) -> Option<KeywordMatch> {
    let query = query.trim();
    if !query.is_empty() && title.trim().to_lowercase() == query.to_lowercase() {
        Some(KeywordMatch {
            strategy: MatchStrategy::TitleExact,
            score: config.title_exact_score,
            title_match: true,
        })
    } else {
        None
    }
}

/// Score a document against a keyword query, trying exact title, then
/// exact body phrase, then token overlap. Token overlap must reach a
/// minimum hit ratio, which is stricter for short queries.
pub fn keyword_score(
    query: &str,
    title: &str,
    body: &str,
    config: &ScoringConfig,
) -> Option<KeywordMatch> {
    let query = query.trim();
    if query.is_empty() {
        return None;
    }

    if let Some(matched) = title_exact(query, title, config) {
        return Some(matched);
    }

    let query_tokens: Vec<String> = {
        let mut seen = HashSet::default();
        analysis::tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect()
    };
    let title_tokens: HashSet<String> = analysis::tokenize(title).into_iter().collect();
    let title_match =
        !query_tokens.is_empty() && query_tokens.iter().all(|t| title_tokens.contains(t));

    if analysis::find_case_insensitive(body, query).is_some() {
        return Some(KeywordMatch {
            strategy: MatchStrategy::BodyExact,
            score: config.body_exact_score,
            title_match,
        });
    }

    if query_tokens.is_empty() {
        return None;
    }

    let mut doc_tokens = title_tokens;
    doc_tokens.extend(analysis::tokenize(body));
    let hits = query_tokens.iter().filter(|t| doc_tokens.contains(*t)).count();
    let ratio = hits as f32 / query_tokens.len() as f32;

    let min_ratio = if query_tokens.len() < config.short_query_tokens {
        config.short_query_min_ratio
    } else {
        config.long_query_min_ratio
    };
    if hits == 0 || ratio < min_ratio {
        return None;
    }

    Some(KeywordMatch {
        strategy: MatchStrategy::Fuzzy,
        score: config.fuzzy_max_score * ratio,
        title_match,
    })
}

/// Merge the two seed engines' opinions of one document.
///
/// A document both engines found gets its vector score lifted by a fixed
/// boost, plus a further boost when the keyword hit was on the title, so an
/// exact title match outranks documents that are only semantically close.
pub fn hybrid_score(
    vector: Option<f32>,
    keyword: Option<&KeywordMatch>,
    config: &ScoringConfig,
) -> f32 {
    match (vector, keyword) {
        (Some(v), Some(k)) => {
            let title = if k.title_match { config.title_boost } else { 0.0 };
            v + config.keyword_boost + title
        }
        (Some(v), None) => v,
        (None, Some(k)) => k.score,
        (None, None) => 0.0,
    }
}

/// Graph-Aware Relevance Score: a weighted sum of seed similarity, node
/// centrality and spreading activation. Non-decreasing in each input for
/// non-negative weights.
pub fn gars(similarity: f32, centrality: f32, activation: f32, config: &ScoringConfig) -> f32 {
    config.w_sim * similarity + config.w_cent * centrality + config.w_act * activation
}

/// Dampen scores reached through high-degree nodes. Degrees at or below
/// `threshold` are untouched.
pub fn hub_penalty(score: f32, degree: usize, threshold: usize) -> f32 {
    if degree > threshold && degree > 1 {
        score / (1.0 + (degree as f32).ln())
    } else {
        score
    }
}

/// Degree normalised by the largest degree in the graph
pub fn centrality(degree: usize, max_degree: usize) -> f32 {
    if max_degree == 0 {
        0.0
    } else {
        degree as f32 / max_degree as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ScoringConfig {
        ScoringConfig::default()
    }

    #[test]
    fn test_title_exact_wins() {
        let m = keyword_score("Project Alpha", "project alpha", "unrelated", &config()).unwrap();
        assert_eq!(m.strategy, MatchStrategy::TitleExact);
        assert_eq!(m.score, config().title_exact_score);
        assert!(m.title_match);
    }

    #[test]
    fn test_body_exact() {
        let m = keyword_score("borrow checker", "Rust", "the Borrow Checker says no", &config())
            .unwrap();
        assert_eq!(m.strategy, MatchStrategy::BodyExact);
        assert!(!m.title_match);
    }

    #[test]
    fn test_fuzzy_ratio_thresholds() {
        let c = config();
        // 2 of 3 tokens on a short query is below the 0.75 floor
        assert!(keyword_score("red green blue", "", "red and green", &c).is_none());
        // all tokens present, out of order
        let m = keyword_score("green red", "", "red and green", &c).unwrap();
        assert_eq!(m.strategy, MatchStrategy::Fuzzy);
        assert!((m.score - c.fuzzy_max_score).abs() < 1e-6);
        // long query: 2 of 4 clears the 0.4 floor
        let m = keyword_score("red green blue yellow", "", "red green", &c).unwrap();
        assert!((m.score - c.fuzzy_max_score * 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_fuzzy_title_match_flag() {
        let m = keyword_score("alpha plans", "Alpha Plans Q3", "nothing", &config()).unwrap();
        assert!(m.title_match);
    }

    #[test]
    fn test_empty_query() {
        assert!(keyword_score("  ", "t", "b", &config()).is_none());
    }

    #[test]
    fn test_hybrid_score() {
        let c = config();
        let title = KeywordMatch {
            strategy: MatchStrategy::TitleExact,
            score: 1.0,
            title_match: true,
        };
        let body = KeywordMatch {
            strategy: MatchStrategy::BodyExact,
            score: 0.7,
            title_match: false,
        };

        assert_eq!(hybrid_score(Some(0.5), None, &c), 0.5);
        assert_eq!(hybrid_score(Some(0.5), Some(&body), &c), 0.5 + c.keyword_boost);
        assert_eq!(
            hybrid_score(Some(0.5), Some(&title), &c),
            0.5 + c.keyword_boost + c.title_boost
        );
        assert_eq!(hybrid_score(None, Some(&body), &c), 0.7);
    }

    #[test]
    fn test_gars_weights() {
        let c = config();
        let score = gars(1.0, 0.5, 0.25, &c);
        assert!((score - (c.w_sim + 0.5 * c.w_cent + 0.25 * c.w_act)).abs() < 1e-6);
    }

    #[test]
    fn test_hub_penalty() {
        assert_eq!(hub_penalty(1.0, 2, 2), 1.0);
        let penalised = hub_penalty(1.0, 100, 2);
        assert!(penalised < 0.25);
        assert!(hub_penalty(1.0, 1000, 2) < penalised);
    }

    #[test]
    fn test_centrality() {
        assert_eq!(centrality(0, 0), 0.0);
        assert_eq!(centrality(5, 10), 0.5);
    }

    #[test]
    fn test_bm25_squash() {
        let m = KeywordMatch::from_bm25(3.0, &config());
        assert!(m.score > 0.0 && m.score < config().fuzzy_max_score);
    }
}
