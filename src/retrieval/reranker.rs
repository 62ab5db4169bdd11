//! Optional re-ranking after Scoring
//!
//! Two implementations share the [`Reranker`] trait: a local cross-encoder
//! (fastembed) and an LLM judge reached through a caller-supplied
//! [`LlmClient`]. The LLM's reply is parsed into typed verdicts and checked
//! against the candidates it was shown.

use crate::retrieval::SearchHit;
use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Reranker initialization failed: {0}")]
    InitializationError(String),

    #[error("Reranking failed: {0}")]
    RerankingError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed reranker reply: {0}")]
    InvalidResponse(String),

    #[error("Reranker scored unknown candidate '{0}'")]
    UnknownCandidate(String),
}

/// What a re-ranker sees of one hit
#[derive(Debug, Clone, Serialize)]
pub struct RerankCandidate {
    pub id: String,
    pub title: String,
    pub excerpt: String,
}

impl RerankCandidate {
    pub fn from_hit(hit: &SearchHit) -> Self {
        Self {
            id: hit.path.clone(),
            title: hit.display_title().to_string(),
            excerpt: hit.excerpt.clone().unwrap_or_default(),
        }
    }
}

/// A re-ranker's judgement of one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankVerdict {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub reasoning: String,
}

pub trait Reranker: Send + Sync {
    /// Verdicts for some or all candidates; unscored candidates keep their
    /// order behind the scored ones
    fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
    ) -> Result<Vec<RerankVerdict>, RerankError>;

    fn name(&self) -> &str;
}

/// Cross-encoder reranker running locally through fastembed
pub struct CrossEncoderReranker {
    model: TextRerank,
    model_name: String,
    batch_size: usize,
}

impl CrossEncoderReranker {
    /// Load the BGE reranker base model
    pub fn new(batch_size: usize) -> Result<Self, RerankError> {
        tracing::info!("Initializing reranker model: BAAI/bge-reranker-base");

        let init_options =
            RerankInitOptions::new(RerankerModel::BGERerankerBase).with_show_download_progress(true);
        let model = TextRerank::try_new(init_options)
            .map_err(|e| RerankError::InitializationError(e.to_string()))?;

        Ok(Self {
            model,
            model_name: "BAAI/bge-reranker-base".to_string(),
            batch_size: batch_size.max(1),
        })
    }
}

impl Reranker for CrossEncoderReranker {
    fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
    ) -> Result<Vec<RerankVerdict>, RerankError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        if query.trim().is_empty() {
            return Err(RerankError::InvalidInput(
                "Query cannot be empty".to_string(),
            ));
        }

        let documents: Vec<String> = candidates
            .iter()
            .map(|c| format!("{}\n{}", c.title, c.excerpt))
            .collect();
        let documents: Vec<&str> = documents.iter().map(String::as_str).collect();

        let results = self
            .model
            .rerank(query, documents, false, Some(self.batch_size))
            .map_err(|e| RerankError::RerankingError(e.to_string()))?;

        Ok(results
            .into_iter()
            .filter_map(|r| {
                let candidate = candidates.get(r.index)?;
                Some(RerankVerdict {
                    id: candidate.id.clone(),
                    // logits -> [0, 1]
                    score: 1.0 / (1.0 + (-r.score).exp()),
                    reasoning: String::new(),
                })
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.model_name
    }
}

/// Transport to a chat model. Retries and backoff are the client's job.
pub trait LlmClient: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, RerankError>;
}

/// Request body sent to the LLM judge
#[derive(Debug, Serialize)]
pub struct RerankPayload<'a> {
    pub instructions: &'static str,
    pub query: &'a str,
    pub candidates: &'a [RerankCandidate],
    pub response_schema: serde_json::Value,
}

const INSTRUCTIONS: &str = "Score how well each candidate answers the query, from 0 (irrelevant) \
to 1 (directly answers it). Reply with a JSON array only, one object per candidate you score, \
each with the candidate's id, a score and a one-sentence reasoning.";

impl<'a> RerankPayload<'a> {
    pub fn new(query: &'a str, candidates: &'a [RerankCandidate]) -> Self {
        Self {
            instructions: INSTRUCTIONS,
            query,
            candidates,
            response_schema: serde_json::json!({
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["id", "score"],
                    "properties": {
                        "id": { "type": "string" },
                        "score": { "type": "number", "minimum": 0, "maximum": 1 },
                        "reasoning": { "type": "string" }
                    }
                }
            }),
        }
    }

    pub fn to_prompt(&self) -> Result<String, RerankError> {
        serde_json::to_string_pretty(self).map_err(|e| RerankError::InvalidInput(e.to_string()))
    }
}

/// LLM-as-judge reranker
pub struct LlmReranker<C: LlmClient> {
    client: C,
}

impl<C: LlmClient> LlmReranker<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

impl<C: LlmClient> Reranker for LlmReranker<C> {
    fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
    ) -> Result<Vec<RerankVerdict>, RerankError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let prompt = RerankPayload::new(query, candidates).to_prompt()?;
        let reply = self.client.complete(&prompt)?;
        parse_verdicts(&reply, candidates)
    }

    fn name(&self) -> &str {
        "llm"
    }
}

/// Parse an LLM reply into verdicts. The JSON array may be wrapped in prose
/// or a code fence. Ids must name shown candidates; scores are clamped to
/// `[0, 1]`; a repeated id keeps its first verdict.
pub fn parse_verdicts(
    reply: &str,
    candidates: &[RerankCandidate],
) -> Result<Vec<RerankVerdict>, RerankError> {
    let start = reply
        .find('[')
        .ok_or_else(|| RerankError::InvalidResponse("no JSON array in reply".to_string()))?;
    let end = reply
        .rfind(']')
        .filter(|end| *end > start)
        .ok_or_else(|| RerankError::InvalidResponse("unterminated JSON array".to_string()))?;

    let parsed: Vec<RerankVerdict> = serde_json::from_str(&reply[start..=end])
        .map_err(|e| RerankError::InvalidResponse(e.to_string()))?;

    let known: HashSet<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut verdicts = Vec::with_capacity(parsed.len());

    for mut verdict in parsed {
        if !known.contains(verdict.id.as_str()) {
            return Err(RerankError::UnknownCandidate(verdict.id));
        }
        if !verdict.score.is_finite() {
            return Err(RerankError::InvalidResponse(format!(
                "non-finite score for '{}'",
                verdict.id
            )));
        }
        if !seen.insert(verdict.id.clone()) {
            continue;
        }
        verdict.score = verdict.score.clamp(0.0, 1.0);
        verdicts.push(verdict);
    }
    Ok(verdicts)
}

/// Reorder hits by re-rank verdicts. Scored hits come first, best first;
/// the rest keep their relative order.
pub fn rerank_hits(
    reranker: &dyn Reranker,
    query: &str,
    hits: Vec<SearchHit>,
) -> Result<Vec<SearchHit>, RerankError> {
    if hits.len() < 2 {
        return Ok(hits);
    }
    let candidates: Vec<RerankCandidate> = hits.iter().map(RerankCandidate::from_hit).collect();
    let verdicts = reranker.rerank(query, &candidates)?;

    let mut by_id: HashMap<String, RerankVerdict> = HashMap::new();
    for verdict in verdicts {
        by_id.entry(verdict.id.clone()).or_insert(verdict);
    }

    let mut scored = Vec::with_capacity(hits.len());
    let mut unscored = Vec::new();
    for mut hit in hits {
        match by_id.remove(&hit.path) {
            Some(verdict) => {
                hit.score = verdict.score;
                if !verdict.reasoning.is_empty() {
                    hit.reasoning = Some(verdict.reasoning);
                }
                scored.push(hit);
            }
            None => unscored.push(hit),
        }
    }

    tracing::debug!(
        "Re-ranked {} of {} hits with {}",
        scored.len(),
        scored.len() + unscored.len(),
        reranker.name()
    );
    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    scored.extend(unscored);
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::HitOrigin;
    use std::sync::Mutex;

    fn candidates(ids: &[&str]) -> Vec<RerankCandidate> {
        ids.iter()
            .map(|id| RerankCandidate {
                id: id.to_string(),
                title: id.to_string(),
                excerpt: String::new(),
            })
            .collect()
    }

    fn hit(path: &str, score: f32) -> SearchHit {
        SearchHit {
            path: path.to_string(),
            score,
            similarity: score,
            centrality: 0.0,
            activation: 0.0,
            origin: HitOrigin::Seed,
            keyword_match: false,
            title_match: false,
            chunk: None,
            excerpt: Some(format!("excerpt of {}", path)),
            title: None,
            token_count: None,
            reasoning: None,
        }
    }

    struct CannedClient {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedClient {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    impl LlmClient for CannedClient {
        fn complete(&self, prompt: &str) -> Result<String, RerankError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn test_parse_verdicts_from_fenced_reply() {
        let reply = "Here you go:\n```json\n[{\"id\": \"a.md\", \"score\": 0.9, \"reasoning\": \"direct\"}, {\"id\": \"b.md\", \"score\": 0.2}]\n```";
        let verdicts = parse_verdicts(reply, &candidates(&["a.md", "b.md"])).unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].reasoning, "direct");
        assert_eq!(verdicts[1].reasoning, "");
    }

    #[test]
    fn test_parse_verdicts_clamps_and_dedups() {
        let reply = r#"[{"id":"a.md","score":1.7},{"id":"a.md","score":0.1},{"id":"b.md","score":-2}]"#;
        let verdicts = parse_verdicts(reply, &candidates(&["a.md", "b.md"])).unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].score, 1.0);
        assert_eq!(verdicts[1].score, 0.0);
    }

    #[test]
    fn test_parse_verdicts_rejects_unknown_ids_and_garbage() {
        let known = candidates(&["a.md"]);
        assert!(matches!(
            parse_verdicts(r#"[{"id":"ghost.md","score":0.5}]"#, &known),
            Err(RerankError::UnknownCandidate(id)) if id == "ghost.md"
        ));
        assert!(matches!(
            parse_verdicts("I cannot help with that", &known),
            Err(RerankError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_verdicts(r#"[{"id":"a.md"}]"#, &known),
            Err(RerankError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_llm_reranker_reorders_hits() {
        let client = CannedClient::new(
            r#"[{"id":"low.md","score":0.95,"reasoning":"answers it"},{"id":"high.md","score":0.3}]"#,
        );
        let reranker = LlmReranker::new(client);
        let hits = vec![hit("high.md", 0.9), hit("mid.md", 0.6), hit("low.md", 0.2)];

        let reranked = rerank_hits(&reranker, "question", hits).unwrap();
        let order: Vec<&str> = reranked.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(order, vec!["low.md", "high.md", "mid.md"]);
        assert_eq!(reranked[0].reasoning.as_deref(), Some("answers it"));
        assert_eq!(reranked[1].reasoning, None);
        // unscored hit keeps its pipeline score
        assert_eq!(reranked[2].score, 0.6);

        let prompts = reranker.client.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("excerpt of mid.md"));
    }

    #[test]
    fn test_single_hit_skips_reranker() {
        let reranker = LlmReranker::new(CannedClient::new("not json"));
        let reranked = rerank_hits(&reranker, "q", vec![hit("only.md", 0.5)]).unwrap();
        assert_eq!(reranked.len(), 1);
        assert!(reranker.client.prompts.lock().unwrap().is_empty());
    }

    #[test]
    #[ignore] // Requires model download
    fn test_cross_encoder_prefers_relevant_document() {
        let reranker = CrossEncoderReranker::new(8).unwrap();
        let candidates = vec![
            RerankCandidate {
                id: "pets.md".to_string(),
                title: "Pets".to_string(),
                excerpt: "Cats and dogs are common household pets.".to_string(),
            },
            RerankCandidate {
                id: "rust.md".to_string(),
                title: "Rust".to_string(),
                excerpt: "Rust is a systems programming language focused on safety.".to_string(),
            },
        ];
        let verdicts = reranker.rerank("rust programming", &candidates).unwrap();
        let best = verdicts
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .unwrap();
        assert_eq!(best.id, "rust.md");
        assert!(verdicts.iter().all(|v| (0.0..=1.0).contains(&v.score)));
    }
}
