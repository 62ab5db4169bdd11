//! Context assembly ("accordion")
//!
//! Packs ranked documents into a character budget. The more relevant a
//! document is relative to the best hit, the more of it is included: full
//! body, a clipped window, or only its table of contents.
//!
//! Budgets are counted in chars, and the rendered entry headers count
//! against the budget too, so the packed text never exceeds it.

use crate::analysis::{char_len, find_case_insensitive, take_chars};
use crate::config::ContextConfig;
use serde::Serialize;
use tracing::debug;

const SEPARATOR: &str = "\n\n";
const ELLIPSIS: &str = "…";

/// A hydrated document offered to the assembler
#[derive(Debug, Clone)]
pub struct ContextCandidate {
    pub path: String,
    pub title: String,
    pub score: f32,
    /// The query matched this document lexically
    pub keyword_match: bool,
    pub body: String,
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextTier {
    Primary,
    Supporting,
    Structural,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry {
    pub path: String,
    pub title: String,
    pub tier: ContextTier,
    /// Chars of document content included, headers excluded
    pub chars: usize,
    pub clipped: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssembledContext {
    pub text: String,
    /// Paths in the order they appear in `text`
    pub used_paths: Vec<String>,
    pub entries: Vec<ContextEntry>,
    /// Chars of `text`
    pub used_chars: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tier_count(&self, tier: ContextTier) -> usize {
        self.entries.iter().filter(|e| e.tier == tier).count()
    }
}

pub struct ContextAssembler {
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Assemble with the configured default budget
    pub fn assemble_default(&self, candidates: &[ContextCandidate], query: &str) -> AssembledContext {
        self.assemble(candidates, query, self.config.budget_chars)
    }

    pub fn assemble(
        &self,
        candidates: &[ContextCandidate],
        query: &str,
        budget: usize,
    ) -> AssembledContext {
        let mut ranked: Vec<&ContextCandidate> = candidates
            .iter()
            .filter(|c| c.score.is_finite())
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut context = AssembledContext::default();
        let top_score = match ranked.first() {
            Some(top) if top.score > 0.0 && budget > 0 => top.score,
            _ => return context,
        };

        let soft_cap = ((budget as f32 * self.config.soft_limit_ratio) as usize).max(1);
        let mut structural = 0;

        for candidate in ranked {
            if context.entries.len() >= self.config.max_documents || context.used_chars >= budget {
                break;
            }
            let relevance = candidate.score / top_score;
            let Some(tier) = self.tier_for(relevance) else {
                // sorted, so everything after is below the floor too
                break;
            };
            if tier == ContextTier::Structural && structural >= self.config.structural_cap {
                continue;
            }

            let heading = render_heading(candidate);
            let separator = if context.text.is_empty() { 0 } else { SEPARATOR.len() };
            let overhead = char_len(&heading) + separator;
            let remaining = budget - context.used_chars;
            if overhead >= remaining {
                continue;
            }
            let available = remaining - overhead;

            let (content, clipped) = match tier {
                ContextTier::Primary => {
                    let body_chars = char_len(&candidate.body);
                    if body_chars <= available.min(soft_cap) {
                        (candidate.body.clone(), false)
                    } else {
                        (clip(candidate, query, soft_cap.min(available)), true)
                    }
                }
                ContextTier::Supporting => {
                    let width = (soft_cap / 2).max(1).min(available);
                    let clipped = char_len(&candidate.body) > width;
                    (clip(candidate, query, width), clipped)
                }
                ContextTier::Structural => {
                    let outline = render_outline(&candidate.headers);
                    let clipped = char_len(&outline) > available;
                    (take_chars(&outline, available).to_string(), clipped)
                }
            };

            if tier == ContextTier::Structural {
                structural += 1;
            }
            let chars = char_len(&content);
            if !context.text.is_empty() {
                context.text.push_str(SEPARATOR);
            }
            context.text.push_str(&heading);
            context.text.push_str(&content);
            context.used_chars += overhead + chars;
            context.used_paths.push(candidate.path.clone());
            context.entries.push(ContextEntry {
                path: candidate.path.clone(),
                title: candidate.title.clone(),
                tier,
                chars,
                clipped,
            });
        }

        debug!(
            "Assembled context: {} documents, {}/{} chars ({} primary, {} supporting, {} structural)",
            context.entries.len(),
            context.used_chars,
            budget,
            context.tier_count(ContextTier::Primary),
            context.tier_count(ContextTier::Supporting),
            structural
        );
        context
    }

    fn tier_for(&self, relevance: f32) -> Option<ContextTier> {
        if relevance >= self.config.primary_threshold {
            Some(ContextTier::Primary)
        } else if relevance >= self.config.supporting_threshold {
            Some(ContextTier::Supporting)
        } else if relevance >= self.config.structural_threshold {
            Some(ContextTier::Structural)
        } else {
            None
        }
    }
}

fn render_heading(candidate: &ContextCandidate) -> String {
    format!("### {}\n({})\n", candidate.title, candidate.path)
}

fn render_outline(headers: &[String]) -> String {
    if headers.is_empty() {
        return "(no sections)".to_string();
    }
    headers
        .iter()
        .map(|h| format!("- {}", h))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A window of at most `width` chars, ellipses included. Keyword matches are
/// centered on the first occurrence of the query, everything else starts at
/// the top of the document.
fn clip(candidate: &ContextCandidate, query: &str, width: usize) -> String {
    let body = &candidate.body;
    let total = char_len(body);
    if total <= width {
        return body.clone();
    }

    let anchor = if candidate.keyword_match {
        find_case_insensitive(body, query.trim()).map(|byte| char_len(&body[..byte]))
    } else {
        None
    };

    let Some(match_start) = anchor else {
        return with_ellipses(body, 0, width, total);
    };

    let query_chars = char_len(query.trim());
    let lead = width.saturating_sub(query_chars) / 2;
    let start = match_start.saturating_sub(lead).min(total - width);
    with_ellipses(body, start, width, total)
}

/// `width` chars from char offset `start`, with an ellipsis on each cut
/// side that fits inside the width
fn with_ellipses(body: &str, start: usize, width: usize, total: usize) -> String {
    let mut start = start;
    let mut take = width;
    let lead = start > 0;
    let trail = start + width < total;
    let marker = char_len(ELLIPSIS);

    if lead && take > marker {
        take -= marker;
        start += marker;
    }
    if trail && take > marker {
        take -= marker;
    }

    let tail = match body.char_indices().nth(start) {
        Some((byte, _)) => &body[byte..],
        None => "",
    };
    let mut window = String::with_capacity(take + 2 * ELLIPSIS.len());
    if lead && width > marker {
        window.push_str(ELLIPSIS);
    }
    window.push_str(take_chars(tail, take));
    if trail && width > 2 * marker {
        window.push_str(ELLIPSIS);
    }
    window
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(path: &str, score: f32, body: &str) -> ContextCandidate {
        ContextCandidate {
            path: path.to_string(),
            title: path.trim_end_matches(".md").to_string(),
            score,
            keyword_match: false,
            body: body.to_string(),
            headers: vec!["Overview".to_string(), "Details".to_string()],
        }
    }

    fn assembler() -> ContextAssembler {
        ContextAssembler::new(&ContextConfig::default())
    }

    #[test]
    fn test_empty_input() {
        let context = assembler().assemble(&[], "q", 1000);
        assert!(context.is_empty());
        assert_eq!(context.text, "");
        assert_eq!(context.used_chars, 0);
    }

    #[test]
    fn test_tiers_by_relative_relevance() {
        let long = "x".repeat(5000);
        let candidates = vec![
            candidate("top.md", 1.0, "short primary body"),
            candidate("support.md", 0.6, &long),
            candidate("outline.md", 0.35, &long),
            candidate("noise.md", 0.1, &long),
        ];
        let context = assembler().assemble(&candidates, "q", 24_000);

        let tiers: Vec<ContextTier> = context.entries.iter().map(|e| e.tier).collect();
        assert_eq!(
            tiers,
            vec![ContextTier::Primary, ContextTier::Supporting, ContextTier::Structural]
        );
        assert_eq!(context.used_paths, vec!["top.md", "support.md", "outline.md"]);
        assert!(context.text.contains("short primary body"));
        assert!(context.text.contains("- Overview\n- Details"));
        // supporting window is half the soft cap
        assert!(context.entries[1].chars <= 3000);
        assert!(context.entries[1].clipped);
        assert_eq!(context.used_chars, char_len(&context.text));
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let candidates = vec![candidate("low.md", 0.5, "low"), candidate("high.md", 2.0, "high")];
        let context = assembler().assemble(&candidates, "q", 1000);
        assert_eq!(context.used_paths[0], "high.md");
    }

    #[test]
    fn test_keyword_clip_is_centered_on_match() {
        let mut body = "a".repeat(3000);
        body.push_str("NEEDLE here");
        body.push_str(&"b".repeat(3000));
        let mut doc = candidate("doc.md", 1.0, &body);
        doc.keyword_match = true;

        let context = assembler().assemble(&[doc], "needle", 400);
        assert!(context.text.contains("NEEDLE here"));
        assert!(context.entries[0].clipped);
        assert!(context.used_chars <= 400);
    }

    #[test]
    fn test_clip_without_keyword_starts_at_top() {
        let body = format!("START{}", "z".repeat(2000));
        let context = assembler().assemble(&[candidate("doc.md", 1.0, &body)], "q", 400);
        assert!(context.text.contains("START"));
        assert!(context.text.ends_with(ELLIPSIS));
    }

    #[test]
    fn test_max_documents_cap() {
        let config = ContextConfig {
            max_documents: 3,
            ..ContextConfig::default()
        };
        let candidates: Vec<_> = (0..10)
            .map(|i| candidate(&format!("{}.md", i), 1.0, "body"))
            .collect();
        let context = ContextAssembler::new(&config).assemble(&candidates, "q", 100_000);
        assert_eq!(context.entries.len(), 3);
    }

    #[test]
    fn test_tiny_budget_never_overflows() {
        let candidates = vec![candidate("a-very-long-document-name.md", 1.0, "body text")];
        let context = assembler().assemble(&candidates, "q", 10);
        assert!(context.used_chars <= 10);
        assert!(context.is_empty());
    }

    #[test]
    fn test_zero_scores_yield_nothing() {
        let candidates = vec![candidate("a.md", 0.0, "body")];
        assert!(assembler().assemble(&candidates, "q", 1000).is_empty());
    }
}
