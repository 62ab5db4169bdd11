//! Accordion context assembly: budget, structural cap and clipping

use proptest::prelude::*;
use weft::config::ContextConfig;
use weft::context::{ContextAssembler, ContextCandidate, ContextTier};

fn candidate(path: &str, score: f32, body: String) -> ContextCandidate {
    ContextCandidate {
        path: path.to_string(),
        title: path.trim_end_matches(".md").to_string(),
        score,
        keyword_match: false,
        body,
        headers: vec!["Summary".to_string(), "Notes".to_string()],
    }
}

#[test]
fn test_large_document_is_clipped_and_others_fit() {
    let config = ContextConfig {
        soft_limit_ratio: 0.2,
        ..ContextConfig::default()
    };
    let budget = 8000;

    let mut candidates = vec![candidate(
        "huge.md",
        1.0,
        format!("{} deployment checklist {}", "a".repeat(25_000), "b".repeat(24_978)),
    )];
    for i in 0..4 {
        candidates.push(candidate(&format!("note{}.md", i), 0.95, "c".repeat(2000)));
    }
    assert_eq!(candidates[0].body.chars().count(), 50_000);

    let context = ContextAssembler::new(&config).assemble(&candidates, "deployment checklist", budget);

    assert_eq!(context.used_paths.len(), 5);
    assert!(context.used_chars <= budget);
    assert_eq!(context.text.chars().count(), context.used_chars);

    let huge = context.entries.iter().find(|e| e.path == "huge.md").unwrap();
    assert!(huge.clipped);
    assert!(huge.chars <= (budget as f32 * 0.2) as usize);
    assert!(context
        .entries
        .iter()
        .all(|e| e.tier == ContextTier::Primary));
}

#[test]
fn test_keyword_clip_contains_the_match() {
    let mut big = candidate(
        "huge.md",
        1.0,
        format!("{} deployment checklist {}", "a".repeat(25_000), "b".repeat(25_000)),
    );
    big.keyword_match = true;

    let context = ContextAssembler::new(&ContextConfig::default()).assemble(
        &[big],
        "Deployment Checklist",
        4000,
    );
    assert!(context.text.contains("deployment checklist"));
}

#[test]
fn test_structural_cap_with_many_candidates() {
    let config = ContextConfig::default();
    let mut candidates = vec![candidate("top.md", 1.0, "best match".to_string())];
    for i in 0..100 {
        // relevance 0.35: structural tier
        candidates.push(candidate(&format!("s{:03}.md", i), 0.35, "x".repeat(400)));
    }

    let context = ContextAssembler::new(&config).assemble(&candidates, "q", 1_000_000);
    assert_eq!(context.tier_count(ContextTier::Structural), config.structural_cap);
    assert_eq!(context.tier_count(ContextTier::Primary), 1);
    assert!(context.text.contains("- Summary"));
}

fn arb_candidate() -> impl Strategy<Value = ContextCandidate> {
    (
        "[a-z]{1,8}",
        0.0f32..10.0,
        any::<bool>(),
        "[a-zé ]{0,3000}",
        prop::collection::vec("[A-Za-z ]{1,20}", 0..8),
    )
        .prop_map(|(name, score, keyword_match, body, headers)| ContextCandidate {
            path: format!("{}.md", name),
            title: name,
            score,
            keyword_match,
            body,
            headers,
        })
}

proptest! {
    #[test]
    fn prop_never_exceeds_budget(
        candidates in prop::collection::vec(arb_candidate(), 0..30),
        budget in 0usize..20_000,
        ratio in 0.05f32..1.0,
        query in "[a-z ]{0,12}",
    ) {
        let config = ContextConfig { soft_limit_ratio: ratio, ..ContextConfig::default() };
        let context = ContextAssembler::new(&config).assemble(&candidates, &query, budget);

        prop_assert!(context.used_chars <= budget);
        prop_assert_eq!(context.text.chars().count(), context.used_chars);
        prop_assert!(context.entries.len() <= config.max_documents);
        prop_assert!(context.tier_count(ContextTier::Structural) <= config.structural_cap);
        prop_assert_eq!(context.used_paths.len(), context.entries.len());
    }
}
