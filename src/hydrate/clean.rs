//! Markup cleaning for excerpts

use regex::Regex;
use std::sync::OnceLock;

/// Placeholder for a fenced code block
pub const CODE_PLACEHOLDER: &str = "[code]";

fn embed_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // ![[note]] and ![alt](image.png)
    RE.get_or_init(|| Regex::new(r"!\[\[[^\]\n]*\]\]|!\[[^\]\n]*\]\([^)\n]*\)").ok())
        .as_ref()
}

fn heading_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#{1,6}\s+").ok()).as_ref()
}

fn quote_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:>\s?)+").ok()).as_ref()
}

/// Strip markup noise from an excerpt: heading markers, embeds and
/// blockquote markers go, fenced code becomes [`CODE_PLACEHOLDER`] and all
/// whitespace collapses to single spaces.
pub fn clean_markup(text: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            if !in_fence {
                kept.push(CODE_PLACEHOLDER.to_string());
            }
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let mut line = trimmed.to_string();
        for re in [quote_re(), heading_re()].into_iter().flatten() {
            line = re.replace(&line, "").into_owned();
        }
        if let Some(re) = embed_re() {
            line = re.replace_all(&line, "").into_owned();
        }
        kept.push(line);
    }

    kept.join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
