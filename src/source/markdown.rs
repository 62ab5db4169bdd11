//! Markdown helpers: link extraction, headings and titles

use crate::graph::EdgeKind;
use crate::source::OutgoingLink;
use regex::Regex;
use ahash::{HashMap, HashMapExt};
use std::sync::OnceLock;

fn wikilink_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // [[target]], [[target|alias]], [[target#heading]], ![[embed]]
    RE.get_or_init(|| {
        Regex::new(r"!?\[\[([^\]\|#\n]+)(?:#[^\]\|\n]*)?(?:\|[^\]\n]*)?\]\]").ok()
    })
    .as_ref()
}

fn mdlink_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // [text](relative/note.md) and [text](relative/note.md#heading)
    RE.get_or_init(|| Regex::new(r"\[[^\]\n]*\]\(([^)\s#]+\.md)(?:#[^)\s]*)?\)").ok())
        .as_ref()
}

/// Split a document into its front matter block (without delimiters) and
/// the body
pub fn split_front_matter(text: &str) -> (Option<&str>, &str) {
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return (None, text);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(front), body);
        }
        offset += line.len();
    }
    (None, text)
}

/// Extract outgoing links. Links in the front matter are structural, links
/// in the body are body links; a target linked both ways keeps the
/// structural kind.
pub fn extract_links(text: &str) -> Vec<OutgoingLink> {
    let (front, body) = split_front_matter(text);
    let mut seen: HashMap<String, EdgeKind> = HashMap::new();
    let mut order = Vec::new();

    let mut collect = |chunk: &str, kind: EdgeKind| {
        let wiki = wikilink_re()
            .into_iter()
            .flat_map(|re| re.captures_iter(chunk))
            .map(|c| c[1].trim().to_string());
        let md = mdlink_re()
            .into_iter()
            .flat_map(|re| re.captures_iter(chunk))
            .map(|c| c[1].replace("%20", " ").trim().to_string());

        for target in wiki.chain(md) {
            if target.is_empty() {
                continue;
            }
            match seen.get(&target) {
                Some(EdgeKind::Structural) => {}
                Some(EdgeKind::Body) if kind == EdgeKind::Body => {}
                Some(_) => {
                    seen.insert(target, kind);
                }
                None => {
                    order.push(target.clone());
                    seen.insert(target, kind);
                }
            }
        }
    };

    if let Some(front) = front {
        collect(front, EdgeKind::Structural);
    }
    collect(body, EdgeKind::Body);

    order
        .into_iter()
        .filter_map(|target| {
            let kind = *seen.get(&target)?;
            Some(OutgoingLink { target, kind })
        })
        .collect()
}

/// Markdown headings outside code fences, in document order
pub fn extract_headers(text: &str) -> Vec<String> {
    let (_, body) = split_front_matter(text);
    let mut in_fence = false;
    let mut headers = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) {
            let rest = &trimmed[hashes..];
            if rest.starts_with(' ') {
                let heading = rest.trim().trim_end_matches('#').trim();
                if !heading.is_empty() {
                    headers.push(heading.to_string());
                }
            }
        }
    }
    headers
}

/// Front matter `title:` if present, otherwise the file stem
pub fn document_title(path: &str, text: &str) -> String {
    if let (Some(front), _) = split_front_matter(text) {
        for line in front.lines() {
            if let Some(value) = line.strip_prefix("title:") {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }
    file_stem(path).to_string()
}

/// Last path segment without a `.md` extension
pub fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.strip_suffix(".md").unwrap_or(name)
}
