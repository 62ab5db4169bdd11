use crate::source::markdown::file_stem;
use ahash::{HashMap, HashMapExt};
use serde::{Deserialize, Serialize};

/// Lookup from the names a note can be linked by to its canonical path
///
/// Each document registers its path without extension, its file stem and
/// its title, all lowercased. When two documents claim the same short
/// name, the most recently registered one wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliasMap {
    names: HashMap<String, String>,
}

fn normalize(link: &str) -> String {
    let link = link.trim().trim_start_matches("./").trim_start_matches('/');
    let link = link.strip_suffix(".md").unwrap_or(link);
    link.to_lowercase()
}

impl AliasMap {
    pub fn new() -> Self {
        Self {
            names: HashMap::new(),
        }
    }

    /// Names a document answers to
    pub fn names_for(path: &str, title: &str) -> Vec<String> {
        let mut names = vec![normalize(path), file_stem(path).to_lowercase()];
        let title = title.trim().to_lowercase();
        if !title.is_empty() {
            names.push(title);
        }
        names.dedup();
        names
    }

    pub fn register(&mut self, path: &str, title: &str) {
        for name in Self::names_for(path, title) {
            self.names.insert(name, path.to_string());
        }
    }

    /// Forget every name pointing at `path`
    pub fn unregister(&mut self, path: &str) {
        self.names.retain(|_, target| target != path);
    }

    /// Resolve a raw link target to a document path
    pub fn resolve(&self, link: &str) -> Option<&str> {
        let key = normalize(link);
        if key.is_empty() {
            return None;
        }
        self.names
            .get(&key)
            .or_else(|| self.names.get(file_stem(&key)))
            .map(String::as_str)
    }

    /// Normalised lookup key for a raw link
    pub fn key(link: &str) -> String {
        normalize(link)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }
}
