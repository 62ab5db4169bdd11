//! Document sources
//!
//! The retrieval core never touches the file system directly. Everything it
//! knows about the corpus comes through [`DocumentSource`]: the list of live
//! documents, their text, cheap change-detection stats and their outgoing
//! links. [`FsDocumentSource`] serves a directory of markdown notes;
//! [`InMemorySource`] backs tests and embedders that keep notes in memory.

mod fs;
pub mod markdown;
mod memory;

pub use fs::FsDocumentSource;
pub use memory::InMemorySource;

use crate::error::Result;
use crate::graph::EdgeKind;
use serde::{Deserialize, Serialize};
use ahash::{HashMap, HashMapExt};

/// Cheap change-detection stats for a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStat {
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch
    pub mtime: i64,
}

/// A link from one document to another, as written in the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingLink {
    /// Raw link target (note name or relative path)
    pub target: String,
    pub kind: EdgeKind,
}

/// A change observed in the corpus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Modify(String),
    Delete(String),
    Rename { from: String, to: String },
}

impl ChangeEvent {
    /// Path the event applies to after it takes effect
    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::Modify(path) | ChangeEvent::Delete(path) => path,
            ChangeEvent::Rename { to, .. } => to,
        }
    }
}

/// Read access to the living corpus
///
/// Paths are relative to the corpus root and use `/` separators.
pub trait DocumentSource: Send + Sync {
    /// All live document paths
    fn list(&self) -> Result<Vec<String>>;

    /// Full current text of a document
    fn read(&self, path: &str) -> Result<String>;

    /// Stats used for change detection, `None` when the document is gone
    fn stat(&self, path: &str) -> Result<Option<DocumentStat>>;

    /// Outgoing links of a document
    fn links(&self, path: &str) -> Result<Vec<OutgoingLink>> {
        let text = self.read(path)?;
        Ok(markdown::extract_links(&text))
    }
}

/// Compare the source against previously seen stats and report what
/// changed. Renames cannot be told apart from a delete plus a create here,
/// so they surface as both.
pub fn detect_changes(
    source: &dyn DocumentSource,
    known: &HashMap<String, DocumentStat>,
) -> Result<(Vec<ChangeEvent>, HashMap<String, DocumentStat>)> {
    let mut current = HashMap::new();
    let mut events = Vec::new();

    for path in source.list()? {
        let Some(stat) = source.stat(&path)? else {
            continue;
        };
        if known.get(&path) != Some(&stat) {
            events.push(ChangeEvent::Modify(path.clone()));
        }
        current.insert(path, stat);
    }

    for path in known.keys() {
        if !current.contains_key(path) {
            events.push(ChangeEvent::Delete(path.clone()));
        }
    }

    Ok((events, current))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_changes() {
        let source = InMemorySource::new();
        source.insert("a.md", "alpha");
        source.insert("b.md", "beta");

        let (events, known) = detect_changes(&source, &HashMap::new()).unwrap();
        assert_eq!(events.len(), 2);

        let (events, known) = detect_changes(&source, &known).unwrap();
        assert!(events.is_empty());

        source.insert("a.md", "alpha, edited");
        source.remove("b.md");
        let (mut events, _) = detect_changes(&source, &known).unwrap();
        events.sort_by(|a, b| a.path().cmp(b.path()));
        assert_eq!(
            events,
            vec![
                ChangeEvent::Modify("a.md".to_string()),
                ChangeEvent::Delete("b.md".to_string()),
            ]
        );
    }

    #[test]
    fn test_rename_event_path() {
        let event = ChangeEvent::Rename {
            from: "old.md".to_string(),
            to: "new.md".to_string(),
        };
        assert_eq!(event.path(), "new.md");
    }
}
