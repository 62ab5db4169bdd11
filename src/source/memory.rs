use super::{DocumentSource, DocumentStat};
use crate::error::{Result, WeftError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

struct MemoryDocument {
    text: String,
    mtime: i64,
}

/// Documents held in memory. Every write bumps a logical clock that stands
/// in for the modification time.
#[derive(Default)]
pub struct InMemorySource {
    documents: RwLock<BTreeMap<String, MemoryDocument>>,
    clock: AtomicI64,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document
    pub fn insert(&self, path: &str, text: &str) {
        let mtime = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.insert(
            path.to_string(),
            MemoryDocument {
                text: text.to_string(),
                mtime,
            },
        );
    }

    /// Replace a document's text without touching its stats, the way an
    /// editor that preserves mtime and size would
    pub fn overwrite_silently(&self, path: &str, text: &str) {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        if let Some(doc) = documents.get_mut(path) {
            doc.text = text.to_string();
        }
    }

    pub fn remove(&self, path: &str) -> bool {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.remove(path).is_some()
    }

    pub fn rename(&self, from: &str, to: &str) -> bool {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        match documents.remove(from) {
            Some(doc) => {
                documents.insert(to.to_string(), doc);
                true
            }
            None => false,
        }
    }
}

impl DocumentSource for InMemorySource {
    fn list(&self) -> Result<Vec<String>> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents.keys().cloned().collect())
    }

    fn read(&self, path: &str) -> Result<String> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        documents
            .get(path)
            .map(|doc| doc.text.clone())
            .ok_or_else(|| WeftError::DocumentNotFound {
                path: path.to_string(),
            })
    }

    fn stat(&self, path: &str) -> Result<Option<DocumentStat>> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents.get(path).map(|doc| DocumentStat {
            size: doc.text.len() as u64,
            mtime: doc.mtime,
        }))
    }
}
