//! Per-path coalescing and debouncing of change events

use crate::source::ChangeEvent;
use crate::worker::DocumentPayload;
use ahash::{HashMap, HashMapExt};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// Content changed (or the document is new)
    Modify,
    Delete,
    /// Moved without a content change
    Move,
}

/// A coalesced change that is ready to dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueChange {
    pub path: String,
    pub kind: PendingKind,
    /// Path the index still knows this document under
    pub renamed_from: Option<String>,
    /// Re-index even if the document's stats look unchanged
    pub force: bool,
}

#[derive(Debug, Clone)]
struct Pending {
    kind: PendingKind,
    renamed_from: Option<String>,
    force: bool,
    due: Instant,
}

/// Coalesces change events per path. The latest event for a path wins,
/// renames carry pending work over to the new path, and each event pushes
/// its path's deadline out by the debounce window.
pub struct ChangeBatcher {
    pending: HashMap<String, Pending>,
    active: Option<String>,
    debounce: Duration,
    active_debounce: Duration,
}

impl ChangeBatcher {
    pub fn new(debounce: Duration, active_debounce: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            active: None,
            debounce,
            active_debounce,
        }
    }

    pub fn set_windows(&mut self, debounce: Duration, active_debounce: Duration) {
        self.debounce = debounce;
        self.active_debounce = active_debounce;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Focus moves to `path`. Work pending for the previously active
    /// document falls back to the normal debounce.
    pub fn set_active(&mut self, path: Option<String>, now: Instant) {
        if let Some(previous) = self.active.take() {
            if Some(&previous) != path.as_ref() {
                let normal = now + self.debounce;
                if let Some(pending) = self.pending.get_mut(&previous) {
                    pending.due = pending.due.min(normal);
                }
            }
        }
        self.active = path;
    }

    pub fn push(&mut self, event: ChangeEvent, now: Instant) {
        match event {
            ChangeEvent::Modify(path) => {
                let due = self.deadline(&path, now);
                let entry = self.pending.entry(path).or_insert(Pending {
                    kind: PendingKind::Modify,
                    renamed_from: None,
                    force: false,
                    due,
                });
                entry.kind = PendingKind::Modify;
                entry.due = due;
            }
            ChangeEvent::Delete(path) => {
                let due = now + self.debounce;
                let entry = self.pending.entry(path).or_insert(Pending {
                    kind: PendingKind::Delete,
                    renamed_from: None,
                    force: false,
                    due,
                });
                entry.kind = PendingKind::Delete;
                entry.due = due;
            }
            ChangeEvent::Rename { from, to } => {
                let due = self.deadline(&to, now);
                let carried = self.pending.remove(&from);
                let pending = match carried {
                    Some(previous) if previous.kind == PendingKind::Delete => {
                        // `from` stays deleted; `to` is new content
                        self.pending.insert(from, previous);
                        Pending {
                            kind: PendingKind::Modify,
                            renamed_from: None,
                            force: false,
                            due,
                        }
                    }
                    Some(previous) => Pending {
                        kind: previous.kind,
                        renamed_from: Some(previous.renamed_from.unwrap_or(from)),
                        force: previous.force,
                        due,
                    },
                    None => Pending {
                        kind: PendingKind::Move,
                        renamed_from: Some(from),
                        force: false,
                        due,
                    },
                };
                self.pending.insert(to, pending);
            }
        }
    }

    /// Queue a re-index of `path` that bypasses the unchanged-stats check.
    /// A pending delete is left alone.
    pub fn push_reindex(&mut self, path: String, now: Instant) {
        let due = self.deadline(&path, now);
        let entry = self.pending.entry(path).or_insert(Pending {
            kind: PendingKind::Modify,
            renamed_from: None,
            force: true,
            due,
        });
        if entry.kind != PendingKind::Delete {
            entry.kind = PendingKind::Modify;
            entry.force = true;
        }
    }

    /// Earliest deadline among pending changes
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    /// Remove and return every change whose deadline has passed
    pub fn take_due(&mut self, now: Instant) -> Vec<DueChange> {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due <= now)
            .map(|(path, _)| path.clone())
            .collect();
        self.take(due)
    }

    /// Remove and return everything, due or not
    pub fn take_all(&mut self) -> Vec<DueChange> {
        let all: Vec<String> = self.pending.keys().cloned().collect();
        self.take(all)
    }

    fn take(&mut self, mut paths: Vec<String>) -> Vec<DueChange> {
        paths.sort();
        paths
            .into_iter()
            .filter_map(|path| {
                let pending = self.pending.remove(&path)?;
                Some(DueChange {
                    path,
                    kind: pending.kind,
                    renamed_from: pending.renamed_from,
                    force: pending.force,
                })
            })
            .collect()
    }

    fn deadline(&self, path: &str, now: Instant) -> Instant {
        if self.active.as_deref() == Some(path) {
            now + self.active_debounce
        } else {
            now + self.debounce
        }
    }
}

/// Split documents into batches of at most `max_documents` documents and
/// about `max_bytes` of text. A single oversized document gets a batch of
/// its own.
pub fn split_batches(
    documents: Vec<DocumentPayload>,
    max_documents: usize,
    max_bytes: usize,
) -> Vec<Vec<DocumentPayload>> {
    let max_documents = max_documents.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<DocumentPayload> = Vec::new();
    let mut bytes = 0;

    for doc in documents {
        let size = doc.text.len();
        if !current.is_empty() && (current.len() >= max_documents || bytes + size > max_bytes) {
            batches.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes += size;
        current.push(doc);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
