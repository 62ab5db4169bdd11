//! Result hydration
//!
//! Hollow hits carry only a path, byte offsets and the chunk's anchor hash.
//! Hydration reads the live document and verifies the span still hashes to
//! the anchor. When it does not, the text has drifted since indexing: a
//! bounded window around the old offsets is searched for a span of the same
//! length with the same hash (text that moved but did not change). If that
//! fails the caller gets a placeholder and a [`DriftSignal`] is emitted so
//! the document gets re-indexed.
//!
//! Documents that keep failing to heal are quarantined for the rest of the
//! session: they still hydrate to a placeholder but stop emitting signals.

mod clean;

pub use clean::{clean_markup, CODE_PLACEHOLDER};

use crate::analysis::floor_char_boundary;
use crate::config::HydrationConfig;
use crate::embedding::chunking::anchor_hash;
use crate::error::WeftError;
use crate::index::ChunkRef;
use crate::retrieval::SearchHit;
use crate::source::DocumentSource;
use ahash::{HashMap, HashMapExt};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Excerpt length for hits that have no chunk
const LEAD_EXCERPT_BYTES: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationStatus {
    /// The recorded span still matches
    Intact,
    /// The span moved to `offset` but is otherwise unchanged
    Healed { offset: usize },
    /// The span changed; placeholder returned
    Drifted,
    /// The document no longer exists
    Missing,
    /// The document could not be read
    Unreadable,
}

impl HydrationStatus {
    pub fn has_text(&self) -> bool {
        matches!(self, Self::Intact | Self::Healed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Hydrated {
    /// Cleaned span text, or the placeholder
    pub text: String,
    pub status: HydrationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftReason {
    Drifted,
    Missing,
}

/// Request to re-index (or drop) a document whose chunks no longer match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftSignal {
    pub path: String,
    pub reason: DriftReason,
}

pub struct ResultHydrator {
    source: Arc<dyn DocumentSource>,
    config: RwLock<HydrationConfig>,
    failures: Mutex<HashMap<String, u32>>,
    drift_tx: Option<mpsc::UnboundedSender<DriftSignal>>,
}

impl ResultHydrator {
    pub fn new(source: Arc<dyn DocumentSource>, config: &HydrationConfig) -> Self {
        Self {
            source,
            config: RwLock::new(config.clone()),
            failures: Mutex::new(HashMap::new()),
            drift_tx: None,
        }
    }

    pub fn with_drift_sink(mut self, drift_tx: mpsc::UnboundedSender<DriftSignal>) -> Self {
        self.drift_tx = Some(drift_tx);
        self
    }

    /// Swap settings; heal failures recorded so far are kept
    pub fn set_config(&self, config: &HydrationConfig) {
        let mut current = self.config.write().unwrap_or_else(|e| e.into_inner());
        *current = config.clone();
    }

    fn settings(&self) -> HydrationConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resolve one chunk of `path` against the live document
    pub fn hydrate(&self, path: &str, chunk: &ChunkRef) -> Hydrated {
        let text = match self.source.read(path) {
            Ok(text) => text,
            Err(WeftError::DocumentNotFound { .. }) => {
                debug!("Hydration: {} no longer exists", path);
                self.signal(path, DriftReason::Missing);
                return self.placeholder(HydrationStatus::Missing);
            }
            Err(e) => {
                warn!("Hydration: failed to read {}: {}", path, e);
                return self.placeholder(HydrationStatus::Unreadable);
            }
        };

        if span_matches(&text, chunk.start, chunk.end, chunk.anchor) {
            return Hydrated {
                text: clean_markup(&text[chunk.start..chunk.end]),
                status: HydrationStatus::Intact,
            };
        }

        if let Some(offset) = self.heal(&text, chunk) {
            debug!(
                "Hydration: healed chunk of {} ({} -> {})",
                path, chunk.start, offset
            );
            let len = chunk.end - chunk.start;
            return Hydrated {
                text: clean_markup(&text[offset..offset + len]),
                status: HydrationStatus::Healed { offset },
            };
        }

        self.record_failure(path);
        self.placeholder(HydrationStatus::Drifted)
    }

    /// Fill `hit.excerpt`. Graph discoveries without a chunk get the start
    /// of the document.
    pub fn hydrate_hit(&self, hit: &mut SearchHit) -> HydrationStatus {
        match &hit.chunk {
            Some(chunk) => {
                let hydrated = self.hydrate(&hit.path, chunk);
                hit.excerpt = Some(hydrated.text);
                hydrated.status
            }
            None => match self.source.read(&hit.path) {
                Ok(text) => {
                    let end = floor_char_boundary(&text, LEAD_EXCERPT_BYTES);
                    hit.excerpt = Some(clean_markup(&text[..end]));
                    HydrationStatus::Intact
                }
                Err(WeftError::DocumentNotFound { .. }) => {
                    self.signal(&hit.path, DriftReason::Missing);
                    hit.excerpt = Some(self.settings().placeholder);
                    HydrationStatus::Missing
                }
                Err(e) => {
                    warn!("Hydration: failed to read {}: {}", hit.path, e);
                    hit.excerpt = Some(self.settings().placeholder);
                    HydrationStatus::Unreadable
                }
            },
        }
    }

    pub fn is_quarantined(&self, path: &str) -> bool {
        self.failure_count(path) >= self.settings().max_heal_failures
    }

    pub fn failure_count(&self, path: &str) -> u32 {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.get(path).copied().unwrap_or(0)
    }

    pub fn quarantined(&self) -> Vec<String> {
        let limit = self.settings().max_heal_failures;
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<String> = failures
            .iter()
            .filter(|(_, count)| **count >= limit)
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Forget heal failures and lift every quarantine
    pub fn reset_session(&self) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if !failures.is_empty() {
            info!("Hydration: cleared {} drift records", failures.len());
        }
        failures.clear();
    }

    /// Nearest offset within the heal window whose span hashes to the
    /// anchor. Candidates are tried closest first.
    fn heal(&self, text: &str, chunk: &ChunkRef) -> Option<usize> {
        let len = chunk.end.checked_sub(chunk.start)?;
        if len == 0 || len > text.len() {
            return None;
        }
        let last_start = text.len() - len;
        let window = self.settings().heal_window_bytes;
        let origin = chunk.start.min(last_start);

        for distance in 0..=window {
            let before = origin.checked_sub(distance);
            let after = origin.checked_add(distance).filter(|s| *s <= last_start);
            if before.is_none() && after.is_none() {
                break;
            }
            for start in [before, after].into_iter().flatten() {
                if distance == 0 && start == chunk.start {
                    continue;
                }
                if span_matches(text, start, start + len, chunk.anchor) {
                    return Some(start);
                }
                if distance == 0 {
                    break;
                }
            }
        }
        None
    }

    fn record_failure(&self, path: &str) {
        let count = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let count = failures.entry(path.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };

        let limit = self.settings().max_heal_failures;
        if count > limit {
            debug!("Hydration: {} is quarantined, no re-index requested", path);
            return;
        }
        debug!("Hydration: {} drifted ({} of {} failures)", path, count, limit);
        self.signal(path, DriftReason::Drifted);
        if count == limit {
            warn!(
                "Quarantined {} after {} failed heals; automatic re-indexing suspended this session",
                path, count
            );
        }
    }

    fn signal(&self, path: &str, reason: DriftReason) {
        if let Some(tx) = &self.drift_tx {
            // A closed receiver means the orchestrator is shutting down
            let _ = tx.send(DriftSignal {
                path: path.to_string(),
                reason,
            });
        }
    }

    fn placeholder(&self, status: HydrationStatus) -> Hydrated {
        Hydrated {
            text: self.settings().placeholder,
            status,
        }
    }
}

fn span_matches(text: &str, start: usize, end: usize, anchor: u64) -> bool {
    end <= text.len()
        && start < end
        && text.is_char_boundary(start)
        && text.is_char_boundary(end)
        && anchor_hash(&text[start..end]) == anchor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemorySource;

    const CHUNK: &str = "The migration plan moves billing to the new cluster.";

    fn chunk_of(text: &str, needle: &str) -> ChunkRef {
        let start = text.find(needle).unwrap();
        ChunkRef {
            chunk_id: 1,
            start,
            end: start + needle.len(),
            anchor: anchor_hash(needle),
        }
    }

    fn setup() -> (Arc<InMemorySource>, ResultHydrator, mpsc::UnboundedReceiver<DriftSignal>) {
        let source = Arc::new(InMemorySource::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let hydrator = ResultHydrator::new(source.clone(), &HydrationConfig::default())
            .with_drift_sink(tx);
        (source, hydrator, rx)
    }

    #[test]
    fn test_intact_span() {
        let (source, hydrator, mut rx) = setup();
        let text = format!("# Plan\n{}\n", CHUNK);
        source.insert("plan.md", &text);

        let hydrated = hydrator.hydrate("plan.md", &chunk_of(&text, CHUNK));
        assert_eq!(hydrated.status, HydrationStatus::Intact);
        assert_eq!(hydrated.text, CHUNK);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_shifted_span_heals() {
        let (source, hydrator, mut rx) = setup();
        let original = format!("intro\n{}\n", CHUNK);
        let chunk = chunk_of(&original, CHUNK);

        let edited = format!("intro\nA new paragraph written later.\n{}\n", CHUNK);
        source.insert("plan.md", &edited);

        let hydrated = hydrator.hydrate("plan.md", &chunk);
        assert_eq!(
            hydrated.status,
            HydrationStatus::Healed {
                offset: edited.find(CHUNK).unwrap()
            }
        );
        assert_eq!(hydrated.text, CHUNK);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_span_moved_backwards_heals() {
        let (source, hydrator, _rx) = setup();
        let original = format!("a long introduction paragraph\n{}", CHUNK);
        let chunk = chunk_of(&original, CHUNK);
        source.insert("plan.md", &format!("short\n{}", CHUNK));

        let hydrated = hydrator.hydrate("plan.md", &chunk);
        assert_eq!(hydrated.status, HydrationStatus::Healed { offset: 6 });
    }

    #[test]
    fn test_changed_span_drifts_and_signals() {
        let (source, hydrator, mut rx) = setup();
        let original = format!("intro\n{}\n", CHUNK);
        let chunk = chunk_of(&original, CHUNK);
        source.insert("plan.md", "intro\nThe plan was rewritten entirely.\n");

        let hydrated = hydrator.hydrate("plan.md", &chunk);
        assert_eq!(hydrated.status, HydrationStatus::Drifted);
        assert_eq!(hydrated.text, HydrationConfig::default().placeholder);
        assert_eq!(
            rx.try_recv().unwrap(),
            DriftSignal {
                path: "plan.md".to_string(),
                reason: DriftReason::Drifted
            }
        );
    }

    #[test]
    fn test_heal_window_is_bounded() {
        let (source, _, _rx) = setup();
        let config = HydrationConfig {
            heal_window_bytes: 16,
            ..HydrationConfig::default()
        };
        let hydrator = ResultHydrator::new(source.clone(), &config);

        let chunk = chunk_of(CHUNK, CHUNK);
        source.insert("plan.md", &format!("{}{}", "x".repeat(64), CHUNK));
        assert_eq!(hydrator.hydrate("plan.md", &chunk).status, HydrationStatus::Drifted);
    }

    #[test]
    fn test_quarantine_after_repeated_failures() {
        let (source, hydrator, mut rx) = setup();
        let chunk = chunk_of(CHUNK, CHUNK);
        source.insert("plan.md", "completely different text now");

        for _ in 0..5 {
            assert_eq!(hydrator.hydrate("plan.md", &chunk).status, HydrationStatus::Drifted);
        }

        let mut signals = 0;
        while rx.try_recv().is_ok() {
            signals += 1;
        }
        assert_eq!(signals, 3);
        assert!(hydrator.is_quarantined("plan.md"));
        assert_eq!(hydrator.quarantined(), vec!["plan.md".to_string()]);

        hydrator.reset_session();
        assert!(!hydrator.is_quarantined("plan.md"));
        hydrator.hydrate("plan.md", &chunk);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_missing_document() {
        let (_source, hydrator, mut rx) = setup();
        let hydrated = hydrator.hydrate("gone.md", &chunk_of(CHUNK, CHUNK));
        assert_eq!(hydrated.status, HydrationStatus::Missing);
        assert_eq!(rx.try_recv().unwrap().reason, DriftReason::Missing);
        assert_eq!(hydrator.failure_count("gone.md"), 0);
    }
}
