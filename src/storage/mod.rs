//! Sharded, dual-tier persistence
//!
//! One shard per embedding identity. Every save writes the full snapshot
//! to the local cache tier and a slim copy (chunk text stripped) to the
//! portable tier that travels with the notes.

pub mod snapshot;
mod tier;

pub use snapshot::{SnapshotError, SnapshotHeader};
pub use tier::ShardTier;

use crate::config::Config;
use crate::embedding::ModelIdentity;
use crate::error::{Result, WeftError};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Shard file name derived from an embedding identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ShardKey(String);

impl ShardKey {
    /// First 16 hex digits of BLAKE3(provider, model, dimension)
    pub fn for_identity(identity: &ModelIdentity) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(identity.provider.as_bytes());
        hasher.update(&[0]);
        hasher.update(identity.model.as_bytes());
        hasher.update(&[0]);
        hasher.update(&(identity.dimension as u64).to_le_bytes());
        let hex = hasher.finalize().to_hex();
        Self(hex[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Tier {
    Cache,
    Portable,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Cache => f.write_str("cache"),
            Tier::Portable => f.write_str("portable"),
        }
    }
}

/// One shard file as seen by [`ShardStore::list_shards`]
#[derive(Debug, Clone, Serialize)]
pub struct ShardInfo {
    pub key: String,
    pub tier: Tier,
    pub size: u64,
    /// `None` when the header is unreadable
    pub dimension: Option<usize>,
    pub slim: Option<bool>,
}

/// Which tiers a save reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub cache: bool,
    pub portable: bool,
}

impl SaveReport {
    pub fn any(&self) -> bool {
        self.cache || self.portable
    }
}

pub struct ShardStore {
    cache: ShardTier,
    portable: ShardTier,
}

impl ShardStore {
    /// Open the store for the vault at `vault_root`. The cache tier is
    /// namespaced per vault under the data directory.
    pub fn open(config: &Config, vault_root: &Path) -> Result<Self> {
        let cache_root = config
            .data_dir()
            .join("cache")
            .join(vault_namespace(vault_root));
        Self::with_roots(&cache_root, &config.portable_dir(vault_root))
    }

    pub fn with_roots(cache_root: &Path, portable_root: &Path) -> Result<Self> {
        Ok(Self {
            cache: ShardTier::open("cache", cache_root)?,
            portable: ShardTier::open("portable", portable_root)?,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache.dir()
    }

    pub fn portable_dir(&self) -> &Path {
        self.portable.dir()
    }

    fn tier(&self, tier: Tier) -> &ShardTier {
        match tier {
            Tier::Cache => &self.cache,
            Tier::Portable => &self.portable,
        }
    }

    /// Write both tiers. A failing tier is logged and does not stop the
    /// other one; the next save retries it.
    pub fn save(&self, key: &ShardKey, full: &[u8], slim: &[u8]) -> SaveReport {
        let mut report = SaveReport::default();

        match self.cache.write(key.as_str(), full) {
            Ok(()) => report.cache = true,
            Err(e) => warn!("Failed to write cache shard {}: {}", key, e),
        }
        match self.portable.write(key.as_str(), slim) {
            Ok(()) => report.portable = true,
            Err(e) => warn!("Failed to write portable shard {}: {}", key, e),
        }

        debug!(
            "Saved shard {} ({} full, {} slim)",
            key,
            format_size(full.len() as u64),
            format_size(slim.len() as u64)
        );
        report
    }

    /// Bytes of one tier's copy of a shard
    pub fn load_tier(&self, key: &ShardKey, tier: Tier) -> Result<Option<Vec<u8>>> {
        self.tier(tier).read(key.as_str())
    }

    /// Cache copy if present, otherwise the portable copy
    pub fn load(&self, key: &ShardKey) -> Result<Option<(Tier, Vec<u8>)>> {
        for tier in [Tier::Cache, Tier::Portable] {
            match self.load_tier(key, tier) {
                Ok(Some(bytes)) => return Ok(Some((tier, bytes))),
                Ok(None) => {}
                Err(e) if tier == Tier::Cache => {
                    warn!("Cache shard {} unreadable, trying portable: {}", key, e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub fn list_shards(&self) -> Result<Vec<ShardInfo>> {
        let mut shards = Vec::new();
        for tier in [Tier::Cache, Tier::Portable] {
            let store = self.tier(tier);
            for (key, size) in store.list()? {
                let header = store
                    .read_prefix(&key, snapshot::HEADER_LEN)?
                    .and_then(|bytes| snapshot::read_header(&bytes).ok());
                shards.push(ShardInfo {
                    key,
                    tier,
                    size,
                    dimension: header.map(|h| h.dimension),
                    slim: header.map(|h| h.slim),
                });
            }
        }
        Ok(shards)
    }

    /// Delete every shard except `keep`, in both tiers
    pub fn prune(&self, keep: &ShardKey) -> Result<usize> {
        let mut removed = 0;
        for tier in [&self.cache, &self.portable] {
            for (key, _) in tier.list()? {
                if key != keep.as_str() && tier.delete(&key)? {
                    info!("Pruned stale {} shard {}", tier.name(), key);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Delete a shard from both tiers, returning how many files went away
    pub fn delete(&self, key: &str) -> Result<usize> {
        let mut removed = 0;
        for tier in [&self.cache, &self.portable] {
            if tier.delete(key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Total bytes held by both tiers
    pub fn disk_usage(&self) -> Result<u64> {
        Ok(dir_size(self.cache.dir())? + dir_size(self.portable.dir())?)
    }
}

/// Stable per-vault directory name for the cache tier
fn vault_namespace(vault_root: &Path) -> String {
    let canonical: PathBuf = vault_root
        .canonicalize()
        .unwrap_or_else(|_| vault_root.to_path_buf());
    let hex = blake3::hash(canonical.to_string_lossy().as_bytes()).to_hex();
    hex[..16].to_string()
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut size = 0u64;
    if !path.is_dir() {
        return Ok(0);
    }
    for entry in std::fs::read_dir(path).map_err(|e| WeftError::Io {
        source: e,
        context: format!("Failed to read directory for size calculation: {}", path.display()),
    })? {
        let entry = entry.map_err(|e| WeftError::Io {
            source: e,
            context: "Failed to read directory entry for size calculation".to_string(),
        })?;
        let path = entry.path();
        if path.is_dir() {
            size += dir_size(&path)?;
        } else {
            size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(size)
}

/// Format size as human-readable string
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity(model: &str, dimension: usize) -> ModelIdentity {
        ModelIdentity {
            provider: "hashing".to_string(),
            model: model.to_string(),
            dimension,
        }
    }

    fn store(temp: &TempDir) -> ShardStore {
        ShardStore::with_roots(&temp.path().join("cache"), &temp.path().join("vault/.weft"))
            .unwrap()
    }

    #[test]
    fn test_shard_key_is_stable_and_distinct() {
        let a = ShardKey::for_identity(&identity("m", 384));
        assert_eq!(a, ShardKey::for_identity(&identity("m", 384)));
        assert_eq!(a.as_str().len(), 16);
        assert_ne!(a, ShardKey::for_identity(&identity("m", 768)));
        assert_ne!(a, ShardKey::for_identity(&identity("n", 384)));
    }

    #[test]
    fn test_save_writes_both_tiers() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let key = ShardKey::for_identity(&identity("m", 8));

        let report = store.save(&key, b"full", b"slim");
        assert!(report.cache && report.portable);

        let (tier, bytes) = store.load(&key).unwrap().unwrap();
        assert_eq!(tier, Tier::Cache);
        assert_eq!(bytes, b"full");
        assert_eq!(
            store.load_tier(&key, Tier::Portable).unwrap().unwrap(),
            b"slim"
        );
    }

    #[test]
    fn test_load_falls_back_to_portable() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let key = ShardKey::for_identity(&identity("m", 8));
        store.save(&key, b"full", b"slim");
        std::fs::remove_file(store.cache_dir().join(format!("{}.bin", key))).unwrap();

        let (tier, bytes) = store.load(&key).unwrap().unwrap();
        assert_eq!(tier, Tier::Portable);
        assert_eq!(bytes, b"slim");

        let missing = ShardKey::for_identity(&identity("other", 8));
        assert!(store.load(&missing).unwrap().is_none());
    }

    #[test]
    fn test_list_and_prune() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let keep = ShardKey::for_identity(&identity("new", 4));
        let stale = ShardKey::for_identity(&identity("old", 4));

        let full = snapshot::encode(&vec![1u32, 2, 3], 4, false, 3).unwrap();
        let slim = snapshot::encode(&vec![1u32], 4, true, 3).unwrap();
        store.save(&keep, &full, &slim);
        store.save(&stale, &full, &slim);

        let shards = store.list_shards().unwrap();
        assert_eq!(shards.len(), 4);
        assert!(shards
            .iter()
            .all(|s| s.dimension == Some(4) && s.slim == Some(s.tier == Tier::Portable)));

        assert_eq!(store.prune(&keep).unwrap(), 2);
        let remaining = store.list_shards().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|s| s.key == keep.as_str()));

        assert_eq!(store.delete(keep.as_str()).unwrap(), 2);
        assert!(store.list_shards().unwrap().is_empty());
    }

    #[test]
    fn test_one_failing_tier_does_not_block_the_other() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let key = ShardKey::for_identity(&identity("m", 8));

        // A directory where the portable file should go makes the rename fail
        std::fs::create_dir_all(store.portable_dir().join(format!("{}.bin", key))).unwrap();
        let report = store.save(&key, b"full", b"slim");
        assert!(report.cache);
        assert!(!report.portable);
        assert!(report.any());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0.00 B");
        assert_eq!(format_size(1023), "1023.00 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1024 * 1024), "1.00 MB");
    }
}
