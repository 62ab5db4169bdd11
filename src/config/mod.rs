//! Configuration management for weft
//!
//! Every tunable of the ranking model, the context accordion and the sync
//! pipeline lives here as plain data. The rest of the crate receives these
//! structs by reference; there is no global configuration state.

use crate::error::{Result, WeftError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

/// Schema version understood by this build
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub hydration: HydrationConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the fast local cache tier
    pub data_dir: PathBuf,
    /// Root of the portable (sync-friendly, slimmed) tier. Defaults to
    /// `<vault>/.weft` when unset so the slim shard travels with the notes.
    pub portable_dir: Option<PathBuf>,
    /// zstd level used for shard payloads
    pub compression_level: i32,
    /// Delete shards of other model identities after a reconfiguration
    pub prune_stale_shards: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.weft"),
            portable_dir: None,
            compression_level: 3,
            prune_stale_shards: true,
        }
    }
}

/// Embedding configuration. Changing any of these fields changes the
/// embedding identity and forces a worker restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "fastembed" or "hashing"
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    /// Maximum chunk length in chars
    pub chunk_size: usize,
    /// Chars shared between consecutive chunks
    pub chunk_overlap: usize,
    /// Chunks embedded per provider call
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "fastembed".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            chunk_size: 1000,
            chunk_overlap: 100,
            batch_size: 32,
        }
    }
}

/// Vector / keyword index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Live vector count above which searches go through HNSW instead of
    /// an exact scan
    pub ann_threshold: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_m: usize,
    pub hnsw_ef_search: usize,
    /// Heap budget handed to the tantivy writer, in bytes
    pub keyword_writer_memory: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            ann_threshold: 4096,
            hnsw_ef_construction: 200,
            hnsw_m: 16,
            hnsw_ef_search: 64,
            keyword_writer_memory: 50_000_000,
        }
    }
}

/// Relationship graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Score multiplier applied per hop
    pub decay: f32,
    /// In-degree a topic needs; degree above it triggers the hub penalty
    pub hub_degree_threshold: usize,
    /// Path prefixes that make up the topic region
    pub topic_folders: Vec<String>,
    /// Number of seeds expanded through the graph per query
    pub expansion_seeds: usize,
    pub structural_edge_weight: f32,
    pub body_edge_weight: f32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            decay: 0.7,
            hub_degree_threshold: 2,
            topic_folders: vec!["Topics/".to_string(), "Ontology/".to_string()],
            expansion_seeds: 5,
            structural_edge_weight: 1.0,
            body_edge_weight: 0.6,
        }
    }
}

/// Scoring strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// GARS weight for seed similarity
    pub w_sim: f32,
    /// GARS weight for graph centrality
    pub w_cent: f32,
    /// GARS weight for spreading activation
    pub w_act: f32,
    /// Added to the vector score when the keyword engine confirms a hit
    pub keyword_boost: f32,
    /// Extra boost when the keyword confirmation was a title match
    pub title_boost: f32,
    /// Minimum vector similarity kept during seeding
    pub recall_floor: f32,
    pub title_exact_score: f32,
    pub body_exact_score: f32,
    pub fuzzy_max_score: f32,
    /// Queries with fewer tokens than this are "short"
    pub short_query_tokens: usize,
    /// Hit ratio a short query needs before it scores at all
    pub short_query_min_ratio: f32,
    /// Hit ratio a long query needs before it scores at all
    pub long_query_min_ratio: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            w_sim: 0.6,
            w_cent: 0.2,
            w_act: 0.2,
            keyword_boost: 0.25,
            title_boost: 0.25,
            recall_floor: 0.15,
            title_exact_score: 1.0,
            body_exact_score: 0.7,
            fuzzy_max_score: 0.6,
            short_query_tokens: 4,
            short_query_min_ratio: 0.75,
            long_query_min_ratio: 0.4,
        }
    }
}

/// Context accordion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Total character budget for the packed context
    pub budget_chars: usize,
    pub primary_threshold: f32,
    pub supporting_threshold: f32,
    pub structural_threshold: f32,
    /// Fraction of the budget a single document may take
    pub soft_limit_ratio: f32,
    /// Maximum number of structural-tier entries
    pub structural_cap: usize,
    /// Maximum number of documents of any tier
    pub max_documents: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_chars: 24_000,
            primary_threshold: 0.8,
            supporting_threshold: 0.5,
            structural_threshold: 0.3,
            soft_limit_ratio: 0.25,
            structural_cap: 5,
            max_documents: 20,
        }
    }
}

/// Background sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Debounce for the document currently being edited
    pub active_debounce: String,
    /// Debounce for every other changed document
    pub debounce: String,
    pub batch_max_documents: usize,
    pub batch_max_bytes: usize,
    /// Idle delay before a coalesced save runs
    pub save_idle: String,
    /// Capacity of the mutation queue
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            active_debounce: "5s".to_string(),
            debounce: "1s".to_string(),
            batch_max_documents: 16,
            batch_max_bytes: 512 * 1024,
            save_idle: "30s".to_string(),
            queue_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn active_debounce_duration(&self) -> Duration {
        parse_duration(&self.active_debounce)
    }

    pub fn debounce_duration(&self) -> Duration {
        parse_duration(&self.debounce)
    }

    pub fn save_idle_duration(&self) -> Duration {
        parse_duration(&self.save_idle)
    }
}

/// Result hydration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrationConfig {
    /// Bytes searched on each side of the recorded offsets when healing
    pub heal_window_bytes: usize,
    /// Heal failures per session before a document is quarantined
    pub max_heal_failures: u32,
    /// Placeholder returned for chunks that could not be healed
    pub placeholder: String,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            heal_window_bytes: 4096,
            max_heal_failures: 3,
            placeholder: "[content moved; re-indexing]".to_string(),
        }
    }
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_dimension: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w_sim: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w_cent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w_act: Option<f32>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(WeftError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| WeftError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WeftError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| WeftError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| WeftError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(provider) = overrides.embedding_provider {
            self.embedding.provider = provider;
        }
        if let Some(model) = overrides.embedding_model {
            self.embedding.model = model;
        }
        if let Some(dimension) = overrides.embedding_dimension {
            self.embedding.dimension = dimension;
        }
        if let Some(budget) = overrides.budget_chars {
            self.context.budget_chars = budget;
        }
        if let Some(w) = overrides.w_sim {
            self.scoring.w_sim = w;
        }
        if let Some(w) = overrides.w_cent {
            self.scoring.w_cent = w;
        }
        if let Some(w) = overrides.w_act {
            self.scoring.w_act = w;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: WEFT_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("WEFT_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            "EMBEDDING__PROVIDER" => self.embedding.provider = value.to_string(),
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "EMBEDDING__DIMENSION" => self.embedding.dimension = parse_env(path, value)?,
            "CONTEXT__BUDGET_CHARS" => self.context.budget_chars = parse_env(path, value)?,
            "SCORING__W_SIM" => self.scoring.w_sim = parse_env(path, value)?,
            "SCORING__W_CENT" => self.scoring.w_cent = parse_env(path, value)?,
            "SCORING__W_ACT" => self.scoring.w_act = parse_env(path, value)?,
            "GRAPH__DECAY" => self.graph.decay = parse_env(path, value)?,
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// True when `other` would produce vectors incompatible with this
    /// configuration's shard (model, provider, dimension or chunking changed)
    pub fn embedding_identity_differs(&self, other: &Config) -> bool {
        let a = &self.embedding;
        let b = &other.embedding;
        a.provider != b.provider
            || a.model != b.model
            || a.dimension != b.dimension
            || a.chunk_size != b.chunk_size
            || a.chunk_overlap != b.chunk_overlap
    }

    /// Data directory with `~` expanded
    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    /// Portable tier directory with `~` expanded
    pub fn portable_dir(&self, vault_root: &Path) -> PathBuf {
        match &self.storage.portable_dir {
            Some(dir) => expand_tilde(dir),
            None => vault_root.join(".weft"),
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| WeftError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("weft").join("config.toml"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| WeftError::Config("Cannot determine home directory".to_string()))?;

        Ok(home_dir.join(".weft"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            indexing: IndexingConfig::default(),
            graph: GraphConfig::default(),
            scoring: ScoringConfig::default(),
            context: ContextConfig::default(),
            sync: SyncConfig::default(),
            hydration: HydrationConfig::default(),
            profiles: HashMap::new(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| WeftError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Parse a duration string such as "5s", "250ms", "2m". Bare numbers are
/// seconds. Unparseable input falls back to one second.
pub fn parse_duration(interval: &str) -> Duration {
    try_parse_duration(interval).unwrap_or(Duration::from_secs(1))
}

pub fn try_parse_duration(interval: &str) -> Option<Duration> {
    let interval = interval.trim();

    // "ms" before "s" because "ms" ends with "s"
    if let Some(ms) = interval.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = interval.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = interval.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60))
    } else {
        interval.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s"), Duration::from_secs(5));
        assert_eq!(parse_duration("250ms"), Duration::from_millis(250));
        assert_eq!(parse_duration("2m"), Duration::from_secs(120));
        assert_eq!(parse_duration("7"), Duration::from_secs(7));
        assert_eq!(parse_duration("bogus"), Duration::from_secs(1));
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde(Path::new("~/.weft")), home.join(".weft"));
        assert_eq!(expand_tilde(Path::new("/tmp/weft")), PathBuf::from("/tmp/weft"));
    }

    #[test]
    fn test_round_trip_through_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = Config::default();
        config.context.budget_chars = 8000;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.context.budget_chars, 8000);
        assert_eq!(loaded.meta.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            "[_meta]\nschema_version = \"1.0.0\"\n\n[scoring]\nw_sim = 0.9\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.scoring.w_sim, 0.9);
        assert_eq!(config.scoring.w_cent, ScoringConfig::default().w_cent);
        assert_eq!(config.graph.decay, GraphConfig::default().decay);
    }

    #[test]
    fn test_profile_overrides() {
        let mut config = Config::default();
        config.profiles.insert(
            "offline".to_string(),
            ProfileOverrides {
                embedding_provider: Some("hashing".to_string()),
                embedding_dimension: Some(256),
                ..Default::default()
            },
        );

        config.apply_profile("offline").unwrap();
        assert_eq!(config.embedding.provider, "hashing");
        assert_eq!(config.embedding.dimension, 256);
        assert!(config.apply_profile("missing").is_err());
    }

    #[test]
    fn test_embedding_identity() {
        let a = Config::default();
        let mut b = Config::default();
        assert!(!a.embedding_identity_differs(&b));

        b.context.budget_chars = 1;
        assert!(!a.embedding_identity_differs(&b));

        b.embedding.chunk_size = 500;
        assert!(a.embedding_identity_differs(&b));
    }
}
