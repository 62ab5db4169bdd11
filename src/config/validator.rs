use crate::config::{Config, SCHEMA_VERSION};
use crate::error::{Result, ValidationError, WeftError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, collecting every problem before failing
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_indexing(config, &mut errors);
        Self::validate_graph(config, &mut errors);
        Self::validate_scoring(config, &mut errors);
        Self::validate_context(config, &mut errors);
        Self::validate_sync(config, &mut errors);
        Self::validate_hydration(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WeftError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        let embedding = &config.embedding;
        let valid_providers = ["fastembed", "hashing"];
        if !valid_providers.contains(&embedding.provider.as_str()) {
            errors.push(ValidationError::new(
                "embedding.provider",
                format!(
                    "Provider must be one of {:?}, got '{}'",
                    valid_providers, embedding.provider
                ),
            ));
        }

        if embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }

        if embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "Dimension must be greater than 0",
            ));
        }

        if embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if embedding.chunk_size == 0 {
            errors.push(ValidationError::new(
                "embedding.chunk_size",
                "Chunk size must be greater than 0",
            ));
        } else if embedding.chunk_overlap >= embedding.chunk_size {
            errors.push(ValidationError::new(
                "embedding.chunk_overlap",
                "Chunk overlap must be smaller than the chunk size",
            ));
        }
    }

    fn validate_indexing(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.indexing.hnsw_ef_construction == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_construction",
                "HNSW ef_construction must be greater than 0",
            ));
        }

        if config.indexing.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_m",
                "HNSW M must be greater than 0",
            ));
        }

        // tantivy refuses writer budgets below 15MB
        if config.indexing.keyword_writer_memory < 15_000_000 {
            errors.push(ValidationError::new(
                "indexing.keyword_writer_memory",
                "Keyword writer memory must be at least 15000000 bytes",
            ));
        }
    }

    fn validate_graph(config: &Config, errors: &mut Vec<ValidationError>) {
        let decay = config.graph.decay;
        if !(decay > 0.0 && decay <= 1.0) {
            errors.push(ValidationError::new(
                "graph.decay",
                format!("Decay must be in (0, 1], got {}", decay),
            ));
        }

        if config.graph.structural_edge_weight < 0.0 || config.graph.body_edge_weight < 0.0 {
            errors.push(ValidationError::new(
                "graph.structural_edge_weight",
                "Edge weights must be non-negative",
            ));
        }
    }

    fn validate_scoring(config: &Config, errors: &mut Vec<ValidationError>) {
        let s = &config.scoring;
        for (path, weight) in [
            ("scoring.w_sim", s.w_sim),
            ("scoring.w_cent", s.w_cent),
            ("scoring.w_act", s.w_act),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                errors.push(ValidationError::new(
                    path,
                    format!("Weight must be a non-negative number, got {}", weight),
                ));
            }
        }

        if s.w_sim + s.w_cent + s.w_act <= 0.0 {
            errors.push(ValidationError::new(
                "scoring",
                "At least one GARS weight must be positive",
            ));
        }

        if !(0.0..=1.0).contains(&s.recall_floor) {
            errors.push(ValidationError::new(
                "scoring.recall_floor",
                format!("Recall floor must be in [0, 1], got {}", s.recall_floor),
            ));
        }

        for (path, ratio) in [
            ("scoring.short_query_min_ratio", s.short_query_min_ratio),
            ("scoring.long_query_min_ratio", s.long_query_min_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                errors.push(ValidationError::new(
                    path,
                    format!("Ratio must be in [0, 1], got {}", ratio),
                ));
            }
        }
    }

    fn validate_context(config: &Config, errors: &mut Vec<ValidationError>) {
        let c = &config.context;
        if c.budget_chars == 0 {
            errors.push(ValidationError::new(
                "context.budget_chars",
                "Budget must be greater than 0",
            ));
        }

        for (path, threshold) in [
            ("context.primary_threshold", c.primary_threshold),
            ("context.supporting_threshold", c.supporting_threshold),
            ("context.structural_threshold", c.structural_threshold),
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                errors.push(ValidationError::new(
                    path,
                    format!("Threshold must be in [0, 1], got {}", threshold),
                ));
            }
        }

        if c.primary_threshold < c.supporting_threshold
            || c.supporting_threshold < c.structural_threshold
        {
            errors.push(ValidationError::new(
                "context",
                "Thresholds must satisfy primary >= supporting >= structural",
            ));
        }

        if !(c.soft_limit_ratio > 0.0 && c.soft_limit_ratio <= 1.0) {
            errors.push(ValidationError::new(
                "context.soft_limit_ratio",
                format!("Soft limit ratio must be in (0, 1], got {}", c.soft_limit_ratio),
            ));
        }

        if c.max_documents == 0 {
            errors.push(ValidationError::new(
                "context.max_documents",
                "Maximum document count must be greater than 0",
            ));
        }
    }

    fn validate_sync(config: &Config, errors: &mut Vec<ValidationError>) {
        let sync = &config.sync;
        for (path, value) in [
            ("sync.active_debounce", &sync.active_debounce),
            ("sync.debounce", &sync.debounce),
            ("sync.save_idle", &sync.save_idle),
        ] {
            if super::try_parse_duration(value).is_none() {
                errors.push(ValidationError::new(
                    path,
                    format!("Invalid duration format: {}", value),
                ));
            }
        }

        if sync.batch_max_documents == 0 {
            errors.push(ValidationError::new(
                "sync.batch_max_documents",
                "Batch document limit must be greater than 0",
            ));
        }

        if sync.batch_max_bytes == 0 {
            errors.push(ValidationError::new(
                "sync.batch_max_bytes",
                "Batch byte limit must be greater than 0",
            ));
        }

        if sync.queue_capacity == 0 {
            errors.push(ValidationError::new(
                "sync.queue_capacity",
                "Queue capacity must be greater than 0",
            ));
        }
    }

    fn validate_hydration(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.hydration.max_heal_failures == 0 {
            errors.push(ValidationError::new(
                "hydration.max_heal_failures",
                "Heal failure cap must be greater than 0",
            ));
        }
    }
}
