//! Embedding providers and chunking
//!
//! - [`EmbeddingProvider`] abstracts the model that turns text into vectors
//! - [`FastEmbedProvider`] runs local ONNX models through fastembed
//! - [`HashingProvider`] is a deterministic, model-free fallback for offline
//!   use and tests
//! - [`chunking`] splits documents into overlapping spans and computes the
//!   anchor hashes used to heal drifted offsets

pub mod chunking;
mod hashing;
mod provider;

pub use chunking::{anchor_hash, chunk_text, TextChunk};
pub use hashing::HashingProvider;
pub use provider::FastEmbedProvider;

use crate::config::EmbeddingConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Embedding generation failed: {0}")]
    GenerationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Unknown embedding provider: {0}")]
    UnknownProvider(String),
}

/// Identity of the vector space a provider produces. Two identities that
/// differ in any field produce incompatible vectors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({}D)", self.provider, self.model, self.dimension)
    }
}

/// Vectors for every chunk of one document
#[derive(Debug, Clone)]
pub struct DocumentEmbedding {
    pub vectors: Vec<Vec<f32>>,
    /// Approximate tokens consumed, reported back for search results
    pub token_count: usize,
}

/// Trait for embedding providers
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a search query
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a document's chunks, conditioned on the document title.
    /// Returns one vector per chunk, in order.
    fn embed_document(
        &self,
        chunks: &[String],
        title: &str,
    ) -> Result<DocumentEmbedding, EmbeddingError>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;

    fn provider_name(&self) -> &str;

    fn identity(&self) -> ModelIdentity {
        ModelIdentity {
            provider: self.provider_name().to_string(),
            model: self.model_name().to_string(),
            dimension: self.dimension(),
        }
    }
}

/// Build the provider named by the configuration and check it produces
/// vectors of the configured dimension
pub fn create_provider(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "fastembed" => Arc::new(FastEmbedProvider::new(&config.model, config.batch_size)?),
        "hashing" => Arc::new(HashingProvider::new(config.dimension)),
        other => return Err(EmbeddingError::UnknownProvider(other.to_string())),
    };

    if provider.dimension() != config.dimension {
        return Err(EmbeddingError::DimensionMismatch {
            expected: config.dimension,
            actual: provider.dimension(),
        });
    }

    Ok(provider)
}

/// Rough token estimate used where a provider does not report one
pub(crate) fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_hashing_provider() {
        let config = EmbeddingConfig {
            provider: "hashing".to_string(),
            dimension: 64,
            ..Default::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.dimension(), 64);
        assert_eq!(
            provider.identity(),
            ModelIdentity {
                provider: "hashing".to_string(),
                model: "hashing-v1".to_string(),
                dimension: 64,
            }
        );
    }

    #[test]
    fn test_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "remote".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            create_provider(&config),
            Err(EmbeddingError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_identity_display() {
        let identity = ModelIdentity {
            provider: "fastembed".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
        };
        assert_eq!(identity.to_string(), "fastembed/all-MiniLM-L6-v2 (384D)");
    }
}
