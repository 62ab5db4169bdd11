use super::{estimate_tokens, DocumentEmbedding, EmbeddingError, EmbeddingProvider};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;

struct ModelSpec {
    names: &'static [&'static str],
    model: EmbeddingModel,
    dimension: usize,
    size_mb: usize,
}

const MODELS: &[ModelSpec] = &[
    ModelSpec {
        names: &["all-MiniLM-L6-v2", "all-minilm-l6-v2"],
        model: EmbeddingModel::AllMiniLML6V2,
        dimension: 384,
        size_mb: 90,
    },
    ModelSpec {
        names: &["bge-small-en-v1.5"],
        model: EmbeddingModel::BGESmallENV15,
        dimension: 384,
        size_mb: 130,
    },
    ModelSpec {
        names: &["bge-base-en-v1.5"],
        model: EmbeddingModel::BGEBaseENV15,
        dimension: 768,
        size_mb: 440,
    },
];

/// FastEmbed provider for local embedding generation
///
/// Models are downloaded on demand to the fastembed cache on first use.
/// Document chunks are prefixed with the note title so that a chunk deep in
/// a long note still carries what the note is about.
pub struct FastEmbedProvider {
    model: Arc<TextEmbedding>,
    model_name: String,
    dimension: usize,
    batch_size: usize,
}

impl FastEmbedProvider {
    pub fn new(model_name: &str, batch_size: usize) -> Result<Self, EmbeddingError> {
        let spec = MODELS
            .iter()
            .find(|spec| spec.names.contains(&model_name))
            .ok_or_else(|| {
                let supported: Vec<&str> = MODELS.iter().map(|s| s.names[0]).collect();
                EmbeddingError::InitializationError(format!(
                    "Unsupported model: {}. Supported: {}",
                    model_name,
                    supported.join(", ")
                ))
            })?;

        tracing::info!(
            "Initializing embedding model: {} ({}D, ~{}MB download if not cached)",
            model_name,
            spec.dimension,
            spec.size_mb
        );

        let init_options = InitOptions::new(spec.model.clone()).with_show_download_progress(true);
        let model = TextEmbedding::try_new(init_options)
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: spec.names[0].to_string(),
            dimension: spec.dimension,
            batch_size: batch_size.max(1),
        })
    }

    fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let expected = texts.len();
        let embeddings = self
            .model
            .embed(texts, Some(self.batch_size))
            .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?;

        if embeddings.len() != expected {
            return Err(EmbeddingError::GenerationError(format!(
                "Expected {} embeddings, got {}",
                expected,
                embeddings.len()
            )));
        }

        for embedding in &embeddings {
            if embedding.len() != self.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension,
                    actual: embedding.len(),
                });
            }
        }

        Ok(embeddings)
    }
}

impl EmbeddingProvider for FastEmbedProvider {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty query".to_string()));
        }

        self.embed_texts(vec![text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::GenerationError("No embeddings generated".to_string()))
    }

    fn embed_document(
        &self,
        chunks: &[String],
        title: &str,
    ) -> Result<DocumentEmbedding, EmbeddingError> {
        if chunks.is_empty() {
            return Ok(DocumentEmbedding {
                vectors: Vec::new(),
                token_count: 0,
            });
        }

        let texts: Vec<String> = chunks
            .iter()
            .map(|chunk| format!("{}\n{}", title, chunk))
            .collect();
        let token_count = texts.iter().map(|t| estimate_tokens(t)).sum();

        Ok(DocumentEmbedding {
            vectors: self.embed_texts(texts)?,
            token_count,
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_model() {
        let result = FastEmbedProvider::new("not-a-model", 8);
        assert!(matches!(
            result,
            Err(EmbeddingError::InitializationError(msg)) if msg.contains("all-MiniLM-L6-v2")
        ));
    }

    #[test]
    #[ignore] // Requires model download (~90MB) - run with: cargo test -- --ignored
    fn test_document_embedding() {
        let provider = FastEmbedProvider::new("all-MiniLM-L6-v2", 8).unwrap();
        let chunks = vec!["First chunk.".to_string(), "Second chunk.".to_string()];

        let embedded = provider.embed_document(&chunks, "A note").unwrap();
        assert_eq!(embedded.vectors.len(), 2);
        assert!(embedded.vectors.iter().all(|v| v.len() == 384));
        assert!(embedded.token_count > 0);

        let query = provider.embed_query("first").unwrap();
        let magnitude: f32 = query.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.1);
    }
}
