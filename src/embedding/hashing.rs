use super::{DocumentEmbedding, EmbeddingError, EmbeddingProvider};
use crate::analysis;

/// Deterministic feature-hashing embedder
///
/// Each stemmed token is hashed into one of `dimension` buckets with a
/// signed weight and the result is L2-normalised. Texts sharing vocabulary
/// land close together, which is enough for offline operation and for tests
/// that need stable vectors without a model download.
pub struct HashingProvider {
    dimension: usize,
}

impl HashingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn vectorize(&self, tokens: &[String]) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        if tokens.is_empty() {
            // Tokenless text still needs a unit vector for cosine distance
            vector[0] = 1.0;
            return vector;
        }

        for token in tokens {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&bytes[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        } else {
            vector[0] = 1.0;
        }
        vector
    }
}

impl EmbeddingProvider for HashingProvider {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty query".to_string()));
        }
        Ok(self.vectorize(&analysis::tokenize(text)))
    }

    fn embed_document(
        &self,
        chunks: &[String],
        title: &str,
    ) -> Result<DocumentEmbedding, EmbeddingError> {
        let title_tokens = analysis::tokenize(title);
        let mut token_count = 0;
        let mut vectors = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let mut tokens = title_tokens.clone();
            tokens.extend(analysis::tokenize(chunk));
            token_count += tokens.len();
            vectors.push(self.vectorize(&tokens));
        }

        Ok(DocumentEmbedding {
            vectors,
            token_count,
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hashing-v1"
    }

    fn provider_name(&self) -> &str {
        "hashing"
    }
}
