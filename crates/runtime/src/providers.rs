//! LLM and embedding provider contracts.
//!
//! The substrate treats providers as opaque services returning text or
//! vectors plus cost metadata; the resource monitor consumes the metadata.
//! Swapping providers never changes core behavior.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{CortexError, CortexResult};

/// One text generation with its accounting metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
}

/// One embedding with its accounting metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub input_tokens: i64,
    pub cost: f64,
}

/// Text generation service.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> CortexResult<Completion>;

    fn model_name(&self) -> &str;
}

/// Embedding service with a fixed output dimension.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> CortexResult<Embedding>;

    fn dimension(&self) -> usize;
}

/// Deterministic offline provider.
///
/// Generates a stable pseudo-embedding from byte histograms and echoes
/// prompts back. Enough to exercise the retrieval and accounting paths
/// without network access.
#[derive(Debug, Clone)]
pub struct MockProvider {
    dimension: usize,
}

impl MockProvider {
    pub fn new(dimension: usize) -> CortexResult<Self> {
        if dimension == 0 {
            return Err(CortexError::InvariantViolation(
                "embedding dimension must be positive".to_string(),
            ));
        }
        Ok(Self { dimension })
    }
}

#[async_trait]
impl LanguageModel for MockProvider {
    async fn generate(&self, prompt: &str) -> CortexResult<Completion> {
        let input_tokens = (prompt.len() as i64 / 4).max(1);
        Ok(Completion {
            text: format!("echo: {prompt}"),
            input_tokens,
            output_tokens: input_tokens + 2,
            cost: 0.0,
        })
    }

    fn model_name(&self) -> &str {
        "mock-echo"
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    async fn embed(&self, text: &str) -> CortexResult<Embedding> {
        let mut vector = vec![0.0f32; self.dimension];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dimension] += f32::from(byte) / 255.0;
        }
        // Normalize so cosine comparisons behave.
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(Embedding {
            vector,
            input_tokens: (text.len() as i64 / 4).max(1),
            cost: 0.0,
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;

    #[tokio::test]
    async fn mock_embeddings_are_deterministic_and_normalized() {
        let provider = MockProvider::new(8).unwrap();
        let a = provider.embed("hello world").await.unwrap();
        let b = provider.embed("hello world").await.unwrap();
        assert_eq!(a.vector, b.vector);
        assert!((cosine_similarity(&a.vector, &b.vector) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn different_texts_differ() {
        let provider = MockProvider::new(8).unwrap();
        let a = provider.embed("alpha").await.unwrap();
        let b = provider.embed("a completely different sentence").await.unwrap();
        assert!(cosine_similarity(&a.vector, &b.vector) < 0.999_9);
    }

    #[test]
    fn zero_dimension_is_rejected() {
        assert!(MockProvider::new(0).is_err());
    }

    #[tokio::test]
    async fn generation_reports_token_counts() {
        let provider = MockProvider::new(4).unwrap();
        let completion = provider.generate("summarize this").await.unwrap();
        assert!(completion.text.starts_with("echo:"));
        assert!(completion.input_tokens > 0);
        assert!(completion.output_tokens > completion.input_tokens);
    }
}
