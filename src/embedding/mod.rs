//! Embedding generation for meeting chunks and search queries.

mod openai;

pub use openai::OpenAIEmbedder;

use crate::error::Result;
use async_trait::async_trait;

/// Turns text into vectors. Chunks and the queries that search them must use
/// the same embedder.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Vector for one search query or chunk.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Vectors for many chunks, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize;
}
