//! Vector store abstraction for Referat.
//!
//! Records live in namespaces and carry flat metadata that queries can
//! filter on. Backends only need upsert, filtered query, scan and delete.

mod filter;
mod memory;
mod sqlite;

pub use filter::{Condition, Filter, Metadata, MetadataValue, Predicate};
pub use memory::MemoryVectorStore;
pub use sqlite::SqliteVectorStore;

use crate::error::{ReferatError, Result};
use async_trait::async_trait;

/// A record to be stored.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
    /// Chunk text returned alongside matches.
    pub text: String,
}

impl VectorRecord {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ReferatError::VectorStore("record id is empty".to_string()));
        }
        if self.embedding.is_empty() {
            return Err(ReferatError::VectorStore(format!(
                "record '{}' has no embedding",
                self.id
            )));
        }
        if let Some((key, _)) = self.metadata.iter().find(|(k, _)| k.is_empty()) {
            return Err(ReferatError::VectorStore(format!(
                "record '{}' has an empty metadata key '{}'",
                self.id, key
            )));
        }
        Ok(())
    }
}

/// A query or scan result.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub id: String,
    /// Similarity score (higher is better). Zero for scans.
    pub score: f32,
    pub metadata: Metadata,
    pub text: String,
}

impl ScoredRecord {
    /// Text metadata field, or empty string.
    pub fn text_field(&self, key: &str) -> &str {
        self.metadata
            .get(key)
            .and_then(MetadataValue::as_str)
            .unwrap_or_default()
    }

    pub fn number_field(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(MetadataValue::as_f64)
    }

    pub fn list_field(&self, key: &str) -> &[String] {
        self.metadata
            .get(key)
            .and_then(MetadataValue::as_list)
            .unwrap_or_default()
    }
}

/// Which records a delete applies to.
#[derive(Debug, Clone)]
pub enum DeleteSelector {
    Ids(Vec<String>),
    Filter(Filter),
}

/// Trait for vector store implementations.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace records by id.
    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<usize>;

    /// Rank records matching `filter` by similarity to `embedding`.
    async fn query(
        &self,
        namespace: &str,
        embedding: &[f32],
        top_k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredRecord>>;

    /// Unranked records matching `filter`, at most `limit`.
    async fn scan(&self, namespace: &str, filter: &Filter, limit: usize) -> Result<Vec<ScoredRecord>>;

    /// Delete records, returning how many were removed.
    async fn delete(&self, namespace: &str, selector: &DeleteSelector) -> Result<usize>;

    /// Number of records in a namespace.
    async fn count(&self, namespace: &str) -> Result<usize>;
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Sort by descending score and keep the best `top_k`.
pub(crate) fn rank(mut results: Vec<ScoredRecord>, top_k: usize) -> Vec<ScoredRecord> {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results.truncate(top_k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c)).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_record_validation() {
        let record = VectorRecord {
            id: "meeting_ab12cd34_chunk_0".into(),
            embedding: vec![],
            metadata: Metadata::new(),
            text: String::new(),
        };
        assert!(record.validate().is_err());
    }
}
