//! In-memory vector store implementation.
//!
//! Useful for testing and small datasets.

use super::{
    cosine_similarity, rank, DeleteSelector, Filter, ScoredRecord, VectorRecord, VectorStore,
};
use crate::error::{ReferatError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type Namespaces = HashMap<String, HashMap<String, VectorRecord>>;

/// In-memory vector store.
#[derive(Default)]
pub struct MemoryVectorStore {
    namespaces: RwLock<Namespaces>,
}

impl MemoryVectorStore {
    /// Create a new in-memory vector store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Namespaces>> {
        self.namespaces
            .read()
            .map_err(|e| ReferatError::VectorStore(format!("Failed to acquire lock: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Namespaces>> {
        self.namespaces
            .write()
            .map_err(|e| ReferatError::VectorStore(format!("Failed to acquire lock: {}", e)))
    }
}

fn to_scored(record: &VectorRecord, score: f32) -> ScoredRecord {
    ScoredRecord {
        id: record.id.clone(),
        score,
        metadata: record.metadata.clone(),
        text: record.text.clone(),
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<usize> {
        for record in records {
            record.validate()?;
        }
        let mut namespaces = self.write()?;
        let space = namespaces.entry(namespace.to_string()).or_default();
        for record in records {
            space.insert(record.id.clone(), record.clone());
        }
        Ok(records.len())
    }

    async fn query(
        &self,
        namespace: &str,
        embedding: &[f32],
        top_k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredRecord>> {
        let namespaces = self.read()?;
        let Some(space) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let results = space
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| to_scored(r, cosine_similarity(embedding, &r.embedding)))
            .collect();

        Ok(rank(results, top_k))
    }

    async fn scan(&self, namespace: &str, filter: &Filter, limit: usize) -> Result<Vec<ScoredRecord>> {
        let namespaces = self.read()?;
        let Some(space) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut results: Vec<ScoredRecord> = space
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| to_scored(r, 0.0))
            .collect();
        results.sort_by(|a, b| a.id.cmp(&b.id));
        results.truncate(limit);
        Ok(results)
    }

    async fn delete(&self, namespace: &str, selector: &DeleteSelector) -> Result<usize> {
        let mut namespaces = self.write()?;
        let Some(space) = namespaces.get_mut(namespace) else {
            return Ok(0);
        };

        let before = space.len();
        match selector {
            DeleteSelector::Ids(ids) => {
                for id in ids {
                    space.remove(id);
                }
            }
            DeleteSelector::Filter(filter) => space.retain(|_, r| !filter.matches(&r.metadata)),
        }
        Ok(before - space.len())
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        let namespaces = self.read()?;
        Ok(namespaces.get(namespace).map_or(0, HashMap::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::{Condition, Metadata, MetadataValue};

    fn record(id: &str, meeting: &str, embedding: Vec<f32>) -> VectorRecord {
        let mut metadata = Metadata::new();
        metadata.insert("meeting_id".into(), MetadataValue::from(meeting));
        VectorRecord {
            id: id.to_string(),
            embedding,
            metadata,
            text: format!("text of {}", id),
        }
    }

    #[tokio::test]
    async fn test_query_ranks_and_filters() {
        let store = MemoryVectorStore::new();
        store
            .upsert(
                "dev",
                &[
                    record("a0", "aaaa0000", vec![1.0, 0.0, 0.0]),
                    record("a1", "aaaa0000", vec![0.7, 0.7, 0.0]),
                    record("b0", "bbbb1111", vec![1.0, 0.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.count("dev").await.unwrap(), 3);

        let all = store.query("dev", &[1.0, 0.0, 0.0], 10, &Filter::new()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].score >= all[2].score);

        let filter = Filter::new().and("meeting_id", Condition::Eq("aaaa0000".into()));
        let scoped = store.query("dev", &[1.0, 0.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(scoped.len(), 2);
        assert!(scoped.iter().all(|r| r.text_field("meeting_id") == "aaaa0000"));
        assert_eq!(scoped[0].id, "a0");
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = MemoryVectorStore::new();
        store.upsert("dev", &[record("x", "aaaa0000", vec![1.0])]).await.unwrap();
        assert_eq!(store.count("prod").await.unwrap(), 0);
        assert!(store.query("prod", &[1.0], 5, &Filter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_ids_and_filter() {
        let store = MemoryVectorStore::new();
        store
            .upsert(
                "dev",
                &[
                    record("a0", "aaaa0000", vec![1.0]),
                    record("a1", "aaaa0000", vec![1.0]),
                    record("b0", "bbbb1111", vec![1.0]),
                ],
            )
            .await
            .unwrap();

        let removed = store
            .delete("dev", &DeleteSelector::Ids(vec!["b0".into(), "missing".into()]))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let filter = Filter::new().and("meeting_id", Condition::Eq("aaaa0000".into()));
        let removed = store.delete("dev", &DeleteSelector::Filter(filter)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count("dev").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = MemoryVectorStore::new();
        store.upsert("dev", &[record("a0", "aaaa0000", vec![1.0])]).await.unwrap();
        store.upsert("dev", &[record("a0", "cccc2222", vec![1.0])]).await.unwrap();
        let rows = store.scan("dev", &Filter::new(), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text_field("meeting_id"), "cccc2222");
    }
}
