//! SQLite-based vector store implementation.
//!
//! Uses SQLite for persistence with similarity and metadata filtering computed
//! in Rust. For large collections, use a dedicated vector database.

use super::{
    cosine_similarity, rank, DeleteSelector, Filter, Metadata, ScoredRecord, VectorRecord,
    VectorStore,
};
use crate::error::{ReferatError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        namespace TEXT NOT NULL,
        id TEXT NOT NULL,
        text TEXT NOT NULL,
        metadata_json TEXT NOT NULL,
        embedding BLOB NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (namespace, id)
    );

    CREATE INDEX IF NOT EXISTS idx_records_namespace ON records(namespace);
"#;

/// SQLite-based vector store.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
}

/// A row as loaded from the table, before scoring.
struct StoredRow {
    id: String,
    text: String,
    metadata: Metadata,
    embedding: Vec<f32>,
}

impl SqliteVectorStore {
    /// Open (or create) a store at `path`.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Initialized SQLite vector store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite vector store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ReferatError::VectorStore(format!("Failed to acquire lock: {}", e)))
    }

    /// Serialize embedding to bytes.
    fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize embedding from bytes.
    fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| {
                let arr: [u8; 4] = chunk.try_into().unwrap_or_default();
                f32::from_le_bytes(arr)
            })
            .collect()
    }

    /// Load every row of a namespace matching `filter`, ordered by id.
    fn load_matching(conn: &Connection, namespace: &str, filter: &Filter) -> Result<Vec<StoredRow>> {
        let mut stmt = conn.prepare(
            "SELECT id, text, metadata_json, embedding FROM records WHERE namespace = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map(params![namespace], |row| {
            let metadata_json: String = row.get(2)?;
            let embedding_bytes: Vec<u8> = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                metadata_json,
                embedding_bytes,
            ))
        })?;

        let mut matching = Vec::new();
        for row in rows {
            let (id, text, metadata_json, embedding_bytes) = row?;
            let metadata: Metadata = serde_json::from_str(&metadata_json).map_err(|e| {
                ReferatError::VectorStore(format!("Corrupt metadata for record {}: {}", id, e))
            })?;
            if filter.matches(&metadata) {
                matching.push(StoredRow {
                    id,
                    text,
                    metadata,
                    embedding: Self::bytes_to_embedding(&embedding_bytes),
                });
            }
        }
        Ok(matching)
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<usize> {
        for record in records {
            record.validate()?;
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();

        for record in records {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO records (namespace, id, text, metadata_json, embedding, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    namespace,
                    record.id,
                    record.text,
                    serde_json::to_string(&record.metadata)?,
                    Self::embedding_to_bytes(&record.embedding),
                    now,
                ],
            )?;
        }

        tx.commit()?;
        info!("Upserted {} records into '{}'", records.len(), namespace);
        Ok(records.len())
    }

    #[instrument(skip(self, embedding), fields(filter = %filter))]
    async fn query(
        &self,
        namespace: &str,
        embedding: &[f32],
        top_k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredRecord>> {
        let conn = self.lock()?;
        let results = Self::load_matching(&conn, namespace, filter)?
            .into_iter()
            .map(|row| ScoredRecord {
                score: cosine_similarity(embedding, &row.embedding),
                id: row.id,
                metadata: row.metadata,
                text: row.text,
            })
            .collect();

        let ranked = rank(results, top_k);
        debug!("Found {} matching records", ranked.len());
        Ok(ranked)
    }

    #[instrument(skip(self), fields(filter = %filter))]
    async fn scan(&self, namespace: &str, filter: &Filter, limit: usize) -> Result<Vec<ScoredRecord>> {
        let conn = self.lock()?;
        Ok(Self::load_matching(&conn, namespace, filter)?
            .into_iter()
            .take(limit)
            .map(|row| ScoredRecord {
                id: row.id,
                score: 0.0,
                metadata: row.metadata,
                text: row.text,
            })
            .collect())
    }

    #[instrument(skip(self, selector))]
    async fn delete(&self, namespace: &str, selector: &DeleteSelector) -> Result<usize> {
        let conn = self.lock()?;

        let ids: Vec<String> = match selector {
            DeleteSelector::Ids(ids) => ids.clone(),
            DeleteSelector::Filter(filter) => Self::load_matching(&conn, namespace, filter)?
                .into_iter()
                .map(|row| row.id)
                .collect(),
        };

        let tx = conn.unchecked_transaction()?;
        let mut deleted = 0;
        for id in &ids {
            deleted += tx.execute(
                "DELETE FROM records WHERE namespace = ?1 AND id = ?2",
                params![namespace, id],
            )?;
        }
        tx.commit()?;

        info!("Deleted {} records from '{}'", deleted, namespace);
        Ok(deleted)
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE namespace = ?1",
            params![namespace],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::{Condition, MetadataValue};

    fn record(id: &str, speaker: &str, start: f64) -> VectorRecord {
        let mut metadata = Metadata::new();
        metadata.insert("meeting_id".into(), "ab12cd34".into());
        metadata.insert("speakers".into(), MetadataValue::List(vec![speaker.to_string()]));
        metadata.insert("start_time".into(), start.into());
        VectorRecord {
            id: id.to_string(),
            embedding: vec![start as f32, 1.0],
            metadata,
            text: format!("{} talking", speaker),
        }
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.db");
        {
            let store = SqliteVectorStore::new(&path).unwrap();
            store
                .upsert("dev", &[record("c0", "Alice", 0.0), record("c1", "Bob", 700.0)])
                .await
                .unwrap();
        }
        let store = SqliteVectorStore::new(&path).unwrap();
        assert_eq!(store.count("dev").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_filtered_query_and_metadata_round_trip() {
        let store = SqliteVectorStore::in_memory().unwrap();
        store
            .upsert(
                "dev",
                &[record("c0", "Alice", 0.0), record("c1", "Bob", 700.0), record("c2", "Alice", 900.0)],
            )
            .await
            .unwrap();

        let filter = Filter::new()
            .and("speakers", Condition::In(vec!["Alice".into()]))
            .and("start_time", Condition::Gte(600.0));
        let results = store.query("dev", &[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "c2");
        assert_eq!(results[0].list_field("speakers"), ["Alice".to_string()]);
        assert_eq!(results[0].number_field("start_time"), Some(900.0));
    }

    #[tokio::test]
    async fn test_delete_by_filter() {
        let store = SqliteVectorStore::in_memory().unwrap();
        store
            .upsert("dev", &[record("c0", "Alice", 0.0), record("c1", "Bob", 700.0)])
            .await
            .unwrap();
        let filter = Filter::new().and("speakers", Condition::Eq("Bob".into()));
        assert_eq!(store.delete("dev", &DeleteSelector::Filter(filter)).await.unwrap(), 1);
        let rest = store.scan("dev", &Filter::new(), 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "c0");
    }
}
