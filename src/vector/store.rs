//! SQLite-backed vector collections with an atomic reindex swap
//!
//! Embeddings are stored as little-endian f32 blobs and scored with cosine
//! similarity in Rust. Collections are plain tables (`vec_<name>`); the
//! reindex swap drops the live table and renames the temp over it inside a
//! single transaction, so a concurrent reader sees the old collection or
//! the new one, never neither.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::embedding::cosine_similarity;
use crate::error::{LifeQueryError, Result};
use crate::types::{QueryHit, VectorRecord};

/// Name of the collection queries run against
pub const LIVE_COLLECTION: &str = "live";

/// Name reindex writes into before the swap
pub const TEMP_COLLECTION: &str = "reindex_tmp";

/// Vector store over a dedicated SQLite file
pub struct VectorStore {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    dir: PathBuf,
}

fn valid_collection_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(LifeQueryError::InvalidInput(format!(
            "invalid collection name: {}",
            name
        )));
    }
    Ok(())
}

fn table_name(collection: &str) -> String {
    format!("vec_{}", collection)
}

/// Serialize an embedding to little-endian f32 bytes
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize an embedding from little-endian f32 bytes
fn embedding_from_bytes(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(LifeQueryError::Invariant(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let mut embedding = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk.try_into().expect("chunks_exact(4)");
        embedding.push(f32::from_le_bytes(arr));
    }
    Ok(embedding)
}

impl VectorStore {
    /// Open the store under `dir`, creating the live collection and
    /// removing any temp collection a dead reindex left behind.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("vectors.db");

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            "#,
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            dir: dir.to_path_buf(),
        };
        store.ensure_collection(LIVE_COLLECTION)?;
        store.drop_collection(TEMP_COLLECTION)?;
        Ok(store)
    }

    /// In-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            dir: PathBuf::new(),
        };
        store.ensure_collection(LIVE_COLLECTION)?;
        Ok(store)
    }

    /// Create a collection table if missing
    pub fn ensure_collection(&self, collection: &str) -> Result<()> {
        valid_collection_name(collection)?;
        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                chunk_id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                chat_id TEXT NOT NULL,
                chat_name TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                participants TEXT NOT NULL,
                excerpt TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{}_chat ON {} (chat_id);",
            table_name(collection),
            table_name(collection),
            table_name(collection),
        ))?;
        Ok(())
    }

    /// Create an empty temp collection, discarding any previous one
    pub fn create_temp(&self) -> Result<()> {
        self.drop_collection(TEMP_COLLECTION)?;
        self.ensure_collection(TEMP_COLLECTION)
    }

    /// Drop a collection if it exists
    pub fn drop_collection(&self, collection: &str) -> Result<()> {
        valid_collection_name(collection)?;
        let conn = self.conn.lock();
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", table_name(collection)))?;
        Ok(())
    }

    /// Insert or replace vector records in a collection
    pub fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        valid_collection_name(collection)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {}
                 (chunk_id, embedding, chat_id, chat_name, start_ts, end_ts, participants, excerpt)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                table_name(collection)
            ))?;
            for record in records {
                stmt.execute(params![
                    record.chunk_id,
                    embedding_to_bytes(&record.embedding),
                    record.chat_id,
                    record.chat_name,
                    record.start_ts,
                    record.end_ts,
                    serde_json::to_string(&record.participants)?,
                    record.excerpt,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete records from the live collection by chunk id
    pub fn delete(&self, chunk_ids: &[String]) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "DELETE FROM {} WHERE chunk_id = ?",
            table_name(LIVE_COLLECTION)
        ))?;
        for id in chunk_ids {
            stmt.execute([id])?;
        }
        Ok(())
    }

    /// Cosine nearest-neighbor query against the live collection,
    /// restricted to the given chat ids. Returns up to `k` hits, best
    /// score first.
    pub fn query(
        &self,
        embedding: &[f32],
        k: usize,
        chat_ids: &HashSet<String>,
    ) -> Result<Vec<QueryHit>> {
        if chat_ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let placeholders: Vec<&str> = chat_ids.iter().map(|_| "?").collect();
        let sql = format!(
            "SELECT chunk_id, embedding, chat_id, chat_name, start_ts, end_ts, participants, excerpt
             FROM {} WHERE chat_id IN ({})",
            table_name(LIVE_COLLECTION),
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;

        let params: Vec<&dyn rusqlite::ToSql> =
            chat_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

        let rows = stmt.query_map(params.as_slice(), |row| {
            let participants_json: String = row.get(6)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                participants_json,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (chunk_id, blob, chat_id, chat_name, start_ts, end_ts, participants_json, excerpt) =
                row?;
            let stored = embedding_from_bytes(&blob)?;
            let score = cosine_similarity(embedding, &stored);
            hits.push(QueryHit {
                chunk_id,
                chat_id,
                chat_name,
                start_ts,
                end_ts,
                participants: serde_json::from_str(&participants_json).unwrap_or_default(),
                excerpt,
                score,
            });
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Promote the temp collection under the live name.
    ///
    /// Runs as one transaction: readers serialized on this connection see
    /// either the old collection or the new one.
    pub fn swap_from_temp(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
            [table_name(TEMP_COLLECTION)],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(LifeQueryError::Invariant(
                "swap requested but no temp collection exists".into(),
            ));
        }

        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {live};
             ALTER TABLE {temp} RENAME TO {live};",
            live = table_name(LIVE_COLLECTION),
            temp = table_name(TEMP_COLLECTION),
        ))?;
        tx.commit()?;
        Ok(())
    }

    /// Number of records in a collection
    pub fn count(&self, collection: &str) -> Result<i64> {
        valid_collection_name(collection)?;
        let conn = self.conn.lock();
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table_name(collection)),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl Clone for VectorStore {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            dir: self.dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chunk_id: &str, chat_id: &str, embedding: Vec<f32>, start_ts: i64) -> VectorRecord {
        VectorRecord {
            chunk_id: chunk_id.to_string(),
            embedding,
            chat_id: chat_id.to_string(),
            chat_name: format!("Chat {}", chat_id),
            start_ts,
            end_ts: start_ts + 60,
            participants: vec!["alice".to_string()],
            excerpt: format!("text of {}", chunk_id),
        }
    }

    fn ids(hits: &[QueryHit]) -> Vec<&str> {
        hits.iter().map(|h| h.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_embedding_round_trip() {
        let embedding = vec![1.0f32, -0.5, 0.25];
        let bytes = embedding_to_bytes(&embedding);
        assert_eq!(bytes.len(), 12);
        assert_eq!(embedding_from_bytes(&bytes).unwrap(), embedding);
    }

    #[test]
    fn test_query_masked_by_chat() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert(
                LIVE_COLLECTION,
                &[
                    record("c1", "a", vec![1.0, 0.0], 0),
                    record("c2", "b", vec![1.0, 0.0], 10),
                ],
            )
            .unwrap();

        let mask: HashSet<String> = ["a".to_string()].into();
        let hits = store.query(&[1.0, 0.0], 10, &mask).unwrap();
        assert_eq!(ids(&hits), vec!["c1"]);

        let empty: HashSet<String> = HashSet::new();
        assert!(store.query(&[1.0, 0.0], 10, &empty).unwrap().is_empty());
    }

    #[test]
    fn test_query_ordering_and_k() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert(
                LIVE_COLLECTION,
                &[
                    record("far", "a", vec![0.0, 1.0], 0),
                    record("near", "a", vec![1.0, 0.0], 10),
                    record("mid", "a", vec![0.7, 0.7], 20),
                ],
            )
            .unwrap();

        let mask: HashSet<String> = ["a".to_string()].into();
        let hits = store.query(&[1.0, 0.0], 2, &mask).unwrap();
        assert_eq!(ids(&hits), vec!["near", "mid"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_delete() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert(LIVE_COLLECTION, &[record("c1", "a", vec![1.0], 0)])
            .unwrap();
        store.delete(&["c1".to_string()]).unwrap();
        assert_eq!(store.count(LIVE_COLLECTION).unwrap(), 0);
    }

    #[test]
    fn test_swap_from_temp() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert(LIVE_COLLECTION, &[record("old", "a", vec![1.0, 0.0], 0)])
            .unwrap();

        store.create_temp().unwrap();
        store
            .upsert(TEMP_COLLECTION, &[record("new", "a", vec![1.0, 0.0], 0)])
            .unwrap();

        let mask: HashSet<String> = ["a".to_string()].into();
        let before = store.query(&[1.0, 0.0], 10, &mask).unwrap();
        assert_eq!(ids(&before), vec!["old"]);

        store.swap_from_temp().unwrap();

        let after = store.query(&[1.0, 0.0], 10, &mask).unwrap();
        assert_eq!(ids(&after), vec!["new"]);
        assert_eq!(store.count(LIVE_COLLECTION).unwrap(), 1);
    }

    #[test]
    fn test_swap_without_temp_fails() {
        let store = VectorStore::open_in_memory().unwrap();
        assert!(store.swap_from_temp().is_err());
    }

    #[test]
    fn test_stale_temp_removed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = VectorStore::open(dir.path()).unwrap();
            store.create_temp().unwrap();
            store
                .upsert(TEMP_COLLECTION, &[record("tmp", "a", vec![1.0], 0)])
                .unwrap();
        }
        // Simulated crash: temp left behind, cleaned up on next open
        let store = VectorStore::open(dir.path()).unwrap();
        assert!(store.count(TEMP_COLLECTION).is_err() || store.count(TEMP_COLLECTION).unwrap() == 0);
    }

    #[test]
    fn test_invalid_collection_name() {
        let store = VectorStore::open_in_memory().unwrap();
        assert!(store.ensure_collection("bad name; drop").is_err());
    }
}
