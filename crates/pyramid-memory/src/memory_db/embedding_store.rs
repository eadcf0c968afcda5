//! Embedding storage keyed by (source kind, source id)
use crate::memory_db::schema::*;
use rusqlite::{params, Row};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

#[derive(Debug, Clone, serde::Serialize)]
pub struct EmbeddingStats {
    pub total_embeddings: usize,
    pub dimension: usize,
}

pub struct EmbeddingStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    dimension: usize,
}

impl EmbeddingStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, dimension: usize) -> Self {
        Self { pool, dimension }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Keys that already have a vector
    pub fn existing_keys(&self) -> anyhow::Result<HashSet<(SourceKind, i64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT source_type, source_id FROM memory_vec")?;
        let mut rows = stmt.query([])?;
        let mut keys = HashSet::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            match SourceKind::parse(&kind) {
                Some(kind) => {
                    keys.insert((kind, row.get(1)?));
                }
                None => warn!("Ignoring embedding row with unknown source type '{}'", kind),
            }
        }
        Ok(keys)
    }

    /// Store one batch of vectors in a single transaction
    pub fn store_batch(
        &self,
        keys: &[(SourceKind, i64)],
        embeddings: &[Vec<f32>],
    ) -> anyhow::Result<usize> {
        if keys.len() != embeddings.len() {
            return Err(anyhow::anyhow!(
                "Embedding count mismatch: {} keys, {} vectors",
                keys.len(),
                embeddings.len()
            ));
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimension) {
            return Err(anyhow::anyhow!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                bad.len()
            ));
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO memory_vec (source_type, source_id, embedding)
                 VALUES (?1, ?2, ?3)"
            )?;
            for ((kind, id), embedding) in keys.iter().zip(embeddings) {
                let bytes = bincode::serialize(embedding)?;
                stmt.execute(params![kind.as_str(), id, bytes])?;
            }
        }
        tx.commit()?;
        Ok(keys.len())
    }

    pub fn clear(&self) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM memory_vec", [])?;
        info!("Cleared {} embeddings", deleted);
        Ok(deleted)
    }

    pub fn get(&self, kind: SourceKind, source_id: i64) -> anyhow::Result<Option<StoredEmbedding>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_type, source_id, embedding FROM memory_vec
             WHERE source_type = ?1 AND source_id = ?2"
        )?;
        let mut rows = stmt.query(params![kind.as_str(), source_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_embedding(row)?))
        } else {
            Ok(None)
        }
    }

    /// Linear cosine scan over every stored vector, best first
    pub fn nearest(&self, query: &[f32], limit: usize) -> anyhow::Result<Vec<(SourceKind, i64, f32)>> {
        if query.len() != self.dimension {
            return Err(anyhow::anyhow!(
                "Query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            ));
        }
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT id, source_type, source_id, embedding FROM memory_vec")?;
        let mut rows = stmt.query([])?;

        let mut matches = Vec::new();
        while let Some(row) = rows.next()? {
            let stored = Self::row_to_embedding(row)?;
            let sim = cosine_similarity(query, &stored.embedding);
            matches.push((stored.source_kind, stored.source_id, sim));
        }

        matches.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit);
        Ok(matches)
    }

    pub fn count(&self) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memory_vec", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn get_stats(&self) -> anyhow::Result<EmbeddingStats> {
        Ok(EmbeddingStats {
            total_embeddings: self.count()?,
            dimension: self.dimension,
        })
    }

    fn row_to_embedding(row: &Row) -> anyhow::Result<StoredEmbedding> {
        let kind: String = row.get(1)?;
        let source_kind = SourceKind::parse(&kind)
            .ok_or_else(|| anyhow::anyhow!("Unknown embedding source type '{}'", kind))?;
        let bytes: Vec<u8> = row.get(3)?;
        let embedding: Vec<f32> = bincode::deserialize(&bytes)
            .map_err(|e| anyhow::anyhow!("Deserialization error: {}", e))?;
        Ok(StoredEmbedding {
            id: row.get(0)?,
            source_kind,
            source_id: row.get(2)?,
            embedding,
        })
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() { return 0.0; }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 { 0.0 } else { dot / (norm_a * norm_b) }
}
