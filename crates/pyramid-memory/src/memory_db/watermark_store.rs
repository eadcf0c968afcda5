//! Import watermark storage for incremental scans
use crate::memory_db::schema::*;
use rusqlite::{params, Transaction};
use std::collections::BTreeMap;
use tracing::debug;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

/// Tracked file path -> last recorded watermark
pub type WatermarkMap = BTreeMap<String, FileWatermark>;

pub struct WatermarkStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl WatermarkStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn load_all(&self) -> anyhow::Result<WatermarkMap> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT file_path, last_size, last_mtime_ns FROM import_watermarks"
        )?;
        let mut rows = stmt.query([])?;
        let mut map = WatermarkMap::new();
        while let Some(row) = rows.next()? {
            let size: i64 = row.get(1)?;
            map.insert(
                row.get(0)?,
                FileWatermark { size: size as u64, mtime_ns: row.get(2)? },
            );
        }
        Ok(map)
    }

    /// Insert or update every entry of `watermarks` in one transaction
    pub fn upsert_all(&self, watermarks: &WatermarkMap) -> anyhow::Result<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        Self::upsert_in(&tx, watermarks)?;
        tx.commit()?;
        debug!("Upserted {} import watermarks", watermarks.len());
        Ok(watermarks.len())
    }

    /// Upsert inside a caller's transaction
    pub(crate) fn upsert_in(tx: &Transaction, watermarks: &WatermarkMap) -> rusqlite::Result<()> {
        let mut stmt = tx.prepare(
            "INSERT INTO import_watermarks (file_path, last_size, last_mtime_ns)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(file_path) DO UPDATE SET
                 last_size = excluded.last_size,
                 last_mtime_ns = excluded.last_mtime_ns"
        )?;
        for (path, mark) in watermarks {
            stmt.execute(params![path, mark.size as i64, mark.mtime_ns])?;
        }
        Ok(())
    }

    pub fn get(&self, file_path: &str) -> anyhow::Result<Option<ImportWatermark>> {
        Ok(self.load_all()?.remove(file_path).map(|watermark| ImportWatermark {
            file_path: file_path.to_string(),
            watermark,
        }))
    }

    pub fn clear(&self) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        Ok(conn.execute("DELETE FROM import_watermarks", [])?)
    }
}
