//! Memory database module - SQLite-based storage for subjects, observations,
//! summaries, import watermarks and embeddings
pub mod schema;
pub mod migration;
pub mod subject_store;
pub mod observation_store;
pub mod summary_store;
pub mod watermark_store;
pub mod embedding_store;
pub use schema::*;
pub use migration::MigrationManager;
pub use subject_store::SubjectStore;
pub use observation_store::ObservationStore;
pub use summary_store::SummaryStore;
pub use watermark_store::{WatermarkStore, WatermarkMap};
pub use embedding_store::{EmbeddingStore, EmbeddingStats};
use std::path::Path;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

pub const DEFAULT_EMBEDDING_DIM: usize = 1536;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;";

pub struct MemoryDatabase {
    pub subjects: SubjectStore,
    pub observations: ObservationStore,
    pub summaries: SummaryStore,
    pub watermarks: WatermarkStore,
    pub embeddings: EmbeddingStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    /// Open (or create) the database file and apply pending migrations
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        Self::open(db_path, DEFAULT_EMBEDDING_DIM)
    }

    pub fn open(db_path: &Path, embedding_dim: usize) -> anyhow::Result<Self> {
        info!("Opening pyramid database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }
        info!("Pyramid database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool), embedding_dim))
    }

    /// In-memory database for tests and dry runs.
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        Self::new_in_memory_with_dimension(DEFAULT_EMBEDDING_DIM)
    }

    pub fn new_in_memory_with_dimension(embedding_dim: usize) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool), embedding_dim))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>, embedding_dim: usize) -> Self {
        Self {
            subjects: SubjectStore::new(Arc::clone(&pool)),
            observations: ObservationStore::new(Arc::clone(&pool)),
            summaries: SummaryStore::new(Arc::clone(&pool)),
            watermarks: WatermarkStore::new(Arc::clone(&pool)),
            embeddings: EmbeddingStore::new(Arc::clone(&pool), embedding_dim),
            pool,
        }
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    /// Wipe imported content: observations, summaries, embeddings and
    /// derived subjects. Built-in subjects and import watermarks survive.
    pub fn reset_all(&self) -> anyhow::Result<ResetStats> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let embeddings = tx.execute("DELETE FROM memory_vec", [])?;
        let summaries = tx.execute("DELETE FROM summaries", [])?;
        let observations = tx.execute("DELETE FROM observations", [])?;
        let subjects = tx.execute("DELETE FROM subjects WHERE is_builtin = FALSE", [])?;
        tx.commit()?;

        let stats = ResetStats { observations, summaries, subjects, embeddings };
        info!(
            "Cleaned: {} observations, {} summaries, {} subjects, {} embeddings",
            stats.observations, stats.summaries, stats.subjects, stats.embeddings
        );
        Ok(stats)
    }

    /// Drop the pyramid but keep observations and their subjects. Derived
    /// subjects left without observations are removed.
    pub fn reset_summaries(&self) -> anyhow::Result<ResetStats> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let embeddings = tx.execute("DELETE FROM memory_vec WHERE source_type = 'summary'", [])?;
        let summaries = tx.execute("DELETE FROM summaries", [])?;
        let subjects = tx.execute(
            "DELETE FROM subjects
             WHERE is_builtin = FALSE
               AND id NOT IN (SELECT subject_id FROM observations WHERE subject_id IS NOT NULL)",
            [],
        )?;
        tx.commit()?;

        let stats = ResetStats { observations: 0, summaries, subjects, embeddings };
        info!(
            "Cleaned: {} summaries, {} summary embeddings, {} empty subjects",
            stats.summaries, stats.embeddings, stats.subjects
        );
        Ok(stats)
    }

    /// Store newly imported observations together with the source
    /// watermarks that produced them, so a file is never imported twice.
    pub fn record_import(
        &self,
        observations: &[NewObservation],
        watermarks: &WatermarkMap,
    ) -> anyhow::Result<Vec<i64>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let ids = ObservationStore::insert_all(&tx, observations)?;
        WatermarkStore::upsert_in(&tx, watermarks)?;
        tx.commit()?;

        info!("Recorded {} observations from {} source files", ids.len(), watermarks.len());
        Ok(ids)
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn seed(db: &MemoryDatabase) -> i64 {
        let topic = db.subjects.get_or_create("rust", None).unwrap();
        let user = db.subjects.get_by_name("user").unwrap().unwrap();
        let now = Utc::now();
        db.observations.add_batch(&[
            NewObservation { text: "likes rust".into(), timestamp: now, subject_id: Some(topic.id) },
            NewObservation { text: "asked about lifetimes".into(), timestamp: now, subject_id: Some(user.id) },
        ]).unwrap();
        db.summaries.insert(&NewSummary {
            subject_id: topic.id,
            tier: 0,
            text: "rust fan".into(),
            start_timestamp: now,
            end_timestamp: now,
        }).unwrap();
        topic.id
    }

    #[test]
    fn test_reset_all_keeps_builtins() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        seed(&db);
        let stats = db.reset_all().unwrap();
        assert_eq!(stats.observations, 2);
        assert_eq!(stats.summaries, 1);
        assert_eq!(stats.subjects, 1);

        let names: Vec<String> = db.subjects.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["assistant".to_string(), "user".to_string()]);
        assert_eq!(db.observations.count().unwrap(), 0);
    }

    #[test]
    fn test_reset_summaries_keeps_observations() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let topic = seed(&db);
        let idle = db.subjects.get_or_create("cooking", None).unwrap();
        let stats = db.reset_summaries().unwrap();
        assert_eq!(stats.summaries, 1);
        assert_eq!(stats.subjects, 1);
        assert_eq!(db.observations.count().unwrap(), 2);
        assert!(db.observations.unassigned().unwrap().is_empty());
        assert!(db.subjects.get(topic).unwrap().is_some());
        assert!(db.subjects.get(idle.id).unwrap().is_none());
    }

    #[test]
    fn test_record_import_is_atomic() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let mut marks = WatermarkMap::new();
        marks.insert("/sessions/a.jsonl".into(), FileWatermark { size: 120, mtime_ns: 7 });
        let now = Utc::now();

        let ids = db.record_import(
            &[NewObservation { text: "likes rust".into(), timestamp: now, subject_id: None }],
            &marks,
        ).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(db.watermarks.load_all().unwrap(), marks);

        // unknown subject violates the foreign key: neither table changes
        let mut moved = WatermarkMap::new();
        moved.insert("/sessions/a.jsonl".into(), FileWatermark { size: 240, mtime_ns: 9 });
        let bad = NewObservation { text: "orphan".into(), timestamp: now, subject_id: Some(9_999) };
        assert!(db.record_import(&[bad], &moved).is_err());
        assert_eq!(db.observations.count().unwrap(), 1);
        assert_eq!(db.watermarks.load_all().unwrap(), marks);
    }

    #[test]
    fn test_file_database_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pyramid.db");
        {
            let db = MemoryDatabase::new(&path).unwrap();
            seed(&db);
        }
        let db = MemoryDatabase::new(&path).unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.total_observations, 2);
        assert_eq!(stats.total_summaries, 1);
        assert_eq!(stats.total_subjects, 3);
        assert_eq!(stats.max_tier, Some(0));
    }
}
