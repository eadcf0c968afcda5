//! Database migration system

use rusqlite::{Connection, Result};
use tracing::{info, warn, error};

use crate::memory_db::schema::{self, BUILTIN_SUBJECTS};

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    /// Create a new migration manager
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Initialize database with current schema and seed built-in subjects
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing pyramid database schema...");

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current database schema version: {}", current_version);

        self.apply_migrations(current_version)?;
        self.seed_builtin_subjects()?;

        Ok(())
    }

    /// Apply all pending migrations, one transaction each
    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version <= current_version {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
            tx.commit()?;

            info!("Migration {} applied successfully", version);
        }

        Ok(())
    }

    fn seed_builtin_subjects(&mut self) -> Result<()> {
        for name in BUILTIN_SUBJECTS {
            self.conn.execute(
                "INSERT OR IGNORE INTO subjects (name, is_builtin) VALUES (?1, TRUE)",
                [name],
            )?;
        }
        Ok(())
    }

    /// Get current schema version
    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or_else(|_| Ok(0))
    }
}

/// Get all migration SQL scripts
fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_add_import_watermarks.sql")),
        (3, include_str!("migrations/003_add_memory_vec.sql")),
    ]
}

/// Get database statistics from a connection
pub fn get_database_stats(conn: &Connection) -> Result<schema::DatabaseStats> {
    fn count(conn: &Connection, sql: &str) -> Result<i64> {
        conn.query_row(sql, [], |row| row.get(0)).or_else(|e| {
            warn!("Stats query failed ({}): {}", sql, e);
            Ok(0)
        })
    }

    let max_tier: Option<i64> = conn
        .query_row("SELECT MAX(tier) FROM summaries", [], |row| row.get(0))
        .unwrap_or(None);

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(schema::DatabaseStats {
        total_subjects: count(conn, "SELECT COUNT(*) FROM subjects")?,
        total_observations: count(conn, "SELECT COUNT(*) FROM observations")?,
        unassigned_observations: count(conn, "SELECT COUNT(*) FROM observations WHERE subject_id IS NULL")?,
        total_summaries: count(conn, "SELECT COUNT(*) FROM summaries")?,
        max_tier: max_tier.map(|t| t as u32),
        total_embeddings: count(conn, "SELECT COUNT(*) FROM memory_vec")?,
        tracked_files: count(conn, "SELECT COUNT(*) FROM import_watermarks")?,
        database_size_bytes,
    })
}
