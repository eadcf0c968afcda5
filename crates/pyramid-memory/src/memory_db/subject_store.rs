//! Subject storage: built-in and derived memory partitions
use crate::memory_db::schema::*;
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub struct SubjectStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SubjectStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// All subjects, built-ins first, then by id
    pub fn list(&self) -> anyhow::Result<Vec<Subject>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, is_builtin FROM subjects
             ORDER BY is_builtin DESC, id ASC"
        )?;
        let mut rows = stmt.query([])?;
        let mut subjects = Vec::new();
        while let Some(row) = rows.next()? {
            subjects.push(Self::row_to_subject(row)?);
        }
        Ok(subjects)
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Subject>> {
        let conn = self.get_conn()?;
        let subject = conn
            .query_row(
                "SELECT id, name, description, is_builtin FROM subjects WHERE id = ?1",
                [id],
                |row| Self::row_to_subject(row),
            )
            .optional()?;
        Ok(subject)
    }

    pub fn get_by_name(&self, name: &str) -> anyhow::Result<Option<Subject>> {
        let conn = self.get_conn()?;
        let subject = conn
            .query_row(
                "SELECT id, name, description, is_builtin FROM subjects WHERE name = ?1",
                [name],
                |row| Self::row_to_subject(row),
            )
            .optional()?;
        Ok(subject)
    }

    /// Look a subject up by name, creating a derived (non built-in) one if absent
    pub fn get_or_create(&self, name: &str, description: Option<&str>) -> anyhow::Result<Subject> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow::anyhow!("Subject name cannot be empty"));
        }
        if let Some(existing) = self.get_by_name(name)? {
            return Ok(existing);
        }

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO subjects (name, description, is_builtin) VALUES (?1, ?2, FALSE)",
            params![name, description],
        )?;
        drop(conn);

        let subject = self
            .get_by_name(name)?
            .ok_or_else(|| anyhow::anyhow!("Subject '{}' vanished after insert", name))?;
        info!("Created subject '{}' (id={})", subject.name, subject.id);
        Ok(subject)
    }

    fn row_to_subject(row: &Row) -> rusqlite::Result<Subject> {
        Ok(Subject {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            is_builtin: row.get(3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::memory_db::MemoryDatabase;

    #[test]
    fn test_builtin_subjects_seeded() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let names: Vec<String> = db.subjects.list().unwrap().into_iter()
            .filter(|s| s.is_builtin)
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["assistant".to_string(), "user".to_string()]);
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let first = db.subjects.get_or_create("python", Some("Programming language experiences")).unwrap();
        let second = db.subjects.get_or_create("python", None).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_builtin);
        assert_eq!(first.description.as_deref(), Some("Programming language experiences"));

        let user = db.subjects.get_or_create("user", None).unwrap();
        assert!(user.is_builtin);
    }

    #[test]
    fn test_get_or_create_rejects_blank_name() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        assert!(db.subjects.get_or_create("   ", None).is_err());
    }
}
