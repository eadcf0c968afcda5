//! Observation storage and retrieval operations
use crate::memory_db::schema::*;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use chrono::{DateTime, Utc};
use tracing::debug;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

const SELECT_COLUMNS: &str = "SELECT id, text, timestamp, subject_id FROM observations";

pub struct ObservationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ObservationStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Store a single observation, returning its id
    pub fn add(&self, observation: &NewObservation) -> anyhow::Result<i64> {
        let ids = self.add_batch(std::slice::from_ref(observation))?;
        ids.first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Observation insert returned no id"))
    }

    /// Store observations in one transaction; ids are returned in input order
    pub fn add_batch(&self, observations: &[NewObservation]) -> anyhow::Result<Vec<i64>> {
        if observations.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let ids = Self::insert_all(&tx, observations)?;
        tx.commit()?;

        debug!("Stored {} observations in batch", ids.len());
        Ok(ids)
    }

    /// Insert inside a caller's transaction
    pub(crate) fn insert_all(tx: &Transaction, observations: &[NewObservation]) -> rusqlite::Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(observations.len());
        let mut stmt = tx.prepare(
            "INSERT INTO observations (text, timestamp, subject_id) VALUES (?1, ?2, ?3)"
        )?;
        for obs in observations {
            stmt.execute(params![&obs.text, format_ts(&obs.timestamp), obs.subject_id])?;
            ids.push(tx.last_insert_rowid());
        }
        Ok(ids)
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Observation>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                [id],
                |row| Ok(Self::read_row(row)),
            )
            .optional()?;
        row.transpose()
    }

    /// Attach an observation to a subject; the only mutation observations allow
    pub fn assign_subject(&self, observation_id: i64, subject_id: i64) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE observations SET subject_id = ?1 WHERE id = ?2",
            params![subject_id, observation_id],
        )?;
        if updated == 0 {
            return Err(anyhow::anyhow!("Observation {} not found", observation_id));
        }
        Ok(())
    }

    /// Observations of a subject strictly after `after` (all when `None`),
    /// optionally skipping ids below `start_id`, in timestamp order
    pub fn by_subject_after(
        &self,
        subject_id: i64,
        after: Option<DateTime<Utc>>,
        start_id: Option<i64>,
    ) -> anyhow::Result<Vec<Observation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE subject_id = ?1
               AND (?2 IS NULL OR timestamp > ?2)
               AND (?3 IS NULL OR id >= ?3)
             ORDER BY timestamp ASC, id ASC",
            SELECT_COLUMNS
        ))?;

        let after = after.as_ref().map(format_ts);
        let mut rows = stmt.query(params![subject_id, after, start_id])?;
        let mut observations = Vec::new();
        while let Some(row) = rows.next()? {
            observations.push(Self::read_row(row)?);
        }
        Ok(observations)
    }

    /// Observations not yet assigned to any subject
    pub fn unassigned(&self) -> anyhow::Result<Vec<Observation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE subject_id IS NULL ORDER BY timestamp ASC, id ASC",
            SELECT_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut observations = Vec::new();
        while let Some(row) = rows.next()? {
            observations.push(Self::read_row(row)?);
        }
        Ok(observations)
    }

    /// Every observation, in id order
    pub fn all(&self) -> anyhow::Result<Vec<Observation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY id ASC", SELECT_COLUMNS))?;
        let mut rows = stmt.query([])?;
        let mut observations = Vec::new();
        while let Some(row) = rows.next()? {
            observations.push(Self::read_row(row)?);
        }
        Ok(observations)
    }

    /// Distinct subjects among observations with id >= `first_id`
    pub fn subjects_since(&self, first_id: i64) -> anyhow::Result<Vec<i64>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT subject_id FROM observations
             WHERE id >= ?1 AND subject_id IS NOT NULL ORDER BY subject_id"
        )?;
        let ids = stmt
            .query_map([first_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn count(&self) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))?)
    }

    fn read_row(row: &Row) -> anyhow::Result<Observation> {
        let timestamp: String = row.get(2)?;
        Ok(Observation {
            id: row.get(0)?,
            text: row.get(1)?,
            timestamp: parse_ts(&timestamp)?,
            subject_id: row.get(3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;
    use chrono::{Duration, TimeZone};

    fn obs(text: &str, timestamp: DateTime<Utc>, subject_id: Option<i64>) -> NewObservation {
        NewObservation { text: text.to_string(), timestamp, subject_id }
    }

    #[test]
    fn test_add_without_subject() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let id = db.observations.add(&obs("Test observation", Utc::now(), None)).unwrap();
        let stored = db.observations.get(id).unwrap().unwrap();
        assert_eq!(stored.subject_id, None);
        assert_eq!(db.observations.unassigned().unwrap().len(), 1);
    }

    #[test]
    fn test_batch_ids_follow_input_order() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = Utc::now();
        let ids = db.observations
            .add_batch(&[obs("a", now, None), obs("b", now, None), obs("c", now, None)])
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(db.observations.get(ids[1]).unwrap().unwrap().text, "b");
    }

    #[test]
    fn test_by_subject_after_is_strict_and_ordered() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let user = db.subjects.get_by_name("user").unwrap().unwrap();
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();

        db.observations.add_batch(&[
            obs("later", base + Duration::hours(2), Some(user.id)),
            obs("boundary", base, Some(user.id)),
            obs("earlier", base - Duration::hours(1), Some(user.id)),
            obs("nobody", base + Duration::hours(3), None),
        ]).unwrap();

        let all = db.observations.by_subject_after(user.id, None, None).unwrap();
        let texts: Vec<&str> = all.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, vec!["earlier", "boundary", "later"]);

        let after = db.observations.by_subject_after(user.id, Some(base), None).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].text, "later");
    }

    #[test]
    fn test_by_subject_after_respects_start_id() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let user = db.subjects.get_by_name("user").unwrap().unwrap();
        let now = Utc::now();
        let ids = db.observations
            .add_batch(&[obs("old", now, Some(user.id)), obs("new", now, Some(user.id))])
            .unwrap();
        let resumed = db.observations.by_subject_after(user.id, None, Some(ids[1])).unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].text, "new");
    }

    #[test]
    fn test_assign_subject() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let assistant = db.subjects.get_by_name("assistant").unwrap().unwrap();
        let id = db.observations.add(&obs("I learned something new", Utc::now(), None)).unwrap();

        db.observations.assign_subject(id, assistant.id).unwrap();
        assert_eq!(db.observations.get(id).unwrap().unwrap().subject_id, Some(assistant.id));
        assert_eq!(db.observations.subjects_since(id).unwrap(), vec![assistant.id]);
        assert!(db.observations.assign_subject(id + 100, assistant.id).is_err());
    }
}
