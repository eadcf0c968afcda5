//! Summary storage and retrieval operations
use crate::memory_db::schema::*;
use rusqlite::{params, Connection, Row};
use chrono::{DateTime, Utc};
use tracing::debug;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

const SELECT_COLUMNS: &str =
    "SELECT id, subject_id, tier, text, start_timestamp, end_timestamp FROM summaries";

pub struct SummaryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SummaryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Store one summary in its own transaction.
    ///
    /// Fails if the subject does not exist: a summary for a missing subject
    /// means something outside the engine changed the store under us.
    pub fn insert(&self, summary: &NewSummary) -> anyhow::Result<Summary> {
        if summary.start_timestamp > summary.end_timestamp {
            return Err(anyhow::anyhow!(
                "Summary range is inverted: {} > {}",
                summary.start_timestamp,
                summary.end_timestamp
            ));
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        Self::ensure_subject(&tx, summary.subject_id)?;

        debug!(
            "Storing tier {} summary for subject {} ({} to {})",
            summary.tier,
            summary.subject_id,
            summary.start_timestamp,
            summary.end_timestamp
        );

        tx.execute(
            "INSERT INTO summaries (subject_id, tier, text, start_timestamp, end_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                summary.subject_id,
                summary.tier,
                &summary.text,
                format_ts(&summary.start_timestamp),
                format_ts(&summary.end_timestamp),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Summary {
            id,
            subject_id: summary.subject_id,
            tier: summary.tier,
            text: summary.text.clone(),
            start_timestamp: summary.start_timestamp,
            end_timestamp: summary.end_timestamp,
        })
    }

    fn ensure_subject(conn: &Connection, subject_id: i64) -> anyhow::Result<()> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM subjects WHERE id = ?1)",
            [subject_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(anyhow::anyhow!(
                "Subject {} referenced by summary does not exist",
                subject_id
            ));
        }
        Ok(())
    }

    /// All summaries of a subject, ordered by tier then start
    pub fn by_subject(&self, subject_id: i64) -> anyhow::Result<Vec<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE subject_id = ?1 ORDER BY tier ASC, start_timestamp ASC, id ASC",
            SELECT_COLUMNS
        ))?;
        let mut rows = stmt.query([subject_id])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(Self::row_to_summary(row)?);
        }
        Ok(summaries)
    }

    /// Summaries of one tier whose end lies strictly after `after`
    /// (all of the tier when `None`), ordered by start
    pub fn by_subject_tier_after(
        &self,
        subject_id: i64,
        tier: u32,
        after: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE subject_id = ?1 AND tier = ?2
               AND (?3 IS NULL OR end_timestamp > ?3)
             ORDER BY start_timestamp ASC, id ASC",
            SELECT_COLUMNS
        ))?;
        let after = after.as_ref().map(format_ts);
        let mut rows = stmt.query(params![subject_id, tier, after])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(Self::row_to_summary(row)?);
        }
        Ok(summaries)
    }

    /// Latest end timestamp at a tier: the coverage watermark for the tier below
    pub fn latest_end(&self, subject_id: i64, tier: u32) -> anyhow::Result<Option<DateTime<Utc>>> {
        let conn = self.get_conn()?;
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(end_timestamp) FROM summaries WHERE subject_id = ?1 AND tier = ?2",
            params![subject_id, tier],
            |row| row.get(0),
        )?;
        latest.as_deref().map(parse_ts).transpose()
    }

    /// Every summary, in id order
    pub fn all(&self) -> anyhow::Result<Vec<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY id ASC", SELECT_COLUMNS))?;
        let mut rows = stmt.query([])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(Self::row_to_summary(row)?);
        }
        Ok(summaries)
    }

    pub fn count(&self) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM summaries", [], |row| row.get(0))?)
    }

    fn row_to_summary(row: &Row) -> anyhow::Result<Summary> {
        let start: String = row.get(4)?;
        let end: String = row.get(5)?;
        Ok(Summary {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            tier: row.get(2)?,
            text: row.get(3)?,
            start_timestamp: parse_ts(&start)?,
            end_timestamp: parse_ts(&end)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;
    use chrono::{Duration, TimeZone};

    fn new_summary(subject_id: i64, tier: u32, start: DateTime<Utc>, end: DateTime<Utc>) -> NewSummary {
        NewSummary {
            subject_id,
            tier,
            text: format!("Tier {}", tier),
            start_timestamp: start,
            end_timestamp: end,
        }
    }

    #[test]
    fn test_insert_and_read_back() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let assistant = db.subjects.get_by_name("assistant").unwrap().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        let stored = db.summaries.insert(&new_summary(assistant.id, 0, now, now)).unwrap();
        assert_eq!(db.summaries.by_subject(assistant.id).unwrap(), vec![stored]);
    }

    #[test]
    fn test_insert_rejects_missing_subject() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = Utc::now();
        let err = db.summaries.insert(&new_summary(9999, 0, now, now)).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert_eq!(db.summaries.count().unwrap(), 0);
    }

    #[test]
    fn test_insert_rejects_inverted_range() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let user = db.subjects.get_by_name("user").unwrap().unwrap();
        let now = Utc::now();
        assert!(db.summaries.insert(&new_summary(user.id, 0, now, now - Duration::seconds(1))).is_err());
    }

    #[test]
    fn test_latest_end_per_tier() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let user = db.subjects.get_by_name("user").unwrap().unwrap();
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(db.summaries.latest_end(user.id, 0).unwrap(), None);
        db.summaries.insert(&new_summary(user.id, 0, base, base + Duration::days(1))).unwrap();
        db.summaries.insert(&new_summary(user.id, 0, base + Duration::days(2), base + Duration::days(3))).unwrap();
        db.summaries.insert(&new_summary(user.id, 1, base, base + Duration::days(10))).unwrap();

        assert_eq!(db.summaries.latest_end(user.id, 0).unwrap(), Some(base + Duration::days(3)));
        assert_eq!(db.summaries.latest_end(user.id, 1).unwrap(), Some(base + Duration::days(10)));
        assert_eq!(db.summaries.latest_end(user.id, 2).unwrap(), None);
    }

    #[test]
    fn test_by_subject_tier_after_uses_end_timestamp() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let user = db.subjects.get_by_name("user").unwrap().unwrap();
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        db.summaries.insert(&new_summary(user.id, 0, base, base + Duration::days(1))).unwrap();
        db.summaries.insert(&new_summary(user.id, 0, base + Duration::days(2), base + Duration::days(3))).unwrap();

        let covered_to_day_one = db.summaries
            .by_subject_tier_after(user.id, 0, Some(base + Duration::days(1)))
            .unwrap();
        assert_eq!(covered_to_day_one.len(), 1);
        assert_eq!(covered_to_day_one[0].start_timestamp, base + Duration::days(2));

        assert_eq!(db.summaries.by_subject_tier_after(user.id, 0, None).unwrap().len(), 2);
        assert!(db.summaries.by_subject_tier_after(user.id, 1, None).unwrap().is_empty());
    }
}
