//! Database schema definitions for the pyramid memory store
use serde::{Deserialize, Serialize};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

/// Subjects seeded at initialization; never removed by a reset.
pub const BUILTIN_SUBJECTS: &[&str] = &["assistant", "user"];

/// A named partition of memory (a person, the assistant itself, or a topic)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_builtin: bool,
}

/// An atomic fact extracted from conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub id: i64,
    pub text: String,
    /// When the underlying conversation event happened, not when it was extracted.
    pub timestamp: DateTime<Utc>,
    pub subject_id: Option<i64>,
}

/// Observation that has not been persisted yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewObservation {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub subject_id: Option<i64>,
}

/// A compacted artifact at some tier of the pyramid
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub id: i64,
    pub subject_id: i64,
    /// 0 = built from observations, k > 0 = built from tier k-1 summaries.
    pub tier: u32,
    pub text: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
}

/// Summary that has not been persisted yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewSummary {
    pub subject_id: i64,
    pub tier: u32,
    pub text: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
}

/// Last observed size and modification time of a tracked source file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileWatermark {
    pub size: u64,
    /// Nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
}

/// Persisted watermark row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportWatermark {
    pub file_path: String,
    pub watermark: FileWatermark,
}

/// What an embedding row points at
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    Observation,
    Summary,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Observation => "observation",
            SourceKind::Summary => "summary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "observation" => Some(SourceKind::Observation),
            "summary" => Some(SourceKind::Summary),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub id: i64,
    pub source_kind: SourceKind,
    pub source_id: i64,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub total_subjects: i64,
    pub total_observations: i64,
    pub unassigned_observations: i64,
    pub total_summaries: i64,
    pub max_tier: Option<u32>,
    pub total_embeddings: i64,
    pub tracked_files: i64,
    pub database_size_bytes: i64,
}

/// Rows removed by a bulk reset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetStats {
    pub observations: usize,
    pub summaries: usize,
    pub subjects: usize,
    pub embeddings: usize,
}

/// Formats a timestamp as fixed-width RFC 3339 UTC (microseconds, `Z`).
///
/// Every timestamp column uses this form so that SQL string comparison is
/// chronological comparison.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow::anyhow!("Failed to parse timestamp '{}': {}", value, e))?
        .with_timezone(&Utc))
}
