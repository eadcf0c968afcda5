//! Conversation messages and what the extractor turns them into
use crate::compaction::chunker::{estimate_tokens, TokenCost};
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub const UNKNOWN_WEEK: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TokenCost for ConversationMessage {
    fn token_cost(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// One fact returned by an [`ObservationExtractor`](crate::capability::ObservationExtractor)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedObservation {
    pub text: String,
    /// Falls back to the newest message of the extraction chunk when absent
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Name of the subject the fact is about; unassigned when absent
    #[serde(default)]
    pub subject: Option<String>,
}

/// Parse the timestamp shapes conversation exports use: RFC 3339, naive
/// ISO 8601 (read as UTC) or epoch milliseconds.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    value.parse::<i64>().ok().and_then(from_epoch_millis)
}

fn from_epoch_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => parse_timestamp(&s),
        Some(serde_json::Value::Number(n)) => n.as_i64().and_then(from_epoch_millis),
        _ => None,
    })
}

/// ISO week bucket, e.g. `2025-W03`
pub fn week_key(timestamp: Option<&DateTime<Utc>>) -> String {
    match timestamp {
        Some(ts) => {
            let week = ts.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
        None => UNKNOWN_WEEK.to_string(),
    }
}

/// Messages bucketed by ISO week; the map orders weeks chronologically with
/// `unknown` last. Order within a week is preserved.
pub fn group_by_week(messages: Vec<ConversationMessage>) -> BTreeMap<String, Vec<ConversationMessage>> {
    let mut by_week: BTreeMap<String, Vec<ConversationMessage>> = BTreeMap::new();
    for message in messages {
        by_week
            .entry(week_key(message.timestamp.as_ref()))
            .or_default()
            .push(message);
    }
    by_week
}
