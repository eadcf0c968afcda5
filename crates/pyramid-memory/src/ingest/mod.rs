//! Getting conversations in: file tracking, parsing, extraction
pub mod extract;
pub mod messages;
pub mod parser;
pub mod tracker;

pub use extract::extract_observations;
pub use messages::{group_by_week, parse_timestamp, week_key, ConversationMessage, ExtractedObservation};
pub use parser::{JsonLinesParser, RecordParser};
pub use tracker::{IncrementalTracker, ScanOutcome};
