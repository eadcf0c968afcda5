//! Model-backed capabilities the engine calls out to.
//!
//! The engine never talks to a model service itself. Callers hand in
//! implementations of these traits (an HTTP client, a local runtime, or a
//! closure in tests). Calls are blocking and may run concurrently on the
//! worker pool, so every implementation must be `Send + Sync`.
use crate::compaction::chunker::{estimate_tokens, TokenCost};
use crate::ingest::messages::{ConversationMessage, ExtractedObservation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One input to a summarization call: an observation or a lower-tier summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub text: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TokenCost for SourceItem {
    fn token_cost(&self) -> usize {
        estimate_tokens(&self.text)
    }
}

/// What the summarizer is being asked to produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierContext {
    pub subject_id: i64,
    pub subject_name: String,
    pub subject_description: Option<String>,
    /// Tier of the summary being written
    pub tier: u32,
}

pub trait Summarizer: Send + Sync {
    fn summarize(&self, items: &[SourceItem], context: &TierContext) -> anyhow::Result<String>;
}

pub trait Embedder: Send + Sync {
    /// One vector per input text, in input order
    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

pub trait ObservationExtractor: Send + Sync {
    fn extract(&self, messages: &[ConversationMessage]) -> anyhow::Result<Vec<ExtractedObservation>>;
}

impl<F> Summarizer for F
where
    F: Fn(&[SourceItem], &TierContext) -> anyhow::Result<String> + Send + Sync,
{
    fn summarize(&self, items: &[SourceItem], context: &TierContext) -> anyhow::Result<String> {
        self(items, context)
    }
}

impl<F> Embedder for F
where
    F: Fn(&[String]) -> anyhow::Result<Vec<Vec<f32>>> + Send + Sync,
{
    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self(texts)
    }
}

impl<F> ObservationExtractor for F
where
    F: Fn(&[ConversationMessage]) -> anyhow::Result<Vec<ExtractedObservation>> + Send + Sync,
{
    fn extract(&self, messages: &[ConversationMessage]) -> anyhow::Result<Vec<ExtractedObservation>> {
        self(messages)
    }
}
