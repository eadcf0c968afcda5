//! Top-level orchestration: import, summarize, embed and incremental sync
use crate::capability::{Embedder, ObservationExtractor, Summarizer};
use crate::compaction::pyramid::Pyramid;
use crate::compaction::tier_builder::{Tier0Options, TierBuilder};
use crate::config::Config;
use crate::embedding::EmbeddingIndexer;
use crate::ingest::extract::extract_observations;
use crate::ingest::messages::{group_by_week, ConversationMessage, ExtractedObservation};
use crate::ingest::parser::RecordParser;
use crate::ingest::tracker::IncrementalTracker;
use crate::memory_db::{MemoryDatabase, NewObservation, Summary};
use crate::thread_pool::TaskRunner;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub weeks: usize,
    pub messages: usize,
    pub observations: usize,
    pub tier0_summaries: usize,
    pub higher_summaries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatReport {
    pub changed_files: usize,
    pub new_messages: usize,
    pub skipped_lines: usize,
    pub observations: usize,
    pub tier0_summaries: usize,
    pub higher_summaries: usize,
    pub embedded: usize,
    /// Subjects that received new observations in this run
    pub affected_subjects: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SummarizeOptions {
    pub start_id: Option<i64>,
    pub max_observations: Option<usize>,
    /// Overrides the configured ceiling when set
    pub max_tier: Option<u32>,
    /// Drop existing summaries and subject assignments first
    pub clean: bool,
}

pub struct PyramidEngine {
    config: Config,
    db: MemoryDatabase,
    tracker: IncrementalTracker,
}

impl PyramidEngine {
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let db = MemoryDatabase::open(&config.db_path, config.embedding_dim)?;
        Ok(Self::with_database(config, db))
    }

    pub fn with_database(config: Config, db: MemoryDatabase) -> Self {
        Self {
            config,
            db,
            tracker: IncrementalTracker::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    fn runner(&self) -> TaskRunner {
        TaskRunner::new(self.config.workers)
    }

    /// Record a single observation by hand
    pub fn observe(&self, text: &str, subject: Option<&str>) -> anyhow::Result<i64> {
        let subject_id = match subject.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => Some(self.db.subjects.get_or_create(name, None)?.id),
            None => None,
        };
        let id = self.db.observations.add(&NewObservation {
            text: text.to_string(),
            timestamp: Utc::now(),
            subject_id,
        })?;
        info!("Added observation #{}", id);
        Ok(id)
    }

    /// Persist extracted observations in one transaction, resolving subject
    /// names along the way. Returns the id of the first stored row.
    pub fn store_observations(&self, extracted: Vec<ExtractedObservation>) -> anyhow::Result<Option<i64>> {
        let rows = self.resolve_subjects(extracted)?;
        let ids = self.db.observations.add_batch(&rows)?;
        Ok(ids.first().copied())
    }

    fn resolve_subjects(&self, extracted: Vec<ExtractedObservation>) -> anyhow::Result<Vec<NewObservation>> {
        let mut subject_ids: HashMap<String, i64> = HashMap::new();
        let mut rows = Vec::with_capacity(extracted.len());

        for observation in extracted {
            let subject_id = match observation.subject.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(name) => match subject_ids.get(name) {
                    Some(id) => Some(*id),
                    None => {
                        let id = self.db.subjects.get_or_create(name, None)?.id;
                        subject_ids.insert(name.to_string(), id);
                        Some(id)
                    }
                },
                None => None,
            };
            rows.push(NewObservation {
                text: observation.text,
                timestamp: observation.timestamp.unwrap_or_else(Utc::now),
                subject_id,
            });
        }
        Ok(rows)
    }

    /// Bulk import: extract week by week, optionally building tier 0 after
    /// each week and the higher tiers once at the end.
    pub fn import_messages(
        &self,
        messages: Vec<ConversationMessage>,
        extractor: &dyn ObservationExtractor,
        summarizer: Option<&dyn Summarizer>,
    ) -> anyhow::Result<ImportReport> {
        let mut report = ImportReport { messages: messages.len(), ..Default::default() };
        if messages.is_empty() {
            info!("No messages to process");
            return Ok(report);
        }

        let by_week = group_by_week(messages);
        report.weeks = by_week.len();
        info!("Processing {} weeks...", by_week.len());

        let runner = self.runner();
        let limits = self.config.chunk_limits();
        for (week, week_messages) in by_week {
            info!("{}: {} messages", week, week_messages.len());
            let extracted = extract_observations(week_messages, extractor, &runner, &limits)?;
            let count = extracted.len();
            self.store_observations(extracted)?;
            report.observations += count;
            info!("{}: saved {} observations", week, count);

            if let Some(summarizer) = summarizer {
                let builder = TierBuilder::new(&self.db, summarizer, limits);
                report.tier0_summaries += builder.build_tier0(&self.config.tier0_options(None))?;
            }
        }

        if let Some(summarizer) = summarizer {
            let builder = TierBuilder::new(&self.db, summarizer, limits);
            report.higher_summaries = builder.build_higher_tiers(&self.config.higher_tier_options())?;
        }

        info!(
            "Imported {} observations from {} messages ({} tier 0, {} higher summaries)",
            report.observations, report.messages, report.tier0_summaries, report.higher_summaries
        );
        Ok(report)
    }

    /// Build every tier that has pending material.
    ///
    /// `clean` rebuilds the pyramid from scratch; observations keep the
    /// subjects they were extracted with.
    pub fn summarize(&self, summarizer: &dyn Summarizer, options: &SummarizeOptions) -> anyhow::Result<(usize, usize)> {
        if options.clean {
            self.db.reset_summaries()?;
        }
        let loose = self.db.observations.unassigned()?.len();
        if loose > 0 {
            warn!("{} observations have no subject and will not be summarized", loose);
        }

        let tier0 = Tier0Options {
            start_id: options.start_id,
            max_observations: options.max_observations,
            workers: self.config.workers,
        };
        let mut higher = self.config.higher_tier_options();
        if options.max_tier.is_some() {
            higher.max_tier = options.max_tier;
        }
        TierBuilder::new(&self.db, summarizer, self.config.chunk_limits()).build_all(&tier0, &higher)
    }

    pub fn embed(&self, embedder: &dyn Embedder, force: bool) -> anyhow::Result<usize> {
        EmbeddingIndexer::new(&self.db, embedder, self.config.embed_limits(), self.config.workers)
            .embed_pending(force)
    }

    /// One incremental sync pass over `source`.
    ///
    /// New observations are stored in the same transaction as the
    /// watermarks of the files they came from. The builders and the
    /// embedding pass run on every heartbeat, so work left unfinished by a
    /// failed pass is completed by the next one without re-reading input.
    pub fn heartbeat<P>(
        &self,
        source: &Path,
        extractor: &dyn ObservationExtractor,
        summarizer: &dyn Summarizer,
        parser: &P,
        embedder: Option<&dyn Embedder>,
    ) -> anyhow::Result<HeartbeatReport>
    where
        P: RecordParser<Item = ConversationMessage>,
    {
        let previous = self.db.watermarks.load_all()?;
        let outcome = self.tracker.scan(source, &previous, parser)?;

        let mut report = HeartbeatReport {
            changed_files: outcome.changed_files.len(),
            new_messages: outcome.items.len(),
            skipped_lines: outcome.skipped_lines,
            ..Default::default()
        };
        if outcome.has_changes() {
            info!(
                "Heartbeat: {} changed files, {} new messages",
                report.changed_files, report.new_messages
            );
        } else {
            debug!("No changes detected");
        }
        if report.skipped_lines > 0 {
            warn!("Skipped {} unreadable lines", report.skipped_lines);
        }

        let limits = self.config.chunk_limits();
        if !outcome.items.is_empty() {
            let mut messages = outcome.items;
            messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

            let extracted = extract_observations(messages, extractor, &self.runner(), &limits)?;
            report.observations = extracted.len();
            let rows = self.resolve_subjects(extracted)?;
            let ids = self.db.record_import(&rows, &outcome.watermarks)?;
            info!("Extracted {} observations", report.observations);

            if let Some(first_id) = ids.first() {
                report.affected_subjects = self.db.observations.subjects_since(*first_id)?;
            }
        } else if outcome.has_changes() {
            self.db.watermarks.upsert_all(&outcome.watermarks)?;
            info!("No new messages to process");
        }

        let builder = TierBuilder::new(&self.db, summarizer, limits);
        report.tier0_summaries = builder.build_tier0(&self.config.tier0_options(None))?;
        report.higher_summaries = builder.build_higher_tiers(&self.config.higher_tier_options())?;

        if let Some(embedder) = embedder {
            report.embedded = self.embed(embedder, false)?;
        }

        info!(
            "Heartbeat done: {} observations, {} tier 0 and {} higher summaries, {} embedded",
            report.observations, report.tier0_summaries, report.higher_summaries, report.embedded
        );
        Ok(report)
    }

    /// Treat everything currently in `source` as imported
    pub fn mark_imported(&self, source: &Path) -> anyhow::Result<usize> {
        let snapshot = self.tracker.snapshot(source)?;
        let tracked = self.db.watermarks.upsert_all(&snapshot)?;
        info!("Tracked {} session files for incremental sync", tracked);
        Ok(tracked)
    }

    /// The non-overlapping timeline view of a subject, by name
    pub fn frontier(&self, subject: &str) -> anyhow::Result<Vec<Summary>> {
        let subject = self
            .db
            .subjects
            .get_by_name(subject)?
            .ok_or_else(|| anyhow::anyhow!("Unknown subject '{}'", subject))?;
        let pyramid = Pyramid::load(&self.db, subject.id)?;
        Ok(pyramid.frontier().into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{SourceItem, TierContext};
    use crate::ingest::parse_timestamp;

    fn test_engine() -> PyramidEngine {
        let config = Config {
            workers: 2,
            chunk_items: 5,
            min_compaction_items: 3,
            embedding_dim: 2,
            ..Config::default()
        };
        let db = MemoryDatabase::new_in_memory_with_dimension(2).unwrap();
        PyramidEngine::with_database(config, db)
    }

    fn message(content: &str, timestamp: &str) -> ConversationMessage {
        ConversationMessage {
            role: "user".into(),
            content: content.into(),
            timestamp: parse_timestamp(timestamp),
        }
    }

    fn per_message(messages: &[ConversationMessage]) -> anyhow::Result<Vec<ExtractedObservation>> {
        Ok(messages
            .iter()
            .map(|m| ExtractedObservation {
                text: format!("user said {}", m.content),
                timestamp: m.timestamp,
                subject: Some(m.role.clone()),
            })
            .collect())
    }

    fn labeler(items: &[SourceItem], context: &TierContext) -> anyhow::Result<String> {
        Ok(format!("tier {} over {} items", context.tier, items.len()))
    }

    #[test]
    fn test_observe_resolves_subject() {
        let engine = test_engine();
        let id = engine.observe("prefers tabs", Some("  coding style ")).unwrap();
        let stored = engine.database().observations.get(id).unwrap().unwrap();
        let subject = engine.database().subjects.get_by_name("coding style").unwrap().unwrap();
        assert_eq!(stored.subject_id, Some(subject.id));

        let loose = engine.observe("stray fact", None).unwrap();
        assert_eq!(engine.database().observations.get(loose).unwrap().unwrap().subject_id, None);
    }

    #[test]
    fn test_import_messages_by_week() {
        let engine = test_engine();
        let mut messages = Vec::new();
        for day in 6..=19u32 {
            messages.push(message(&format!("day {}", day), &format!("2025-01-{:02}T09:00:00Z", day)));
        }

        let report = engine.import_messages(messages, &per_message, Some(&labeler)).unwrap();
        assert_eq!(report.weeks, 2);
        assert_eq!(report.messages, 14);
        assert_eq!(report.observations, 14);
        // 7 per week in chunks of 5
        assert_eq!(report.tier0_summaries, 4);
        assert_eq!(report.higher_summaries, 1);

        let frontier = engine.frontier("user").unwrap();
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier[0].tier, 1);
    }

    #[test]
    fn test_import_without_summarizer_only_stores() {
        let engine = test_engine();
        let report = engine
            .import_messages(vec![message("hi", "2025-01-06T09:00:00Z")], &per_message, None)
            .unwrap();
        assert_eq!(report.observations, 1);
        assert_eq!(report.tier0_summaries, 0);
        assert_eq!(engine.database().summaries.count().unwrap(), 0);
    }

    #[test]
    fn test_summarize_clean_rebuilds() {
        let engine = test_engine();
        for i in 0..4 {
            engine.observe(&format!("fact {}", i), Some("user")).unwrap();
        }
        engine.observe("pasta night", Some("cooking")).unwrap();
        let first = engine.summarize(&labeler, &SummarizeOptions::default()).unwrap();
        assert_eq!(first, (2, 0));
        assert_eq!(engine.summarize(&labeler, &SummarizeOptions::default()).unwrap(), (0, 0));

        let rebuilt = engine
            .summarize(&labeler, &SummarizeOptions { clean: true, ..Default::default() })
            .unwrap();
        assert_eq!(rebuilt, (2, 0));
        assert_eq!(engine.database().summaries.count().unwrap(), 2);
        assert_eq!(engine.frontier("user").unwrap().len(), 1);
        assert_eq!(engine.frontier("cooking").unwrap()[0].text, "tier 0 over 1 items");
    }

    #[test]
    fn test_frontier_unknown_subject() {
        let engine = test_engine();
        assert!(engine.frontier("nobody").is_err());
        assert!(engine.frontier("assistant").unwrap().is_empty());
    }
}
