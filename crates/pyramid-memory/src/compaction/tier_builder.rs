//! Builds tier-0 summaries from observations and tier-N+1 summaries from tier N
use crate::capability::{SourceItem, Summarizer, TierContext};
use crate::compaction::chunker::{chunk_items, ChunkLimits};
use crate::memory_db::{MemoryDatabase, NewSummary, Observation, Subject, Summary};
use crate::thread_pool::{TaskProgress, TaskRunner, DEFAULT_WORKERS};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Default number of uncovered items a subject needs before a tier is built
pub const DEFAULT_MIN_COMPACTION_ITEMS: usize = 10;

/// Below this a tier cannot shrink its input
pub const MIN_COMPACTION_FLOOR: usize = 2;

#[derive(Debug, Clone)]
pub struct Tier0Options {
    /// Ignore observations with a smaller id (resume point for incremental runs)
    pub start_id: Option<i64>,
    /// Per-subject cap, for test runs
    pub max_observations: Option<usize>,
    pub workers: usize,
}

impl Default for Tier0Options {
    fn default() -> Self {
        Self {
            start_id: None,
            max_observations: None,
            workers: DEFAULT_WORKERS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HigherTierOptions {
    /// Highest tier to build, inclusive
    pub max_tier: Option<u32>,
    pub min_compaction_items: usize,
    pub workers: usize,
}

impl Default for HigherTierOptions {
    fn default() -> Self {
        Self {
            max_tier: None,
            min_compaction_items: DEFAULT_MIN_COMPACTION_ITEMS,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// One summarization call: a chunk of one subject's material
struct ChunkJob {
    context: TierContext,
    items: Vec<SourceItem>,
}

pub struct TierBuilder<'a> {
    db: &'a MemoryDatabase,
    summarizer: &'a dyn Summarizer,
    limits: ChunkLimits,
}

impl<'a> TierBuilder<'a> {
    pub fn new(db: &'a MemoryDatabase, summarizer: &'a dyn Summarizer, limits: ChunkLimits) -> Self {
        Self { db, summarizer, limits }
    }

    /// Summarize every subject's observations newer than its latest tier-0
    /// summary. Returns the number of tier-0 summaries created.
    pub fn build_tier0(&self, options: &Tier0Options) -> anyhow::Result<usize> {
        let subjects = self.subjects()?;

        let mut pending: BTreeMap<i64, Vec<Observation>> = BTreeMap::new();
        for subject_id in subjects.keys() {
            let covered = self.db.summaries.latest_end(*subject_id, 0)?;
            let mut observations = self
                .db
                .observations
                .by_subject_after(*subject_id, covered, options.start_id)?;
            if let Some(cap) = options.max_observations {
                observations.truncate(cap);
            }
            if !observations.is_empty() {
                pending.insert(*subject_id, observations);
            }
        }

        if pending.is_empty() {
            debug!("Tier 0: nothing to summarize");
            return Ok(0);
        }

        let mut jobs = Vec::new();
        for (subject_id, observations) in pending {
            let items: Vec<SourceItem> = observations
                .into_iter()
                .map(|o| SourceItem { text: o.text, start: o.timestamp, end: o.timestamp })
                .collect();
            let context = Self::context(&subjects[&subject_id], 0);
            jobs.extend(
                chunk_items(items, &self.limits)
                    .into_iter()
                    .map(|items| ChunkJob { context: context.clone(), items }),
            );
        }

        self.run_jobs(0, jobs, options.workers)
    }

    /// Compact tier N into tier N+1 for N = 0, 1, ... until no subject has
    /// enough uncovered material or `max_tier` is passed.
    ///
    /// A subject also stops climbing when chunking would not shrink its
    /// material, so every built tier is strictly smaller than the one below.
    pub fn build_higher_tiers(&self, options: &HigherTierOptions) -> anyhow::Result<usize> {
        if options.min_compaction_items < MIN_COMPACTION_FLOOR {
            anyhow::bail!(
                "min_compaction_items must be at least {}, got {}",
                MIN_COMPACTION_FLOOR,
                options.min_compaction_items
            );
        }

        let subjects = self.subjects()?;
        let mut active: BTreeSet<i64> = subjects.keys().copied().collect();
        let mut created = 0;
        let mut tier = 1u32;

        while !active.is_empty() {
            if options.max_tier.is_some_and(|max| tier > max) {
                break;
            }

            let mut pending: BTreeMap<i64, Vec<Summary>> = BTreeMap::new();
            for subject_id in active.clone() {
                let covered = self.db.summaries.latest_end(subject_id, tier)?;
                let uncovered = self
                    .db
                    .summaries
                    .by_subject_tier_after(subject_id, tier - 1, covered)?;
                if uncovered.len() < options.min_compaction_items {
                    active.remove(&subject_id);
                } else {
                    pending.insert(subject_id, uncovered);
                }
            }

            let mut jobs = Vec::new();
            for (subject_id, summaries) in pending {
                let consumed = summaries.len();
                debug!(
                    "Tier {}: subject {} has {} uncovered tier {} summaries",
                    tier,
                    subject_id,
                    consumed,
                    tier - 1
                );
                let items: Vec<SourceItem> = summaries
                    .into_iter()
                    .map(|s| SourceItem { text: s.text, start: s.start_timestamp, end: s.end_timestamp })
                    .collect();
                let chunks = chunk_items(items, &self.limits);
                if chunks.len() >= consumed {
                    warn!(
                        "Tier {}: chunk limits put each of subject {}'s {} summaries in its own chunk, not compacting further",
                        tier, subject_id, consumed
                    );
                    active.remove(&subject_id);
                    continue;
                }
                let context = Self::context(&subjects[&subject_id], tier);
                jobs.extend(chunks.into_iter().map(|items| ChunkJob { context: context.clone(), items }));
            }

            if jobs.is_empty() {
                break;
            }

            created += self.run_jobs(tier, jobs, options.workers)?;
            tier += 1;
        }

        Ok(created)
    }

    /// Tier 0 followed by every higher tier: `(tier0_created, higher_created)`
    pub fn build_all(
        &self,
        tier0: &Tier0Options,
        higher: &HigherTierOptions,
    ) -> anyhow::Result<(usize, usize)> {
        let tier0_created = self.build_tier0(tier0)?;
        let higher_created = self.build_higher_tiers(higher)?;
        Ok((tier0_created, higher_created))
    }

    fn subjects(&self) -> anyhow::Result<BTreeMap<i64, Subject>> {
        Ok(self
            .db
            .subjects
            .list()?
            .into_iter()
            .map(|s| (s.id, s))
            .collect())
    }

    fn context(subject: &Subject, tier: u32) -> TierContext {
        TierContext {
            subject_id: subject.id,
            subject_name: subject.name.clone(),
            subject_description: subject.description.clone(),
            tier,
        }
    }

    /// Summarize all chunks on the pool and store each result in submission
    /// order, so a (subject, tier) never gets a summary ahead of an earlier
    /// chunk that failed.
    fn run_jobs(&self, tier: u32, jobs: Vec<ChunkJob>, workers: usize) -> anyhow::Result<usize> {
        let total = jobs.len();
        info!("Tier {}: summarizing {} chunks with {} workers", tier, total, workers);

        let summarizer = self.summarizer;
        let results = TaskRunner::new(workers).run_committing(
            jobs,
            |_, job| {
                let text = summarizer.summarize(&job.items, &job.context)?;
                Ok(summary_for(&job, text))
            },
            |_, summary| {
                self.db.summaries.insert(summary)?;
                Ok(())
            },
            |progress: TaskProgress| {
                debug!("Tier {}: [{}/{}] chunks", tier, progress.completed, progress.total);
            },
        )?;

        info!("Tier {}: created {} summaries", tier, results.len());
        Ok(results.len())
    }
}

fn summary_for(job: &ChunkJob, text: String) -> NewSummary {
    let start = job.items.iter().map(|i| i.start).min();
    let end = job.items.iter().map(|i| i.end).max();
    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        // chunks are never empty
        _ => (chrono::Utc::now(), chrono::Utc::now()),
    };
    NewSummary {
        subject_id: job.context.subject_id,
        tier: job.context.tier,
        text,
        start_timestamp: start,
        end_timestamp: end,
    }
}
