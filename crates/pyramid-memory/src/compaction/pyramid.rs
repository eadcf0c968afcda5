//! Per-subject view of the summary pyramid and its non-overlapping frontier
use crate::memory_db::{MemoryDatabase, Observation, Summary};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// Summaries grouped by tier, each tier ordered by start then id
pub type TierMap = BTreeMap<u32, Vec<Summary>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pyramid {
    pub subject_id: i64,
    pub by_tier: TierMap,
}

impl Pyramid {
    pub fn load(db: &MemoryDatabase, subject_id: i64) -> anyhow::Result<Self> {
        let summaries = db.summaries.by_subject(subject_id)?;
        debug!("Loaded {} summaries for subject {}", summaries.len(), subject_id);
        Ok(Self::from_summaries(subject_id, summaries))
    }

    pub fn from_summaries(subject_id: i64, summaries: Vec<Summary>) -> Self {
        let mut by_tier = TierMap::new();
        for summary in summaries {
            by_tier.entry(summary.tier).or_insert_with(Vec::new).push(summary);
        }
        for tier in by_tier.values_mut() {
            tier.sort_by(|a, b| {
                a.start_timestamp
                    .cmp(&b.start_timestamp)
                    .then(a.id.cmp(&b.id))
            });
        }
        Self { subject_id, by_tier }
    }

    pub fn is_empty(&self) -> bool {
        self.by_tier.is_empty()
    }

    pub fn max_tier(&self) -> Option<u32> {
        self.by_tier.keys().next_back().copied()
    }

    /// End of the newest tier-0 summary: everything up to here is compacted
    pub fn tier0_watermark(&self) -> Option<DateTime<Utc>> {
        self.by_tier
            .get(&0)
            .and_then(|tier| tier.iter().map(|s| s.end_timestamp).max())
    }

    pub fn frontier(&self) -> Vec<&Summary> {
        select_frontier(&self.by_tier)
    }
}

/// Pick the coarsest summaries that tile the timeline without overlap.
///
/// Tiers are visited from the highest down; within a tier summaries are
/// taken in start order. A summary is kept when it starts at or after the
/// end of everything kept so far, so finer tiers only fill in time the
/// coarser tiers have not reached yet.
pub fn select_frontier(by_tier: &TierMap) -> Vec<&Summary> {
    let mut frontier = Vec::new();
    let mut watermark: Option<DateTime<Utc>> = None;

    for summaries in by_tier.values().rev() {
        for summary in summaries {
            if watermark.map_or(true, |mark| summary.start_timestamp >= mark) {
                watermark = Some(match watermark {
                    Some(mark) => mark.max(summary.end_timestamp),
                    None => summary.end_timestamp,
                });
                frontier.push(summary);
            }
        }
    }
    frontier
}

/// Observations of the subject newer than the latest tier-0 summary
pub fn unsummarized_observations(
    db: &MemoryDatabase,
    subject_id: i64,
    pyramid: &Pyramid,
) -> anyhow::Result<Vec<Observation>> {
    db.observations
        .by_subject_after(subject_id, pyramid.tier0_watermark(), None)
}
