//! Keeps the vector index in step with observations and summaries
use crate::capability::Embedder;
use crate::compaction::chunker::{chunk_items, estimate_tokens, ChunkLimits, TokenCost};
use crate::memory_db::{MemoryDatabase, SourceKind};
use crate::thread_pool::TaskRunner;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Prefix `text` with the date (or date range) it describes, so vectors of
/// otherwise similar facts from different periods stay apart.
pub fn enrich_for_embedding(text: &str, start: &DateTime<Utc>, end: Option<&DateTime<Utc>>) -> String {
    let start_day = start.format("%Y-%m-%d").to_string();
    match end.map(|e| e.format("%Y-%m-%d").to_string()) {
        Some(end_day) if end_day != start_day => format!("[{} to {}] {}", start_day, end_day, text),
        _ => format!("[{}] {}", start_day, text),
    }
}

#[derive(Debug, Clone)]
struct PendingEmbedding {
    kind: SourceKind,
    source_id: i64,
    text: String,
}

impl TokenCost for PendingEmbedding {
    fn token_cost(&self) -> usize {
        estimate_tokens(&self.text)
    }
}

pub struct EmbeddingIndexer<'a> {
    db: &'a MemoryDatabase,
    embedder: &'a dyn Embedder,
    limits: ChunkLimits,
    workers: usize,
}

impl<'a> EmbeddingIndexer<'a> {
    pub fn new(db: &'a MemoryDatabase, embedder: &'a dyn Embedder, limits: ChunkLimits, workers: usize) -> Self {
        Self { db, embedder, limits, workers }
    }

    /// Embed every observation and summary that has no vector yet.
    ///
    /// `force` drops the whole index first. Batches are bounded by the token
    /// budget and stored in submission order, one transaction per batch.
    /// Returns the number of items embedded.
    pub fn embed_pending(&self, force: bool) -> anyhow::Result<usize> {
        if force {
            self.db.embeddings.clear()?;
        }
        let existing = self.db.embeddings.existing_keys()?;

        let mut pending = Vec::new();
        for observation in self.db.observations.all()? {
            if existing.contains(&(SourceKind::Observation, observation.id)) || observation.text.trim().is_empty() {
                continue;
            }
            pending.push(PendingEmbedding {
                kind: SourceKind::Observation,
                source_id: observation.id,
                text: enrich_for_embedding(&observation.text, &observation.timestamp, None),
            });
        }
        for summary in self.db.summaries.all()? {
            if existing.contains(&(SourceKind::Summary, summary.id)) || summary.text.trim().is_empty() {
                continue;
            }
            pending.push(PendingEmbedding {
                kind: SourceKind::Summary,
                source_id: summary.id,
                text: enrich_for_embedding(&summary.text, &summary.start_timestamp, Some(&summary.end_timestamp)),
            });
        }

        if pending.is_empty() {
            debug!("Embedding index is up to date");
            return Ok(0);
        }

        let total = pending.len();
        let batches = chunk_items(pending, &self.limits);
        info!("Embedding {} items in {} batches", total, batches.len());

        let embedder = self.embedder;
        let mut embedded = 0;
        TaskRunner::new(self.workers).run_committing(
            batches,
            |index, batch| {
                let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
                let vectors = embedder.embed(&texts)?;
                if vectors.len() != batch.len() {
                    anyhow::bail!(
                        "Embedder returned {} vectors for {} texts in batch {}",
                        vectors.len(),
                        batch.len(),
                        index + 1
                    );
                }
                let keys: Vec<(SourceKind, i64)> = batch.iter().map(|p| (p.kind, p.source_id)).collect();
                Ok((keys, vectors))
            },
            |_, (keys, vectors)| {
                embedded += self.db.embeddings.store_batch(keys, vectors)?;
                Ok(())
            },
            |progress| debug!("Embedding [{}/{}] batches", progress.completed, progress.total),
        )?;

        info!("Embedded {} items", embedded);
        Ok(embedded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{NewObservation, NewSummary};
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, d, 8, 0, 0).unwrap()
    }

    fn fake_embed(texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
    }

    fn seed(db: &MemoryDatabase) {
        let user = db.subjects.get_by_name("user").unwrap().unwrap();
        db.observations.add_batch(&[
            NewObservation { text: "likes tea".into(), timestamp: day(2), subject_id: Some(user.id) },
            NewObservation { text: "   ".into(), timestamp: day(3), subject_id: Some(user.id) },
            NewObservation { text: "owns a cat".into(), timestamp: day(4), subject_id: None },
        ]).unwrap();
        db.summaries.insert(&NewSummary {
            subject_id: user.id,
            tier: 0,
            text: "tea drinker".into(),
            start_timestamp: day(2),
            end_timestamp: day(4),
        }).unwrap();
    }

    #[test]
    fn test_enrichment_prefix() {
        assert_eq!(enrich_for_embedding("x", &day(2), None), "[2025-01-02] x");
        assert_eq!(enrich_for_embedding("x", &day(2), Some(&day(2))), "[2025-01-02] x");
        assert_eq!(enrich_for_embedding("x", &day(2), Some(&day(9))), "[2025-01-02 to 2025-01-09] x");
    }

    #[test]
    fn test_embeds_only_missing_non_blank_items() {
        let db = MemoryDatabase::new_in_memory_with_dimension(2).unwrap();
        seed(&db);
        let indexer = EmbeddingIndexer::new(&db, &fake_embed, ChunkLimits::tokens_only(250_000), 2);

        assert_eq!(indexer.embed_pending(false).unwrap(), 3);
        assert_eq!(indexer.embed_pending(false).unwrap(), 0);
        assert_eq!(db.embeddings.count().unwrap(), 3);

        assert_eq!(indexer.embed_pending(true).unwrap(), 3);
        assert_eq!(db.embeddings.count().unwrap(), 3);
    }

    #[test]
    fn test_batches_follow_token_budget() {
        let db = MemoryDatabase::new_in_memory_with_dimension(2).unwrap();
        seed(&db);
        let batch_sizes = Mutex::new(Vec::new());
        let recording = |texts: &[String]| {
            batch_sizes.lock().unwrap().push(texts.len());
            fake_embed(texts)
        };
        // every enriched text is over 4 tokens on its own
        let indexer = EmbeddingIndexer::new(&db, &recording, ChunkLimits::tokens_only(4), 1);
        assert_eq!(indexer.embed_pending(false).unwrap(), 3);
        assert_eq!(batch_sizes.into_inner().unwrap(), vec![1, 1, 1]);
    }

    #[test]
    fn test_short_response_is_an_error() {
        let db = MemoryDatabase::new_in_memory_with_dimension(2).unwrap();
        seed(&db);
        let short = |_: &[String]| -> anyhow::Result<Vec<Vec<f32>>> { Ok(vec![vec![1.0, 0.0]]) };
        let indexer = EmbeddingIndexer::new(&db, &short, ChunkLimits::tokens_only(250_000), 1);
        let err = indexer.embed_pending(false).unwrap_err();
        assert!(format!("{:#}", err).contains("1 vectors for 3 texts"));
        assert_eq!(db.embeddings.count().unwrap(), 0);
    }

    #[test]
    fn test_wrong_dimension_is_an_error() {
        let db = MemoryDatabase::new_in_memory_with_dimension(3).unwrap();
        seed(&db);
        let indexer = EmbeddingIndexer::new(&db, &fake_embed, ChunkLimits::tokens_only(250_000), 1);
        assert!(indexer.embed_pending(false).is_err());
    }
}
