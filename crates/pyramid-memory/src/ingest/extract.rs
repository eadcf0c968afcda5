//! Fan conversation chunks out to the observation extractor
use crate::capability::ObservationExtractor;
use crate::compaction::chunker::{chunk_items, ChunkLimits};
use crate::ingest::messages::{ConversationMessage, ExtractedObservation};
use crate::thread_pool::TaskRunner;
use chrono::Utc;
use tracing::{debug, info};

/// Run the extractor over `messages` in token-bounded chunks on `runner`.
///
/// Results come back flattened in message order. Every returned observation
/// carries a timestamp: the extractor's own, else the newest message
/// timestamp of its chunk, else the current time. Blank observations are
/// dropped.
pub fn extract_observations(
    messages: Vec<ConversationMessage>,
    extractor: &dyn ObservationExtractor,
    runner: &TaskRunner,
    limits: &ChunkLimits,
) -> anyhow::Result<Vec<ExtractedObservation>> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }
    let chunks = chunk_items(messages, limits);
    info!("Extracting observations from {} message chunks", chunks.len());

    let per_chunk = runner.run(
        chunks,
        |index, chunk| {
            let observations = extractor.extract(&chunk)?;
            let fallback = chunk.iter().filter_map(|m| m.timestamp).max();
            debug!("Chunk {}: {} messages, {} observations", index + 1, chunk.len(), observations.len());
            Ok(observations
                .into_iter()
                .filter(|o| !o.text.trim().is_empty())
                .map(|mut o| {
                    o.timestamp = o.timestamp.or(fallback).or_else(|| Some(Utc::now()));
                    o
                })
                .collect::<Vec<_>>())
        },
        |progress| debug!("Extraction [{}/{}]", progress.completed, progress.total),
    )?;

    Ok(per_chunk.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn messages(count: usize) -> Vec<ConversationMessage> {
        (0..count)
            .map(|i| ConversationMessage {
                role: if i % 2 == 0 { "user".into() } else { "assistant".into() },
                content: format!("message {}", i),
                timestamp: Some(at(i as i64)),
            })
            .collect()
    }

    fn echo(messages: &[ConversationMessage]) -> anyhow::Result<Vec<ExtractedObservation>> {
        Ok(messages
            .iter()
            .map(|m| ExtractedObservation {
                text: format!("saw {}", m.content),
                timestamp: None,
                subject: Some(m.role.clone()),
            })
            .collect())
    }

    #[test]
    fn test_results_keep_message_order() {
        let observations = extract_observations(
            messages(23),
            &echo,
            &TaskRunner::new(4),
            &ChunkLimits::new(5, 100_000),
        )
        .unwrap();

        assert_eq!(observations.len(), 23);
        let texts: Vec<String> = observations.iter().map(|o| o.text.clone()).collect();
        let expected: Vec<String> = (0..23).map(|i| format!("saw message {}", i)).collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn test_missing_timestamp_takes_chunk_latest() {
        let observations = extract_observations(
            messages(10),
            &echo,
            &TaskRunner::new(2),
            &ChunkLimits::new(5, 100_000),
        )
        .unwrap();

        assert_eq!(observations[0].timestamp, Some(at(4)));
        assert_eq!(observations[9].timestamp, Some(at(9)));
    }

    #[test]
    fn test_blank_and_dated_observations() {
        let extractor = |_: &[ConversationMessage]| -> anyhow::Result<Vec<ExtractedObservation>> {
            Ok(vec![
                ExtractedObservation { text: "  ".into(), timestamp: None, subject: None },
                ExtractedObservation { text: "dated".into(), timestamp: Some(at(-60)), subject: None },
            ])
        };
        let undated = vec![ConversationMessage { role: "user".into(), content: "hi".into(), timestamp: None }];
        let before = Utc::now();
        let observations = extract_observations(undated, &extractor, &TaskRunner::new(1), &ChunkLimits::default()).unwrap();

        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].timestamp, Some(at(-60)));

        let fallback = |_: &[ConversationMessage]| -> anyhow::Result<Vec<ExtractedObservation>> {
            Ok(vec![ExtractedObservation { text: "undated".into(), timestamp: None, subject: None }])
        };
        let undated = vec![ConversationMessage { role: "user".into(), content: "hi".into(), timestamp: None }];
        let observations = extract_observations(undated, &fallback, &TaskRunner::new(1), &ChunkLimits::default()).unwrap();
        assert!(observations[0].timestamp.unwrap() >= before);
    }

    #[test]
    fn test_extractor_error_propagates() {
        let failing = |_: &[ConversationMessage]| -> anyhow::Result<Vec<ExtractedObservation>> {
            anyhow::bail!("service unavailable")
        };
        let err = extract_observations(messages(3), &failing, &TaskRunner::new(2), &ChunkLimits::default())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("service unavailable"));
    }

    #[test]
    fn test_empty_input() {
        let observations = extract_observations(Vec::new(), &echo, &TaskRunner::new(2), &ChunkLimits::default()).unwrap();
        assert!(observations.is_empty());
    }
}
