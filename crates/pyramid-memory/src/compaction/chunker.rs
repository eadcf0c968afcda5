//! Greedy batching under an item count and an estimated token budget
use serde::{Deserialize, Serialize};

/// Rough characters-per-token ratio used for every budget in the crate
pub const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// Anything the chunker can weigh
pub trait TokenCost {
    fn token_cost(&self) -> usize;
}

impl TokenCost for String {
    fn token_cost(&self) -> usize {
        estimate_tokens(self)
    }
}

impl TokenCost for str {
    fn token_cost(&self) -> usize {
        estimate_tokens(self)
    }
}

impl<T: TokenCost + ?Sized> TokenCost for &T {
    fn token_cost(&self) -> usize {
        (**self).token_cost()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLimits {
    pub max_items: usize,
    pub max_tokens: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_items: 10,
            max_tokens: 100_000,
        }
    }
}

impl ChunkLimits {
    pub fn new(max_items: usize, max_tokens: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            max_tokens,
        }
    }

    /// Token budget only; used for embedding requests
    pub fn tokens_only(max_tokens: usize) -> Self {
        Self {
            max_items: usize::MAX,
            max_tokens,
        }
    }
}

/// Split `items` into ordered chunks.
///
/// The running chunk is flushed before an item is added when it already
/// holds `max_items`, or when its token estimate plus the item's would go
/// over `max_tokens`. An item that alone exceeds the budget still gets a
/// chunk of its own.
pub fn chunk_items<T: TokenCost>(items: Vec<T>, limits: &ChunkLimits) -> Vec<Vec<T>> {
    let max_items = limits.max_items.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_tokens = 0usize;

    for item in items {
        let tokens = item.token_cost();
        let over_count = current.len() >= max_items;
        let over_budget = current_tokens.saturating_add(tokens) > limits.max_tokens;
        if !current.is_empty() && (over_count || over_budget) {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens = current_tokens.saturating_add(tokens);
        current.push(item);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Weighted(usize);

    impl TokenCost for Weighted {
        fn token_cost(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 0);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        // counted in characters, not bytes
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn test_empty_input_has_no_chunks() {
        let chunks = chunk_items(Vec::<Weighted>::new(), &ChunkLimits::default());
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_count_limit() {
        let items: Vec<Weighted> = (0..25).map(|_| Weighted(1)).collect();
        let chunks = chunk_items(items, &ChunkLimits::new(10, 1_000));
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_token_budget() {
        let items = vec![Weighted(40), Weighted(40), Weighted(40), Weighted(10)];
        let chunks = chunk_items(items, &ChunkLimits::new(10, 100));
        assert_eq!(chunks, vec![
            vec![Weighted(40), Weighted(40)],
            vec![Weighted(40), Weighted(10)],
        ]);
    }

    #[test]
    fn test_oversized_item_stands_alone() {
        let items = vec![Weighted(5), Weighted(500), Weighted(5)];
        let chunks = chunk_items(items, &ChunkLimits::new(10, 100));
        assert_eq!(chunks, vec![vec![Weighted(5)], vec![Weighted(500)], vec![Weighted(5)]]);
    }

    #[test]
    fn test_budget_is_inclusive() {
        let items = vec![Weighted(50), Weighted(50), Weighted(1)];
        let chunks = chunk_items(items, &ChunkLimits::new(10, 100));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2);
    }

    #[test]
    fn test_strings_use_char_estimate() {
        let texts = vec!["a".repeat(40), "b".repeat(40), "c".repeat(40)];
        let chunks = chunk_items(texts, &ChunkLimits::tokens_only(20));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2);
    }

    proptest! {
        #[test]
        fn prop_chunks_reproduce_input(
            weights in prop::collection::vec(0usize..200, 0..80),
            max_items in 1usize..15,
            max_tokens in 1usize..400,
        ) {
            let items: Vec<Weighted> = weights.iter().copied().map(Weighted).collect();
            let chunks = chunk_items(items.clone(), &ChunkLimits::new(max_items, max_tokens));
            let flattened: Vec<Weighted> = chunks.into_iter().flatten().collect();
            prop_assert_eq!(flattened, items);
        }

        #[test]
        fn prop_chunks_respect_bounds(
            weights in prop::collection::vec(0usize..200, 0..80),
            max_items in 1usize..15,
            max_tokens in 1usize..400,
        ) {
            let items: Vec<Weighted> = weights.into_iter().map(Weighted).collect();
            for chunk in chunk_items(items, &ChunkLimits::new(max_items, max_tokens)) {
                prop_assert!(!chunk.is_empty());
                prop_assert!(chunk.len() <= max_items);
                let tokens: usize = chunk.iter().map(|w| w.0).sum();
                prop_assert!(tokens <= max_tokens || chunk.len() == 1);
            }
        }
    }
}
