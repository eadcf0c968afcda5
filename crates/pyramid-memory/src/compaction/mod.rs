//! Compaction pyramid: chunking, tier building and frontier selection
pub mod chunker;
pub mod pyramid;
pub mod tier_builder;

pub use chunker::{chunk_items, estimate_tokens, ChunkLimits, TokenCost, CHARS_PER_TOKEN};
pub use pyramid::{select_frontier, unsummarized_observations, Pyramid, TierMap};
pub use tier_builder::{HigherTierOptions, Tier0Options, TierBuilder, DEFAULT_MIN_COMPACTION_ITEMS};
