// pyramid-memory/crates/pyramid-memory/src/lib.rs

pub mod capability;
pub mod compaction;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod ingest;
pub mod memory_db;
pub mod telemetry;
pub mod thread_pool;

// Public API exports
pub use capability::{Embedder, ObservationExtractor, SourceItem, Summarizer, TierContext};
pub use compaction::{
    chunk_items, select_frontier, unsummarized_observations, ChunkLimits, HigherTierOptions, Pyramid,
    Tier0Options, TierBuilder, TokenCost,
};
pub use config::Config;
pub use embedding::{enrich_for_embedding, EmbeddingIndexer};
pub use engine::{HeartbeatReport, ImportReport, PyramidEngine, SummarizeOptions};
pub use ingest::{
    extract_observations, ConversationMessage, ExtractedObservation, IncrementalTracker, JsonLinesParser,
    RecordParser, ScanOutcome,
};
pub use memory_db::MemoryDatabase;
pub use thread_pool::{TaskProgress, TaskRunner};
