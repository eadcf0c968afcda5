// pyramid-memory/crates/pyramid-memory/src/config.rs

use crate::compaction::chunker::ChunkLimits;
use crate::compaction::tier_builder::{
    HigherTierOptions, Tier0Options, DEFAULT_MIN_COMPACTION_ITEMS, MIN_COMPACTION_FLOOR,
};
use crate::memory_db::DEFAULT_EMBEDDING_DIM;
use crate::thread_pool::DEFAULT_WORKERS;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub workers: usize,
    pub chunk_items: usize,
    pub chunk_tokens: usize,
    pub embed_batch_tokens: usize,
    pub min_compaction_items: usize,
    pub max_tier: Option<u32>,
    pub embedding_dim: usize,
    pub source_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("pyramid.db"),
            workers: DEFAULT_WORKERS,
            chunk_items: 10,
            chunk_tokens: 100_000,
            embed_batch_tokens: 250_000,
            min_compaction_items: DEFAULT_MIN_COMPACTION_ITEMS,
            max_tier: None,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            source_dir: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let config = Self::from_lookup(|key| env::var(key).ok())?;
        info!(
            "Pyramid configuration: {} workers, chunks of {} items / {} tokens, min compaction {}",
            config.workers, config.chunk_items, config.chunk_tokens, config.min_compaction_items
        );
        Ok(config)
    }

    /// Resolve every setting through `lookup`, falling back to the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let workers = match lookup("PYRAMID_WORKERS") {
            Some(value) if value.trim().eq_ignore_ascii_case("auto") => Self::auto_detect_workers(),
            Some(value) => value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("PYRAMID_WORKERS must be a number or 'auto', got '{}'", value))?
                .max(1),
            None => defaults.workers,
        };

        let max_tier = match lookup("PYRAMID_MAX_TIER") {
            Some(value) if !value.trim().is_empty() => Some(
                value
                    .trim()
                    .parse::<u32>()
                    .with_context(|| format!("PYRAMID_MAX_TIER must be a tier number, got '{}'", value))?,
            ),
            _ => None,
        };

        let min_compaction_items: usize = lookup("PYRAMID_MIN_COMPACTION")
            .unwrap_or_else(|| "10".into())
            .trim()
            .parse()
            .context("PYRAMID_MIN_COMPACTION must be a number")?;
        if min_compaction_items < MIN_COMPACTION_FLOOR {
            anyhow::bail!(
                "PYRAMID_MIN_COMPACTION must be at least {}, got {}",
                MIN_COMPACTION_FLOOR,
                min_compaction_items
            );
        }

        Ok(Self {
            db_path: lookup("PYRAMID_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            workers,
            chunk_items: lookup("PYRAMID_CHUNK_ITEMS")
                .unwrap_or_else(|| "10".into())
                .trim()
                .parse()
                .context("PYRAMID_CHUNK_ITEMS must be a number")?,
            chunk_tokens: lookup("PYRAMID_CHUNK_TOKENS")
                .unwrap_or_else(|| "100000".into())
                .trim()
                .parse()
                .context("PYRAMID_CHUNK_TOKENS must be a number")?,
            embed_batch_tokens: lookup("PYRAMID_EMBED_BATCH_TOKENS")
                .unwrap_or_else(|| "250000".into())
                .trim()
                .parse()
                .context("PYRAMID_EMBED_BATCH_TOKENS must be a number")?,
            min_compaction_items,
            max_tier,
            embedding_dim: lookup("PYRAMID_EMBEDDING_DIM")
                .unwrap_or_else(|| "1536".into())
                .trim()
                .parse()
                .context("PYRAMID_EMBEDDING_DIM must be a number")?,
            source_dir: lookup("PYRAMID_SOURCE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    /// Model calls spend most of their time waiting on the service, so the
    /// pool runs wider than the core count.
    fn auto_detect_workers() -> usize {
        let cpus = num_cpus::get();
        let workers = (cpus * 2).clamp(2, 32);
        info!("Auto-detected CPU cores: {}, using {} workers", cpus, workers);
        workers
    }

    pub fn chunk_limits(&self) -> ChunkLimits {
        ChunkLimits::new(self.chunk_items, self.chunk_tokens)
    }

    pub fn embed_limits(&self) -> ChunkLimits {
        ChunkLimits::tokens_only(self.embed_batch_tokens)
    }

    pub fn tier0_options(&self, start_id: Option<i64>) -> Tier0Options {
        Tier0Options {
            start_id,
            max_observations: None,
            workers: self.workers,
        }
    }

    pub fn higher_tier_options(&self) -> HigherTierOptions {
        HigherTierOptions {
            max_tier: self.max_tier,
            min_compaction_items: self.min_compaction_items,
            workers: self.workers,
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.db_path.display());
        info!("- Workers: {}", self.workers);
        info!("- Chunk Items: {}", self.chunk_items);
        info!("- Chunk Tokens: {}", self.chunk_tokens);
        info!("- Embed Batch Tokens: {}", self.embed_batch_tokens);
        info!("- Min Compaction Items: {}", self.min_compaction_items);
        match self.max_tier {
            Some(tier) => info!("- Max Tier: {}", tier),
            None => info!("- Max Tier: unlimited"),
        }
        info!("- Embedding Dimension: {}", self.embedding_dim);
        if let Some(dir) = &self.source_dir {
            info!("- Source: {}", dir.display());
        }
    }
}
