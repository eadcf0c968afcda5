// pyramid-memory/crates/pyramid-memory/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Used when `RUST_LOG` is unset: run milestones from the engine, builders
/// and tracker, without per-chunk detail.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Install the global fmt subscriber for engine runs.
///
/// Lines carry the emitting thread's name: anything a capability logs from
/// inside a pool task reads as `pyramid-worker-N`, while progress, commits
/// and tier counts come from the calling thread. Safe to call more than
/// once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_thread_names(true)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
