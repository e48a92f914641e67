//! Tracing bootstrap for binaries embedding this crate (`logs/logs.go`).
//!
//! A library should not force a global subscriber on its caller, so unlike
//! the teacher's two config-driven variants this exposes one `init` that
//! an application's `main` can call opt-in, honoring `RUST_LOG` first.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a process-global `fmt` subscriber. `default_level` is used
/// only when `RUST_LOG` is unset, mirroring `Logger(level)`'s fallback.
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Scoped variant for tests: installs the subscriber only for the current
/// thread and returns a guard that restores the previous one on drop.
pub fn init_scoped(default_level: &str) -> tracing::subscriber::DefaultGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_default(subscriber)
}
