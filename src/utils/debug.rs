//! Logging setup.
//!
//! Log lines go to stderr. `RUST_LOG`, when set, replaces the default filter
//! entirely; otherwise the relay logs at info, or debug when asked.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Presence of this variable turns on debug logging, like `-d`.
pub const NSRELAY_DEBUG_ENV: &str = "NSRELAY_DEBUG";

fn default_filter(debug: bool) -> EnvFilter {
    let level = if debug { "debug" } else { "info" };
    EnvFilter::new(format!("nsrelay={},warn", level))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// only update the debug flag.
pub fn init_debug_logging(force_debug: bool) {
    let debug_enabled = force_debug || std::env::var_os(NSRELAY_DEBUG_ENV).is_some();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(debug_enabled));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug_enabled)
        .with_thread_ids(debug_enabled)
        .try_init();
}

/// Whether debug logging was requested.
pub fn is_debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::SeqCst)
}
