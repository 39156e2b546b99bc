//! Tracing initialization.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with env-filter support.
///
/// `PAGEPILOT_LOG` overrides the default filter (e.g.
/// `PAGEPILOT_LOG=pagepilot=debug`). Safe to call more than once; later
/// calls are ignored.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_env("PAGEPILOT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
