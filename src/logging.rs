//! Logging: one-time `tracing_subscriber` initialization to stderr, so the
//! framed stdio protocol's stdout stream stays clean.

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber. `debug` raises the default
/// filter directive from `info` to `debug` when `RUST_LOG` is unset;
/// `RUST_LOG`, when set, always wins.
pub fn init(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
