//! Log setup for the `pkb` binary.
//!
//! Logs go to stderr so command output on stdout stays parseable. The level
//! comes from `PKB_LOG` (falling back to `RUST_LOG`), using the usual
//! `EnvFilter` syntax, e.g. `PKB_LOG=personal_kb::tasks=debug`.

use tracing_subscriber::EnvFilter;

fn log_filter(default_level: &str) -> EnvFilter {
    let level = std::env::var("PKB_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Installs the global subscriber. `json` selects one JSON object per line.
pub fn init(default_level: &str, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_filter(default_level))
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
