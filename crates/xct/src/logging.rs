//! Tracing setup for the `xct` binary

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter (falls back to `RUST_LOG`).
pub const LOG_ENV: &str = "XCT_LOG";

/// Filter directive for a `-v` count when no environment filter is set.
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    }
}

fn filter(verbose: u8) -> EnvFilter {
    let from_env = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .filter(|value| !value.is_empty());
    match from_env {
        Some(directives) if verbose == 0 => {
            EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(default_directive(0)))
        }
        _ => EnvFilter::new(default_directive(verbose)),
    }
}

/// Install the global subscriber, writing to stderr.
///
/// In launcher mode stderr is the target's stderr, so the default level
/// stays quiet.
pub fn init(verbose: u8) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_target(verbose > 1)
        .with_writer(std::io::stderr)
        .try_init();
}
