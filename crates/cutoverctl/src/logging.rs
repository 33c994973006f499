//! Logging setup for cutoverctl
//!
//! Installed once from `main`. Logs go to stderr so command output on stdout
//! stays machine-readable.

use tracing_subscriber::EnvFilter;

/// Filter override, e.g. `CUTOVER_LOG=cutover_common=debug`
pub const LOG_ENV: &str = "CUTOVER_LOG";

pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
