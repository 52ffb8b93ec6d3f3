//! Logging setup for the binary and for tests.

use std::io::IsTerminal;
use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Log level directive for the `rewind` crate, e.g. `debug` or `rewind=trace`.
pub const LOG_ENV_VAR: &str = "REWIND_LOG";

/// Install the stderr subscriber. Safe to call more than once.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_target(false)
            .init();
    });
}

fn env_filter() -> EnvFilter {
    let level = std::env::var(LOG_ENV_VAR).unwrap_or_else(|_| "warn".to_string());
    let directive = if level.contains('=') {
        level
    } else {
        format!("rewind={}", level)
    };
    let filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
    match filter.parse(&directive) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("ignoring invalid {}: {}", LOG_ENV_VAR, err);
            EnvFilter::default().add_directive(LevelFilter::WARN.into())
        }
    }
}
