//! Diagnostic logging setup.
//!
//! Logs go to stderr through `tracing-subscriber`, so command output on
//! stdout stays machine-readable. `RUST_LOG` overrides the computed level.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Output format for log lines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Install the global subscriber. Safe to call more than once.
///
/// `default_level` applies when `RUST_LOG` is unset; each `verbose` step
/// raises it one notch (`warn` → `info` → `debug` → `trace`).
pub fn init(default_level: &str, verbose: u8, format: LogFormat) {
    INIT.call_once(|| {
        let level = raise_level(default_level, verbose);
        let filter = format!("site_chat={level},sitechat={level},tower_http=warn");

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false);

        let _ = match format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
    });
}

fn raise_level(base: &str, steps: u8) -> &'static str {
    const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    let start = LEVELS.iter().position(|l| *l == base).unwrap_or(1);
    LEVELS[(start + steps as usize).min(LEVELS.len() - 1)]
}
