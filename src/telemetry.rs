//! Tracing initialization.
//!
//! Console-only `tracing_subscriber::fmt`, seeded from the config
//! file's `log_level` (or `RUST_LOG` if set). No OTLP export layer:
//! this service has no OpenTelemetry collector to ship to (see
//! DESIGN.md).

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. `level` is the
/// `log_level` config value; `--verbose` on the CLI raises it to
/// `debug` regardless of what the config file says.
pub fn init(level: &str, verbose: bool) {
    let directive = if verbose { "debug" } else { level };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}
