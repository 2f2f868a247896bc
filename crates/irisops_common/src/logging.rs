//! Logging initialization
//!
//! Structured `tracing` output on stderr so stdout stays free for command
//! results. `RUST_LOG` wins over the configured level when set.

use tracing_subscriber::{fmt, EnvFilter};

use crate::settings::{LogFormat, LoggingSettings};

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let _ = match settings.format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Pretty => builder.with_line_number(true).try_init(),
    };
}

/// Verbose logging for tests, captured by the test harness
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
