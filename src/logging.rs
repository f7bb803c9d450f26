//! Tracing subscriber setup.
//!
//! Console output is compact and filtered by `RUST_LOG` (default `info`).
//! When a log directory is configured, a daily rolling JSON file is written
//! alongside it.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber. The returned guard must be held until
/// shutdown so buffered file output is flushed.
pub fn init_tracing(log_directory: Option<&Path>) -> Result<Option<WorkerGuard>, std::io::Error> {
    let (file_layer, guard) = match log_directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "tradegate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .json()
                .with_current_span(false)
                .with_span_list(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .compact();

    // A second install (tests, repeated CLI calls) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    Ok(guard)
}
