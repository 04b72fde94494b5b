//! Structured logging setup.
//!
//! The indexer logs through `tracing` everywhere; this module wires the
//! subscriber once at process start.
//!
//! # Environment Configuration
//!
//! ```bash
//! # Global level
//! RUST_LOG=debug job-registry-indexer run
//!
//! # Per-component levels
//! RUST_LOG=job_registry_indexer=debug,sqlx=warn job-registry-indexer run
//!
//! # JSON console output for log shippers
//! LOG_JSON=true job-registry-indexer run
//!
//! # Additional daily-rotated JSON file
//! LOG_FILE=./logs/indexer.log job-registry-indexer run
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when neither `RUST_LOG` nor an explicit level is given.
pub const DEFAULT_FILTER: &str = "job_registry_indexer=info,sqlx=warn,warn";

/// Build the `EnvFilter` from `RUST_LOG`, then the explicit level, then [`DEFAULT_FILTER`].
fn build_filter(log_level: Option<String>) -> EnvFilter {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        EnvFilter::new(filter)
    } else if let Some(level) = log_level {
        EnvFilter::new(level)
    } else {
        EnvFilter::new(DEFAULT_FILTER)
    }
}

/// Initialize the global tracing subscriber.
///
/// * `log_level` - level or directive string used when `RUST_LOG` is unset
/// * `log_file` - optional path; enables a daily-rotated JSON file layer
/// * `json_output` - JSON console output instead of the pretty format
///
/// When file logging is enabled the returned [`WorkerGuard`] must be held for
/// the lifetime of the process, otherwise buffered lines are dropped.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already installed.
pub fn init_tracing(
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    json_output: bool,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let env_filter = build_filter(log_level);

    let console_layer = if json_output {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .boxed()
    };

    let mut guard = None;
    let file_layer = match log_file.as_ref() {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;

            let appender = tracing_appender::rolling::daily(
                dir,
                path.file_name().unwrap_or_else(|| OsStr::new("indexer.log")),
            );
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);

            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!(
        json_output,
        file_logging = log_file.is_some(),
        "Tracing initialized"
    );

    Ok(guard)
}

/// Route tracing output to the test harness.
///
/// Safe to call from every test; only the first call installs a subscriber.
/// Run with `cargo test -- --nocapture` to see the output.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("job_registry_indexer=debug"))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_level_used_without_rust_log() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let filter = build_filter(Some("debug".to_string()));
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_default_filter_without_inputs() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let filter = build_filter(None);
        assert!(filter.to_string().contains("job_registry_indexer=info"));
    }

    #[test]
    fn test_init_test_tracing_is_repeatable() {
        init_test_tracing();
        init_test_tracing();
    }
}
