//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// When set, logs are additionally written to daily rotated files in this directory
pub const LOG_PATH_ENV_VAR: &str = "DEVICE_PLUGIN_LOG_PATH";

const LOG_FILE_PREFIX: &str = "device-plugin.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// non-blocking writer to daily rotated files, `None` when the directory cannot be used
fn get_file_writer(log_dir: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    let appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(3)
        .build(log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("failed to create log file in {}: {e}", log_dir.display());
            return None;
        }
    };

    Some(tracing_appender::non_blocking(appender))
}

/// initiate the global tracing subscriber
///
/// The returned guard must be held for as long as file logging should be
/// flushed; it is `None` when only stderr logging is active.
pub fn init() -> Option<WorkerGuard> {
    let file_writer = std::env::var(LOG_PATH_ENV_VAR)
        .ok()
        .and_then(|log_dir| get_file_writer(Path::new(&log_dir)));

    let (file_layer, guard) = match file_writer {
        Some((writer, guard)) => {
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).with(file_layer).init();
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_writer_is_created_in_writable_dir() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let writer = get_file_writer(dir.path());
        assert!(writer.is_some());
    }

    #[test]
    fn file_writer_is_skipped_when_path_is_a_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").expect("should write file");

        let writer = get_file_writer(&file);
        assert!(writer.is_none());
    }
}
