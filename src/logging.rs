//! Subscriber setup for binaries and tests embedding the scheduler.
//!
//! The crate is a library, so the host may already own the global subscriber. In that case
//! installation is skipped quietly and the scheduler's events flow into the host's subscriber.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "scheduler.log";

/// Keeps the non-blocking file writer alive; dropping it flushes and stops file output.
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

/// Daily-rolling file output, enabled with `SCHEDULER_FILE_LOGS=true|1`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileLogSettings {
    pub dir: PathBuf,
}

impl FileLogSettings {
    pub fn from_env() -> Option<Self> {
        let enabled = std::env::var("SCHEDULER_FILE_LOGS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        enabled.then(|| Self {
            dir: std::env::var("SCHEDULER_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./logs")),
        })
    }
}

/// Installs the global subscriber filtered by `log_level` (an `EnvFilter` directive, `info` when
/// unparsable). Returns a guard only when file output was installed by this call.
pub fn init_tracing(log_level: &str) -> Option<FileLogGuard> {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(true);

    let file = FileLogSettings::from_env().and_then(|settings| match std::fs::create_dir_all(&settings.dir) {
        Ok(()) => Some(settings),
        Err(err) => {
            eprintln!("failed to create log directory {}: {err}", settings.dir.display());
            None
        }
    });

    let Some(settings) = file else {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .try_init();
        return None;
    };

    let appender = RollingFileAppender::new(Rotation::DAILY, &settings.dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok()
        .then_some(FileLogGuard { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_tolerated() {
        let _first = init_tracing("debug");
        let second = init_tracing("not a directive ===");
        assert!(second.is_none());
    }
}
