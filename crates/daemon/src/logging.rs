//! Logging bootstrap driven by the `[log]` config section.

use std::path::Path;
use stm_config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Initialize the global subscriber: a console layer, plus a non-blocking
/// file layer when a log file is configured. The returned guard must be
/// held for the life of the process so buffered file output is flushed.
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let console = fmt::layer()
        .with_target(true)
        .with_filter(env_filter(&config.level));

    let Some(file) = &config.file else {
        // A second init (tests, embedding) keeps the existing subscriber
        let _ = tracing_subscriber::registry().with(console).try_init();
        return None;
    };

    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("could not create log directory {}: {e}", dir.display());
        let _ = tracing_subscriber::registry().with(console).try_init();
        return None;
    }
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "stm.log".to_string());

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(env_filter(&config.level));

    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init();
    Some(guard)
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}
