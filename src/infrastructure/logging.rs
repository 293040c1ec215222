use std::fs;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Configuration for console and file logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub max_files: usize,
    pub enable_console: bool,
    pub enable_file: bool,
    pub log_level: Level,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            max_files: 30,
            enable_console: true,
            enable_file: true,
            log_level: Level::INFO,
        }
    }
}

/// Keeps the non-blocking file writers flushing. Drop it last.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Initialize console output plus daily rolling files for warnings and for
/// everything.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuards, Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let filter_str = env!("CARGO_PKG_NAME").replace('-', "_")
            + "="
            + &config.log_level.to_string()
            + ",tower_http="
            + &config.log_level.to_string()
            + ",sqlx=warn";
        EnvFilter::new(filter_str)
    });

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();
    let mut guards = Vec::new();

    if config.enable_console {
        let console_layer = fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_ansi(true);
        layers.push(Box::new(console_layer));
    }

    if config.enable_file {
        fs::create_dir_all(&config.log_dir)?;
        cleanup_old_logs(&config.log_dir, config.max_files)?;

        let warn_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "warn.log");
        let (warn_writer, warn_guard) = tracing_appender::non_blocking(warn_appender);
        guards.push(warn_guard);

        let all_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "restaurant-intel.log");
        let (all_writer, all_guard) = tracing_appender::non_blocking(all_appender);
        guards.push(all_guard);

        let warn_layer = fmt::layer()
            .with_writer(warn_writer)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_ansi(false)
            .with_filter(tracing_subscriber::filter::LevelFilter::WARN);
        layers.push(Box::new(warn_layer));

        let all_layer = fmt::layer()
            .with_writer(all_writer)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_ansi(false);
        layers.push(Box::new(all_layer));
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    Ok(LoggingGuards { _guards: guards })
}

/// Remove the oldest `.log` files beyond `max_files`. Returns how many were
/// deleted.
pub fn cleanup_old_logs(log_dir: &str, max_files: usize) -> std::io::Result<usize> {
    let log_path = Path::new(log_dir);
    if !log_path.exists() {
        return Ok(0);
    }

    let mut log_files: Vec<_> = fs::read_dir(log_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.contains(".log"))
                .unwrap_or(false)
        })
        .collect();

    if log_files.len() <= max_files {
        return Ok(0);
    }

    // Oldest first
    log_files.sort_by_key(|entry| {
        entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });

    let mut removed = 0;
    for entry in log_files.iter().take(log_files.len() - max_files) {
        if fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
