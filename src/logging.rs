//! Logging setup for the addon host.
//!
//! Writes timestamped log files into `<data_root>/logs/` and removes files
//! older than the retention period. The CLI additionally mirrors records
//! to stderr.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Default log retention in hours.
pub const DEFAULT_LOG_RETENTION_HOURS: u32 = 24;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Name of the log directory under the data root.
pub const LOG_DIR_NAME: &str = "logs";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log retention period in hours.
    pub retention_hours: u32,
    /// Log level (trace, debug, info, warn, error, off).
    pub level: String,
    /// Whether file logging is enabled.
    pub enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention_hours: DEFAULT_LOG_RETENTION_HOURS,
            level: DEFAULT_LOG_LEVEL.to_string(),
            enabled: true,
        }
    }
}

impl LogConfig {
    /// Normalizes a level name; unknown names fall back to the default.
    #[must_use]
    pub fn parse_level(value: &str) -> String {
        match value.to_lowercase().as_str() {
            "trace" => "trace".to_string(),
            "debug" => "debug".to_string(),
            "info" => "info".to_string(),
            "warn" | "warning" => "warn".to_string(),
            "error" => "error".to_string(),
            "off" | "none" | "disabled" => "off".to_string(),
            _ => DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Log directory for a data root.
#[must_use]
pub fn log_directory(data_root: &Path) -> PathBuf {
    data_root.join(LOG_DIR_NAME)
}

fn new_log_path(log_dir: &Path) -> PathBuf {
    let now = chrono::Local::now();
    log_dir.join(format!("addonhost_{}.log", now.format("%Y-%m-%d_%H-%M-%S")))
}

/// Deletes `.log` files in `log_dir` older than `retention_hours`.
///
/// # Errors
/// Returns error if the directory cannot be read.
pub fn cleanup_old_logs(log_dir: &Path, retention_hours: u32) -> io::Result<u32> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let retention = Duration::from_secs(u64::from(retention_hours) * 3600);
    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > retention) && fs::remove_file(&path).is_ok() {
            deleted += 1;
        }
    }

    Ok(deleted)
}

/// Installs the global subscriber.
///
/// Returns the log file path when file logging is enabled. With `stderr`,
/// records at the configured level are also written to stderr.
///
/// # Errors
/// Returns error if the log directory or file cannot be created.
pub fn init(config: &LogConfig, data_root: &Path, stderr: bool) -> io::Result<Option<PathBuf>> {
    let level = LogConfig::parse_level(&config.level);
    if level == "off" && !stderr {
        return Ok(None);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let mut log_path = None;
    let mut deleted = 0;
    let file_layer = if config.enabled && level != "off" {
        let log_dir = log_directory(data_root);
        fs::create_dir_all(&log_dir)?;
        deleted = cleanup_old_logs(&log_dir, config.retention_hours)?;

        let path = new_log_path(&log_dir);
        let file = File::create(&path)?;
        log_path = Some(path);
        Some(
            fmt::layer()
                .with_writer(file.with_max_level(tracing::Level::TRACE))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(false),
        )
    } else {
        None
    };

    let stderr_layer = stderr.then(|| {
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    if let Some(path) = &log_path {
        tracing::debug!("Log file: {}", path.display());
        tracing::debug!("Log retention: {} hours", config.retention_hours);
    }
    if deleted > 0 {
        tracing::debug!("Cleaned up {} old log file(s)", deleted);
    }

    Ok(log_path)
}
