//! # Log Setup
//!
//! Installs a global `log` backend for binaries built on the presence client.
//! Every record goes to stdout, with the level coloured, and to a fresh
//! timestamped file in the log directory. Older files are pruned at start-up
//! so that only the previous run's log survives next to the new one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use colored::Colorize;
use thiserror::Error;

/// File name prefix of presence client logs.
pub const LOG_FILE_PREFIX: &str = "presence_";

/// Errors raised while installing the logger.
#[derive(Error, Debug)]
pub enum LoggerError {
    /// The log directory or file could not be prepared.
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
    /// A global logger was installed already.
    #[error("Logger already initialized: {0}")]
    AlreadySet(#[from] log::SetLoggerError),
}

/// Maps a level name to a filter. Unknown names fall back to `Info`.
pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "off" => log::LevelFilter::Off,
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

fn colored_level(level: log::Level) -> String {
    let label = level.to_string();
    match level {
        log::Level::Error => label.red().bold().to_string(),
        log::Level::Warn => label.yellow().to_string(),
        log::Level::Info => label.green().to_string(),
        log::Level::Debug => label.blue().to_string(),
        log::Level::Trace => label.dimmed().to_string(),
    }
}

/// Installs the global logger and returns the path of the new log file.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<PathBuf, LoggerError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    cleanup_old_logs(log_dir)?;

    let log_file_name = format!(
        "{}{}.log",
        LOG_FILE_PREFIX,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = log_dir.join(log_file_name);

    let console = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                colored_level(record.level()),
                message
            ))
        })
        .chain(std::io::stdout());

    let file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S%.3f]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(fern::log_file(&log_path)?);

    fern::Dispatch::new()
        .level(parse_level(log_level))
        .chain(console)
        .chain(file)
        .apply()?;

    Ok(log_path)
}

/// Deletes every `.log` file in `log_dir` except the most recently modified.
pub fn cleanup_old_logs(log_dir: &Path) -> Result<(), LoggerError> {
    let mut entries: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .map(|p| {
            let modified = fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, p)
        })
        .collect();

    // Newest first; names carry the timestamp and break ties.
    entries.sort_by(|a, b| b.cmp(a));

    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}
