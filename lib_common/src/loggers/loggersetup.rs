//! # Logger Setup
//!
//! Installs a `fern` dispatcher behind the `log` facade. Every crate in the
//! workspace logs through `log::info!` and friends; this module only decides
//! where the lines end up.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use glob::glob;
use thiserror::Error;

/// Errors raised while installing the global logger.
#[derive(Debug, Error)]
pub enum LoggerSetupError {
    /// The log directory or the log file could not be created.
    #[error("log file error: {0}")]
    Io(#[from] std::io::Error),
    /// A global logger was already installed by someone else.
    #[error("a global logger is already installed")]
    AlreadyInitialized,
}

/// Maps a textual level to a `log::LevelFilter`. Unknown values fall back to `Info`.
pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" | "fatal" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Installs the global logger.
///
/// Lines go to stdout and, when `log_dir` is given, to
/// `<log_dir>/<app_name>_<timestamp>.log`. Older files of the same app are
/// rotated away so only the newest survives.
///
/// # Returns
/// The path of the log file, if one was opened.
pub fn setup_logging(
    log_dir: Option<&Path>,
    log_level: &str,
    app_name: &str,
) -> Result<Option<PathBuf>, LoggerSetupError> {
    let level = parse_level(log_level);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    let mut log_path = None;
    if let Some(dir) = log_dir {
        fs::create_dir_all(dir)?;
        rotate_logs(app_name, dir);

        let file_name = format!("{}_{}.log", app_name, Local::now().format("%Y-%m-%d_%H-%M-%S"));
        let path = dir.join(file_name);
        dispatch = dispatch.chain(fern::log_file(&path)?);
        log_path = Some(path);
    }

    dispatch
        .apply()
        .map_err(|_| LoggerSetupError::AlreadyInitialized)?;

    Ok(log_path)
}

/// Deletes every log file of `app_name` in `log_dir` except the newest one.
///
/// File names embed a sortable timestamp, so the lexicographic maximum is the newest.
pub fn rotate_logs(app_name: &str, log_dir: &Path) {
    let pattern = format!("{}/{}_*.log", log_dir.display(), app_name);
    let mut log_files: Vec<PathBuf> = match glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            eprintln!("Invalid log rotation pattern {}: {}", pattern, e);
            return;
        }
    };

    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    for old_file in log_files.iter().skip(1) {
        if let Err(e) = fs::remove_file(old_file) {
            eprintln!("Error deleting old log file {}: {}", old_file.display(), e);
        }
    }
}
