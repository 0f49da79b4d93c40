use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::prefs::Preferences;

/// Rotation threshold for the main log.
const MAX_LOG_SIZE: u64 = 1024 * 1024;
/// Rotated generations kept (`.1` through `.4`).
const KEPT_GENERATIONS: u32 = 4;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Could not prepare log directory {}", .1.display())]
    Io(#[source] std::io::Error, PathBuf),

    #[error("Could not open a log file")]
    OpenLogFile(#[from] std::io::Error),

    #[error("Logger was already initialized")]
    AlreadySet(#[from] log::SetLoggerError),
}

fn level_for(logging_level: i64) -> log::LevelFilter {
    match logging_level {
        i64::MIN..=0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Shifts `<log>` -> `<log>.1` -> ... -> `<log>.4` when the main file has
/// outgrown the threshold. Called before the logger opens the file.
pub fn rotate_if_needed(log_path: &Path) {
    let size = match fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if size <= MAX_LOG_SIZE {
        return;
    }
    for generation in (1..KEPT_GENERATIONS).rev() {
        let from = rotated_name(log_path, generation);
        if from.exists() {
            let _ = fs::rename(&from, rotated_name(log_path, generation + 1));
        }
    }
    let _ = fs::rename(log_path, rotated_name(log_path, 1));
}

fn rotated_name(log_path: &Path, generation: u32) -> PathBuf {
    let mut name = log_path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}", generation));
    log_path.with_file_name(name)
}

/// Wires the `log` facade to the main log file plus `errors.log` and
/// `warnings.log` mirrors, optionally echoing to stderr. Falls back to
/// `env_logger` when no log file can be prepared.
pub fn setup(prefs: &Preferences, echo_to_stderr: bool) -> Result<(), LogError> {
    let level = level_for(prefs.integer("LoggingLevel").unwrap_or(1));

    let log_path = match prefs.string("LogFile").map(PathBuf::from) {
        Some(p) => p,
        None => {
            let _ = env_logger::Builder::new().filter_level(level).try_init();
            return Ok(());
        }
    };
    let log_dir = log_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&log_dir).map_err(|e| LogError::Io(e, log_dir.clone()))?;

    rotate_if_needed(&log_path);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {} [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S %z"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(fern::log_file(&log_path)?)
        .chain(
            fern::Dispatch::new()
                .filter(|meta| meta.level() == log::Level::Warn)
                .chain(fern::log_file(log_dir.join("warnings.log"))?),
        )
        .chain(
            fern::Dispatch::new()
                .filter(|meta| meta.level() == log::Level::Error)
                .chain(fern::log_file(log_dir.join("errors.log"))?),
        );

    if echo_to_stderr {
        dispatch = dispatch.chain(std::io::stderr());
    }

    dispatch.apply()?;
    log::debug!("logging initialized at {}", log_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_for(0), log::LevelFilter::Warn);
        assert_eq!(level_for(1), log::LevelFilter::Info);
        assert_eq!(level_for(2), log::LevelFilter::Debug);
        assert_eq!(level_for(3), log::LevelFilter::Trace);
        assert_eq!(level_for(9), log::LevelFilter::Trace);
    }

    #[test]
    fn test_rotation_shifts_generations() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("engine.log");

        fs::write(&log, vec![0u8; (MAX_LOG_SIZE + 1) as usize]).unwrap();
        fs::write(rotated_name(&log, 1), b"gen1").unwrap();

        rotate_if_needed(&log);
        assert!(!log.exists());
        assert_eq!(fs::metadata(rotated_name(&log, 1)).unwrap().len(), MAX_LOG_SIZE + 1);
        assert_eq!(fs::read(rotated_name(&log, 2)).unwrap(), b"gen1");
    }

    #[test]
    fn test_small_log_not_rotated() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("engine.log");
        fs::write(&log, b"short").unwrap();
        rotate_if_needed(&log);
        assert!(log.exists());
        assert!(!rotated_name(&log, 1).exists());
    }
}
