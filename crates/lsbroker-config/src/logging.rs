//! Log-file helpers: default location and size-based rotation.
//!
//! The `tracing-subscriber` setup itself lives in the binary
//! (`src/main.rs`); this module only decides where the file goes and
//! keeps it from growing without bound.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::LogConfig;

/// Maximum size of a single log file before rotation (10 MB).
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Maximum number of rotated log files to retain.
pub const DEFAULT_MAX_LOG_FILES: u32 = 5;

/// Return the platform-specific default log file path.
///
/// * macOS: `$HOME/Library/Logs/lsbroker/lsbroker.log`
/// * Linux: `$HOME/.local/state/lsbroker/lsbroker.log`
/// * Windows: `%LOCALAPPDATA%/lsbroker/logs/lsbroker.log`
/// * Fallback: the system temp dir.
pub fn default_log_file_path() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join("Library/Logs/lsbroker/lsbroker.log");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".local/state/lsbroker/lsbroker.log");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(appdata).join("lsbroker\\logs\\lsbroker.log");
        }
    }
    std::env::temp_dir().join("lsbroker").join("lsbroker.log")
}

/// The configured log file, or the platform default.
pub fn resolve_log_file(config: &LogConfig) -> PathBuf {
    config.file.clone().unwrap_or_else(default_log_file_path)
}

/// Create the log file's parent directory, rotate if oversized, and
/// open it for appending.
pub fn prepare_log_file(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    rotate_log_files(path, DEFAULT_MAX_LOG_SIZE, DEFAULT_MAX_LOG_FILES)?;
    fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Rotate `log_path` once it reaches `max_size` bytes.
///
/// ```text
///   lsbroker.log   → lsbroker.log.1
///   lsbroker.log.1 → lsbroker.log.2
///   …
///   lsbroker.log.<max_files> is deleted
/// ```
pub fn rotate_log_files(log_path: &Path, max_size: u64, max_files: u32) -> io::Result<()> {
    match fs::metadata(log_path) {
        Ok(meta) if meta.len() >= max_size => {}
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }

    let oldest = rotated_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for i in (1..max_files).rev() {
        let from = rotated_path(log_path, i);
        if from.exists() {
            fs::rename(&from, rotated_path(log_path, i + 1))?;
        }
    }
    fs::rename(log_path, rotated_path(log_path, 1))
}

fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_file_path_names_the_broker() {
        let path = default_log_file_path();
        assert!(path.to_string_lossy().contains("lsbroker"));
        assert!(path.extension().is_some_and(|e| e == "log"));
    }

    #[test]
    fn resolve_prefers_configured_file() {
        let cfg = LogConfig {
            file: Some(PathBuf::from("/var/log/broker.log")),
            ..LogConfig::default()
        };
        assert_eq!(resolve_log_file(&cfg), PathBuf::from("/var/log/broker.log"));
        assert_eq!(resolve_log_file(&LogConfig::default()), default_log_file_path());
    }

    #[test]
    fn rotated_path_appends_index() {
        let base = Path::new("/tmp/lsbroker.log");
        assert_eq!(rotated_path(base, 1), PathBuf::from("/tmp/lsbroker.log.1"));
        assert_eq!(rotated_path(base, 3), PathBuf::from("/tmp/lsbroker.log.3"));
    }

    #[test]
    fn rotate_no_op_when_file_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("lsbroker.log");
        assert!(rotate_log_files(&log, 10, 3).is_ok());
    }

    #[test]
    fn rotate_no_op_when_under_max_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("lsbroker.log");
        fs::write(&log, "small").unwrap();
        rotate_log_files(&log, DEFAULT_MAX_LOG_SIZE, DEFAULT_MAX_LOG_FILES).unwrap();
        assert!(log.exists());
    }

    #[test]
    fn rotate_cascades_and_drops_oldest() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("lsbroker.log");
        fs::write(dir.path().join("lsbroker.log.1"), "old1").unwrap();
        fs::write(dir.path().join("lsbroker.log.2"), "old2").unwrap();
        fs::write(&log, "x".repeat(200)).unwrap();

        rotate_log_files(&log, 50, 2).unwrap();

        assert!(!log.exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("lsbroker.log.1")).unwrap(),
            "x".repeat(200)
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("lsbroker.log.2")).unwrap(),
            "old1"
        );
        assert!(!dir.path().join("lsbroker.log.3").exists());
    }

    #[test]
    fn prepare_log_file_creates_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("a").join("b").join("lsbroker.log");
        prepare_log_file(&log).unwrap();
        assert!(log.exists());
    }
}
