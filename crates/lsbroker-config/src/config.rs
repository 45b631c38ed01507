use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Log verbosity level.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debug messages, including every protocol message.
    Debug,
    /// Informational messages (default).
    #[default]
    Info,
    /// Warnings only.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// The `tracing` filter directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log verbosity level.
    #[serde(default)]
    pub level: LogLevel,
    /// Optional path to a log file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
        }
    }
}

/// How the broker talks to a spawned server.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSetting {
    /// The process's stdin/stdout pipes.
    #[default]
    Stdio,
    /// A TCP socket the server connects back to; `{port}` in args is substituted.
    Socket,
    /// A local IPC channel the server connects back to; `{pipe}` in args is substituted.
    Ipc,
}

/// Crash-recovery and teardown policy shared by all server kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Crashes tolerated per project within the window before giving up.
    #[serde(default = "default_restart_limit")]
    pub restart_limit: u32,
    /// Length of the crash-counting window in seconds.
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
    /// Send `shutdown` + `exit` before killing a server.
    #[serde(default = "default_true")]
    pub graceful_shutdown: bool,
    /// Upper bound on the graceful `shutdown` round-trip.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_restart_limit() -> u32 {
    5
}

fn default_restart_window() -> u64 {
    180
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            restart_limit: default_restart_limit(),
            restart_window_secs: default_restart_window(),
            graceful_shutdown: true,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Configuration for a single language server kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// The command to run the server.
    pub command: String,
    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// LSP language identifier sent with `didOpen`. Defaults to the entry key.
    #[serde(default)]
    pub language_id: Option<String>,
    /// File extensions this server handles.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Transport used to reach the server.
    #[serde(default)]
    pub connection: ConnectionSetting,
    /// Optional bound on the `initialize` round-trip.
    #[serde(default)]
    pub initialize_timeout_secs: Option<u64>,
    /// Number of stderr lines kept for error reports.
    #[serde(default = "default_stderr_tail")]
    pub stderr_tail_lines: usize,
    /// Passed verbatim as `initializationOptions`.
    #[serde(default)]
    pub initialization_options: Option<toml::Table>,
}

fn default_stderr_tail() -> usize {
    100
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
    /// Lifecycle policy.
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Server kinds, keyed by a short name (e.g. `rust`, `python`).
    #[serde(default)]
    pub servers: HashMap<String, ServerEntry>,
}

impl Config {
    /// Find the server entry that handles files with `extension`.
    pub fn server_for_extension(&self, extension: &str) -> Option<(&str, &ServerEntry)> {
        let mut matches: Vec<_> = self
            .servers
            .iter()
            .filter(|(_, entry)| entry.extensions.iter().any(|e| e == extension))
            .collect();
        // HashMap order is unstable; pick deterministically.
        matches.sort_by(|a, b| a.0.cmp(b.0));
        matches
            .into_iter()
            .next()
            .map(|(name, entry)| (name.as_str(), entry))
    }
}
