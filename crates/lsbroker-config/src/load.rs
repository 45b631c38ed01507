use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::ConfigError;
use crate::merge::merge_configs;
use crate::validate::validate;

/// Directory name searched for project-local overrides.
pub const PROJECT_CONFIG_DIR: &str = ".lsbroker";

/// Content written into a newly-created default config file.
const DEFAULT_CONFIG_CONTENT: &str = r#"# lsbroker configuration
# Uncomment and edit settings below to override defaults.

# [log]
# level = "info"

# [manager]
# restart_limit = 5
# restart_window_secs = 180
# graceful_shutdown = true
# shutdown_timeout_secs = 5

# [servers.rust]
# command = "rust-analyzer"
# extensions = ["rs"]
# connection = "stdio"
"#;

/// Return the default configuration directory.
///
/// `$XDG_CONFIG_HOME/lsbroker`, then `$HOME/.config/lsbroker`,
/// falling back to `./.lsbroker`.
pub fn default_config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("lsbroker");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".config").join("lsbroker");
    }
    PathBuf::from(PROJECT_CONFIG_DIR)
}

/// Load and merge configuration.
///
/// 1. Reads the global config from `config_dir/config.toml`.
///    If the file does not exist it is created with commented-out
///    defaults.
/// 2. Optionally reads a project config from
///    `project_dir/.lsbroker/config.toml` (walks upward).
/// 3. Merges: `Config::default() <- global <- project`.
/// 4. Validates the merged result.
///
/// # Errors
///
/// Returns [`ConfigError`] on I/O failure, parse failure, or
/// validation failure.
pub fn load_config(config_dir: &Path, project_dir: Option<&Path>) -> Result<Config, ConfigError> {
    let global_path = config_dir.join("config.toml");

    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir)?;
    }

    if !global_path.exists() {
        std::fs::write(&global_path, DEFAULT_CONFIG_CONTENT)
            .map_err(|source| ConfigError::CreateDefault {
                path: global_path.clone(),
                source,
            })?;
        tracing::info!("created default config at {}", global_path.display());
    }

    let mut config = Config::default();

    let global_content = std::fs::read_to_string(&global_path)?;
    if has_non_comment_content(&global_content) {
        config = merge_configs(&config, &global_content).map_err(|e| e.in_file(&global_path))?;
    }

    if let Some(proj) = project_dir {
        if let Some(project_path) = find_project_config(proj) {
            tracing::debug!("merging project config {}", project_path.display());
            let project_content = std::fs::read_to_string(&project_path)?;
            config = merge_configs(&config, &project_content)
                .map_err(|e| e.in_file(&project_path))?;
        }
    }

    check(&config)?;
    Ok(config)
}

/// Load a single explicit config file on top of the defaults.
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`] when `path` does not exist.
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let config = merge_configs(&Config::default(), &content).map_err(|e| e.in_file(path))?;
    check(&config)?;
    Ok(config)
}

/// Walk from `start` upward looking for `.lsbroker/config.toml`.
fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(PROJECT_CONFIG_DIR).join("config.toml");
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Returns `true` when the content has at least one
/// non-empty, non-comment line.
fn has_non_comment_content(content: &str) -> bool {
    content.lines().any(|l| {
        let trimmed = l.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    })
}

fn check(config: &Config) -> Result<(), ConfigError> {
    validate(config).map_err(|errors| {
        for err in &errors {
            tracing::warn!("{}", err);
        }
        errors
            .into_iter()
            .next()
            .unwrap_or_else(|| ConfigError::Validation {
                field: "unknown".to_string(),
                message: "validation failed".to_string(),
            })
    })
}

/// Parse a TOML string directly into a validated [`Config`].
///
/// # Errors
///
/// Returns [`ConfigError`] on parse or validation failure.
pub fn load_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(toml_str).map_err(ConfigError::parse)?;
    check(&config)?;
    Ok(config)
}
