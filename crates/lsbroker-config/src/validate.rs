use crate::config::{Config, ConnectionSetting};
use crate::error::ConfigError;

/// Validate a [`Config`], returning all detected violations.
///
/// Returns `Ok(())` when the config is valid, or `Err` with a
/// vector of every validation error found.
pub fn validate(config: &Config) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut reject = |field: String, message: String| {
        errors.push(ConfigError::Validation { field, message });
    };

    if config.manager.restart_limit == 0 {
        reject(
            "manager.restart_limit".to_string(),
            "must be at least 1".to_string(),
        );
    }
    if config.manager.restart_window_secs == 0 {
        reject(
            "manager.restart_window_secs".to_string(),
            "must be greater than 0".to_string(),
        );
    }
    if config.manager.shutdown_timeout_secs == 0 {
        reject(
            "manager.shutdown_timeout_secs".to_string(),
            "must be greater than 0".to_string(),
        );
    }

    let mut names: Vec<_> = config.servers.keys().collect();
    names.sort();
    for name in names {
        let entry = &config.servers[name];
        if entry.command.trim().is_empty() {
            reject(
                format!("servers.{name}.command"),
                "must not be empty".to_string(),
            );
        }
        if entry.extensions.is_empty() {
            reject(
                format!("servers.{name}.extensions"),
                "must list at least one extension".to_string(),
            );
        }
        if entry.initialize_timeout_secs == Some(0) {
            reject(
                format!("servers.{name}.initialize_timeout_secs"),
                "must be greater than 0 when set".to_string(),
            );
        }
        let placeholder = match entry.connection {
            ConnectionSetting::Stdio => None,
            ConnectionSetting::Socket => Some("{port}"),
            ConnectionSetting::Ipc => Some("{pipe}"),
        };
        if let Some(placeholder) = placeholder {
            if !entry.args.iter().any(|a| a.contains(placeholder)) {
                reject(
                    format!("servers.{name}.args"),
                    format!("must contain {placeholder} for this connection"),
                );
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
