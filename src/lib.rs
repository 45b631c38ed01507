//! Wiring between the broker configuration and the lifecycle managers.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use lsbroker_config::{Config, ConnectionSetting, ManagerConfig, ServerEntry};
use lsbroker_lsp::{
    ConnectionKind, EditorId, ManagerOptions, ProcessServerFactory, ServerConfig, ServerManager,
    TextEditor,
};

/// Turn one configured server kind into launch settings.
pub fn server_config(name: &str, entry: &ServerEntry) -> Result<ServerConfig> {
    let initialization_options = entry
        .initialization_options
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .with_context(|| format!("invalid initialization_options for {name}"))?;
    Ok(ServerConfig {
        name: name.to_string(),
        command: entry.command.clone(),
        args: entry.args.clone(),
        language_id: entry.language_id.clone().unwrap_or_else(|| name.to_string()),
        extensions: entry.extensions.clone(),
        connection: match entry.connection {
            ConnectionSetting::Stdio => ConnectionKind::Stdio,
            ConnectionSetting::Socket => ConnectionKind::Socket,
            ConnectionSetting::Ipc => ConnectionKind::Ipc,
        },
        initialize_timeout: entry.initialize_timeout_secs.map(Duration::from_secs),
        stderr_tail_lines: entry.stderr_tail_lines,
        initialization_options,
    })
}

pub fn manager_options(config: &ManagerConfig) -> ManagerOptions {
    ManagerOptions {
        restart_limit: config.restart_limit,
        restart_window: Duration::from_secs(config.restart_window_secs),
        graceful_shutdown: config.graceful_shutdown,
        shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
    }
}

/// One manager per configured server kind, ordered by name.
pub fn build_managers(config: &Config) -> Result<Vec<ServerManager>> {
    let mut names: Vec<_> = config.servers.keys().collect();
    names.sort();
    let options = manager_options(&config.manager);
    names
        .into_iter()
        .map(|name| {
            let launch = server_config(name, &config.servers[name])?;
            let factory = Arc::new(ProcessServerFactory::new(launch));
            Ok(ServerManager::builder(factory)
                .options(options.clone())
                .build())
        })
        .collect()
}

/// A file named on the command line, standing in for an open editor.
#[derive(Debug, Clone)]
pub struct FileEditor {
    id: EditorId,
    path: PathBuf,
    scope: String,
}

impl FileEditor {
    /// `path` is made absolute against `cwd`. The grammar scope is
    /// derived from the extension (`source.rs`, `source.py`, ...).
    pub fn new(id: u64, path: &Path, cwd: &Path) -> Self {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        let path = std::fs::canonicalize(&path).unwrap_or(path);
        let scope = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("source.{ext}"),
            None => "text.plain".to_string(),
        };
        Self {
            id: EditorId::new(id),
            path,
            scope,
        }
    }
}

impl TextEditor for FileEditor {
    fn id(&self) -> EditorId {
        self.id
    }

    fn path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn grammar_scope(&self) -> &str {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editor_paths_are_absolute() {
        let editor = FileEditor::new(1, Path::new("src/x.rs"), Path::new("/nonexistent/proj"));
        assert_eq!(editor.path(), Some(PathBuf::from("/nonexistent/proj/src/x.rs")));
        assert_eq!(editor.grammar_scope(), "source.rs");
    }

    #[test]
    fn file_without_extension_is_plain_text() {
        let editor = FileEditor::new(2, Path::new("/nonexistent/Makefile"), Path::new("/"));
        assert_eq!(editor.grammar_scope(), "text.plain");
    }
}
