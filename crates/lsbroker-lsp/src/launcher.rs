//! Starting a real server process and completing the handshake.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lsp_types::{ClientInfo, InitializeParams, ServerCapabilities, WorkspaceFolder};
use serde_json::Value;

use crate::cancel::with_timeout;
use crate::connection::Connection;
use crate::error::LspError;
use crate::hooks::ServerFactory;
use crate::process::{log_stderr_line, spawn_server, ServerProcessHandle, SpawnedServer, StderrHandler};
use crate::server::ActiveServer;
use crate::types::{client_capabilities, ProjectPath, ServerConfig, ServerId, TextEditor};

/// Build the `initialize` params for `project`.
#[allow(deprecated)]
pub fn initialize_params(
    project: &ProjectPath,
    initialization_options: Option<Value>,
) -> Result<InitializeParams, LspError> {
    let root_uri = project.to_uri()?;
    let name = project
        .as_path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| project.to_string());
    Ok(InitializeParams {
        process_id: Some(std::process::id()),
        root_path: Some(project.to_string()),
        root_uri: Some(root_uri.clone()),
        initialization_options,
        capabilities: client_capabilities(),
        workspace_folders: Some(vec![WorkspaceFolder {
            uri: root_uri,
            name,
        }]),
        client_info: Some(ClientInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        ..Default::default()
    })
}

/// Start listening on `conn` and run `initialize` then `initialized`.
/// Returns what the server declared.
pub async fn handshake(
    conn: &Connection,
    project: &ProjectPath,
    initialization_options: Option<Value>,
    timeout: Option<Duration>,
) -> Result<ServerCapabilities, LspError> {
    conn.listen()?;
    let params = initialize_params(project, initialization_options)?;
    let result = match timeout {
        Some(limit) => with_timeout(limit, conn.initialize(params)).await?,
        None => conn.initialize(params).await?,
    };
    conn.initialized()?;
    if let Some(info) = &result.server_info {
        tracing::info!(
            server = %conn.name(),
            name = %info.name,
            version = info.version.as_deref().unwrap_or("unknown"),
            "handshake complete"
        );
    }
    Ok(result.capabilities)
}

/// A [`ServerFactory`] that spawns the configured command.
pub struct ProcessServerFactory {
    config: ServerConfig,
    stderr_handler: StderrHandler,
}

impl ProcessServerFactory {
    /// Launch servers as `config` describes, logging their stderr.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            stderr_handler: Arc::new(log_stderr_line),
        }
    }

    /// Send stderr lines somewhere other than the log.
    pub fn with_stderr_handler(mut self, handler: StderrHandler) -> Self {
        self.stderr_handler = handler;
        self
    }

    /// The launch settings.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[async_trait]
impl ServerFactory for ProcessServerFactory {
    fn server_name(&self) -> &str {
        &self.config.name
    }

    fn language_name(&self) -> &str {
        &self.config.language_id
    }

    fn should_start_for_editor(&self, editor: &dyn TextEditor) -> bool {
        editor
            .path()
            .is_some_and(|path| self.config.handles_path(&path))
    }

    async fn start_server(
        &self,
        project: &ProjectPath,
        id: ServerId,
    ) -> Result<ActiveServer, LspError> {
        let SpawnedServer {
            process,
            connection,
            stderr,
        } = spawn_server(&self.config, project, self.stderr_handler.clone()).await?;

        let handshake = handshake(
            &connection,
            project,
            self.config.initialization_options.clone(),
            self.config.initialize_timeout,
        )
        .await;
        match handshake {
            Ok(capabilities) => Ok(ActiveServer::new(
                id,
                project.clone(),
                Box::new(process),
                connection,
                capabilities,
            )),
            Err(e) => {
                connection.dispose();
                process.kill();
                let tail = stderr.render();
                let message = if tail.is_empty() {
                    format!("{}: {e}", self.config.name)
                } else {
                    format!("{}: {e}\n{tail}", self.config.name)
                };
                Err(LspError::InitFailed(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::HandshakeState;
    use crate::test_support::{connection_pair, request_id, FakeEditor};

    #[test]
    fn initialize_params_describe_project() {
        let params = initialize_params(
            &ProjectPath::new("/work/proj"),
            Some(serde_json::json!({"checkOnSave": false})),
        )
        .unwrap();
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["processId"], std::process::id());
        assert_eq!(value["rootUri"], "file:///work/proj/");
        assert_eq!(value["workspaceFolders"][0]["name"], "proj");
        assert_eq!(value["initializationOptions"]["checkOnSave"], false);
        assert!(value["capabilities"]["workspace"].is_object());
    }

    #[tokio::test]
    async fn handshake_orders_initialize_then_initialized() {
        let (conn, mut peer) = connection_pair("test");
        let project = ProjectPath::new("/proj");
        let run = handshake(&conn, &project, None, None);
        let serve = async {
            let raw = peer.recv_raw().await;
            assert_eq!(raw["method"], "initialize");
            assert_eq!(raw["params"]["rootUri"], "file:///proj/");
            peer.respond(
                request_id(&raw["id"]),
                serde_json::json!({"capabilities": {"completionProvider": {}}}),
            )
            .await;
            let raw = peer.recv_raw().await;
            assert_eq!(raw["method"], "initialized");
        };
        let (caps, ()) = tokio::join!(run, serve);
        assert!(caps.unwrap().completion_provider.is_some());
        assert_eq!(conn.handshake_state(), HandshakeState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out() {
        let (conn, _peer) = connection_pair("test");
        let err = handshake(
            &conn,
            &ProjectPath::new("/proj"),
            None,
            Some(Duration::from_secs(3)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LspError::Timeout(_)));
    }

    #[test]
    fn eligibility_follows_extensions() {
        let mut config = ServerConfig::new("fake-ls", "fake-ls");
        config.extensions = vec!["fake".into()];
        let factory = ProcessServerFactory::new(config);
        assert!(factory.should_start_for_editor(FakeEditor::new(1, "/p/a.fake").as_ref()));
        assert!(!factory.should_start_for_editor(FakeEditor::new(2, "/p/a.rs").as_ref()));
        assert!(!factory.should_start_for_editor(FakeEditor::unsaved(3).as_ref()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn init_failure_includes_stderr_tail() {
        let mut config = ServerConfig::new("broken-ls", "sh");
        config.args = vec!["-c".into(), "echo 'fatal: no workspace' >&2; sleep 0.2".into()];
        let factory = ProcessServerFactory::new(config);
        let err = factory
            .start_server(&ProjectPath::new("/"), ServerId::new(1))
            .await
            .err()
            .unwrap();
        match err {
            LspError::InitFailed(msg) => {
                assert!(msg.starts_with("broken-ls"));
                assert!(msg.contains("fatal: no workspace"));
            }
            other => panic!("expected init failure, got {other:?}"),
        }
    }
}
