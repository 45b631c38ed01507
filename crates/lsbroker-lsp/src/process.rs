//! Spawning language server processes and watching them die.
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;

use crate::cancel::with_timeout;
use crate::connection::Connection;
use crate::error::LspError;
use crate::types::{ConnectionKind, ProjectPath, ServerConfig};

/// How long a socket or IPC server gets to connect back.
const CONNECT_BACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives every stderr line as `(server name, line)`.
pub type StderrHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// The default [`StderrHandler`].
pub fn log_stderr_line(server: &str, line: &str) {
    tracing::debug!(%server, stderr = %line, "server stderr");
}

/// The process side of a running server.
pub trait ServerProcessHandle: Send + Sync {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;
    /// Terminate the process. Safe to call more than once.
    fn kill(&self);
}

/// The last N lines a server wrote to stderr.
#[derive(Clone)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    /// Keep at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Snapshot, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// The tail joined with newlines.
    pub fn render(&self) -> String {
        self.lines().join("\n")
    }
}

/// A spawned server process.
pub struct ServerProcess {
    name: String,
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ServerProcess {
    /// Take ownership of `child`; a background task reaps it and logs
    /// how it exited.
    pub fn watch(name: impl Into<String>, child: Child) -> Self {
        let name = name.into();
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_exit(name.clone(), child, kill_rx));
        Self {
            name,
            pid,
            kill_tx: Mutex::new(Some(kill_tx)),
        }
    }
}

impl ServerProcessHandle for ServerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            tracing::debug!(server = %self.name, pid = ?self.pid, "killing server process");
            let _ = tx.send(());
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn watch_exit(name: String, mut child: Child, kill_rx: oneshot::Receiver<()>) {
    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(server = %name, error = %e, "kill failed");
            }
            (child.wait().await, true)
        }
    };
    match status {
        Ok(status) => log_exit(&name, status, killed),
        Err(e) => tracing::error!(server = %name, error = %e, "failed to reap server process"),
    }
}

fn exit_signal(status: &ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

fn log_exit(name: &str, status: ExitStatus, killed: bool) {
    let code = status.code();
    let signal = exit_signal(&status);
    if killed || status.success() {
        tracing::info!(server = %name, ?code, ?signal, "server exited");
    } else {
        tracing::warn!(server = %name, ?code, ?signal, "server exited abnormally");
    }
}

async fn pump_stderr(name: String, stderr: ChildStderr, tail: StderrTail, handler: StderrHandler) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                handler(&name, &line);
                tail.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %name, error = %e, "stderr closed");
                break;
            }
        }
    }
}

fn substitute(args: &[String], placeholder: &str, value: &str) -> Vec<String> {
    args.iter().map(|arg| arg.replace(placeholder, value)).collect()
}

/// Everything a freshly spawned server needs before the handshake.
pub struct SpawnedServer {
    /// The process.
    pub process: ServerProcess,
    /// A connection over the chosen transport, not yet listening.
    pub connection: Connection,
    /// Rolling stderr capture.
    pub stderr: StderrTail,
}

/// Spawn `config` for `project` and wire the selected transport.
pub async fn spawn_server(
    config: &ServerConfig,
    project: &ProjectPath,
    stderr_handler: StderrHandler,
) -> Result<SpawnedServer, LspError> {
    let label = format!("{} {}", config.name, project);
    let spawn_error =
        |e: std::io::Error| LspError::SpawnFailed(format!("{} ({}): {e}", config.name, config.command));

    let mut command = Command::new(&config.command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if project.as_path().is_dir() {
        command.current_dir(project.as_path());
    }

    let (mut child, connection) = match config.connection {
        ConnectionKind::Stdio => {
            command.args(&config.args).stdin(Stdio::piped()).stdout(Stdio::piped());
            let mut child = command.spawn().map_err(spawn_error)?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| LspError::SpawnFailed("could not capture stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| LspError::SpawnFailed("could not capture stdout".into()))?;
            (child, Connection::new(label.clone(), stdout, stdin))
        }
        ConnectionKind::Socket => {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
            let port = listener.local_addr()?.port();
            command.args(substitute(&config.args, "{port}", &port.to_string()));
            let child = command.spawn().map_err(spawn_error)?;
            tracing::debug!(server = %label, port, "waiting for server to connect");
            let (stream, _) =
                with_timeout(CONNECT_BACK_TIMEOUT, async { Ok(listener.accept().await?) }).await?;
            let (reader, writer) = stream.into_split();
            (child, Connection::new(label.clone(), reader, writer))
        }
        ConnectionKind::Ipc => spawn_ipc(&mut command, config, &label, spawn_error).await?,
    };

    let stderr = StderrTail::new(config.stderr_tail_lines);
    if let Some(pipe) = child.stderr.take() {
        tokio::spawn(pump_stderr(label.clone(), pipe, stderr.clone(), stderr_handler));
    }
    tracing::info!(server = %label, pid = ?child.id(), "server spawned");

    Ok(SpawnedServer {
        process: ServerProcess::watch(label, child),
        connection,
        stderr,
    })
}

#[cfg(unix)]
async fn spawn_ipc(
    command: &mut Command,
    config: &ServerConfig,
    label: &str,
    spawn_error: impl Fn(std::io::Error) -> LspError,
) -> Result<(Child, Connection), LspError> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT_PIPE: AtomicU64 = AtomicU64::new(0);

    let pipe = std::env::temp_dir().join(format!(
        "lsbroker-{}-{}.sock",
        std::process::id(),
        NEXT_PIPE.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_file(&pipe);
    let listener = tokio::net::UnixListener::bind(&pipe)?;
    command.args(substitute(&config.args, "{pipe}", &pipe.to_string_lossy()));
    let child = command.spawn().map_err(spawn_error)?;
    tracing::debug!(server = %label, pipe = %pipe.display(), "waiting for server to connect");
    let accepted = with_timeout(CONNECT_BACK_TIMEOUT, async { Ok(listener.accept().await?) }).await;
    let _ = std::fs::remove_file(&pipe);
    let (stream, _) = accepted?;
    let (reader, writer) = stream.into_split();
    Ok((child, Connection::new(label, reader, writer)))
}

#[cfg(not(unix))]
async fn spawn_ipc(
    _command: &mut Command,
    _config: &ServerConfig,
    _label: &str,
    _spawn_error: impl Fn(std::io::Error) -> LspError,
) -> Result<(Child, Connection), LspError> {
    Err(LspError::UnsupportedTransport("ipc".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let tail = StderrTail::new(3);
        for i in 0..5 {
            tail.push(format!("line {i}"));
        }
        assert_eq!(tail.lines(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(tail.render(), "line 2\nline 3\nline 4");
    }

    #[test]
    fn zero_capacity_tail_keeps_nothing() {
        let tail = StderrTail::new(0);
        tail.push("ignored");
        assert!(tail.lines().is_empty());
    }

    #[test]
    fn placeholders_are_substituted() {
        let args = vec!["--port={port}".to_string(), "--stdio".to_string()];
        assert_eq!(
            substitute(&args, "{port}", "4242"),
            vec!["--port=4242", "--stdio"]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failure() {
        let config = ServerConfig::new("ghost", "lsbroker-no-such-binary-xyz");
        let err = spawn_server(&config, &ProjectPath::new("/"), Arc::new(log_stderr_line))
            .await
            .err()
            .unwrap();
        match err {
            LspError::SpawnFailed(msg) => assert!(msg.contains("ghost")),
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_lines_reach_handler_and_tail() {
        let mut config = ServerConfig::new("sh", "sh");
        config.args = vec!["-c".into(), "echo one >&2; echo two >&2".into()];
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: StderrHandler = Arc::new(move |_, line| {
            let _ = tx.send(line.to_string());
        });
        let spawned = spawn_server(&config, &ProjectPath::new("/"), handler)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
        assert_eq!(spawned.stderr.lines(), vec!["one", "two"]);
    }

    #[cfg(unix)]
    /// Wait for `sh` to write the substituted placeholder into `path`.
    async fn written_line(path: &std::path::Path) -> String {
        for _ in 0..500 {
            if let Ok(text) = std::fs::read_to_string(path) {
                if text.ends_with('\n') {
                    return text.trim().to_string();
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("{} was never written", path.display());
    }

    #[cfg(unix)]
    /// Play the server side of `initialize` on a connected-back stream.
    async fn answer_initialize<S>(stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        use crate::transport::{
            frame_message, parse_message, read_frame, serialize_response, JsonRpcMessage,
        };
        use tokio::io::AsyncWriteExt;

        let (read, mut write) = tokio::io::split(stream);
        let mut reader = tokio::io::BufReader::new(read);
        let body = read_frame(&mut reader).await.unwrap().unwrap();
        let JsonRpcMessage::Request { id, method, .. } = parse_message(&body).unwrap() else {
            panic!("expected a request, got {body}");
        };
        assert_eq!(method, "initialize");
        let reply = serialize_response(&id, serde_json::json!({ "capabilities": { "hoverProvider": true } }));
        write.write_all(&frame_message(&reply)).await.unwrap();
        write.flush().await.unwrap();
    }

    #[cfg(unix)]
    async fn initialize_over(spawned: &SpawnedServer) -> lsp_types::InitializeResult {
        spawned.connection.listen().unwrap();
        spawned
            .connection
            .initialize(lsp_types::InitializeParams::default())
            .await
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn socket_transport_connects_back_on_port() {
        let dir = tempfile::tempdir().unwrap();
        let port_file = dir.path().join("port");
        let mut config = ServerConfig::new("tcp-ls", "sh");
        config.connection = ConnectionKind::Socket;
        config.args = vec![
            "-c".into(),
            format!("echo {{port}} > '{}'; sleep 30", port_file.display()),
        ];

        let connect = async {
            let port: u16 = written_line(&port_file).await.parse().unwrap();
            tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap()
        };
        let root = ProjectPath::new("/");
        let (spawned, stream) = tokio::join!(
            spawn_server(&config, &root, Arc::new(log_stderr_line)),
            connect
        );
        let spawned = spawned.unwrap();

        let (result, ()) = tokio::join!(initialize_over(&spawned), answer_initialize(stream));
        assert!(result.capabilities.hover_provider.is_some());
        spawned.process.kill();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ipc_transport_connects_back_on_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let pipe_file = dir.path().join("pipe");
        let mut config = ServerConfig::new("ipc-ls", "sh");
        config.connection = ConnectionKind::Ipc;
        config.args = vec![
            "-c".into(),
            format!("echo {{pipe}} > '{}'; sleep 30", pipe_file.display()),
        ];

        let connect = async {
            let pipe = written_line(&pipe_file).await;
            tokio::net::UnixStream::connect(pipe).await.unwrap()
        };
        let root = ProjectPath::new("/");
        let (spawned, stream) = tokio::join!(
            spawn_server(&config, &root, Arc::new(log_stderr_line)),
            connect
        );
        let spawned = spawned.unwrap();

        let (result, ()) = tokio::join!(initialize_over(&spawned), answer_initialize(stream));
        assert!(result.capabilities.hover_provider.is_some());
        spawned.process.kill();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_is_idempotent() {
        let mut config = ServerConfig::new("sleeper", "sleep");
        config.args = vec!["30".into()];
        let spawned = spawn_server(&config, &ProjectPath::new("/"), Arc::new(log_stderr_line))
            .await
            .unwrap();
        assert!(spawned.process.pid().is_some());
        spawned.process.kill();
        spawned.process.kill();
    }
}
