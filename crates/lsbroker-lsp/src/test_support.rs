//! In-memory stand-ins for servers, processes, and editors.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lsp_types::InitializeParams;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::LspError;
use crate::hooks::{BusyHandle, BusyReporter, Notifier, ServerFactory, UserNotification};
use crate::launcher::handshake;
use crate::process::ServerProcessHandle;
use crate::server::ActiveServer;
use crate::transport::{
    frame_message, parse_message, read_frame, serialize_error_response, serialize_notification,
    serialize_request, serialize_response, JsonRpcMessage, RequestId, RpcError,
};
use crate::types::{EditorId, ProjectPath, ServerId, TextEditor};

/// A connection and the server end of its in-memory transport.
pub(crate) fn connection_pair(name: &str) -> (Connection, FakePeer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    (
        Connection::new(name, client_read, client_write),
        FakePeer {
            reader: BufReader::new(server_read),
            writer: server_write,
        },
    )
}

/// Parse a JSON id back into a [`RequestId`].
pub(crate) fn request_id(value: &Value) -> RequestId {
    serde_json::from_value(value.clone()).unwrap()
}

/// The server side of [`connection_pair`], driven by hand.
pub(crate) struct FakePeer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakePeer {
    pub(crate) async fn try_recv_raw(&mut self) -> Option<Value> {
        let body = read_frame(&mut self.reader).await.ok()??;
        serde_json::from_str(&body).ok()
    }

    pub(crate) async fn recv_raw(&mut self) -> Value {
        self.try_recv_raw().await.expect("client closed the transport")
    }

    /// Next message, which must be a request.
    pub(crate) async fn expect_request(&mut self) -> (RequestId, String, Value) {
        let raw = self.recv_raw().await;
        match parse_message(&raw.to_string()).unwrap() {
            JsonRpcMessage::Request { id, method, params } => (id, method, params),
            other => panic!("expected a request, got {other:?}"),
        }
    }

    async fn send(&mut self, body: String) {
        self.writer.write_all(&frame_message(&body)).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Send `message` as-is, however malformed.
    pub(crate) async fn send_json(&mut self, message: Value) {
        self.send(message.to_string()).await;
    }

    pub(crate) async fn respond(&mut self, id: RequestId, result: Value) {
        self.send(serialize_response(&id, result)).await;
    }

    pub(crate) async fn respond_error(&mut self, id: RequestId, code: i32, message: &str) {
        self.send(serialize_error_response(&id, &RpcError::new(code, message)))
            .await;
    }

    pub(crate) async fn notify(&mut self, method: &str, params: Value) {
        self.send(serialize_notification(method, params)).await;
    }

    pub(crate) async fn request(&mut self, id: RequestId, method: &str, params: Value) {
        self.send(serialize_request(&id, method, params)).await;
    }
}

/// Complete the handshake on `conn` with `peer` answering.
pub(crate) async fn handshake_with(conn: &Connection, peer: &mut FakePeer, capabilities: Value) {
    let init = conn.initialize(InitializeParams::default());
    let answer = async {
        let (id, method, _) = peer.expect_request().await;
        assert_eq!(method, "initialize");
        peer.respond(id, json!({ "capabilities": capabilities })).await;
    };
    let (result, ()) = tokio::join!(init, answer);
    result.unwrap();
    conn.initialized().unwrap();
    assert_eq!(peer.recv_raw().await["method"], "initialized");
}

/// A server that answers everything on its own and records what it saw.
pub(crate) struct ScriptedServer {
    received: Arc<Mutex<Vec<(String, Value)>>>,
    crash: CancellationToken,
}

impl ScriptedServer {
    pub(crate) fn spawn(peer: FakePeer, capabilities: Value) -> Self {
        Self::spawn_with(peer, capabilities, true)
    }

    /// With `answers_shutdown` off, `shutdown` is recorded but never
    /// answered, like a wedged server.
    pub(crate) fn spawn_with(mut peer: FakePeer, capabilities: Value, answers_shutdown: bool) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let crash = CancellationToken::new();
        let log = received.clone();
        let crashed = crash.clone();
        tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    _ = crashed.cancelled() => return,
                    raw = peer.try_recv_raw() => match raw {
                        Some(raw) => raw,
                        None => return,
                    },
                };
                let Some(method) = raw["method"].as_str().map(str::to_string) else {
                    continue;
                };
                log.lock().push((method.clone(), raw["params"].clone()));
                if method == "shutdown" && !answers_shutdown {
                    continue;
                }
                if let Some(id) = raw.get("id") {
                    let result = match method.as_str() {
                        "initialize" => json!({ "capabilities": capabilities }),
                        "textDocument/completion" => {
                            json!({ "isIncomplete": false, "items": [{ "label": "fake" }] })
                        }
                        _ => Value::Null,
                    };
                    peer.respond(request_id(id), result).await;
                }
                if method == "exit" {
                    return;
                }
            }
        });
        Self { received, crash }
    }

    /// Drop the transport as if the process died.
    pub(crate) fn crash(&self) {
        self.crash.cancel();
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        self.received.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub(crate) fn params_of(&self, method: &str) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

/// A process handle that only counts kills.
#[derive(Clone, Default)]
pub(crate) struct FakeProcess {
    kills: Arc<AtomicUsize>,
}

impl FakeProcess {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn sharing(kills: Arc<AtomicUsize>) -> Self {
        Self { kills }
    }
}

impl ServerProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

/// A factory backed by [`ScriptedServer`]s.
pub(crate) struct FakeFactory {
    spawns: AtomicUsize,
    kills: Arc<AtomicUsize>,
    fail: AtomicBool,
    answers_shutdown: AtomicBool,
    capabilities: Value,
    start_delay: Duration,
    servers: Mutex<Vec<(ProjectPath, ScriptedServer)>>,
}

impl FakeFactory {
    pub(crate) fn new(capabilities: Value) -> Arc<Self> {
        Arc::new(Self {
            spawns: AtomicUsize::new(0),
            kills: Arc::new(AtomicUsize::new(0)),
            fail: AtomicBool::new(false),
            answers_shutdown: AtomicBool::new(true),
            capabilities,
            start_delay: Duration::from_millis(20),
            servers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Servers started from now on leave `shutdown` unanswered.
    pub(crate) fn set_answers_shutdown(&self, answers: bool) {
        self.answers_shutdown.store(answers, Ordering::SeqCst);
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub(crate) fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Crash the newest server for `project`.
    pub(crate) fn crash(&self, project: &ProjectPath) {
        if let Some((_, server)) = self.servers.lock().iter().rev().find(|(p, _)| p == project) {
            server.crash();
        }
    }

    /// Methods received by the newest server for `project`.
    pub(crate) fn methods(&self, project: &ProjectPath) -> Vec<String> {
        self.with_latest(project, ScriptedServer::methods)
    }

    pub(crate) fn params_of(&self, project: &ProjectPath, method: &str) -> Vec<Value> {
        self.with_latest(project, |s| s.params_of(method))
    }

    fn with_latest<T: Default>(&self, project: &ProjectPath, f: impl Fn(&ScriptedServer) -> T) -> T {
        self.servers
            .lock()
            .iter()
            .rev()
            .find(|(p, _)| p == project)
            .map(|(_, s)| f(s))
            .unwrap_or_default()
    }
}

#[async_trait]
impl ServerFactory for FakeFactory {
    fn server_name(&self) -> &str {
        "fake-ls"
    }

    fn language_name(&self) -> &str {
        "Fake"
    }

    fn should_start_for_editor(&self, editor: &dyn TextEditor) -> bool {
        editor.grammar_scope() == "source.fake"
    }

    fn filter_change_watched_files(&self, path: &Path) -> bool {
        !path.components().any(|c| c.as_os_str() == "target")
    }

    async fn start_server(
        &self,
        project: &ProjectPath,
        id: ServerId,
    ) -> Result<ActiveServer, LspError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.start_delay).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(LspError::SpawnFailed("fake-ls: no such file".into()));
        }
        let (conn, peer) = connection_pair(&format!("fake-ls {project}"));
        let scripted = ScriptedServer::spawn_with(
            peer,
            self.capabilities.clone(),
            self.answers_shutdown.load(Ordering::SeqCst),
        );
        let capabilities = handshake(&conn, project, None, None).await?;
        self.servers.lock().push((project.clone(), scripted));
        Ok(ActiveServer::new(
            id,
            project.clone(),
            Box::new(FakeProcess::sharing(self.kills.clone())),
            conn,
            capabilities,
        ))
    }
}

pub(crate) struct FakeEditor {
    id: EditorId,
    path: Option<PathBuf>,
    scope: String,
}

impl FakeEditor {
    pub(crate) fn new(id: u64, path: &str) -> Arc<Self> {
        Arc::new(Self {
            id: EditorId::new(id),
            path: Some(PathBuf::from(path)),
            scope: "source.fake".into(),
        })
    }

    pub(crate) fn with_scope(id: u64, path: &str, scope: &str) -> Arc<Self> {
        Arc::new(Self {
            id: EditorId::new(id),
            path: Some(PathBuf::from(path)),
            scope: scope.into(),
        })
    }

    pub(crate) fn unsaved(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id: EditorId::new(id),
            path: None,
            scope: "source.fake".into(),
        })
    }
}

impl TextEditor for FakeEditor {
    fn id(&self) -> EditorId {
        self.id
    }

    fn path(&self) -> Option<PathBuf> {
        self.path.clone()
    }

    fn grammar_scope(&self) -> &str {
        &self.scope
    }
}

/// Remembers every notification.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    seen: Mutex<Vec<UserNotification>>,
}

impl RecordingNotifier {
    pub(crate) fn all(&self) -> Vec<UserNotification> {
        self.seen.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: UserNotification) {
        self.seen.lock().push(notification);
    }
}

/// Counts busy scopes begun and ended.
#[derive(Default)]
pub(crate) struct RecordingBusy {
    titles: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicUsize>,
}

impl RecordingBusy {
    pub(crate) fn titles(&self) -> Vec<String> {
        self.titles.lock().clone()
    }

    pub(crate) fn open_scopes(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl BusyReporter for RecordingBusy {
    fn begin(&self, title: &str) -> BusyHandle {
        self.titles.lock().push(title.to_string());
        self.open.fetch_add(1, Ordering::SeqCst);
        let open = self.open.clone();
        BusyHandle::new(move || {
            open.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

/// Poll `condition` until it holds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
