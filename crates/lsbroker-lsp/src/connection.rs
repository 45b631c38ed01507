//! A typed JSON-RPC connection to one language server.
//!
//! Owns the reader and writer tasks for a single transport, correlates
//! responses with requests, enforces the `initialize` → `initialized`
//! handshake ordering, and turns every way the transport can go away
//! into one `closed` signal.
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use lsp_types::notification::{self, Notification};
use lsp_types::request::{self, Request};
use lsp_types::{
    CodeActionParams, CodeActionResponse, CodeLens, CodeLensParams, CompletionItem,
    CompletionParams, CompletionResponse, DidChangeConfigurationParams,
    DidChangeTextDocumentParams, DidChangeWatchedFilesParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, DocumentFormattingParams,
    DocumentHighlight, DocumentHighlightParams, DocumentOnTypeFormattingParams,
    DocumentRangeFormattingParams, DocumentSymbolParams, DocumentSymbolResponse,
    ExecuteCommandParams, FoldingRange, FoldingRangeParams, GotoDefinitionParams,
    GotoDefinitionResponse, Hover, HoverParams, InitializeParams, InitializeResult,
    InitializedParams, Location, ReferenceParams, RenameParams, SignatureHelp,
    SignatureHelpParams, TextEdit, WillSaveTextDocumentParams, WorkspaceEdit,
    WorkspaceSymbolParams, WorkspaceSymbolResponse,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{DispatchResult, Dispatcher, RequestFuture, Routed};
use crate::error::{
    LspError, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, REQUEST_CANCELLED,
};
use crate::transport::{
    frame_message, parse_message, read_frame, serialize_error_response, serialize_notification,
    serialize_request, serialize_response, JsonRpcMessage, RequestId, RpcError,
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport state. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created; reader and writer not running yet.
    Disconnected,
    /// Listening on the transport.
    Connected,
    /// Transport gone; no further traffic.
    Closed,
}

/// Progress of the `initialize` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet.
    NotStarted,
    /// `initialize` in flight.
    Initializing,
    /// `initialize` succeeded; `initialized` not yet sent.
    Negotiated,
    /// `initialized` sent; every request is allowed.
    Ready,
    /// `initialize` failed.
    Failed,
}

struct Shared {
    name: String,
    state: Mutex<ConnectionState>,
    handshake: Mutex<HandshakeState>,
    dispatcher: Mutex<Dispatcher>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    closed: CancellationToken,
    expect_close: AtomicBool,
    next_id: AtomicI64,
}

impl Shared {
    fn send_raw(&self, body: String) -> Result<(), LspError> {
        let guard = self.writer_tx.lock();
        let tx = guard.as_ref().ok_or(LspError::ConnectionClosed)?;
        tx.send(frame_message(&body))
            .map_err(|_| LspError::ConnectionClosed)
    }

    /// Move to `Closed`. Returns false if already closed.
    fn mark_closed(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
        }
        // Dropping the sender lets the writer drain what is queued, then stop.
        // It goes before the pending table so a request registered in
        // between fails to send instead of waiting forever.
        self.writer_tx.lock().take();
        self.dispatcher.lock().cancel_all();
        if self.expect_close.load(Ordering::Acquire) {
            tracing::debug!(server = %self.name, "connection closed");
        } else {
            tracing::warn!(server = %self.name, "connection closed unexpectedly");
        }
        self.closed.cancel();
        true
    }
}

/// A JSON-RPC connection to a single language server.
pub struct Connection {
    shared: Arc<Shared>,
    io: Mutex<Option<(BoxedReader, BoxedWriter)>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap a transport. Nothing is read or written until [`listen`](Self::listen).
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(ConnectionState::Disconnected),
                handshake: Mutex::new(HandshakeState::NotStarted),
                dispatcher: Mutex::new(Dispatcher::new()),
                writer_tx: Mutex::new(None),
                closed: CancellationToken::new(),
                expect_close: AtomicBool::new(false),
                next_id: AtomicI64::new(1),
            }),
            io: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
            reader_task: Mutex::new(None),
        }
    }

    /// Name used in log records.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current transport state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Current handshake state.
    pub fn handshake_state(&self) -> HandshakeState {
        *self.shared.handshake.lock()
    }

    /// True while the transport is up.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Start the reader and writer tasks.
    pub fn listen(&self) -> Result<(), LspError> {
        let (reader, writer) = {
            let mut state = self.shared.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(LspError::Protocol(format!("cannot listen while {:?}", *state)));
            }
            let Some(io) = self.io.lock().take() else {
                return Err(LspError::ConnectionClosed);
            };
            *state = ConnectionState::Connected;
            io
        };

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        *self.shared.writer_tx.lock() = Some(writer_tx);

        tokio::spawn(write_loop(writer, writer_rx, self.shared.clone()));
        let reader = tokio::spawn(read_loop(reader, self.shared.clone()));
        *self.reader_task.lock() = Some(reader);
        tracing::debug!(server = %self.shared.name, "connection listening");
        Ok(())
    }

    /// Resolves once the transport has closed, for whatever reason.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// A token cancelled when the transport closes. Cancelling it does
    /// not affect the connection.
    pub fn closed_signal(&self) -> CancellationToken {
        self.shared.closed.child_token()
    }

    /// Release the transport. Queued messages are still flushed.
    pub fn dispose(&self) {
        self.shared.expect_close.store(true, Ordering::Release);
        self.shared.mark_closed();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.io.lock().take();
    }

    fn ensure_connected(&self) -> Result<(), LspError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(LspError::ConnectionClosed),
            ConnectionState::Disconnected => {
                Err(LspError::Protocol("connection is not listening".into()))
            }
        }
    }

    fn ensure_ready(&self, method: &str) -> Result<(), LspError> {
        self.ensure_connected()?;
        if self.handshake_state() != HandshakeState::Ready {
            return Err(LspError::NotInitialized(method.to_string()));
        }
        Ok(())
    }

    // ── handshake ──────────────────────────────────────────────────────

    /// Send `initialize`. Must be the first request on the connection.
    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, LspError> {
        self.ensure_connected()?;
        {
            let mut handshake = self.shared.handshake.lock();
            if *handshake != HandshakeState::NotStarted {
                return Err(LspError::Protocol(format!(
                    "initialize sent while handshake is {:?}",
                    *handshake
                )));
            }
            *handshake = HandshakeState::Initializing;
        }

        let outcome = async {
            let value = self
                .exchange(request::Initialize::METHOD, serde_json::to_value(params)?, None)
                .await?;
            Ok::<InitializeResult, LspError>(serde_json::from_value(value)?)
        }
        .await;

        *self.shared.handshake.lock() = if outcome.is_ok() {
            HandshakeState::Negotiated
        } else {
            HandshakeState::Failed
        };
        outcome
    }

    /// Send `initialized`. Only valid once, after a successful `initialize`.
    pub fn initialized(&self) -> Result<(), LspError> {
        self.ensure_connected()?;
        {
            let mut handshake = self.shared.handshake.lock();
            if *handshake != HandshakeState::Negotiated {
                return Err(LspError::Protocol(format!(
                    "initialized sent while handshake is {:?}",
                    *handshake
                )));
            }
            *handshake = HandshakeState::Ready;
        }
        self.post(
            notification::Initialized::METHOD,
            serde_json::to_value(InitializedParams {})?,
        )
    }

    /// Ask the server to shut down. Fails fast once the transport is closed.
    pub async fn shutdown(&self) -> Result<(), LspError> {
        self.request::<request::Shutdown>((), None).await
    }

    /// Tell the server to exit. Allowed at any point while connected.
    pub fn exit(&self) -> Result<(), LspError> {
        self.ensure_connected()?;
        self.shared.expect_close.store(true, Ordering::Release);
        self.post(notification::Exit::METHOD, Value::Null)
    }

    // ── generic plumbing ───────────────────────────────────────────────

    /// Send a typed request and wait for its typed result.
    pub async fn request<R: Request>(
        &self,
        params: R::Params,
        cancel: Option<&CancellationToken>,
    ) -> Result<R::Result, LspError> {
        let params = serde_json::to_value(params)?;
        let value = self.send_request(R::METHOD, params, cancel).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a typed notification.
    pub fn notify<N: Notification>(&self, params: N::Params) -> Result<(), LspError> {
        self.send_notification(N::METHOD, serde_json::to_value(params)?)
    }

    /// Send an untyped request. Requires a completed handshake.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, LspError> {
        self.ensure_ready(method)?;
        self.exchange(method, params, cancel).await
    }

    /// Send an untyped notification. Requires a completed handshake.
    pub fn send_notification(&self, method: &str, params: Value) -> Result<(), LspError> {
        self.ensure_ready(method)?;
        self.post(method, params)
    }

    fn post(&self, method: &str, params: Value) -> Result<(), LspError> {
        tracing::debug!(server = %self.shared.name, %method, %params, "--> notification");
        self.shared
            .send_raw(serialize_notification(method, params))
            .inspect_err(|e| {
                tracing::error!(server = %self.shared.name, %method, error = %e, "notification failed");
            })
    }

    async fn exchange(
        &self,
        method: &str,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, LspError> {
        let name = &self.shared.name;
        if cancel.is_some_and(|token| token.is_cancelled()) {
            tracing::debug!(server = %name, %method, "request cancelled before send");
            return Err(LspError::Cancelled {
                method: method.to_string(),
            });
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.shared.dispatcher.lock().register_request(id);
        let started = Instant::now();
        tracing::debug!(server = %name, %method, id, %params, "--> request");

        if let Err(e) = self
            .shared
            .send_raw(serialize_request(&RequestId::Number(id), method, params))
        {
            self.shared.dispatcher.lock().cancel(id);
            tracing::error!(server = %name, %method, id, error = %e, "request not sent");
            return Err(e);
        }

        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                outcome = rx => outcome,
                _ = token.cancelled() => {
                    self.shared.dispatcher.lock().cancel(id);
                    // Best effort; the transport may already be gone.
                    let _ = self.shared.send_raw(serialize_notification(
                        "$/cancelRequest",
                        serde_json::json!({ "id": id }),
                    ));
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    tracing::debug!(server = %name, %method, id, elapsed_ms, "request cancelled");
                    return Err(LspError::Cancelled { method: method.to_string() });
                }
            },
            None => rx.await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(DispatchResult::Success(value)) => {
                tracing::debug!(server = %name, %method, id, elapsed_ms, result = %value, "<-- response");
                Ok(value)
            }
            Ok(DispatchResult::Error(err)) if err.code == REQUEST_CANCELLED => {
                tracing::debug!(server = %name, %method, id, elapsed_ms, "request cancelled by server");
                Err(LspError::Cancelled {
                    method: method.to_string(),
                })
            }
            Ok(DispatchResult::Error(err)) => {
                tracing::error!(
                    server = %name, %method, id, elapsed_ms,
                    code = err.code, message = %err.message,
                    "request failed"
                );
                Err(LspError::Rpc {
                    code: err.code,
                    message: err.message,
                })
            }
            Err(_) => {
                tracing::error!(server = %name, %method, id, elapsed_ms, "connection closed before response");
                Err(LspError::ConnectionClosed)
            }
        }
    }

    // ── inbound handlers ───────────────────────────────────────────────

    /// Handle notifications of type `N`. Replaces a previous handler.
    pub fn on_notification<N, F>(&self, handler: F)
    where
        N: Notification,
        F: Fn(N::Params) + Send + Sync + 'static,
    {
        let name = self.shared.name.clone();
        self.shared.dispatcher.lock().set_notification_handler(
            N::METHOD,
            Arc::new(move |params| match serde_json::from_value::<N::Params>(params) {
                Ok(params) => handler(params),
                Err(e) => tracing::error!(
                    server = %name, method = N::METHOD, error = %e,
                    "malformed notification params"
                ),
            }),
        );
    }

    /// Answer requests of type `R`. Replaces a previous handler.
    pub fn on_request<R, F, Fut>(&self, handler: F)
    where
        R: Request,
        F: Fn(R::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Result, RpcError>> + Send + 'static,
    {
        self.shared.dispatcher.lock().set_request_handler(
            R::METHOD,
            Arc::new(move |params| -> RequestFuture {
                match serde_json::from_value::<R::Params>(params) {
                    Ok(params) => {
                        let reply = handler(params);
                        Box::pin(async move {
                            let result = reply.await?;
                            serde_json::to_value(result)
                                .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))
                        })
                    }
                    Err(e) => Box::pin(std::future::ready(Err(RpcError::new(
                        INVALID_PARAMS,
                        e.to_string(),
                    )))),
                }
            }),
        );
    }

    /// `textDocument/publishDiagnostics`.
    pub fn on_publish_diagnostics<F>(&self, handler: F)
    where
        F: Fn(<notification::PublishDiagnostics as Notification>::Params) + Send + Sync + 'static,
    {
        self.on_notification::<notification::PublishDiagnostics, _>(handler);
    }

    /// `window/logMessage`.
    pub fn on_log_message<F>(&self, handler: F)
    where
        F: Fn(<notification::LogMessage as Notification>::Params) + Send + Sync + 'static,
    {
        self.on_notification::<notification::LogMessage, _>(handler);
    }

    /// `window/showMessage`.
    pub fn on_show_message<F>(&self, handler: F)
    where
        F: Fn(<notification::ShowMessage as Notification>::Params) + Send + Sync + 'static,
    {
        self.on_notification::<notification::ShowMessage, _>(handler);
    }

    /// `telemetry/event`.
    pub fn on_telemetry<F>(&self, handler: F)
    where
        F: Fn(<notification::TelemetryEvent as Notification>::Params) + Send + Sync + 'static,
    {
        self.on_notification::<notification::TelemetryEvent, _>(handler);
    }

    /// `workspace/applyEdit`.
    pub fn on_apply_edit<F, Fut>(&self, handler: F)
    where
        F: Fn(<request::ApplyWorkspaceEdit as Request>::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<<request::ApplyWorkspaceEdit as Request>::Result, RpcError>>
            + Send
            + 'static,
    {
        self.on_request::<request::ApplyWorkspaceEdit, _, _>(handler);
    }

    /// `workspace/configuration`.
    pub fn on_configuration<F, Fut>(&self, handler: F)
    where
        F: Fn(<request::WorkspaceConfiguration as Request>::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<<request::WorkspaceConfiguration as Request>::Result, RpcError>>
            + Send
            + 'static,
    {
        self.on_request::<request::WorkspaceConfiguration, _, _>(handler);
    }

    /// `window/showMessageRequest`.
    pub fn on_show_message_request<F, Fut>(&self, handler: F)
    where
        F: Fn(<request::ShowMessageRequest as Request>::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<<request::ShowMessageRequest as Request>::Result, RpcError>>
            + Send
            + 'static,
    {
        self.on_request::<request::ShowMessageRequest, _, _>(handler);
    }

    /// `client/registerCapability`.
    pub fn on_register_capability<F, Fut>(&self, handler: F)
    where
        F: Fn(<request::RegisterCapability as Request>::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<<request::RegisterCapability as Request>::Result, RpcError>>
            + Send
            + 'static,
    {
        self.on_request::<request::RegisterCapability, _, _>(handler);
    }

    // ── text document sync ─────────────────────────────────────────────

    /// `textDocument/didOpen`.
    pub fn did_open(&self, params: DidOpenTextDocumentParams) -> Result<(), LspError> {
        self.notify::<notification::DidOpenTextDocument>(params)
    }

    /// `textDocument/didChange`.
    pub fn did_change(&self, params: DidChangeTextDocumentParams) -> Result<(), LspError> {
        self.notify::<notification::DidChangeTextDocument>(params)
    }

    /// `textDocument/willSave`.
    pub fn will_save(&self, params: WillSaveTextDocumentParams) -> Result<(), LspError> {
        self.notify::<notification::WillSaveTextDocument>(params)
    }

    /// `textDocument/didSave`.
    pub fn did_save(&self, params: DidSaveTextDocumentParams) -> Result<(), LspError> {
        self.notify::<notification::DidSaveTextDocument>(params)
    }

    /// `textDocument/didClose`.
    pub fn did_close(&self, params: DidCloseTextDocumentParams) -> Result<(), LspError> {
        self.notify::<notification::DidCloseTextDocument>(params)
    }

    /// `workspace/didChangeWatchedFiles`.
    pub fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) -> Result<(), LspError> {
        self.notify::<notification::DidChangeWatchedFiles>(params)
    }

    /// `workspace/didChangeConfiguration`.
    pub fn did_change_configuration(
        &self,
        params: DidChangeConfigurationParams,
    ) -> Result<(), LspError> {
        self.notify::<notification::DidChangeConfiguration>(params)
    }

    // ── language features ──────────────────────────────────────────────

    /// `textDocument/completion`.
    pub async fn completion(
        &self,
        params: CompletionParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<CompletionResponse>, LspError> {
        self.request::<request::Completion>(params, cancel).await
    }

    /// `completionItem/resolve`.
    pub async fn completion_resolve(
        &self,
        item: CompletionItem,
        cancel: Option<&CancellationToken>,
    ) -> Result<CompletionItem, LspError> {
        self.request::<request::ResolveCompletionItem>(item, cancel)
            .await
    }

    /// `textDocument/hover`.
    pub async fn hover(
        &self,
        params: HoverParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Hover>, LspError> {
        self.request::<request::HoverRequest>(params, cancel).await
    }

    /// `textDocument/signatureHelp`.
    pub async fn signature_help(
        &self,
        params: SignatureHelpParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<SignatureHelp>, LspError> {
        self.request::<request::SignatureHelpRequest>(params, cancel)
            .await
    }

    /// `textDocument/definition`.
    pub async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<GotoDefinitionResponse>, LspError> {
        self.request::<request::GotoDefinition>(params, cancel).await
    }

    /// `textDocument/references`.
    pub async fn references(
        &self,
        params: ReferenceParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Vec<Location>>, LspError> {
        self.request::<request::References>(params, cancel).await
    }

    /// `textDocument/documentHighlight`.
    pub async fn document_highlight(
        &self,
        params: DocumentHighlightParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Vec<DocumentHighlight>>, LspError> {
        self.request::<request::DocumentHighlightRequest>(params, cancel)
            .await
    }

    /// `textDocument/documentSymbol`.
    pub async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<DocumentSymbolResponse>, LspError> {
        self.request::<request::DocumentSymbolRequest>(params, cancel)
            .await
    }

    /// `workspace/symbol`.
    pub async fn workspace_symbol(
        &self,
        params: WorkspaceSymbolParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<WorkspaceSymbolResponse>, LspError> {
        self.request::<request::WorkspaceSymbolRequest>(params, cancel)
            .await
    }

    /// `textDocument/codeAction`.
    pub async fn code_action(
        &self,
        params: CodeActionParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<CodeActionResponse>, LspError> {
        self.request::<request::CodeActionRequest>(params, cancel)
            .await
    }

    /// `workspace/executeCommand`.
    pub async fn execute_command(
        &self,
        params: ExecuteCommandParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Value>, LspError> {
        self.request::<request::ExecuteCommand>(params, cancel).await
    }

    /// `textDocument/formatting`.
    pub async fn formatting(
        &self,
        params: DocumentFormattingParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Vec<TextEdit>>, LspError> {
        self.request::<request::Formatting>(params, cancel).await
    }

    /// `textDocument/rangeFormatting`.
    pub async fn range_formatting(
        &self,
        params: DocumentRangeFormattingParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Vec<TextEdit>>, LspError> {
        self.request::<request::RangeFormatting>(params, cancel).await
    }

    /// `textDocument/onTypeFormatting`.
    pub async fn on_type_formatting(
        &self,
        params: DocumentOnTypeFormattingParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Vec<TextEdit>>, LspError> {
        self.request::<request::OnTypeFormatting>(params, cancel).await
    }

    /// `textDocument/rename`.
    pub async fn rename(
        &self,
        params: RenameParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<WorkspaceEdit>, LspError> {
        self.request::<request::Rename>(params, cancel).await
    }

    /// `textDocument/codeLens`.
    pub async fn code_lens(
        &self,
        params: CodeLensParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Vec<CodeLens>>, LspError> {
        self.request::<request::CodeLensRequest>(params, cancel).await
    }

    /// `textDocument/foldingRange`.
    pub async fn folding_range(
        &self,
        params: FoldingRangeParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Vec<FoldingRange>>, LspError> {
        self.request::<request::FoldingRangeRequest>(params, cancel)
            .await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("handshake", &self.handshake_state())
            .finish()
    }
}

async fn write_loop(
    mut writer: BoxedWriter,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    while let Some(bytes) = rx.recv().await {
        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::debug!(server = %shared.name, error = %e, "write failed");
            shared.mark_closed();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(reader: BoxedReader, shared: Arc<Shared>) {
    let mut reader = BufReader::new(reader);
    loop {
        let body = match read_frame(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %shared.name, error = %e, "read failed");
                break;
            }
        };
        let message = match parse_message(&body) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(server = %shared.name, error = %e, "dropping malformed message");
                continue;
            }
        };
        match &message {
            JsonRpcMessage::Notification { method, params } => {
                tracing::debug!(server = %shared.name, %method, %params, "<-- notification");
            }
            JsonRpcMessage::Request { id, method, params } => {
                tracing::debug!(server = %shared.name, %method, %id, %params, "<-- request");
            }
            JsonRpcMessage::Response { .. } => {}
        }

        let routed = shared.dispatcher.lock().route(message);
        match routed {
            Routed::Done => {}
            Routed::Notify(handler, params) => handler(params),
            Routed::Request {
                id,
                method,
                handler,
                params,
            } => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let reply = match handler {
                        Some(handler) => handler(params).await,
                        None => Err(RpcError::new(
                            METHOD_NOT_FOUND,
                            format!("unhandled method: {method}"),
                        )),
                    };
                    let body = match reply {
                        Ok(result) => {
                            tracing::debug!(server = %shared.name, %method, %id, %result, "--> response");
                            serialize_response(&id, result)
                        }
                        Err(err) => {
                            tracing::error!(
                                server = %shared.name, %method, %id,
                                code = err.code, message = %err.message,
                                "inbound request failed"
                            );
                            serialize_error_response(&id, &err)
                        }
                    };
                    let _ = shared.send_raw(body);
                });
            }
        }
    }
    shared.mark_closed();
}
