//! Identities and value types shared by the connection and the manager.
use std::fmt;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};
use std::str::FromStr;
use std::time::Duration;

use lsp_types::{
    ClientCapabilities, DidChangeWatchedFilesClientCapabilities, GotoCapability,
    HoverClientCapabilities, PublishDiagnosticsClientCapabilities,
    TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities, Uri,
    WindowClientCapabilities, WorkspaceClientCapabilities,
};

use crate::error::LspError;

/// Opaque identifier for one running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(u64);

impl ServerId {
    /// Create a new server ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Return the raw numeric id.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque identifier for an editor supplied by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EditorId(u64);

impl EditorId {
    /// Create a new editor ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Return the raw numeric id.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The capability set the manager needs from an editor.
pub trait TextEditor: Send + Sync {
    /// Stable identity of this editor.
    fn id(&self) -> EditorId;
    /// File on disk, or `None` for an unsaved buffer.
    fn path(&self) -> Option<PathBuf>;
    /// Grammar or language scope, e.g. `source.rust`.
    fn grammar_scope(&self) -> &str;
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn with_trailing_separator(path: &Path) -> String {
    let mut text = path.to_string_lossy().into_owned();
    if !text.ends_with(MAIN_SEPARATOR) {
        text.push(MAIN_SEPARATOR);
    }
    text
}

/// A project root directory, stored normalized and with a trailing
/// separator so that prefix matching cannot confuse `/a/b` with `/a/bc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectPath(String);

impl ProjectPath {
    /// Lexically normalize `path` into a project path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self(with_trailing_separator(&normalize_lexically(path.as_ref())))
    }

    /// Like [`new`](Self::new), but resolves symlinks when the directory
    /// exists.
    pub fn canonical(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::canonicalize(path) {
            Ok(resolved) => Self::new(resolved),
            Err(_) => Self::new(path),
        }
    }

    /// The normalized text, always ending in a separator.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The directory as a path.
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// True if `path` is this directory or lies anywhere beneath it.
    pub fn contains(&self, path: &Path) -> bool {
        with_trailing_separator(&normalize_lexically(path)).starts_with(&self.0)
    }

    /// `file://` URI of the directory.
    pub fn to_uri(&self) -> Result<Uri, LspError> {
        path_to_uri(self.as_path())
    }
}

impl fmt::Display for ProjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Convert an absolute path to a `file://` URI.
pub fn path_to_uri(path: &Path) -> Result<Uri, LspError> {
    let url = url::Url::from_file_path(path)
        .map_err(|()| LspError::InvalidMessage(format!("not an absolute path: {}", path.display())))?;
    Uri::from_str(url.as_str())
        .map_err(|e| LspError::InvalidMessage(format!("invalid uri {url}: {e}")))
}

/// Convert a `file://` URI back to a path. `None` for other schemes.
pub fn uri_to_path(uri: &Uri) -> Option<PathBuf> {
    url::Url::parse(uri.as_str()).ok()?.to_file_path().ok()
}

/// What happened to a watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created.
    Created,
    /// File contents changed.
    Changed,
    /// File was deleted.
    Deleted,
    /// File moved here from `old_path`.
    Renamed {
        /// Where the file used to live.
        old_path: PathBuf,
    },
}

/// One filesystem change reported by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// The affected file (the new location for renames).
    pub path: PathBuf,
    /// Kind of change.
    pub kind: FileEventKind,
}

impl FileEvent {
    /// Shorthand for a non-rename event.
    pub fn new(path: impl Into<PathBuf>, kind: FileEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Transport used to talk to a spawned server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionKind {
    /// The child's stdin and stdout.
    #[default]
    Stdio,
    /// A TCP socket on localhost; the server connects back to `{port}`.
    Socket,
    /// A local IPC socket; the server connects back to `{pipe}`.
    Ipc,
}

/// How to launch and initialize one kind of server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Display name, e.g. "rust-analyzer".
    pub name: String,
    /// Executable.
    pub command: String,
    /// Arguments; may contain `{port}` or `{pipe}`.
    pub args: Vec<String>,
    /// Language identifier sent with `didOpen`.
    pub language_id: String,
    /// File extensions (without the dot) this server handles.
    pub extensions: Vec<String>,
    /// Transport.
    pub connection: ConnectionKind,
    /// Optional bound on the `initialize` round-trip.
    pub initialize_timeout: Option<Duration>,
    /// How many stderr lines to keep for error messages.
    pub stderr_tail_lines: usize,
    /// Forwarded verbatim as `initializationOptions`.
    pub initialization_options: Option<serde_json::Value>,
}

impl ServerConfig {
    /// A stdio server with defaults for everything else.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            language_id: name.clone(),
            name,
            command: command.into(),
            args: Vec::new(),
            extensions: Vec::new(),
            connection: ConnectionKind::Stdio,
            initialize_timeout: None,
            stderr_tail_lines: 100,
            initialization_options: None,
        }
    }

    /// True if `path` has one of the configured extensions.
    pub fn handles_path(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
    }
}

/// Client capabilities sent during initialization.
pub fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            apply_edit: Some(true),
            workspace_folders: Some(true),
            configuration: Some(true),
            did_change_watched_files: Some(DidChangeWatchedFilesClientCapabilities {
                dynamic_registration: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(true),
                will_save_wait_until: Some(false),
                did_save: Some(true),
            }),
            hover: Some(HoverClientCapabilities::default()),
            definition: Some(GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(false),
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities::default()),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            show_message: None,
            work_done_progress: Some(false),
            show_document: None,
        }),
        ..Default::default()
    }
}
