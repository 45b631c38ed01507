//! One running server bound to one project.
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use lsp_types::{GotoDefinitionResponse, ServerCapabilities};
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::process::ServerProcessHandle;
use crate::types::{normalize_lexically, uri_to_path, ProjectPath, ServerId};

type Disposable = Box<dyn FnOnce() + Send>;

/// A live server: process, connection, negotiated capabilities, and the
/// resources attached to it.
pub struct ActiveServer {
    id: ServerId,
    project_path: ProjectPath,
    process: Box<dyn ServerProcessHandle>,
    connection: Connection,
    capabilities: ServerCapabilities,
    additional_paths: Mutex<HashSet<PathBuf>>,
    disposables: Mutex<Vec<Disposable>>,
    stopping: AtomicBool,
}

impl ActiveServer {
    /// Bundle a process with its initialized connection.
    pub fn new(
        id: ServerId,
        project_path: ProjectPath,
        process: Box<dyn ServerProcessHandle>,
        connection: Connection,
        capabilities: ServerCapabilities,
    ) -> Self {
        Self {
            id,
            project_path,
            process,
            connection,
            capabilities,
            additional_paths: Mutex::new(HashSet::new()),
            disposables: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        }
    }

    /// Identifier assigned by the manager at start.
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// The project this server was started for.
    pub fn project_path(&self) -> &ProjectPath {
        &self.project_path
    }

    /// The JSON-RPC connection to the server.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Handle on the OS process, for killing it.
    pub fn process(&self) -> &dyn ServerProcessHandle {
        self.process.as_ref()
    }

    /// What the server declared during the handshake.
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    /// Mark as stopping. Returns false if a stop was already under way.
    pub(crate) fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::AcqRel)
    }

    /// True once a stop has begun. Never reset.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Record that this server is authoritative for `dir` as well.
    pub fn claim_path(&self, dir: impl AsRef<Path>) {
        let dir = normalize_lexically(dir.as_ref());
        if self.project_path.contains(&dir) {
            return;
        }
        if self.additional_paths.lock().insert(dir.clone()) {
            tracing::debug!(server = %self.id, path = %dir.display(), "claimed additional path");
        }
    }

    /// True if `path` lies under a claimed directory.
    pub fn has_claimed(&self, path: &Path) -> bool {
        let path = normalize_lexically(path);
        self.additional_paths
            .lock()
            .iter()
            .any(|dir| path.starts_with(dir))
    }

    /// Snapshot of the claimed directories.
    pub fn additional_paths(&self) -> Vec<PathBuf> {
        self.additional_paths.lock().iter().cloned().collect()
    }

    /// Claim the parent directory of every definition target that lies
    /// outside the project.
    pub fn claim_definition_targets(&self, response: &GotoDefinitionResponse) {
        let uris: Vec<&lsp_types::Uri> = match response {
            GotoDefinitionResponse::Scalar(location) => vec![&location.uri],
            GotoDefinitionResponse::Array(locations) => locations.iter().map(|l| &l.uri).collect(),
            GotoDefinitionResponse::Link(links) => links.iter().map(|l| &l.target_uri).collect(),
        };
        for uri in uris {
            let Some(path) = uri_to_path(uri) else {
                continue;
            };
            if self.project_path.contains(&path) {
                continue;
            }
            if let Some(parent) = path.parent() {
                self.claim_path(parent);
            }
        }
    }

    /// Attach a cleanup to run when the server is torn down.
    pub fn add_disposable(&self, dispose: impl FnOnce() + Send + 'static) {
        self.disposables.lock().push(Box::new(dispose));
    }

    /// Run and forget every attached cleanup.
    pub fn dispose_all(&self) {
        let disposables = std::mem::take(&mut *self.disposables.lock());
        for dispose in disposables {
            dispose();
        }
    }
}

impl fmt::Debug for ActiveServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveServer")
            .field("id", &self.id)
            .field("project_path", &self.project_path)
            .field("pid", &self.process.pid())
            .field("connection", &self.connection)
            .finish()
    }
}
