//! Server lifecycle management.
//!
//! [`ServerManager`] owns the project → server map. It deduplicates
//! concurrent starts, routes editors to servers, stops servers nobody
//! uses, and restarts crashed servers within a per-project limit.
//!
//! State lives behind one lock that is never held across an await.
//! Every decision and its recorded effect happen inside a single
//! critical section; the unavoidable suspension points (spawn,
//! handshake, shutdown) are bracketed by the pending-start map on the
//! way up and by removal-before-teardown on the way down.
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use lsp_types::DidChangeWatchedFilesParams;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cancel::with_timeout;
use crate::error::LspError;
use crate::hooks::{
    BusyReporter, LogBusyReporter, LogNotifier, Notifier, ServerFactory, Severity,
    UserNotification,
};
use crate::process::ServerProcessHandle;
use crate::restart::{RestartTracker, DEFAULT_RESTART_LIMIT, DEFAULT_RESTART_WINDOW};
use crate::server::ActiveServer;
use crate::types::{EditorId, FileEvent, ProjectPath, ServerId, TextEditor};
use crate::watched::changes_for_server;

/// Outcome of a start, shared with everyone waiting on it.
type StartOutcome = Option<Result<Arc<ActiveServer>, Arc<LspError>>>;

/// What a project has right now: a running server or a start to join.
enum Lookup {
    Running(Arc<ActiveServer>),
    Pending(watch::Receiver<StartOutcome>),
}

/// Tunables for a [`ServerManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Restarts allowed per project inside one window.
    pub restart_limit: u32,
    /// Length of the restart window.
    pub restart_window: Duration,
    /// Send `shutdown` and `exit` before killing.
    pub graceful_shutdown: bool,
    /// Upper bound on the `shutdown` round-trip.
    pub shutdown_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            restart_limit: DEFAULT_RESTART_LIMIT,
            restart_window: DEFAULT_RESTART_WINDOW,
            graceful_shutdown: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Options for [`ServerManager::get_server`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetServerOptions {
    /// Start a server if none is running or starting.
    pub should_start: bool,
}

impl GetServerOptions {
    /// Start a server when none exists.
    pub fn start() -> Self {
        Self { should_start: true }
    }

    /// Only return a server that is running or already starting.
    pub fn existing() -> Self {
        Self {
            should_start: false,
        }
    }
}

struct State {
    project_paths: Vec<ProjectPath>,
    active: HashMap<ProjectPath, Arc<ActiveServer>>,
    starting: HashMap<ProjectPath, watch::Receiver<StartOutcome>>,
    restarts: RestartTracker,
    editors: HashMap<EditorId, Arc<dyn TextEditor>>,
    bindings: HashMap<EditorId, Arc<ActiveServer>>,
    listening: bool,
    stopping_all: bool,
    next_id: u64,
}

impl State {
    /// Containment against the project roots first (deepest root wins),
    /// then directories claimed by running servers.
    fn route(&self, path: &Path) -> Option<ProjectPath> {
        let by_root = self
            .project_paths
            .iter()
            .filter(|root| root.contains(path))
            .max_by_key(|root| root.as_str().len());
        if let Some(root) = by_root {
            return Some(root.clone());
        }
        self.active
            .values()
            .find(|server| server.has_claimed(path))
            .map(|server| server.project_path().clone())
    }

    /// Whether a crashed server for `project` should come back.
    fn serves(&self, project: &ProjectPath) -> bool {
        !self.stopping_all && self.project_paths.contains(project)
    }

    fn is_active(&self, server: &Arc<ActiveServer>) -> bool {
        self.active
            .get(server.project_path())
            .is_some_and(|current| Arc::ptr_eq(current, server))
    }
}

struct Inner {
    factory: Arc<dyn ServerFactory>,
    busy: Arc<dyn BusyReporter>,
    notifier: Arc<dyn Notifier>,
    options: ManagerOptions,
    state: Mutex<State>,
}

/// Builder for [`ServerManager`].
pub struct ServerManagerBuilder {
    factory: Arc<dyn ServerFactory>,
    busy: Arc<dyn BusyReporter>,
    notifier: Arc<dyn Notifier>,
    options: ManagerOptions,
}

impl ServerManagerBuilder {
    /// Replace the default [`ManagerOptions`].
    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    /// Where start and stop progress is shown. Defaults to the log.
    pub fn busy_reporter(mut self, busy: Arc<dyn BusyReporter>) -> Self {
        self.busy = busy;
        self
    }

    /// Where start failures and restart-limit errors go. Defaults to the log.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Finish the manager. It ignores editor events until
    /// [`ServerManager::start_listening`].
    pub fn build(self) -> ServerManager {
        let restarts = RestartTracker::new(self.options.restart_limit, self.options.restart_window);
        ServerManager {
            inner: Arc::new(Inner {
                factory: self.factory,
                busy: self.busy,
                notifier: self.notifier,
                options: self.options,
                state: Mutex::new(State {
                    project_paths: Vec::new(),
                    active: HashMap::new(),
                    starting: HashMap::new(),
                    restarts,
                    editors: HashMap::new(),
                    bindings: HashMap::new(),
                    listening: false,
                    stopping_all: false,
                    next_id: 0,
                }),
            }),
        }
    }
}

/// Manages the servers of one kind across all projects.
#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<Inner>,
}

impl ServerManager {
    /// Start building a manager for the servers `factory` launches.
    pub fn builder(factory: Arc<dyn ServerFactory>) -> ServerManagerBuilder {
        ServerManagerBuilder {
            factory,
            busy: Arc::new(LogBusyReporter),
            notifier: Arc::new(LogNotifier),
            options: ManagerOptions::default(),
        }
    }

    /// A manager with logging collaborators and default options.
    pub fn new(factory: Arc<dyn ServerFactory>) -> Self {
        Self::builder(factory).build()
    }

    /// The options this manager was built with.
    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Name of the server kind this manager runs.
    pub fn server_name(&self) -> &str {
        self.inner.factory.server_name()
    }

    fn server_label(&self) -> String {
        format!(
            "{} ({})",
            self.inner.factory.server_name(),
            self.inner.factory.language_name()
        )
    }

    // ── queries ────────────────────────────────────────────────────────

    /// Every running server, ordered by project.
    pub fn get_active_servers(&self) -> Vec<Arc<ActiveServer>> {
        let mut servers: Vec<_> = self.inner.state.lock().active.values().cloned().collect();
        servers.sort_by(|a, b| a.project_path().cmp(b.project_path()));
        servers
    }

    /// The running server for `project`, if any.
    pub fn active_server(&self, project: &ProjectPath) -> Option<Arc<ActiveServer>> {
        self.inner.state.lock().active.get(project).cloned()
    }

    /// True while a start for `project` is in flight.
    pub fn is_starting(&self, project: &ProjectPath) -> bool {
        self.inner.state.lock().starting.contains_key(project)
    }

    /// The server `editor` is bound to.
    pub fn server_for_editor(&self, editor: EditorId) -> Option<Arc<ActiveServer>> {
        self.inner.state.lock().bindings.get(&editor).cloned()
    }

    /// Which project a file belongs to.
    pub fn project_for_path(&self, path: &Path) -> Option<ProjectPath> {
        self.inner.state.lock().route(path)
    }

    /// Current project roots.
    pub fn project_paths(&self) -> Vec<ProjectPath> {
        self.inner.state.lock().project_paths.clone()
    }

    // ── start ──────────────────────────────────────────────────────────

    /// The server for `editor`'s project: the running one, the one being
    /// started, or (with `should_start` and an eligible editor) a new one.
    pub async fn get_server(
        &self,
        editor: &dyn TextEditor,
        options: GetServerOptions,
    ) -> Result<Option<Arc<ActiveServer>>, LspError> {
        let Some(path) = editor.path() else {
            return Ok(None);
        };
        let may_start = options.should_start && self.inner.factory.should_start_for_editor(editor);

        let (project, mut pending) = {
            let mut state = self.inner.state.lock();
            let Some(project) = state.route(&path) else {
                return Ok(None);
            };
            if let Some(server) = state.active.get(&project) {
                return Ok(Some(server.clone()));
            }
            let pending = match state.starting.get(&project) {
                Some(pending) => pending.clone(),
                None if !may_start => return Ok(None),
                None if state.restarts.is_blocked(&project) => {
                    return Err(LspError::RestartLimit(project.to_string()));
                }
                None => self.begin_start(&mut state, project.clone()),
            };
            (project, pending)
        };
        wait_for_start(&mut pending, &project).await.map(Some)
    }

    /// Start a server for `project`, or join the start already under way.
    pub async fn start_server(&self, project: ProjectPath) -> Result<Arc<ActiveServer>, LspError> {
        let lookup = self.running_or_start(&mut self.inner.state.lock(), &project);
        resolve(lookup, &project).await
    }

    fn running_or_start(&self, state: &mut State, project: &ProjectPath) -> Lookup {
        if let Some(server) = state.active.get(project) {
            return Lookup::Running(server.clone());
        }
        match state.starting.get(project) {
            Some(pending) => Lookup::Pending(pending.clone()),
            None => Lookup::Pending(self.begin_start(state, project.clone())),
        }
    }

    /// Record the pending start and run it in its own task, so that it
    /// completes (and is cleared) even if every waiter goes away.
    fn begin_start(&self, state: &mut State, project: ProjectPath) -> watch::Receiver<StartOutcome> {
        let (tx, rx) = watch::channel(None);
        state.starting.insert(project.clone(), rx.clone());
        state.next_id += 1;
        let id = ServerId::new(state.next_id);
        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = manager.run_start(project, id).await;
            let _ = tx.send(Some(outcome));
        });
        rx
    }

    async fn run_start(
        &self,
        project: ProjectPath,
        id: ServerId,
    ) -> Result<Arc<ActiveServer>, Arc<LspError>> {
        let label = self.server_label();
        tracing::info!(server = %label, %project, %id, "starting server");
        let started = Instant::now();
        let result = {
            let _busy = self
                .inner
                .busy
                .begin(&format!("Starting {label} for {project}"));
            self.inner.factory.start_server(&project, id).await
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(server) => {
                let server = Arc::new(server);
                {
                    let mut state = self.inner.state.lock();
                    state.starting.remove(&project);
                    state.active.insert(project.clone(), server.clone());
                }
                self.watch_for_crash(&server);
                tracing::info!(server = %label, %project, %id, elapsed_ms, "server started");
                Ok(server)
            }
            Err(e) => {
                self.inner.state.lock().starting.remove(&project);
                tracing::error!(server = %label, %project, elapsed_ms, error = %e, "server failed to start");
                self.inner.notifier.notify(UserNotification {
                    severity: Severity::Error,
                    title: format!("{label} failed to start"),
                    detail: e.to_string(),
                    dismissable: true,
                });
                Err(Arc::new(e))
            }
        }
    }

    // ── stop ───────────────────────────────────────────────────────────

    /// Tear `server` down. A second call for the same server does nothing.
    pub async fn stop_server(&self, server: &Arc<ActiveServer>) {
        if !server.begin_stop() {
            tracing::debug!(server = %server.id(), "stop already in progress");
            return;
        }
        self.finish_stop(server).await;
    }

    /// Claim the stop of `server` only while no editor is bound to it.
    /// Deciding and unmapping share one critical section, so an editor
    /// bound concurrently either keeps the server or is refused by it.
    fn claim_if_unused(&self, server: &Arc<ActiveServer>) -> bool {
        let mut state = self.inner.state.lock();
        if state.bindings.values().any(|bound| Arc::ptr_eq(bound, server)) {
            return false;
        }
        if !server.begin_stop() {
            return false;
        }
        if state.is_active(server) {
            state.active.remove(server.project_path());
        }
        true
    }

    /// Everything after `begin_stop` has been won.
    async fn finish_stop(&self, server: &Arc<ActiveServer>) {
        let project = server.project_path();
        let label = self.server_label();
        let _busy = self
            .inner
            .busy
            .begin(&format!("Stopping {label} for {project}"));
        let _kill = KillOnDrop(server.process());

        {
            let mut state = self.inner.state.lock();
            if state.is_active(server) {
                state.active.remove(project);
            }
            state.bindings.retain(|_, bound| !Arc::ptr_eq(bound, server));
        }

        server.dispose_all();
        let conn = server.connection();
        if self.inner.options.graceful_shutdown && conn.is_connected() {
            match with_timeout(self.inner.options.shutdown_timeout, conn.shutdown()).await {
                Ok(()) => {
                    if let Err(e) = conn.exit() {
                        tracing::debug!(server = %server.id(), error = %e, "exit not sent");
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %server.id(), %project, error = %e, "graceful shutdown failed");
                }
            }
        }
        conn.dispose();
        tracing::info!(server = %label, %project, id = %server.id(), "server stopped");
    }

    /// Stop every server no live editor is bound to.
    pub async fn stop_unused_servers(&self) {
        let unused: Vec<_> = {
            let state = self.inner.state.lock();
            state
                .active
                .values()
                .filter(|server| !state.bindings.values().any(|b| Arc::ptr_eq(b, server)))
                .cloned()
                .collect()
        };
        for server in unused {
            if self.claim_if_unused(&server) {
                self.finish_stop(&server).await;
            } else {
                tracing::debug!(server = %server.id(), "server in use again; kept");
            }
        }
    }

    /// Wait for pending starts, then stop every server in parallel.
    pub async fn stop_all_servers(&self) {
        let pending: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.stopping_all = true;
            state
                .starting
                .iter()
                .map(|(project, rx)| (project.clone(), rx.clone()))
                .collect()
        };
        for (project, mut rx) in pending {
            let _ = wait_for_start(&mut rx, &project).await;
        }

        let servers: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.restarts.clear();
            state.active.values().cloned().collect()
        };
        let mut stops = JoinSet::new();
        for server in servers {
            let manager = self.clone();
            stops.spawn(async move { manager.stop_server(&server).await });
        }
        while let Some(joined) = stops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "stop task failed");
            }
        }
        self.inner.state.lock().stopping_all = false;
    }

    /// Cold restart: stop everything, forget bindings, and rebind every
    /// open editor.
    pub async fn restart_all_servers(&self) {
        tracing::info!(server = %self.server_label(), "restarting all servers");
        self.stop_listening();
        self.stop_all_servers().await;
        self.inner.state.lock().bindings.clear();
        self.start_listening().await;
    }

    // ── crash recovery ────────────────────────────────────────────────

    /// Count one crash of `server`'s project. True once over the limit.
    pub fn has_server_reached_restart_limit(&self, server: &ActiveServer) -> bool {
        let mut state = self.inner.state.lock();
        let reached = state.restarts.record_crash(server.project_path());
        tracing::debug!(
            project = %server.project_path(),
            crashes = state.restarts.crashes(server.project_path()),
            limit = state.restarts.limit(),
            "restart counted"
        );
        reached
    }

    fn watch_for_crash(&self, server: &Arc<ActiveServer>) {
        let closed = server.connection().closed_signal();
        let manager = Arc::downgrade(&self.inner);
        let server = Arc::downgrade(server);
        tokio::spawn(on_closed(closed, manager, server));
    }

    async fn handle_closed(&self, server: Arc<ActiveServer>) {
        let project = server.project_path().clone();
        let editors: Vec<Arc<dyn TextEditor>> = {
            let state = self.inner.state.lock();
            if state.stopping_all || server.is_stopping() || !state.is_active(&server) {
                return;
            }
            state
                .bindings
                .iter()
                .filter(|(_, bound)| Arc::ptr_eq(bound, &server))
                .filter_map(|(id, _)| state.editors.get(id).cloned())
                .collect()
        };

        tracing::warn!(server = %self.server_label(), %project, id = %server.id(), "server closed unexpectedly");
        self.stop_server(&server).await;

        // Stop-all or a project change may have begun during the stop.
        if !self.inner.state.lock().serves(&project) {
            tracing::info!(%project, "project no longer served; not restarting");
            return;
        }
        if self.has_server_reached_restart_limit(&server) {
            let window = self.inner.options.restart_window.as_secs();
            tracing::error!(%project, "restart limit reached; not restarting");
            self.inner.notifier.notify(UserNotification {
                severity: Severity::Error,
                title: format!("{} crashed too often", self.server_label()),
                detail: format!(
                    "The server for {project} crashed more than {} times in {window}s and will not be restarted.",
                    self.inner.options.restart_limit
                ),
                dismissable: false,
            });
            return;
        }

        let lookup = {
            let mut state = self.inner.state.lock();
            if !state.serves(&project) {
                return;
            }
            self.running_or_start(&mut state, &project)
        };
        let Ok(replacement) = resolve(lookup, &project).await else {
            return;
        };
        let mut state = self.inner.state.lock();
        if !state.is_active(&replacement) {
            return;
        }
        for editor in editors {
            if state.editors.contains_key(&editor.id()) {
                state.bindings.insert(editor.id(), replacement.clone());
            }
        }
    }

    // ── editor and workspace events ───────────────────────────────────

    /// Resume reacting to editor events and bind every open editor.
    pub async fn start_listening(&self) {
        let editors: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.listening = true;
            state.editors.values().cloned().collect()
        };
        for editor in editors {
            if let Err(e) = self.bind_editor(editor).await {
                tracing::debug!(error = %e, "editor not bound");
            }
        }
    }

    /// Stop reacting to editor events. Open editors are still tracked.
    pub fn stop_listening(&self) {
        self.inner.state.lock().listening = false;
    }

    async fn bind_editor(
        &self,
        editor: Arc<dyn TextEditor>,
    ) -> Result<Option<Arc<ActiveServer>>, LspError> {
        let server = self.get_server(editor.as_ref(), GetServerOptions::start()).await?;
        if let Some(server) = &server {
            let mut state = self.inner.state.lock();
            if state.is_active(server) && state.editors.contains_key(&editor.id()) {
                state.bindings.insert(editor.id(), server.clone());
            }
        }
        Ok(server)
    }

    /// An editor was opened. Starts or joins its project's server.
    pub async fn editor_opened(
        &self,
        editor: Arc<dyn TextEditor>,
    ) -> Result<Option<Arc<ActiveServer>>, LspError> {
        let listening = {
            let mut state = self.inner.state.lock();
            state.editors.insert(editor.id(), editor.clone());
            state.listening
        };
        if !listening {
            return Ok(None);
        }
        self.bind_editor(editor).await
    }

    /// An editor was closed. Servers left without editors are stopped.
    pub async fn editor_closed(&self, editor: EditorId) {
        let listening = {
            let mut state = self.inner.state.lock();
            state.editors.remove(&editor);
            state.bindings.remove(&editor);
            state.listening
        };
        if listening {
            self.stop_unused_servers().await;
        }
    }

    /// An editor now points at a different file.
    pub async fn editor_path_changed(
        &self,
        editor: Arc<dyn TextEditor>,
    ) -> Result<Option<Arc<ActiveServer>>, LspError> {
        let listening = {
            let mut state = self.inner.state.lock();
            state.editors.insert(editor.id(), editor.clone());
            state.bindings.remove(&editor.id());
            state.listening
        };
        if !listening {
            return Ok(None);
        }
        let bound = self.bind_editor(editor).await;
        self.stop_unused_servers().await;
        bound
    }

    /// Replace the project roots. Servers of removed projects are stopped.
    /// Starts still pending for a removed project are awaited and then
    /// stopped too.
    pub async fn project_paths_changed(&self, paths: impl IntoIterator<Item = ProjectPath>) {
        let (removed, pending): (Vec<_>, Vec<_>) = {
            let mut state = self.inner.state.lock();
            state.project_paths = paths.into_iter().collect();
            state.project_paths.sort();
            state.project_paths.dedup();
            let roots = state.project_paths.clone();
            let removed = state
                .active
                .values()
                .filter(|server| !roots.contains(server.project_path()))
                .cloned()
                .collect();
            let pending = state
                .starting
                .iter()
                .filter(|(project, _)| !roots.contains(project))
                .map(|(project, rx)| (project.clone(), rx.clone()))
                .collect();
            (removed, pending)
        };
        for server in removed {
            tracing::info!(project = %server.project_path(), "project removed");
            self.stop_server(&server).await;
        }
        for (project, mut rx) in pending {
            let Ok(server) = wait_for_start(&mut rx, &project).await else {
                continue;
            };
            if !self.inner.state.lock().project_paths.contains(&project) {
                tracing::info!(%project, "project removed while starting");
                self.stop_server(&server).await;
            }
        }
    }

    /// Forward filesystem changes, one notification per interested server.
    /// Returns how many servers were notified.
    pub fn did_change_watched_files(&self, events: &[FileEvent]) -> usize {
        let factory = self.inner.factory.clone();
        let filter = move |path: &Path| factory.filter_change_watched_files(path);
        let mut notified = 0;
        for server in self.get_active_servers() {
            let changes = changes_for_server(&server, events, &filter);
            if changes.is_empty() {
                continue;
            }
            let count = changes.len();
            match server
                .connection()
                .did_change_watched_files(DidChangeWatchedFilesParams { changes })
            {
                Ok(()) => {
                    tracing::debug!(server = %server.id(), count, "forwarded watched file changes");
                    notified += 1;
                }
                Err(e) => {
                    tracing::debug!(server = %server.id(), error = %e, "watched file changes dropped")
                }
            }
        }
        notified
    }
}

/// Kills the process when dropped, whichever way the stop ends.
struct KillOnDrop<'a>(&'a dyn ServerProcessHandle);

impl Drop for KillOnDrop<'_> {
    fn drop(&mut self) {
        self.0.kill();
    }
}

async fn on_closed(
    closed: tokio_util::sync::CancellationToken,
    manager: Weak<Inner>,
    server: Weak<ActiveServer>,
) {
    closed.cancelled().await;
    let (Some(inner), Some(server)) = (manager.upgrade(), server.upgrade()) else {
        return;
    };
    ServerManager { inner }.handle_closed(server).await;
}

async fn resolve(lookup: Lookup, project: &ProjectPath) -> Result<Arc<ActiveServer>, LspError> {
    match lookup {
        Lookup::Running(server) => Ok(server),
        Lookup::Pending(mut pending) => wait_for_start(&mut pending, project).await,
    }
}

async fn wait_for_start(
    pending: &mut watch::Receiver<StartOutcome>,
    project: &ProjectPath,
) -> Result<Arc<ActiveServer>, LspError> {
    let failed = |source: Arc<LspError>| LspError::StartFailed {
        project: project.to_string(),
        source,
    };
    let outcome = match pending.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => return Err(failed(Arc::new(LspError::ConnectionClosed))),
    };
    match outcome {
        Some(Ok(server)) => Ok(server),
        Some(Err(e)) => Err(failed(e)),
        None => Err(failed(Arc::new(LspError::ConnectionClosed))),
    }
}
