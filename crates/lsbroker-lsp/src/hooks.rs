//! Collaborators the manager calls out to.
//!
//! The embedding application supplies how a server is started, which
//! editors it serves, and how busy indicators and user notifications are
//! shown. Logging-only defaults are provided for the last two.
use std::future::Future;
use std::path::Path;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::LspError;
use crate::server::ActiveServer;
use crate::types::{ProjectPath, ServerId, TextEditor};

/// Starts servers of one kind.
#[async_trait]
pub trait ServerFactory: Send + Sync + 'static {
    /// Display name, e.g. "rust-analyzer".
    fn server_name(&self) -> &str;

    /// Language display name, e.g. "Rust".
    fn language_name(&self) -> &str;

    /// Whether this kind of server handles `editor` at all.
    fn should_start_for_editor(&self, editor: &dyn TextEditor) -> bool;

    /// Whether a watched-file change at `path` is forwarded.
    fn filter_change_watched_files(&self, _path: &Path) -> bool {
        true
    }

    /// Spawn a process for `project`, connect, and complete the handshake.
    async fn start_server(&self, project: &ProjectPath, id: ServerId)
        -> Result<ActiveServer, LspError>;
}

/// Ends a busy scope when dropped.
pub struct BusyHandle {
    on_done: Option<Box<dyn FnOnce() + Send>>,
}

impl BusyHandle {
    /// `on_done` runs once, when the handle is dropped.
    pub fn new(on_done: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_done: Some(Box::new(on_done)),
        }
    }

    /// A handle that does nothing.
    pub fn noop() -> Self {
        Self { on_done: None }
    }
}

impl Drop for BusyHandle {
    fn drop(&mut self) {
        if let Some(done) = self.on_done.take() {
            done();
        }
    }
}

/// Shows a busy indicator while long operations run.
pub trait BusyReporter: Send + Sync {
    /// Open a busy scope. It ends when the returned handle is dropped.
    fn begin(&self, title: &str) -> BusyHandle;
}

/// Writes busy scopes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBusyReporter;

impl BusyReporter for LogBusyReporter {
    fn begin(&self, title: &str) -> BusyHandle {
        tracing::debug!(%title, "busy");
        let title = title.to_string();
        let started = Instant::now();
        BusyHandle::new(move || {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            tracing::debug!(%title, elapsed_ms, "done");
        })
    }
}

/// Run `fut` inside a busy scope titled `title`.
pub async fn report_busy_while<F: Future>(
    reporter: &dyn BusyReporter,
    title: &str,
    fut: F,
) -> F::Output {
    let _busy = reporter.begin(title);
    fut.await
}

/// How loudly a [`UserNotification`] should be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational only.
    Info,
    /// Something degraded but still working.
    Warning,
    /// A server failed or gave up.
    Error,
}

/// Something the user should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNotification {
    /// How loudly to show it.
    pub severity: Severity,
    /// One-line summary.
    pub title: String,
    /// Longer explanation, such as the underlying error.
    pub detail: String,
    /// False for conditions that stay until acted upon.
    pub dismissable: bool,
}

/// Surfaces notifications to the user.
pub trait Notifier: Send + Sync {
    /// Show `notification`.
    fn notify(&self, notification: UserNotification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: UserNotification) {
        match n.severity {
            Severity::Info => {
                tracing::info!(title = %n.title, detail = %n.detail, dismissable = n.dismissable, "notification")
            }
            Severity::Warning => {
                tracing::warn!(title = %n.title, detail = %n.detail, dismissable = n.dismissable, "notification")
            }
            Severity::Error => {
                tracing::error!(title = %n.title, detail = %n.detail, dismissable = n.dismissable, "notification")
            }
        }
    }
}
