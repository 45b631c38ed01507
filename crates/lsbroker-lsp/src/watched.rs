//! Turning filesystem events into `workspace/didChangeWatchedFiles` batches.
use std::path::Path;

use lsp_types::FileChangeType;

use crate::server::ActiveServer;
use crate::types::{path_to_uri, FileEvent, FileEventKind};

fn relevant(server: &ActiveServer, path: &Path) -> bool {
    server.project_path().contains(path) || server.has_claimed(path)
}

fn push_change(
    out: &mut Vec<lsp_types::FileEvent>,
    server: &ActiveServer,
    filter: &dyn Fn(&Path) -> bool,
    path: &Path,
    typ: FileChangeType,
) {
    if !relevant(server, path) || !filter(path) {
        return;
    }
    match path_to_uri(path) {
        Ok(uri) => out.push(lsp_types::FileEvent { uri, typ }),
        Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping watched file"),
    }
}

/// The subset of `events` that concerns `server`, in order. A rename
/// becomes a deletion of the old path followed by a creation of the new.
pub fn changes_for_server(
    server: &ActiveServer,
    events: &[FileEvent],
    filter: &dyn Fn(&Path) -> bool,
) -> Vec<lsp_types::FileEvent> {
    let mut changes = Vec::new();
    for event in events {
        match &event.kind {
            FileEventKind::Created => {
                push_change(&mut changes, server, filter, &event.path, FileChangeType::CREATED)
            }
            FileEventKind::Changed => {
                push_change(&mut changes, server, filter, &event.path, FileChangeType::CHANGED)
            }
            FileEventKind::Deleted => {
                push_change(&mut changes, server, filter, &event.path, FileChangeType::DELETED)
            }
            FileEventKind::Renamed { old_path } => {
                push_change(&mut changes, server, filter, old_path, FileChangeType::DELETED);
                push_change(&mut changes, server, filter, &event.path, FileChangeType::CREATED);
            }
        }
    }
    changes
}
