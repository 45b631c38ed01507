//! lsbroker-lsp — language server lifecycle and connection management.
//!
//! This crate spawns language servers per project, speaks JSON-RPC to
//! them over stdio, sockets, or local IPC, and keeps one server per
//! project alive for as long as editors need it.
pub mod cancel;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod launcher;
pub mod manager;
pub mod process;
pub mod restart;
pub mod server;
pub mod transport;
pub mod types;
pub mod watched;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience.
pub use cancel::{with_timeout, RequestSlots};
pub use connection::{Connection, ConnectionState, HandshakeState};
pub use error::LspError;
pub use hooks::{
    report_busy_while, BusyHandle, BusyReporter, LogBusyReporter, LogNotifier, Notifier,
    ServerFactory, Severity, UserNotification,
};
pub use launcher::{handshake, initialize_params, ProcessServerFactory};
pub use manager::{GetServerOptions, ManagerOptions, ServerManager, ServerManagerBuilder};
pub use process::{spawn_server, ServerProcess, ServerProcessHandle, SpawnedServer, StderrHandler};
pub use restart::RestartTracker;
pub use server::ActiveServer;
pub use types::{
    ConnectionKind, EditorId, FileEvent, FileEventKind, ProjectPath, ServerConfig, ServerId,
    TextEditor,
};
