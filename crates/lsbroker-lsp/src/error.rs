//! LSP error types.
use std::sync::Arc;

/// JSON-RPC error code a server returns for a request it abandoned
/// because the client cancelled it.
pub const REQUEST_CANCELLED: i32 = -32800;

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// JSON-RPC `InvalidParams`.
pub const INVALID_PARAMS: i32 = -32602;

/// JSON-RPC `InternalError`. Also stands in for a missing or
/// unusable code in a server's error object.
pub const INTERNAL_ERROR: i32 = -32603;

/// Errors from connection and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    /// Server process failed to start.
    #[error("server failed to start: {0}")]
    SpawnFailed(String),

    /// Server initialization handshake failed.
    #[error("server initialization failed: {0}")]
    InitFailed(String),

    /// JSON-RPC error returned by the server.
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        /// The error code.
        code: i32,
        /// The error message.
        message: String,
    },

    /// The request's cancellation token fired, or the server reported
    /// the request as cancelled.
    #[error("request cancelled: {method}")]
    Cancelled {
        /// Method of the abandoned request.
        method: String,
    },

    /// A bounded wait elapsed.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The transport is closed; no further traffic is possible.
    #[error("connection closed")]
    ConnectionClosed,

    /// A request was issued before the `initialized` notification.
    #[error("{0} sent before the initialize handshake completed")]
    NotInitialized(String),

    /// Handshake messages sent out of order or twice.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed message from the server.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A start attempt for the project failed. Shared by every caller
    /// that was waiting on the same start.
    #[error("could not start server for {project}: {source}")]
    StartFailed {
        /// The project path the start was for.
        project: String,
        /// The underlying spawn or handshake failure.
        source: Arc<LspError>,
    },

    /// The project crashed too often within the restart window.
    #[error("restart limit reached for {0}")]
    RestartLimit(String),

    /// The selected transport is unavailable on this platform.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),
}

impl LspError {
    /// True for self-cancelled work that callers should not surface.
    pub fn is_cancelled(&self) -> bool {
        match self {
            LspError::Cancelled { .. } => true,
            LspError::Rpc { code, .. } => *code == REQUEST_CANCELLED,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for LspError {
    fn from(err: serde_json::Error) -> Self {
        LspError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_spawn_failed_display() {
        let err = LspError::SpawnFailed("not found".into());
        assert_eq!(err.to_string(), "server failed to start: not found");
    }

    #[test]
    fn error_rpc_display() {
        let err = LspError::Rpc {
            code: -32600,
            message: "invalid request".into(),
        };
        assert_eq!(err.to_string(), "JSON-RPC error -32600: invalid request");
    }

    #[test]
    fn error_cancelled_is_cancelled() {
        let err = LspError::Cancelled {
            method: "textDocument/completion".into(),
        };
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "request cancelled: textDocument/completion");
    }

    #[test]
    fn server_side_cancel_code_is_cancelled() {
        let err = LspError::Rpc {
            code: REQUEST_CANCELLED,
            message: "cancelled".into(),
        };
        assert!(err.is_cancelled());
    }

    #[test]
    fn genuine_failures_are_not_cancelled() {
        assert!(!LspError::ConnectionClosed.is_cancelled());
        assert!(!LspError::Rpc {
            code: -32603,
            message: "internal".into()
        }
        .is_cancelled());
    }

    #[test]
    fn error_timeout_display() {
        let err = LspError::Timeout(std::time::Duration::from_secs(10));
        assert_eq!(err.to_string(), "timed out after 10s");
    }

    #[test]
    fn start_failed_wraps_source() {
        let err = LspError::StartFailed {
            project: "/proj/".into(),
            source: Arc::new(LspError::SpawnFailed("ra: not found".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("/proj/"));
        assert!(msg.contains("ra: not found"));
    }

    #[test]
    fn error_io_from() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken");
        let err = LspError::from(io);
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn serde_error_converts() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(LspError::from(bad), LspError::Serialization(_)));
    }
}
