//! Request/response dispatcher for LSP.
//!
//! Tracks pending requests by ID, routes responses to waiting callers
//! via oneshot channels, and looks up the handler registered for each
//! server-initiated notification or request.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::transport::{JsonRpcMessage, RequestId, RpcError};

/// Handler for one inbound notification method.
pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Future produced by an inbound request handler.
pub type RequestFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

/// Handler for one inbound request method.
pub type RequestHandler = Arc<dyn Fn(Value) -> RequestFuture + Send + Sync>;

/// The result dispatched to a waiting request.
#[derive(Debug)]
pub enum DispatchResult {
    /// Successful response with the result value.
    Success(Value),
    /// Error response from the server.
    Error(RpcError),
}

/// What the reader loop must do with an inbound message once the
/// dispatcher lock is released.
pub enum Routed {
    /// A response was delivered (or dropped as unknown).
    Done,
    /// Invoke a notification handler.
    Notify(NotificationHandler, Value),
    /// Run a request handler, or reply `MethodNotFound` when `None`.
    Request {
        /// Id to answer.
        id: RequestId,
        /// Method name, for logging and the error reply.
        method: String,
        /// Registered handler, if any.
        handler: Option<RequestHandler>,
        /// Request params.
        params: Value,
    },
}

/// Manages pending requests and the inbound handler registry.
#[derive(Default)]
pub struct Dispatcher {
    pending: HashMap<i64, oneshot::Sender<DispatchResult>>,
    notification_handlers: HashMap<String, NotificationHandler>,
    request_handlers: HashMap<String, RequestHandler>,
    closed: bool,
}

impl Dispatcher {
    /// Create a new dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for notifications named `method`,
    /// replacing any previous one.
    pub fn set_notification_handler(&mut self, method: &str, handler: NotificationHandler) {
        self.notification_handlers.insert(method.to_string(), handler);
    }

    /// Register the handler for requests named `method`, replacing any
    /// previous one.
    pub fn set_request_handler(&mut self, method: &str, handler: RequestHandler) {
        self.request_handlers.insert(method.to_string(), handler);
    }

    /// Register a pending request and return a receiver for the response.
    /// After [`cancel_all`](Self::cancel_all) the receiver is already closed.
    pub fn register_request(&mut self, id: i64) -> oneshot::Receiver<DispatchResult> {
        let (tx, rx) = oneshot::channel();
        if !self.closed {
            self.pending.insert(id, tx);
        }
        rx
    }

    /// How many requests are pending.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Route an incoming message.
    ///
    /// - Responses are matched to pending requests by ID.
    /// - Notifications and requests are paired with their handler.
    pub fn route(&mut self, message: JsonRpcMessage) -> Routed {
        match message {
            JsonRpcMessage::Response { id, result, error } => {
                let sender = match id {
                    RequestId::Number(n) => self.pending.remove(&n),
                    RequestId::String(_) => None,
                };
                match sender {
                    Some(sender) => {
                        let dispatch_result = match error {
                            Some(err) => DispatchResult::Error(err),
                            None => DispatchResult::Success(result.unwrap_or(Value::Null)),
                        };
                        // The caller may have stopped waiting.
                        let _ = sender.send(dispatch_result);
                    }
                    None => tracing::warn!(%id, "received response for unknown request id"),
                }
                Routed::Done
            }
            JsonRpcMessage::Notification { method, params } => {
                match self.notification_handlers.get(&method) {
                    Some(handler) => Routed::Notify(handler.clone(), params),
                    None => {
                        tracing::debug!(%method, "unhandled notification");
                        Routed::Done
                    }
                }
            }
            JsonRpcMessage::Request { id, method, params } => Routed::Request {
                id,
                handler: self.request_handlers.get(&method).cloned(),
                method,
                params,
            },
        }
    }

    /// Forget a pending request. Returns true if it was found.
    pub fn cancel(&mut self, id: i64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Drop every pending request; their callers observe a closed
    /// connection. Later registrations are refused the same way.
    pub fn cancel_all(&mut self) {
        self.closed = true;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: i64, result: Value) -> JsonRpcMessage {
        JsonRpcMessage::Response {
            id: RequestId::Number(id),
            result: Some(result),
            error: None,
        }
    }

    #[tokio::test]
    async fn dispatcher_register_and_resolve() {
        let mut disp = Dispatcher::new();
        let rx = disp.register_request(1);
        assert_eq!(disp.pending_count(), 1);

        assert!(matches!(
            disp.route(response(1, serde_json::json!({"key": "value"}))),
            Routed::Done
        ));
        assert_eq!(disp.pending_count(), 0);

        match rx.await.unwrap() {
            DispatchResult::Success(val) => assert_eq!(val["key"], "value"),
            DispatchResult::Error(_) => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn dispatcher_resolve_error() {
        let mut disp = Dispatcher::new();
        let rx = disp.register_request(1);

        disp.route(JsonRpcMessage::Response {
            id: RequestId::Number(1),
            result: None,
            error: Some(RpcError::new(-32600, "invalid request")),
        });

        match rx.await.unwrap() {
            DispatchResult::Error(err) => {
                assert_eq!(err.code, -32600);
                assert_eq!(err.message, "invalid request");
            }
            DispatchResult::Success(_) => panic!("expected error"),
        }
    }

    #[test]
    fn dispatcher_unknown_id_ignored() {
        let mut disp = Dispatcher::new();
        assert!(matches!(disp.route(response(999, Value::Null)), Routed::Done));
    }

    #[test]
    fn notification_routed_to_its_method_only() {
        let mut disp = Dispatcher::new();
        disp.set_notification_handler("window/logMessage", Arc::new(|_| {}));

        let routed = disp.route(JsonRpcMessage::Notification {
            method: "window/logMessage".into(),
            params: serde_json::json!({"message": "hi"}),
        });
        match routed {
            Routed::Notify(_, params) => assert_eq!(params["message"], "hi"),
            _ => panic!("expected a handler"),
        }

        let routed = disp.route(JsonRpcMessage::Notification {
            method: "window/showMessage".into(),
            params: Value::Null,
        });
        assert!(matches!(routed, Routed::Done));
    }

    #[test]
    fn request_without_handler_is_reported() {
        let mut disp = Dispatcher::new();
        let routed = disp.route(JsonRpcMessage::Request {
            id: RequestId::Number(4),
            method: "workspace/applyEdit".into(),
            params: Value::Null,
        });
        match routed {
            Routed::Request {
                id,
                method,
                handler,
                ..
            } => {
                assert_eq!(id, RequestId::Number(4));
                assert_eq!(method, "workspace/applyEdit");
                assert!(handler.is_none());
            }
            _ => panic!("expected request routing"),
        }
    }

    #[test]
    fn dispatcher_cancel_existing_and_all() {
        let mut disp = Dispatcher::new();
        let _rx1 = disp.register_request(1);
        let _rx2 = disp.register_request(2);
        assert!(disp.cancel(1));
        assert!(!disp.cancel(1));
        disp.cancel_all();
        assert_eq!(disp.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_all_wakes_waiters_with_closed_channel() {
        let mut disp = Dispatcher::new();
        let rx = disp.register_request(1);
        disp.cancel_all();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn register_after_cancel_all_is_already_closed() {
        let mut disp = Dispatcher::new();
        disp.cancel_all();
        let rx = disp.register_request(2);
        assert_eq!(disp.pending_count(), 0);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn responses_resolve_out_of_order() {
        let mut disp = Dispatcher::new();
        let rx1 = disp.register_request(1);
        let rx2 = disp.register_request(2);

        disp.route(response(2, serde_json::json!("second")));
        disp.route(response(1, serde_json::json!("first")));

        match rx1.await.unwrap() {
            DispatchResult::Success(val) => assert_eq!(val, "first"),
            _ => panic!("expected success"),
        }
        match rx2.await.unwrap() {
            DispatchResult::Success(val) => assert_eq!(val, "second"),
            _ => panic!("expected success"),
        }
    }
}
