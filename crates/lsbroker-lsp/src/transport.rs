//! JSON-RPC framing for LSP communication.
//!
//! Implements Content-Length header framing per the LSP specification.
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{LspError, INTERNAL_ERROR};

/// Largest body `read_frame` will allocate for.
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// A request id. Ids we allocate are numbers; servers may use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// A JSON-RPC message (request, response, or notification).
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// A request (has id and method).
    Request {
        /// The request ID.
        id: RequestId,
        /// The method name.
        method: String,
        /// The params; `Null` when absent.
        params: Value,
    },
    /// A response (has id, may have result or error).
    Response {
        /// The request ID this responds to.
        id: RequestId,
        /// The result (if successful).
        result: Option<Value>,
        /// The error (if failed).
        error: Option<RpcError>,
    },
    /// A notification (has method, no id).
    Notification {
        /// The method name.
        method: String,
        /// The params; `Null` when absent.
        params: Value,
    },
}

/// An error object in a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// The error code.
    pub code: i32,
    /// The error message.
    pub message: String,
}

impl RpcError {
    /// Build an error object.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Frame a JSON-RPC message with Content-Length header.
pub fn frame_message(body: &str) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut bytes = Vec::with_capacity(header.len() + body.len());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

fn envelope(fields: impl IntoIterator<Item = (&'static str, Value)>) -> String {
    let mut object = serde_json::Map::new();
    object.insert("jsonrpc".into(), Value::from("2.0"));
    for (key, value) in fields {
        object.insert(key.into(), value);
    }
    Value::Object(object).to_string()
}

/// `params` is left out entirely when `Null`; some servers reject a
/// present-but-null `params` member.
fn params_field(params: Value) -> Option<(&'static str, Value)> {
    (!params.is_null()).then_some(("params", params))
}

/// Serialize a JSON-RPC request.
pub fn serialize_request(id: &RequestId, method: &str, params: Value) -> String {
    let id = serde_json::to_value(id).unwrap_or(Value::Null);
    envelope(
        [("id", id), ("method", Value::from(method))]
            .into_iter()
            .chain(params_field(params)),
    )
}

/// Serialize a JSON-RPC notification (no id).
pub fn serialize_notification(method: &str, params: Value) -> String {
    envelope(std::iter::once(("method", Value::from(method))).chain(params_field(params)))
}

/// Serialize a JSON-RPC response.
pub fn serialize_response(id: &RequestId, result: Value) -> String {
    let id = serde_json::to_value(id).unwrap_or(Value::Null);
    envelope([("id", id), ("result", result)])
}

/// Serialize a JSON-RPC error response.
pub fn serialize_error_response(id: &RequestId, error: &RpcError) -> String {
    let id = serde_json::to_value(id).unwrap_or(Value::Null);
    let error = serde_json::json!({ "code": error.code, "message": error.message });
    envelope([("id", id), ("error", error)])
}

/// Parse the Content-Length value from raw header text.
pub fn parse_content_length(header: &str) -> Result<usize, LspError> {
    for line in header.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("Content-Length:") {
            let value = value.trim();
            return value.parse::<usize>().map_err(|_| {
                LspError::InvalidMessage(format!("invalid Content-Length: {}", value))
            });
        }
    }
    Err(LspError::InvalidMessage(
        "missing Content-Length header".to_string(),
    ))
}

fn parse_id(value: &Value) -> Result<RequestId, LspError> {
    serde_json::from_value(value.clone())
        .map_err(|_| LspError::InvalidMessage(format!("id must be number or string: {value}")))
}

/// Any error member counts as a failure, however malformed.
fn parse_error(error: &Value) -> RpcError {
    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(INTERNAL_ERROR);
    let message = match error.get("message") {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    RpcError { code, message }
}

/// Parse a JSON-RPC message from a JSON string.
pub fn parse_message(json_str: &str) -> Result<JsonRpcMessage, LspError> {
    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| LspError::Serialization(format!("invalid JSON: {}", e)))?;

    let id = value.get("id").filter(|id| !id.is_null());
    let method = value.get("method");
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    match (id, method) {
        (Some(id), Some(method)) => Ok(JsonRpcMessage::Request {
            id: parse_id(id)?,
            method: method
                .as_str()
                .ok_or_else(|| LspError::InvalidMessage("method must be string".into()))?
                .to_string(),
            params,
        }),
        (Some(id), None) => {
            let error = value.get("error").filter(|e| !e.is_null()).map(parse_error);
            Ok(JsonRpcMessage::Response {
                id: parse_id(id)?,
                result: value.get("result").cloned(),
                error,
            })
        }
        (None, Some(method)) => Ok(JsonRpcMessage::Notification {
            method: method
                .as_str()
                .ok_or_else(|| LspError::InvalidMessage("method must be string".into()))?
                .to_string(),
            params,
        }),
        (None, None) => Err(LspError::InvalidMessage(
            "message has neither id nor method".to_string(),
        )),
    }
}

/// Read one framed body from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream between messages. A body
/// that is not UTF-8 is skipped; the stream stays in sync because the
/// whole frame was consumed.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, LspError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let Some(header) = read_header(reader).await? else {
            return Ok(None);
        };
        let length = parse_content_length(&header)?;
        if length > MAX_CONTENT_LENGTH {
            return Err(LspError::InvalidMessage(format!(
                "Content-Length {length} exceeds {MAX_CONTENT_LENGTH}"
            )));
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        match String::from_utf8(body) {
            Ok(body) => return Ok(Some(body)),
            Err(_) => tracing::warn!(length, "skipping frame whose body is not UTF-8"),
        }
    }
}

async fn read_header<R>(reader: &mut R) -> Result<Option<String>, LspError>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return if header.is_empty() {
                Ok(None)
            } else {
                Err(LspError::InvalidMessage("stream ended inside header".into()))
            };
        }
        if line.trim().is_empty() {
            if header.is_empty() {
                // Stray blank line between messages.
                continue;
            }
            return Ok(Some(header));
        }
        header.push_str(&line);
    }
}
