//! Wire protocol types for client-host communication.
//!
//! One JSON object per line, in both directions:
//! - **Client → host**: `{"command": "<name>", ...payload}`
//! - **Host → client**: `{"status": "ready"}` once, then one
//!   `{"status": "ok", "data": ...}` or `{"status": "error", "error": "..."}`
//!   per request, in request order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved liveness command, answered by the host itself.
pub const PING_COMMAND: &str = "ping";

/// Data returned for [`PING_COMMAND`].
pub const PONG: &str = "pong";

/// Wire key holding the command name. Payloads may not use it.
pub const COMMAND_FIELD: &str = "command";

/// A request that must not be sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("payload field `{0}` is reserved for the command name")]
    ReservedField(String),
    #[error("request is {size} bytes, over the {max} byte line limit")]
    TooLarge { size: usize, max: usize },
    #[error("request cannot be serialized: {0}")]
    Encode(String),
}

/// Fails if `key` cannot be used as a payload field.
pub fn check_field(key: &str) -> Result<(), RequestError> {
    if key == COMMAND_FIELD {
        return Err(RequestError::ReservedField(key.to_string()));
    }
    Ok(())
}

/// A request from client to host.
///
/// Payload fields sit next to `command` on the wire, so hosts can read them
/// without a nesting convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            payload: Map::new(),
        }
    }

    pub fn ping() -> Self {
        Self::new(PING_COMMAND)
    }

    /// Merge `payload` into the request. A [`COMMAND_FIELD`] key is kept
    /// here and refused by [`check`](Self::check) before sending.
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload.extend(payload);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Make sure the request can go on the wire as exactly one line of at
    /// most `max_line_bytes`.
    pub fn check(&self, max_line_bytes: usize) -> Result<(), RequestError> {
        if self.payload.contains_key(COMMAND_FIELD) {
            return Err(RequestError::ReservedField(COMMAND_FIELD.to_string()));
        }
        let size = serde_json::to_vec(self)
            .map_err(|e| RequestError::Encode(e.to_string()))?
            .len();
        if size > max_line_bytes {
            return Err(RequestError::TooLarge {
                size,
                max: max_line_bytes,
            });
        }
        Ok(())
    }

    pub fn is_ping(&self) -> bool {
        self.command == PING_COMMAND
    }
}

/// A message from host to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Handshake: the hosted computation finished initializing.
    Ready,

    Ok {
        /// Hosts answering side-effect commands may omit `data`.
        #[serde(default)]
        data: Value,
    },

    Error {
        /// Older hosts report the diagnostic under `message`.
        #[serde(alias = "message")]
        error: String,
    },
}

impl Response {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self::Ok { data: data.into() }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(PONG)
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Ok { .. } => "ok",
            Self::Error { .. } => "error",
        }
    }
}
