//! The wire protocol: one JSON document per line, both directions.
//!
//! Requests flow client to server; the server answers with a response
//! carrying the request's id, or pushes an id-less event to watchers. Field
//! names are camelCase on the wire. Before a document leaves the server it
//! passes through a [`FilterChain`], which rewrites every string in the
//! payload; the standard chain restores text the macro compiler escaped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::macros::restore_literal;

/// One decoded command.
///
/// Everything except `action` is optional; each action reads the fields it
/// needs and validates them at dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
    /// Path list for `expire`/`unexpire`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_index: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_index: Option<Value>,
    /// Ask for the affected value in the response (remove, pop, removeRange).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get_value: Option<bool>,
    /// Fire-and-forget: suppress the response entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_ack: Option<bool>,
    /// Path prefix scoping a query's view of the store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Data mapping folded into a query script as `let` declarations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Request {
    /// A bare request for `action` with no fields set.
    pub fn new(action: impl Into<String>) -> Self {
        Request {
            action: action.into(),
            ..Request::default()
        }
    }
}

/// A document the server writes: a response to a request or an event push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "response")]
    Response {
        /// Absent only when the request itself could not be parsed.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "event")]
    Event { event: String, value: Value },
}

impl ServerMessage {
    /// A successful response carrying `value` (or nothing, for acks).
    pub fn response(id: Option<u64>, action: impl Into<String>, value: Option<Value>) -> Self {
        ServerMessage::Response {
            id,
            action: action.into(),
            value,
            error: None,
        }
    }

    /// A failed response with a human-readable error string.
    pub fn error(id: Option<u64>, action: impl Into<String>, error: impl Into<String>) -> Self {
        ServerMessage::Response {
            id,
            action: action.into(),
            value: None,
            error: Some(error.into()),
        }
    }
}

/// A string rewrite applied to outbound payloads.
pub type StringFilter = fn(&str) -> String;

/// Ordered string rewrites run over every string in an outbound document,
/// object keys included, just before serialization.
pub struct FilterChain {
    filters: Vec<StringFilter>,
}

impl FilterChain {
    /// The standard outbound chain: undo macro escaping.
    pub fn standard() -> Self {
        FilterChain {
            filters: vec![restore_literal as StringFilter],
        }
    }

    /// A chain with no rewrites, for tests and raw taps.
    pub fn empty() -> Self {
        FilterChain {
            filters: Vec::new(),
        }
    }

    /// Append a rewrite to the end of the chain.
    pub fn push(&mut self, filter: StringFilter) {
        self.filters.push(filter);
    }

    fn rewrite(&self, text: &str) -> String {
        self.filters
            .iter()
            .fold(text.to_string(), |text, filter| filter(&text))
    }

    /// Rewrite every string in `value`, in place.
    pub fn apply(&self, value: &mut Value) {
        if self.filters.is_empty() {
            return;
        }
        match value {
            Value::String(text) => *text = self.rewrite(text),
            Value::Array(items) => {
                for item in items {
                    self.apply(item);
                }
            }
            Value::Object(fields) => {
                let old = std::mem::take(fields);
                for (key, mut field) in old {
                    self.apply(&mut field);
                    fields.insert(self.rewrite(&key), field);
                }
            }
            _ => {}
        }
    }
}

/// Serialize `message` and write it as one line.
pub async fn write_line<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await
}

/// Serialize `message`, run the filter chain over it, and write one line.
pub async fn write_filtered<W, T>(
    writer: &mut W,
    message: &T,
    filters: &FilterChain,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut value = serde_json::to_value(message)?;
    filters.apply(&mut value);
    write_line(writer, &value).await
}
