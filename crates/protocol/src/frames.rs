//! Wire frames exchanged with the gateway.
//!
//! # Frame Format
//!
//! Every WebSocket text message is one JSON object tagged by `type`:
//!
//! ```text
//! { "type": "req",   "id": ..., "method": ..., "params": ... }
//! { "type": "res",   "id": ..., "ok": bool, "payload": ..., "error": { "message": ... } }
//! { "type": "event", "event": ..., "payload": ... }
//! ```
//!
//! Parsing never fails loudly: anything that is not valid JSON, lacks a known
//! tag, or is missing required fields yields `None` and is ignored by callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Event name of the challenge the gateway sends before accepting a connect.
pub const CONNECT_CHALLENGE_EVENT: &str = "connect.challenge";

/// A request from client to gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    /// Creates a request with a fresh random id.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    /// Serializes this request as a tagged `req` frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&Frame::Request(self.clone()))?)
    }
}

/// Error body carried by a failed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// A response from gateway to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    /// Missing `ok` is treated as failure.
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// Returns the server-provided error message, if any non-empty one was sent.
    pub fn error_message(&self) -> Option<String> {
        self.error
            .as_ref()
            .and_then(|e| e.message.clone())
            .filter(|m| !m.is_empty())
    }

    /// Returns `payload.status` when the payload is an object with a string status.
    pub fn status(&self) -> Option<&str> {
        self.payload.as_ref()?.get("status")?.as_str()
    }
}

/// An unsolicited event from gateway to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    /// Returns the challenge nonce if this is a `connect.challenge` event
    /// carrying a string nonce.
    pub fn challenge_nonce(&self) -> Option<&str> {
        if self.event != CONNECT_CHALLENGE_EVENT {
            return None;
        }
        self.payload
            .as_ref()?
            .get("nonce")?
            .as_str()
            .filter(|n| !n.is_empty())
    }
}

/// A gateway wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl Frame {
    /// Parses one text message into a frame.
    ///
    /// Returns `None` for malformed JSON, unknown `type` tags, and frames
    /// missing required fields.
    pub fn parse(raw: &str) -> Option<Frame> {
        serde_json::from_str(raw).ok()
    }

    /// Parses raw bytes, which must be UTF-8 JSON.
    pub fn parse_bytes(raw: &[u8]) -> Option<Frame> {
        serde_json::from_slice(raw).ok()
    }
}
