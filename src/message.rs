//! Frames exchanged with the transport and the typed envelope used for application messages.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Close code sent by this side on a deliberate shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported locally when the transport dropped without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Message kind stamped on keep-alive messages.
pub const HEARTBEAT_KIND: &str = "heartbeat";

/// An application payload. The manager forwards these without parsing them.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Returns the text content, if this is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Binary(_) => None,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// Close handshake details.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The frame sent by `disconnect()` and manual `reconnect()`.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(NORMAL_CLOSURE, "client disconnect")
    }

    #[must_use]
    pub fn abnormal<S: Into<String>>(reason: S) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason)
    }

    /// Whether this closure was requested deliberately rather than caused by a failure.
    #[must_use]
    pub const fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// A unit of traffic on a [`crate::transport::Link`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Payload),
    Close(CloseFrame),
}

/// Envelope for `send_typed_message` and heartbeats.
///
/// Serializes as `{"type": ..., "data": ..., "timestamp": ...}`, with `data` omitted when absent.
#[derive(Debug, Serialize)]
pub(crate) struct TypedMessage<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<&'a T>,
    pub timestamp: DateTime<Utc>,
}

impl<'a, T: Serialize> TypedMessage<'a, T> {
    pub(crate) fn new(kind: &'a str, data: &'a T) -> Self {
        Self {
            kind,
            data: Some(data),
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn to_payload(&self) -> crate::Result<Payload> {
        Ok(Payload::Text(serde_json::to_string(self)?))
    }
}

pub(crate) fn heartbeat() -> crate::Result<Payload> {
    TypedMessage::<()> {
        kind: HEARTBEAT_KIND,
        data: None,
        timestamp: Utc::now(),
    }
    .to_payload()
}
