//! Message and payload types shared by the client, the journal and event handlers.

use std::fmt;

use serde::Serialize;

use crate::Result;
use crate::error::Error;

/// An outbound or inbound WebSocket data frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
}

impl Message {
    /// Serialize `value` to JSON and wrap it in a text frame.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Text(serde_json::to_string(value)?))
    }

    /// Text content of the frame, if it is a text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<&[u8]> for Message {
    fn from(value: &[u8]) -> Self {
        Self::Binary(value.to_vec())
    }
}

/// Close information reported by the transport.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code, when the peer sent a close frame
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseReason {
    #[must_use]
    pub fn new<S: Into<String>>(code: Option<u16>, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{code} {}", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Data handed to event handlers.
///
/// Each event carries the data of the transport event that caused it: `connected`
/// gets [`Payload::Opened`], `receive` a [`Payload::Message`], `error` a
/// [`Payload::Error`], and `reconnect`/`disconnected` a [`Payload::Closed`].
#[non_exhaustive]
#[derive(Debug)]
pub enum Payload {
    Opened,
    Message(Message),
    Error(Error),
    Closed(CloseReason),
}

impl Payload {
    #[must_use]
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_error(&self) -> Option<&Error> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_close(&self) -> Option<&CloseReason> {
        match self {
            Self::Closed(reason) => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_message_is_text() {
        let message = Message::json(&json!({"type": "ping", "id": 7})).unwrap();

        assert_eq!(message.as_text(), Some(r#"{"id":7,"type":"ping"}"#));
    }

    #[test]
    fn binary_message_exposes_bytes() {
        let message = Message::from(vec![0_u8, 159, 146, 150]);

        assert_eq!(message.as_text(), None);
        assert_eq!(message.as_bytes(), &[0, 159, 146, 150]);
        assert_eq!(message.len(), 4);
    }

    #[test]
    fn close_reason_display() {
        assert_eq!(CloseReason::new(Some(1001), "going away").to_string(), "1001 going away");
        assert_eq!(CloseReason::new(None, "reset").to_string(), "reset");
    }
}
