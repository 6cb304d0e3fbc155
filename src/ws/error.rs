#![expect(
    clippy::module_name_repetitions,
    reason = "WsError includes the module name to indicate its scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// WebSocket transport error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The connection task is gone, so the handle can no longer be written to
    ConnectionClosed,
    /// No PONG arrived within the heartbeat timeout
    HeartbeatTimeout(Duration),
    /// The client was created outside of a tokio runtime
    NoRuntime,
    /// The client's event loop has stopped
    ClientStopped,
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::HeartbeatTimeout(timeout) => {
                write!(f, "no PONG received within {timeout:?}")
            }
            Self::NoRuntime => write!(f, "no tokio runtime available to run the client"),
            Self::ClientStopped => write!(f, "WebSocket client event loop has stopped"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Kind};

    #[test]
    fn ws_error_converts_to_websocket_kind() {
        let error: Error = WsError::HeartbeatTimeout(Duration::from_secs(15)).into();

        assert_eq!(error.kind(), Kind::WebSocket);
        assert_eq!(error.to_string(), "WebSocket: no PONG received within 15s");
    }
}
