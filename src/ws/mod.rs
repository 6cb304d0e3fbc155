//! Tokio transport.
//!
//! Implements the [`crate::transport`] collaborator traits on top of tokio and
//! tokio-tungstenite:
//!
//! - [`WsConnector`]: opens each connection in its own task with `connect_async`,
//!   forwarding frames, errors and the final close as [`Signal`]s
//! - [`TokioScheduler`]: fires reconnect timers with `tokio::time::sleep`
//!
//! Both report into one channel that the [`crate::Client`] event loop drains, so every
//! state transition happens on that single task.

pub mod connection;
pub mod error;

pub use connection::{Signal, TokioScheduler, WsConnection, WsConnector};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
