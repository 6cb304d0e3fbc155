#![cfg_attr(doc, doc = include_str!("../README.md"))]

#[cfg(feature = "ws")]
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod journal;
pub mod machine;
pub mod retry;
pub mod transport;
pub mod types;
#[cfg(feature = "ws")]
pub mod ws;

use crate::error::Error;

#[cfg(feature = "ws")]
pub use crate::client::Client;
pub use crate::config::{Config, HeartbeatConfig, JournalConfig};
pub use crate::events::{Event, EventDispatcher, Handler};
pub use crate::machine::{ConnectionState, ConnectionStateMachine};
pub use crate::retry::{ExhaustionPolicy, RetryCursor, RetrySchedule};
pub use crate::types::{CloseReason, Message, Payload};

pub type Result<T> = std::result::Result<T, Error>;
