//! Collaborator traits the state machine drives.
//!
//! The machine never performs I/O or timing itself. It opens connections through a
//! [`Connector`], writes through the returned [`Connection`] and asks a [`Scheduler`] to
//! wake it up later. Whatever implements these traits reports back by feeding
//! [`TransportEvent`]s (tagged with the [`ConnectionId`] they belong to) and fired
//! [`TimerId`]s into the machine, one at a time.
//!
//! The tokio implementation lives in [`crate::ws`].

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::Result;
use crate::error::Error;
use crate::types::{CloseReason, Message};

/// Identifies one transport handle. Every connection attempt gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifies one scheduled reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Opens transport handles.
pub trait Connector {
    type Connection: Connection;

    /// Start opening a connection to `uri`.
    ///
    /// Returning `Ok` only means the attempt started; the outcome arrives later as
    /// [`TransportEvent::Opened`] or [`TransportEvent::Closed`] for `id`. An `Err` is
    /// treated as an attempt that closed without ever opening.
    fn open(&mut self, uri: &Url, id: ConnectionId) -> Result<Self::Connection>;
}

/// A single transport handle. Handles are discarded after they close and never reused.
pub trait Connection {
    fn send(&mut self, message: &Message) -> Result<()>;

    /// Request a close. The handle reports [`TransportEvent::Closed`] once it is done.
    fn close(&mut self);
}

/// Fires a [`TimerId`] back into the machine after a delay.
pub trait Scheduler {
    fn schedule_after(&mut self, delay: Duration, timer: TimerId);
}

/// Events a transport handle reports.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportEvent {
    Opened,
    Message(Message),
    Error(Error),
    Closed(CloseReason),
}
