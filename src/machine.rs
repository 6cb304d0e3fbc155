//! Connection lifecycle state machine.
//!
//! [`ConnectionStateMachine`] owns the connection state, the retry cursor and the
//! optional journal. It is driven entirely from the outside: public operations
//! (`connect`, `disconnect`, `send`), transport events and fired timers are fed in one
//! at a time, and the machine reacts by opening or closing connections through its
//! [`Connector`], scheduling reconnects through its [`Scheduler`] and notifying the
//! [`EventDispatcher`]. It never blocks and never spawns anything itself.

use backoff::backoff::Backoff as _;
use url::Url;

use crate::Result;
use crate::config::Config;
use crate::error::{Error, RetriesExhausted};
use crate::events::{Event, EventDispatcher};
use crate::journal::{DrainProgress, MessageJournal};
use crate::retry::{DelayDisplay, RetryCursor, RetrySchedule};
use crate::transport::{Connection, ConnectionId, Connector, Scheduler, TimerId, TransportEvent};
use crate::types::{CloseReason, Message, Payload};

/// Lifecycle state of a client. Exactly one is active at a time.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected, or gave up after exhausting the retry schedule
    Disconnected,
    /// First attempt of a lifecycle is in flight
    Connecting,
    /// Open and writable
    Connected,
    /// Connection lost; a reconnect is scheduled or in flight
    Reconnecting,
    /// Open, and the journal is being replayed to the new connection
    JournalRedo,
    /// Closed (or closing) at the application's request
    Disconnecting,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

struct Live<T> {
    id: ConnectionId,
    connection: T,
}

/// Drives connections to a single endpoint. See the module documentation.
pub struct ConnectionStateMachine<C: Connector, S: Scheduler> {
    uri: Url,
    schedule: RetrySchedule,
    cursor: RetryCursor,
    connector: C,
    scheduler: S,
    dispatcher: EventDispatcher,
    journal: Option<MessageJournal>,
    replay_batch_size: usize,
    state: ConnectionState,
    live: Option<Live<C::Connection>>,
    next_connection_id: u64,
    pending_timer: Option<TimerId>,
    next_timer_id: u64,
    skip_reconnect: bool,
    exhausted: Option<RetriesExhausted>,
}

impl<C: Connector, S: Scheduler> ConnectionStateMachine<C, S> {
    /// Validate `config` and open the journal if one is configured.
    pub fn new(
        config: &Config,
        connector: C,
        scheduler: S,
        dispatcher: EventDispatcher,
    ) -> Result<Self> {
        let uri = config.endpoint()?;
        let (journal, replay_batch_size) = match &config.journal {
            Some(journal) => (
                Some(MessageJournal::open(&journal.path)?),
                journal.replay_batch_size.max(1),
            ),
            None => (None, 1),
        };

        Ok(Self {
            uri,
            schedule: config.retry_schedule.clone(),
            cursor: config.retry_schedule.cursor(config.exhaustion_policy()),
            connector,
            scheduler,
            dispatcher,
            journal,
            replay_batch_size,
            state: ConnectionState::Disconnected,
            live: None,
            next_connection_id: 0,
            pending_timer: None,
            next_timer_id: 0,
            skip_reconnect: false,
            exhausted: None,
        })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    #[must_use]
    pub fn is_journaled(&self) -> bool {
        self.journal.is_some()
    }

    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    #[must_use]
    pub fn retry_schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    #[must_use]
    pub fn retry_cursor(&self) -> &RetryCursor {
        &self.cursor
    }

    #[must_use]
    pub fn journal(&self) -> Option<&MessageJournal> {
        self.journal.as_ref()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    #[must_use]
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// The terminal error recorded when the retry schedule ran out.
    #[must_use]
    pub fn exhausted(&self) -> Option<&RetriesExhausted> {
        self.exhausted.as_ref()
    }

    /// Whether a journal replay step is waiting to run.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.state == ConnectionState::JournalRedo
    }

    /// Start a new connection lifecycle.
    ///
    /// No-op while an attempt is already in flight or the client is connected, so at
    /// most one transport handle exists at a time.
    pub fn connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting
            | ConnectionState::JournalRedo => Ok(()),
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                self.skip_reconnect = false;
                self.exhausted = None;
                self.cursor.reset();
                self.state = ConnectionState::Connecting;
                self.establish()
            }
        }
    }

    /// Close the connection and stop reconnecting.
    ///
    /// A reconnect that is already scheduled is cancelled and will not open a transport
    /// when its timer fires.
    pub fn disconnect(&mut self) -> Result<()> {
        let previous = self.state;
        match previous {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => return Ok(()),
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::JournalRedo
            | ConnectionState::Reconnecting => {}
        }

        self.skip_reconnect = true;
        self.pending_timer = None;
        self.state = ConnectionState::Disconnecting;

        let spilled = if previous == ConnectionState::JournalRedo {
            self.abort_replay()
        } else {
            Ok(())
        };

        match self.live.as_mut() {
            Some(live) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(uri = %self.uri, connection = %live.id, "Closing connection");
                live.connection.close();
            }
            None => {
                // Nothing in flight will report a close, so finish the transition here.
                self.dispatcher.notify(
                    Event::Disconnected,
                    &Payload::Closed(CloseReason::new(None, "disconnected by client")),
                );
            }
        }

        spilled
    }

    /// Send `message`, or queue it according to the current state.
    ///
    /// - connected: the overflow buffer is flushed first, then `message` is written;
    /// - replaying the journal: `message` is queued behind the replay;
    /// - otherwise: `message` is journaled, or dropped when journaling is disabled.
    ///
    /// Journal failures are returned to the caller. Transport failures are reported on
    /// the `error` event; a journaled client keeps the message in the journal.
    pub fn send(&mut self, message: Message) -> Result<()> {
        match self.state {
            ConnectionState::Connected => self.send_live(message),
            ConnectionState::JournalRedo => {
                if let Some(journal) = self.journal.as_mut() {
                    journal.push_overflow(message);
                }
                Ok(())
            }
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting
            | ConnectionState::Disconnecting => self.queue(message),
        }
    }

    /// Feed an event reported by connection `id`. Events from superseded connections
    /// are ignored.
    pub fn handle_transport(&mut self, id: ConnectionId, event: TransportEvent) -> Result<()> {
        if self.live.as_ref().is_none_or(|live| live.id != id) {
            #[cfg(feature = "tracing")]
            tracing::trace!(connection = %id, ?event, "Ignoring event from stale connection");
            return Ok(());
        }

        match event {
            TransportEvent::Opened => self.on_open(),
            TransportEvent::Message(message) => {
                self.dispatcher
                    .notify(Event::Receive, &Payload::Message(message));
                Ok(())
            }
            TransportEvent::Error(error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(uri = %self.uri, connection = %id, error = %error, "Transport error");
                self.dispatcher.notify(Event::Error, &Payload::Error(error));
                Ok(())
            }
            TransportEvent::Closed(reason) => {
                self.live = None;
                self.on_close(reason)
            }
        }
    }

    /// Feed a fired reconnect timer. Timers that were cancelled or superseded, or that
    /// fire after [`Self::disconnect`], do nothing.
    pub fn handle_timer(&mut self, timer: TimerId) -> Result<()> {
        if self.pending_timer != Some(timer) {
            #[cfg(feature = "tracing")]
            tracing::trace!(%timer, "Ignoring cancelled reconnect timer");
            return Ok(());
        }
        self.pending_timer = None;

        if self.skip_reconnect || self.state != ConnectionState::Reconnecting {
            return Ok(());
        }

        self.establish()
    }

    /// Write the next batch of journal entries to the connection.
    ///
    /// Called repeatedly while [`Self::is_replaying`] holds, with other inputs handled
    /// in between so that sends made during the replay land in the overflow buffer.
    pub fn replay_step(&mut self) -> Result<()> {
        if self.state != ConnectionState::JournalRedo {
            return Ok(());
        }

        let (Some(journal), Some(live)) = (self.journal.as_mut(), self.live.as_mut()) else {
            return Ok(());
        };

        match journal.drain_to(&mut live.connection, self.replay_batch_size) {
            Ok(DrainProgress::Pending) => Ok(()),
            Ok(DrainProgress::Complete { replayed }) => {
                #[cfg(feature = "tracing")]
                tracing::info!(uri = %self.uri, replayed, "Journal replayed");
                #[cfg(not(feature = "tracing"))]
                let _ = replayed;
                self.mark_connected();
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(uri = %self.uri, error = %e, "Journal replay failed, closing connection");
                let spilled = journal.abort_replay();
                live.connection.close();
                // The close event that follows schedules the reconnect.
                self.state = ConnectionState::Reconnecting;
                self.dispatcher.notify(Event::Error, &Payload::Error(e));
                self.report(spilled);
                Ok(())
            }
        }
    }

    fn establish(&mut self) -> Result<()> {
        self.pending_timer = None;
        self.next_connection_id = self.next_connection_id.wrapping_add(1);
        let id = ConnectionId(self.next_connection_id);

        // The previous handle, if any, is discarded and never reused.
        self.live = None;

        #[cfg(feature = "tracing")]
        tracing::debug!(uri = %self.uri, connection = %id, state = %self.state, "Opening connection");

        match self.connector.open(&self.uri, id) {
            Ok(connection) => {
                self.live = Some(Live { id, connection });
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(uri = %self.uri, error = %e, "Unable to open connection");
                let reason = CloseReason::new(None, format!("open failed: {e}"));
                self.dispatcher.notify(Event::Error, &Payload::Error(e));
                self.on_close(reason)
            }
        }
    }

    fn on_open(&mut self) -> Result<()> {
        if self.state == ConnectionState::Disconnecting {
            // disconnect() raced the open; the close it requested is on its way.
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        tracing::info!(uri = %self.uri, "Connected");

        self.pending_timer = None;
        self.cursor.reset();

        // Anything journaled before this open, first connection included, goes out ahead
        // of new sends. A journal whose size cannot be read is replayed so the failure
        // surfaces from the drain.
        let replay = self
            .journal
            .as_ref()
            .is_some_and(|journal| !matches!(journal.is_empty(), Ok(true)));

        if replay {
            self.state = ConnectionState::JournalRedo;
            self.replay_step()
        } else {
            self.mark_connected();
            Ok(())
        }
    }

    fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.dispatcher.notify(Event::Connected, &Payload::Opened);
    }

    fn on_close(&mut self, reason: CloseReason) -> Result<()> {
        let spilled = if self.state == ConnectionState::JournalRedo {
            self.abort_replay()
        } else {
            Ok(())
        };

        if self.skip_reconnect {
            #[cfg(feature = "tracing")]
            tracing::info!(uri = %self.uri, %reason, "Disconnected");
            self.state = ConnectionState::Disconnecting;
            self.dispatcher
                .notify(Event::Disconnected, &Payload::Closed(reason));
            self.report(spilled);
            return Ok(());
        }

        self.state = ConnectionState::Reconnecting;
        self.dispatcher
            .notify(Event::Reconnect, &Payload::Closed(reason));
        self.report(spilled);
        self.schedule_reconnect()
    }

    /// Surface a journal failure that has no caller to return to.
    fn report(&self, result: Result<()>) {
        if let Err(e) = result {
            #[cfg(feature = "tracing")]
            tracing::error!(uri = %self.uri, error = %e, "Journal failure outside of send");
            self.dispatcher.notify(Event::Error, &Payload::Error(e));
        }
    }

    fn schedule_reconnect(&mut self) -> Result<()> {
        if let Some(delay) = self.cursor.next_backoff() {
            #[cfg(feature = "tracing")]
            tracing::info!(uri = %self.uri, "Connection lost, reconnecting in {}", DelayDisplay(delay));
            #[cfg(not(feature = "tracing"))]
            let _ = DelayDisplay(delay);

            self.next_timer_id = self.next_timer_id.wrapping_add(1);
            let timer = TimerId(self.next_timer_id);
            self.pending_timer = Some(timer);
            self.scheduler.schedule_after(delay, timer);
            return Ok(());
        }

        let exhausted = RetriesExhausted {
            uri: self.uri.to_string(),
            attempts: self.cursor.attempts(),
            last_delay: self.schedule.last(),
        };
        #[cfg(feature = "tracing")]
        tracing::error!(uri = %self.uri, attempts = exhausted.attempts, "Exhausted the retry schedule");

        self.state = ConnectionState::Disconnected;
        self.exhausted = Some(exhausted.clone());
        self.dispatcher.notify(
            Event::Error,
            &Payload::Error(Error::from(exhausted.clone())),
        );
        Err(exhausted.into())
    }

    fn send_live(&mut self, message: Message) -> Result<()> {
        let Some(live) = self.live.as_mut() else {
            return self.queue(message);
        };

        if let Some(journal) = self.journal.as_mut() {
            while let Some(queued) = journal.pop_overflow() {
                if let Err(e) = live.connection.send(&queued) {
                    self.dispatcher.notify(Event::Error, &Payload::Error(e));
                    journal.append(&queued)?;
                    journal.abort_replay()?;
                    return journal.append(&message);
                }
            }
        }

        match live.connection.send(&message) {
            Ok(()) => Ok(()),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(uri = %self.uri, error = %e, "Unable to send message");
                self.dispatcher.notify(Event::Error, &Payload::Error(e));
                self.queue(message)
            }
        }
    }

    fn queue(&mut self, message: Message) -> Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.append(&message),
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(state = %self.state, len = message.len(), "Not connected and not journaled, dropping message");
                Ok(())
            }
        }
    }

    fn abort_replay(&mut self) -> Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.abort_replay(),
            None => Ok(()),
        }
    }
}

impl<C: Connector, S: Scheduler> std::fmt::Debug for ConnectionStateMachine<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("uri", &self.uri.as_str())
            .field("state", &self.state)
            .field("connection", &self.live.as_ref().map(|live| live.id))
            .field("pending_timer", &self.pending_timer)
            .field("journal", &self.journal)
            .finish_non_exhaustive()
    }
}
