use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use crate::Result;
use crate::config::Config;
use crate::error::{Kind, RetriesExhausted};
use crate::events::{Event, EventDispatcher, Handler};
use crate::machine::{ConnectionState, ConnectionStateMachine};
use crate::retry::RetrySchedule;
use crate::types::{Message, Payload};
use crate::ws::{Signal, TokioScheduler, WsConnector, WsError};

type Machine = ConnectionStateMachine<WsConnector, TokioScheduler>;

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<Result<()>>),
    Send(Message, oneshot::Sender<Result<()>>),
}

/// Resilient WebSocket client.
///
/// Keeps one logical connection to a single endpoint, reconnecting on the configured
/// [`RetrySchedule`] whenever the connection drops. With journaling enabled, messages
/// sent while disconnected are written to a durable journal and replayed, in order,
/// after the next reconnect.
///
/// All state transitions run on one background task. The client is a cheap handle to
/// it and can be cloned freely; the task disconnects and stops once every clone has been
/// dropped. Registered handlers are owned by the client, so a handler that captures a
/// clone keeps the task alive until that handler is removed with [`Self::remove_on`].
///
/// # Examples
///
/// ```rust, no_run
/// use tether_ws::{Client, Event};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::new("wss://feed.example.com/stream")?;
///
///     client.on(Event::Receive, |payload| {
///         if let Some(message) = payload.as_message() {
///             println!("received {message:?}");
///         }
///     });
///
///     client.connect().await?;
///     client.send(r#"{"subscribe":"prices"}"#).await?;
///
///     client.closed().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Normalized endpoint
    uri: Url,
    /// Template the retry cursor is cloned from
    retry_schedule: RetrySchedule,
    journaled: bool,
    /// Sender for commands executed on the event loop
    commands: mpsc::UnboundedSender<Command>,
    /// Watch channel receiver for state changes
    state_rx: watch::Receiver<ConnectionState>,
    /// Set once the retry schedule has been exhausted
    exhausted_rx: watch::Receiver<Option<RetriesExhausted>>,
    dispatcher: EventDispatcher,
}

impl Client {
    /// Create a client and start its event loop. Does not connect.
    ///
    /// Accepts a [`Config`] or, as shorthand, just the endpoint. Fails with a
    /// configuration error for an invalid endpoint or schedule, and with a journal error
    /// if the journal file cannot be opened. Must be called within a tokio runtime.
    pub fn new<C: Into<Config>>(config: C) -> Result<Self> {
        let config = config.into();
        let runtime = Handle::try_current().map_err(|_e| WsError::NoRuntime)?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (exhausted_tx, exhausted_rx) = watch::channel(None);
        let dispatcher = EventDispatcher::new();

        let machine = ConnectionStateMachine::new(
            &config,
            WsConnector::new(runtime.clone(), signals_tx.clone(), config.heartbeat),
            TokioScheduler::new(runtime.clone(), signals_tx),
            dispatcher.clone(),
        )?;

        let inner = ClientInner {
            uri: machine.uri().clone(),
            retry_schedule: machine.retry_schedule().clone(),
            journaled: machine.is_journaled(),
            commands: commands_tx,
            state_rx,
            exhausted_rx,
            dispatcher,
        };

        let event_loop = EventLoop {
            machine,
            commands: commands_rx,
            signals: signals_rx,
            state_tx,
            exhausted_tx,
        };
        runtime.spawn(event_loop.run());

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Open the connection. No-op if already connected or connecting.
    ///
    /// Returns once the attempt has started; the `connected` event fires when it succeeds.
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await
    }

    /// Close the connection and cancel any pending reconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Send `message`, whatever the connection state.
    ///
    /// While disconnected the message is journaled when journaling is enabled. Without a
    /// journal it is silently dropped: that mode is lossy by design of the configuration.
    /// A journal write failure is returned here.
    pub async fn send<M: Into<Message>>(&self, message: M) -> Result<()> {
        let message = message.into();
        self.request(|reply| Command::Send(message, reply)).await
    }

    /// Register `callback` for `event`, returning the handler to pass to [`Self::remove_on`].
    ///
    /// The callback runs on the event loop and must not block. Capturing a [`Client`]
    /// clone in it keeps the event loop alive while the handler stays registered.
    pub fn on<F>(&self, event: Event, callback: F) -> Handler
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(event, callback)
    }

    /// Register `callback` for an event given by name, e.g. `"receive"` or `"message"`.
    pub fn on_named<F>(&self, event: &str, callback: F) -> Result<Handler>
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        Ok(self.on(event.parse()?, callback))
    }

    /// Remove one registration of `handler` for `event`.
    pub fn remove_on(&self, event: Event, handler: &Handler) -> bool {
        self.inner.dispatcher.unregister(event, handler)
    }

    /// Remove every registration of `handler` for `event`.
    pub fn remove_all_on(&self, event: Event, handler: &Handler) -> usize {
        self.inner.dispatcher.unregister_all(event, handler)
    }

    #[must_use]
    pub fn events(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    #[must_use]
    pub fn is_journaled(&self) -> bool {
        self.inner.journaled
    }

    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.inner.uri
    }

    #[must_use]
    pub fn retry_schedule(&self) -> &RetrySchedule {
        &self.inner.retry_schedule
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Wait until the client stops for good.
    ///
    /// Resolves with `Ok` after [`Self::disconnect`] and with a
    /// [`RetriesExhausted`] error once the retry schedule has run out.
    pub async fn closed(&self) -> Result<()> {
        let mut state_rx = self.inner.state_rx.clone();
        let mut exhausted_rx = self.inner.exhausted_rx.clone();

        loop {
            if let Some(exhausted) = exhausted_rx.borrow_and_update().clone() {
                return Err(exhausted.into());
            }
            if *state_rx.borrow_and_update() == ConnectionState::Disconnecting {
                return Ok(());
            }

            tokio::select! {
                changed = state_rx.changed() => changed.map_err(|_e| WsError::ClientStopped)?,
                changed = exhausted_rx.changed() => changed.map_err(|_e| WsError::ClientStopped)?,
            }
        }
    }

    async fn request<F>(&self, command: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .commands
            .send(command(reply_tx))
            .map_err(|_e| WsError::ClientStopped)?;
        reply_rx.await.map_err(|_e| WsError::ClientStopped)?
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("uri", &self.inner.uri.as_str())
            .field("state", &self.state())
            .field("journaled", &self.inner.journaled)
            .finish_non_exhaustive()
    }
}

/// Owns the state machine and feeds it every input, one at a time.
struct EventLoop {
    machine: Machine,
    commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedReceiver<Signal>,
    state_tx: watch::Sender<ConnectionState>,
    exhausted_tx: watch::Sender<Option<RetriesExhausted>>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            if self.machine.is_replaying() {
                // Inputs that arrived during the last batch go first, so sends land in
                // the overflow buffer behind the journal and a close aborts the replay.
                while let Ok(command) = self.commands.try_recv() {
                    self.apply(command);
                }
                while let Ok(signal) = self.signals.try_recv() {
                    self.handle_signal(signal);
                }
                let result = self.machine.replay_step();
                self.settle(result);
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Every client handle is gone.
                        let result = self.machine.disconnect();
                        self.settle(result);
                        break;
                    };
                    self.apply(command);
                }
                Some(signal) = self.signals.recv() => {
                    self.handle_signal(signal);
                }
            }
        }
    }

    fn apply(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::Connect(reply) => (self.machine.connect(), reply),
            Command::Disconnect(reply) => (self.machine.disconnect(), reply),
            Command::Send(message, reply) => (self.machine.send(message), reply),
        };
        self.publish();
        _ = reply.send(result);
    }

    fn handle_signal(&mut self, signal: Signal) {
        let result = match signal {
            Signal::Transport { id, event } => self.machine.handle_transport(id, event),
            Signal::Timer(timer) => self.machine.handle_timer(timer),
        };
        self.settle(result);
    }

    fn settle(&mut self, result: Result<()>) {
        if let Err(e) = result {
            #[cfg(feature = "tracing")]
            tracing::error!(uri = %self.machine.uri(), error = %e, "Client error");
            // Exhaustion is already on the `error` event; nothing else here has a caller.
            if e.kind() != Kind::RetriesExhausted {
                self.machine
                    .dispatcher()
                    .notify(Event::Error, &Payload::Error(e));
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });

        let exhausted = self.machine.exhausted().cloned();
        self.exhausted_tx.send_if_modified(|current| {
            let changed = *current != exhausted;
            *current = exhausted;
            changed
        });
    }
}
