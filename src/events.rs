//! Event handler registry.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Error;
use crate::types::Payload;

/// Lifecycle and data events a client emits.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Event {
    /// The connection is open and any journal replay has completed
    Connected,
    /// The connection closed after [`crate::Client::disconnect`]
    Disconnected,
    /// A data frame arrived
    Receive,
    /// The transport reported an error, or the client gave up reconnecting
    Error,
    /// The connection was lost and a reconnect is being scheduled
    Reconnect,
}

impl Event {
    pub const ALL: [Event; 5] = [
        Event::Connected,
        Event::Disconnected,
        Event::Receive,
        Event::Error,
        Event::Reconnect,
    ];
}

impl FromStr for Event {
    type Err = Error;

    /// Parses the event name. The transport-level names `open`, `message` and `close`
    /// are accepted as aliases of `connected`, `receive` and `disconnected`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" | "open" => Ok(Self::Connected),
            "disconnected" | "close" => Ok(Self::Disconnected),
            "receive" | "message" => Ok(Self::Receive),
            "error" => Ok(Self::Error),
            "reconnect" => Ok(Self::Reconnect),
            other => Err(Error::configuration(format!("unknown event name `{other}`"))),
        }
    }
}

/// A registered callback. Removal matches on the `Arc` pointer, not on behavior.
pub type Handler = Arc<dyn Fn(&Payload) + Send + Sync + 'static>;

/// Ordered callback lists keyed by [`Event`].
///
/// Cloning is cheap and every clone shares the same table, so handlers can be added
/// from application code while the client's event loop is dispatching.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: Arc<DashMap<Event, Vec<Handler>>>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `event`. The same handler may be registered
    /// more than once and is then invoked once per registration.
    pub fn register(&self, event: Event, handler: Handler) {
        self.handlers.entry(event).or_default().push(handler);
    }

    /// Wrap `callback` in a [`Handler`], register it, and return it for later removal.
    pub fn on<F>(&self, event: Event, callback: F) -> Handler
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(callback);
        self.register(event, Arc::clone(&handler));
        handler
    }

    /// Remove the most recent registration of `handler` for `event`.
    ///
    /// Returns `false` when the handler was not registered.
    pub fn unregister(&self, event: Event, handler: &Handler) -> bool {
        let Some(mut handlers) = self.handlers.get_mut(&event) else {
            return false;
        };

        match handlers.iter().rposition(|h| Arc::ptr_eq(h, handler)) {
            Some(index) => {
                handlers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove every registration of `handler` for `event`, returning how many were removed.
    pub fn unregister_all(&self, event: Event, handler: &Handler) -> usize {
        let Some(mut handlers) = self.handlers.get_mut(&event) else {
            return 0;
        };

        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        before - handlers.len()
    }

    #[must_use]
    pub fn handler_count(&self, event: Event) -> usize {
        self.handlers.get(&event).map_or(0, |h| h.len())
    }

    /// Invoke every handler for `event` in registration order.
    ///
    /// A panicking handler is caught and logged; the remaining handlers still run.
    /// Returns the number of handlers that completed normally.
    pub fn notify(&self, event: Event, payload: &Payload) -> usize {
        // Snapshot so handlers can register or remove handlers without deadlocking.
        let handlers = match self.handlers.get(&event) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };

        let mut completed = 0;
        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    #[cfg(feature = "tracing")]
                    {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_owned())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_default();
                        tracing::error!(%event, %reason, "Event handler panicked");
                    }
                    #[cfg(not(feature = "tracing"))]
                    let _ = &panic;
                }
            }
        }

        completed
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for event in Event::ALL {
            map.entry(&event, &self.handler_count(event));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::Message;

    fn counter(dispatcher: &EventDispatcher, event: Event) -> (Handler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler = dispatcher.on(event, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    #[test]
    fn event_names_round_trip() {
        for event in Event::ALL {
            assert_eq!(event.to_string().parse::<Event>().unwrap(), event);
        }
        assert_eq!("message".parse::<Event>().unwrap(), Event::Receive);
        assert_eq!("open".parse::<Event>().unwrap(), Event::Connected);
        assert_eq!("close".parse::<Event>().unwrap(), Event::Disconnected);
        "bogus".parse::<Event>().unwrap_err();
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            let order = Arc::clone(&order);
            dispatcher.on(Event::Receive, move |payload| {
                let text = payload.as_message().and_then(Message::as_text).unwrap();
                order.lock().unwrap().push(format!("{id}:{text}"));
            });
        }

        let completed = dispatcher.notify(Event::Receive, &Payload::Message("hi".into()));

        assert_eq!(completed, 3);
        assert_eq!(*order.lock().unwrap(), vec!["0:hi", "1:hi", "2:hi"]);
    }

    #[test]
    fn removed_handler_is_not_invoked() {
        let dispatcher = EventDispatcher::new();
        let (handler, count) = counter(&dispatcher, Event::Connected);

        assert!(dispatcher.unregister(Event::Connected, &handler));
        dispatcher.notify(Event::Connected, &Payload::Opened);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!dispatcher.unregister(Event::Connected, &handler));
    }

    #[test]
    fn duplicate_registration_removed_once_still_fires_once() {
        let dispatcher = EventDispatcher::new();
        let (handler, count) = counter(&dispatcher, Event::Receive);
        dispatcher.register(Event::Receive, Arc::clone(&handler));

        dispatcher.unregister(Event::Receive, &handler);
        dispatcher.notify(Event::Receive, &Payload::Message("x".into()));
        dispatcher.notify(Event::Receive, &Payload::Message("y".into()));

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.handler_count(Event::Receive), 1);
    }

    #[test]
    fn unregister_all_removes_duplicates() {
        let dispatcher = EventDispatcher::new();
        let (handler, count) = counter(&dispatcher, Event::Error);
        dispatcher.register(Event::Error, Arc::clone(&handler));
        let (_other, other_count) = counter(&dispatcher, Event::Error);

        assert_eq!(dispatcher.unregister_all(Event::Error, &handler), 2);
        dispatcher.notify(Event::Error, &Payload::Opened);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(other_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_only_affects_the_named_event() {
        let dispatcher = EventDispatcher::new();
        let (handler, count) = counter(&dispatcher, Event::Reconnect);
        dispatcher.register(Event::Disconnected, Arc::clone(&handler));

        dispatcher.unregister(Event::Reconnect, &handler);
        dispatcher.notify(Event::Disconnected, &Payload::Opened);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_later_handlers() {
        let dispatcher = EventDispatcher::new();
        dispatcher.on(Event::Receive, |_| panic!("handler failure"));
        let (_handler, count) = counter(&dispatcher, Event::Receive);

        let completed = dispatcher.notify(Event::Receive, &Payload::Message("x".into()));

        assert_eq!(completed, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_register_during_dispatch() {
        let dispatcher = EventDispatcher::new();
        let inner = dispatcher.clone();
        dispatcher.on(Event::Connected, move |_| {
            inner.on(Event::Connected, |_| {});
        });

        dispatcher.notify(Event::Connected, &Payload::Opened);

        assert_eq!(dispatcher.handler_count(Event::Connected), 2);
    }
}
