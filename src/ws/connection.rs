#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, interval_at, sleep};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::error::WsError;
use crate::Result;
use crate::config::HeartbeatConfig;
use crate::transport::{Connection, ConnectionId, Connector, Scheduler, TimerId, TransportEvent};
use crate::types::{CloseReason, Message};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything the tokio transport reports back to the client's event loop.
#[non_exhaustive]
#[derive(Debug)]
pub enum Signal {
    /// An event from connection `id`
    Transport {
        id: ConnectionId,
        event: TransportEvent,
    },
    /// A reconnect delay elapsed
    Timer(TimerId),
}

#[derive(Debug)]
enum Outbound {
    Frame(Message),
    Close,
}

/// Opens connections with [`connect_async`], one background task per connection.
#[derive(Debug, Clone)]
pub struct WsConnector {
    runtime: Handle,
    signals: mpsc::UnboundedSender<Signal>,
    heartbeat: HeartbeatConfig,
}

impl WsConnector {
    #[must_use]
    pub fn new(
        runtime: Handle,
        signals: mpsc::UnboundedSender<Signal>,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            runtime,
            signals,
            heartbeat,
        }
    }
}

impl Connector for WsConnector {
    type Connection = WsConnection;

    fn open(&mut self, uri: &Url, id: ConnectionId) -> Result<WsConnection> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask {
            id,
            signals: self.signals.clone(),
            heartbeat: self.heartbeat,
        };

        self.runtime
            .spawn(task.run(uri.clone(), outbound_rx));

        Ok(WsConnection { outbound_tx })
    }
}

/// Write half of a connection opened by [`WsConnector`].
///
/// Dropping the handle closes the socket; whatever the task reports afterwards is for
/// a connection id the state machine no longer tracks.
#[derive(Debug)]
pub struct WsConnection {
    outbound_tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection for WsConnection {
    fn send(&mut self, message: &Message) -> Result<()> {
        self.outbound_tx
            .send(Outbound::Frame(message.clone()))
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    fn close(&mut self) {
        _ = self.outbound_tx.send(Outbound::Close);
    }
}

/// Fires reconnect timers with [`tokio::time::sleep`].
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    runtime: Handle,
    signals: mpsc::UnboundedSender<Signal>,
}

impl TokioScheduler {
    #[must_use]
    pub fn new(runtime: Handle, signals: mpsc::UnboundedSender<Signal>) -> Self {
        Self { runtime, signals }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&mut self, delay: Duration, timer: TimerId) {
        let signals = self.signals.clone();
        self.runtime.spawn(async move {
            sleep(delay).await;
            _ = signals.send(Signal::Timer(timer));
        });
    }
}

struct ConnectionTask {
    id: ConnectionId,
    signals: mpsc::UnboundedSender<Signal>,
    heartbeat: HeartbeatConfig,
}

impl ConnectionTask {
    fn emit(&self, event: TransportEvent) {
        _ = self.signals.send(Signal::Transport { id: self.id, event });
    }

    async fn run(self, uri: Url, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>) {
        let mut early = Vec::new();

        let connected = tokio::select! {
            result = connect_async(uri.as_str()) => Some(result),
            () = Self::wait_for_close(&mut outbound_rx, &mut early) => None,
        };

        let ws_stream = match connected {
            Some(Ok((ws_stream, _))) => ws_stream,
            Some(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%uri, connection = %self.id, error = %e, "Unable to connect");
                self.emit(TransportEvent::Error(WsError::Connection(e).into()));
                self.emit(TransportEvent::Closed(CloseReason::new(
                    None,
                    "connection failed",
                )));
                return;
            }
            None => {
                self.emit(TransportEvent::Closed(CloseReason::new(
                    None,
                    "closed before open",
                )));
                return;
            }
        };

        self.emit(TransportEvent::Opened);

        let reason = self.handle_connection(ws_stream, outbound_rx, early).await;

        #[cfg(feature = "tracing")]
        tracing::debug!(%uri, connection = %self.id, %reason, "Connection closed");

        self.emit(TransportEvent::Closed(reason));
    }

    /// Resolves once a close is requested (or the handle dropped) while still connecting.
    async fn wait_for_close(
        outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
        early: &mut Vec<Message>,
    ) {
        while let Some(Outbound::Frame(message)) = outbound_rx.recv().await {
            early.push(message);
        }
    }

    async fn handle_connection(
        &self,
        ws_stream: WsStream,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        early: Vec<Message>,
    ) -> CloseReason {
        let (mut write, mut read) = ws_stream.split();

        for message in early {
            if let Err(e) = write.send(to_ws(message)).await {
                self.emit(TransportEvent::Error(e.into()));
                return CloseReason::new(None, "write failed");
            }
        }

        let mut ping_interval = self
            .heartbeat
            .interval
            .map(|period| interval_at(Instant::now() + period, period));
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            tokio::select! {
                // Handle incoming frames
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(connection = %self.id, %text, "Received WebSocket text message");
                            self.emit(TransportEvent::Message(Message::Text(text.as_str().to_owned())));
                        }
                        Some(Ok(WsMessage::Binary(bytes))) => {
                            self.emit(TransportEvent::Message(Message::Binary(bytes.to_vec())));
                        }
                        Some(Ok(WsMessage::Pong(_))) => {
                            awaiting_pong = None;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            return close_reason(frame);
                        }
                        Some(Ok(_)) => {
                            // PINGs are answered by tungstenite; raw frames are not surfaced.
                        }
                        Some(Err(e)) => {
                            self.emit(TransportEvent::Error(e.into()));
                            return CloseReason::new(None, "read failed");
                        }
                        None => {
                            return CloseReason::new(None, "stream ended");
                        }
                    }
                }

                // Handle outgoing frames from the state machine
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(Outbound::Frame(message)) => {
                            if let Err(e) = write.send(to_ws(message)).await {
                                self.emit(TransportEvent::Error(e.into()));
                                return CloseReason::new(None, "write failed");
                            }
                        }
                        Some(Outbound::Close) | None => {
                            _ = write.send(WsMessage::Close(None)).await;
                            _ = write.close().await;
                            return CloseReason::new(Some(1000), "closed by client");
                        }
                    }
                }

                // Heartbeat
                () = tick(ping_interval.as_mut()) => {
                    if let Some(sent) = awaiting_pong {
                        if sent.elapsed() >= self.heartbeat.timeout {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                connection = %self.id,
                                "Heartbeat timeout: no PONG received within {:?}",
                                self.heartbeat.timeout
                            );
                            self.emit(TransportEvent::Error(
                                WsError::HeartbeatTimeout(self.heartbeat.timeout).into(),
                            ));
                            return CloseReason::new(None, "heartbeat timeout");
                        }
                    } else {
                        if write.send(WsMessage::Ping(Vec::<u8>::new().into())).await.is_err() {
                            return CloseReason::new(None, "write failed");
                        }
                        awaiting_pong = Some(Instant::now());
                    }
                }
            }
        }
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn to_ws(message: Message) -> WsMessage {
    match message {
        Message::Text(text) => WsMessage::Text(text.into()),
        Message::Binary(bytes) => WsMessage::Binary(bytes.into()),
    }
}

fn close_reason(frame: Option<CloseFrame>) -> CloseReason {
    match frame {
        Some(frame) => CloseReason::new(Some(u16::from(frame.code)), frame.reason.as_str()),
        None => CloseReason::new(None, "closed by peer"),
    }
}

#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    use super::*;

    #[test]
    fn close_frame_maps_code_and_reason() {
        let reason = close_reason(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "restarting".into(),
        }));

        assert_eq!(reason, CloseReason::new(Some(1001), "restarting"));
        assert_eq!(close_reason(None).code, None);
    }

    #[test]
    fn messages_map_to_frames() {
        assert_eq!(to_ws(Message::from("hi")), WsMessage::Text("hi".into()));
        assert_eq!(
            to_ws(Message::from(vec![1_u8, 2])),
            WsMessage::Binary(vec![1_u8, 2].into())
        );
    }

    #[tokio::test]
    async fn scheduler_fires_timer_after_delay() {
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(Handle::current(), signals_tx);

        scheduler.schedule_after(Duration::from_millis(10), TimerId(7));

        let signal = tokio::time::timeout(Duration::from_secs(2), signals_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(signal, Signal::Timer(TimerId(7))));
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_error_then_close() {
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let mut connector =
            WsConnector::new(Handle::current(), signals_tx, HeartbeatConfig::disabled());
        // Port 9 (discard) on localhost is closed on any sane test machine.
        let uri = Url::parse("ws://127.0.0.1:9/").unwrap();

        let _connection = connector.open(&uri, ConnectionId(1)).unwrap();

        let first = signals_rx.recv().await.unwrap();
        let second = signals_rx.recv().await.unwrap();
        assert!(matches!(
            first,
            Signal::Transport { id: ConnectionId(1), event: TransportEvent::Error(_) }
        ));
        assert!(matches!(
            second,
            Signal::Transport { id: ConnectionId(1), event: TransportEvent::Closed(_) }
        ));
    }
}
