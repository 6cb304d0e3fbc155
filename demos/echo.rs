//! Keeps a journaled connection to an echo server and prints everything it sends back.
//!
//! This example shows how to:
//! 1. Configure a client with a short retry schedule and a journal
//! 2. React to connection lifecycle events
//! 3. Keep sending while the server is unreachable and watch the backlog replay
//!
//! Run against any WebSocket echo server:
//! ```sh
//! RUST_LOG=info,tether_ws=debug cargo run --example echo --features ws,tracing -- ws://127.0.0.1:9001
//! ```
//!
//! Optionally log to a file:
//! ```sh
//! LOG_FILE=echo.log RUST_LOG=info cargo run --example echo --features ws,tracing -- ws://127.0.0.1:9001
//! ```

use std::fs::File;
use std::time::Duration;

use tether_ws::{Client, Config, Event, JournalConfig, RetrySchedule};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9001".to_owned());

    let config = Config::builder()
        .uri(uri)
        .retry_schedule(RetrySchedule::from_secs(&[1, 1, 2, 5])?)
        .journal(JournalConfig::new("./logs/echo.journal").with_replay_batch_size(16))
        .build();
    let client = Client::new(config)?;
    info!(uri = %client.uri(), journaled = client.is_journaled(), "client created");

    client.on(Event::Connected, |_| info!("connected"));
    client.on(Event::Reconnect, |payload| {
        if let Some(reason) = payload.as_close() {
            warn!(%reason, "connection lost");
        }
    });
    client.on(Event::Receive, |payload| {
        if let Some(text) = payload.as_message().and_then(|m| m.as_text()) {
            info!(%text, "echo");
        }
    });
    client.on(Event::Error, |payload| {
        if let Some(error) = payload.as_error() {
            warn!(%error, "client error");
        }
    });

    client.connect().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    for seq in 0_u32..60 {
        ticker.tick().await;
        client.send(format!(r#"{{"seq":{seq}}}"#)).await?;
    }

    client.disconnect().await?;
    client.closed().await?;
    info!("done");

    Ok(())
}
