use std::{pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use shared::{domain::ClientEvent, protocol::OutboundEvent};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{error::ClientError, notice::StatusNotice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

/// Delay between a drop (or failed attempt) and the next connect. The
/// manager never gives up; only the spacing between attempts changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    /// Doubles per consecutive failure, capped at `max`. Reset by a
    /// successful connect.
    Backoff { initial: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(Duration::from_millis(3000))
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Backoff { initial, max } => {
                let factor = 1u32.checked_shl(consecutive_failures).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Closed,
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<InboundFrame>> + Send>>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)>;
}

pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (ws_writer, ws_reader) = ws_stream.split();

        let sink = ws_writer
            .sink_map_err(anyhow::Error::from)
            .with(|text: String| future::ready(Ok::<_, anyhow::Error>(Message::Text(text))));
        let stream = ws_reader.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text))),
                Ok(Message::Close(_)) => Some(Ok(InboundFrame::Closed)),
                Ok(_) => None,
                Err(err) => Some(Err(
                    anyhow::Error::from(err).context("websocket receive failed")
                )),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Frame(String),
    Notice(StatusNotice),
    StateChanged(ConnectionState),
}

enum SessionEnd {
    Dropped,
    Shutdown,
}

/// Owns the persistent socket. Inbound frames, notices and state changes
/// are delivered in order on the events channel handed to `new`.
pub struct ConnectionManager {
    url: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            url: url.into(),
            connector,
            policy,
            state,
            outbound: Mutex::new(None),
            events,
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Starts the connect/reconnect loop. A second call while the loop is
    /// running is a no-op.
    pub async fn open(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        self.shutdown.send_replace(false);
        let shutdown = self.shutdown.subscribe();
        let manager = Arc::clone(self);
        *task = Some(tokio::spawn(manager.run(shutdown)));
    }

    /// Sends `{"event": "<name>"}`. Fails with `NotConnected` unless the
    /// socket is open; nothing is queued for later delivery.
    pub async fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        if self.current_state() != ConnectionState::Open {
            return Err(ClientError::NotConnected);
        }
        let frame = serde_json::to_string(&OutboundEvent { event })?;
        let guard = self.outbound.lock().await;
        let writer = guard.as_ref().ok_or(ClientError::NotConnected)?;
        writer.send(frame).map_err(|_| ClientError::NotConnected)?;
        debug!(event = %event, "connection: event queued");
        Ok(())
    }

    /// Stops the loop, closing an open socket or cutting a pending backoff
    /// short, and waits for it to finish.
    pub async fn close(&self) {
        self.request_close();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Signals the loop to stop without waiting for it.
    pub fn request_close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            info!(url = %self.url, attempt = failures + 1, "connection: connecting");

            let connected = tokio::select! {
                result = self.connector.connect(&self.url) => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok((sink, stream)) => {
                    failures = 0;
                    if let SessionEnd::Shutdown = self.serve(sink, stream, &mut shutdown).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(url = %self.url, error = %format!("{err:#}"), "connection: connect failed");
                    self.emit(ConnectionEvent::Notice(StatusNotice::error(format!(
                        "connection error: {err:#}"
                    ))));
                }
            }

            self.set_state(ConnectionState::Closed);
            let delay = self.policy.delay(failures);
            failures = failures.saturating_add(1);
            info!(
                url = %self.url,
                delay_ms = delay.as_millis() as u64,
                "connection: reconnect scheduled"
            );
            self.emit(ConnectionEvent::Notice(StatusNotice::warning(format!(
                "disconnected; reconnecting in {:.1}s",
                delay.as_secs_f64()
            ))));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        *self.outbound.lock().await = None;
        self.set_state(ConnectionState::Disconnected);
        info!(url = %self.url, "connection: stopped");
    }

    async fn serve(
        &self,
        mut sink: FrameSink,
        mut stream: FrameStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock().await = Some(out_tx);
        self.set_state(ConnectionState::Open);
        info!(url = %self.url, "connection: open");
        self.emit(ConnectionEvent::Notice(StatusNotice::success("connected")));

        let end = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(InboundFrame::Text(text))) => {
                        self.emit(ConnectionEvent::Frame(text));
                    }
                    Some(Ok(InboundFrame::Closed)) | None => {
                        info!(url = %self.url, "connection: closed by peer");
                        break SessionEnd::Dropped;
                    }
                    Some(Err(err)) => {
                        warn!(url = %self.url, error = %format!("{err:#}"), "connection: receive failed");
                        self.emit(ConnectionEvent::Notice(StatusNotice::error(format!(
                            "connection error: {err:#}"
                        ))));
                        break SessionEnd::Dropped;
                    }
                },
                Some(text) = out_rx.recv() => {
                    if let Err(err) = sink.send(text).await {
                        warn!(url = %self.url, error = %format!("{err:#}"), "connection: send failed");
                        self.emit(ConnectionEvent::Notice(StatusNotice::error(format!(
                            "connection error: {err:#}"
                        ))));
                        break SessionEnd::Dropped;
                    }
                }
                _ = shutdown.changed() => {
                    let _ = sink.close().await;
                    break SessionEnd::Shutdown;
                }
            }
        };

        // Writer goes first so `send` reports NotConnected from here on.
        *self.outbound.lock().await = None;
        end
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection: state changed");
            self.emit(ConnectionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
