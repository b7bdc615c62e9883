//! # WebSocket Transport
//!
//! Keeps one WebSocket connection to the remote backend alive, reconnecting
//! with exponential backoff, and moves [`RemoteMessage`] text frames in and
//! out.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    WebSocket Connection States                          │
//! │                                                                         │
//! │  ┌────────────┐    spawn()      ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │ ◄────────────┐          │
//! │  └────────────┘                 └─────┬──────┘              │          │
//! │        ▲                    success   │   failure           │          │
//! │        │                        ┌─────┴─────┐               │          │
//! │        │                        ▼           ▼               │          │
//! │        │              ┌────────────┐  ┌────────────┐        │          │
//! │        │              │ Connected  │─►│  Backoff   │────────┘          │
//! │        │              └────────────┘  └─────┬──────┘  timer expired    │
//! │        │       drop / error / stale pong    │                          │
//! │        └──────────── shutdown ──────────────┘                          │
//! │                                                                         │
//! │  Every state change is published on a watch channel; the composition   │
//! │  root maps Connected / not Connected onto the engine's network signal. │
//! │                                                                         │
//! │  BACKOFF: initial_backoff · 2ⁿ, capped at max_backoff, reset on connect │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::config::RemoteSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::RemoteMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTGOING_BUFFER: usize = 256;
const INCOMING_BUFFER: usize = 256;

// =============================================================================
// Transport State
// =============================================================================

/// Connection state for the WebSocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before the next connection attempt.
    Backoff,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
        }
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,

    /// Interval between application-level pings.
    pub ping_interval: Duration,

    /// The connection is dropped when nothing arrives for
    /// `ping_interval + pong_timeout`.
    pub pong_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>, settings: &RemoteSettings) -> Self {
        TransportConfig {
            url: url.into(),
            connect_timeout: settings.connect_timeout(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Handle for sending through the transport and observing its state.
#[derive(Clone)]
pub struct TransportHandle {
    outgoing_tx: mpsc::Sender<RemoteMessage>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl TransportHandle {
    /// Queues a message for the current connection.
    pub async fn send(&self, message: RemoteMessage) -> SyncResult<()> {
        self.outgoing_tx
            .send(message)
            .await
            .map_err(|_| SyncError::ChannelError("Transport task stopped".into()))
    }

    /// Queues without waiting; fails when the outgoing buffer is full.
    pub fn try_send(&self, message: RemoteMessage) -> SyncResult<()> {
        self.outgoing_tx
            .try_send(message)
            .map_err(|e| SyncError::ChannelError(format!("Outgoing message not queued: {}", e)))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receives every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Closes the connection and stops reconnecting.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// WebSocket transport with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let (handle, mut incoming) = Transport::spawn(TransportConfig::new(url, &settings));
/// handle.send(RemoteMessage::ping()).await?;
/// while let Some(msg) = incoming.recv().await {
///     println!("{}", msg.type_name());
/// }
/// ```
pub struct Transport {
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    outgoing_rx: mpsc::Receiver<RemoteMessage>,
    incoming_tx: mpsc::Sender<RemoteMessage>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Transport {
    /// Spawns the background connection task. Must be called inside a tokio
    /// runtime.
    pub fn spawn(config: TransportConfig) -> (TransportHandle, mpsc::Receiver<RemoteMessage>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let transport = Transport {
            config,
            state_tx,
            outgoing_rx,
            incoming_tx,
            shutdown_rx,
        };
        tokio::spawn(transport.run());

        let handle = TransportHandle {
            outgoing_tx,
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
        };
        (handle, incoming_rx)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = %current, to = %state, "Transport state");
                *current = state;
                true
            }
        });
    }

    /// Explicit shutdown, or every handle dropped.
    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err()
    }

    async fn run(mut self) {
        info!(url = %self.config.url, "Transport starting");
        let mut backoff = self.create_backoff();

        loop {
            if self.shutdown_requested() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            match self.connect_with_timeout().await {
                Ok(ws_stream) => {
                    info!("WebSocket connected");
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);

                    match self.connection_loop(ws_stream).await {
                        Ok(()) => info!("WebSocket closed"),
                        Err(e) => warn!(%e, "Connection lost"),
                    }
                    self.discard_outgoing();
                }
                Err(e) => warn!(%e, "Failed to connect"),
            }

            if self.shutdown_requested() || self.incoming_tx.is_closed() {
                break;
            }
            self.set_state(ConnectionState::Backoff);

            let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
            debug!(?delay, "Waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.changed() => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Transport stopped");
    }

    async fn connect_with_timeout(&self) -> SyncResult<WsStream> {
        match timeout(self.config.connect_timeout, connect_async(&self.config.url)).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        }
    }

    /// Requests queued for a connection that died would be answered by
    /// nobody; their callers already saw the disconnect.
    fn discard_outgoing(&mut self) {
        let mut dropped = 0;
        while self.outgoing_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded messages queued for a dead connection");
        }
    }

    async fn connection_loop(&mut self, ws_stream: WsStream) -> SyncResult<()> {
        let (mut write, mut read) = ws_stream.split();

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_interval.tick().await;
        let stale_after = self.config.ping_interval + self.config.pong_timeout;
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                outgoing = self.outgoing_rx.recv() => {
                    let Some(msg) = outgoing else {
                        // Every handle is gone.
                        let _ = write.send(WsMessage::Close(None)).await;
                        return Ok(());
                    };
                    trace!(msg_type = %msg.type_name(), request_id = ?msg.request_id(), "Sending");
                    write.send(WsMessage::Text(msg.to_json()?.into())).await?;
                }

                incoming = read.next() => {
                    let Some(result) = incoming else {
                        return Err(SyncError::Disconnected);
                    };
                    last_heard = Instant::now();
                    match result {
                        Ok(WsMessage::Text(text)) => match RemoteMessage::from_json(&text) {
                            Ok(RemoteMessage::Ping { timestamp }) => {
                                write
                                    .send(WsMessage::Text(RemoteMessage::pong(timestamp).to_json()?.into()))
                                    .await?;
                            }
                            Ok(RemoteMessage::Pong { timestamp }) => {
                                trace!(timestamp, "Received pong");
                            }
                            Ok(msg) => {
                                trace!(msg_type = %msg.type_name(), "Received");
                                if self.incoming_tx.send(msg).await.is_err() {
                                    return Err(SyncError::ChannelError("Receiver dropped".into()));
                                }
                            }
                            Err(e) => warn!(%e, "Unparseable frame ignored"),
                        },
                        Ok(WsMessage::Ping(data)) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Ok(WsMessage::Pong(_)) => {}
                        Ok(WsMessage::Close(frame)) => {
                            info!(?frame, "Received close frame");
                            return Ok(());
                        }
                        Ok(WsMessage::Binary(_)) => warn!("Unexpected binary frame ignored"),
                        Ok(WsMessage::Frame(_)) => {}
                        Err(e) => {
                            error!(%e, "WebSocket error");
                            return Err(SyncError::from(e));
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    if last_heard.elapsed() > stale_after {
                        warn!(?stale_after, "Connection stale, dropping");
                        return Err(SyncError::Timeout(stale_after.as_secs()));
                    }
                    write.send(WsMessage::Text(RemoteMessage::ping().to_json()?.into())).await?;
                }

                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown requested, closing connection");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.config.initial_backoff,
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
    }

    #[test]
    fn test_config_takes_connect_timeout() {
        let settings = RemoteSettings {
            connect_timeout_secs: 3,
            ..RemoteSettings::default()
        };
        let config = TransportConfig::new("ws://127.0.0.1:1/v1/ws", &settings);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_answers_server_ping_and_forwards_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(RemoteMessage::Ping { timestamp: 5 }.to_json().unwrap().into()))
                .await
                .unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            ws.send(WsMessage::Text(RemoteMessage::Ack { request_id: 1 }.to_json().unwrap().into()))
                .await
                .unwrap();
            let closing = ws.next().await;
            (reply, closing)
        });

        let (handle, mut incoming) = Transport::spawn(TransportConfig {
            url,
            ..Default::default()
        });

        let msg = timeout(Duration::from_secs(5), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, RemoteMessage::Ack { request_id: 1 });
        assert!(handle.is_connected());

        handle.shutdown();
        let (reply, _) = server.await.unwrap();
        let text = reply.into_text().unwrap();
        assert_eq!(RemoteMessage::from_json(&text).unwrap(), RemoteMessage::pong(5));
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.next().await
        });

        let (handle, _incoming) = Transport::spawn(TransportConfig {
            url,
            initial_backoff: Duration::from_millis(20),
            ..Default::default()
        });
        let mut state = handle.subscribe_state();

        assert!(timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Backoff),
        )
        .await
        .is_ok());
        assert!(timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .is_ok());

        handle.send(RemoteMessage::ping()).await.unwrap();
        let frame = server.await.unwrap().unwrap().unwrap();
        let msg = RemoteMessage::from_json(&frame.into_text().unwrap()).unwrap();
        assert_eq!(msg.type_name(), "ping");
        handle.shutdown();
    }
}
