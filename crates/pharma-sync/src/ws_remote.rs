//! # WebSocket Remote
//!
//! [`RemoteChannel`] over the [`Transport`]: each call becomes one request
//! frame, correlated with its reply by request id.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  engine ──► WsRemote::write_path ──► pending[id] = oneshot ──► send     │
//! │                                                                         │
//! │  transport incoming ──► dispatcher task                                 │
//! │                           ├─ reply (ack/readResult/...) ──► pending[id] │
//! │                           ├─ event { scope } ──► subscriber sinks       │
//! │                           └─ state change                               │
//! │                                 lost:        fail every pending request │
//! │                                 reconnected: re-authenticate and        │
//! │                                              re-send subscriptions      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests issued while the transport is not connected fail at once with
//! [`SyncError::Disconnected`]; nothing is buffered for a later connection.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use url::Url;

use pharma_core::{now_millis, DevicePresence, SyncEvent};

use crate::config::{RemoteCredentials, RemoteSettings};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{RemoteMessage, RequestId};
use crate::remote::{
    event_path, presence_path, presence_root, AuthState, RemoteChannel, RemoteSubscription,
};
use crate::transport::{ConnectionState, Transport, TransportConfig, TransportHandle};

type Sinks = HashMap<String, Vec<(u64, mpsc::UnboundedSender<SyncEvent>)>>;

struct WsInner {
    transport: TransportHandle,
    credentials: RemoteCredentials,
    device_id: String,
    request_timeout: Duration,
    next_request: AtomicU64,
    next_sink: AtomicU64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<RemoteMessage>>>,
    sinks: Mutex<Sinks>,
    presence: Mutex<HashMap<String, DevicePresence>>,
}

/// WebSocket client for the real-time backend. Cheap to clone.
#[derive(Clone)]
pub struct WsRemote {
    inner: Arc<WsInner>,
}

impl WsRemote {
    /// Starts connecting to `credentials.endpoint`. Must be called inside a
    /// tokio runtime; returns before the first connection is up.
    pub fn connect(
        credentials: RemoteCredentials,
        settings: &RemoteSettings,
        device_id: impl Into<String>,
    ) -> SyncResult<Self> {
        let url = Url::parse(&credentials.endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidUrl(format!(
                "expected ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        let config = TransportConfig::new(url.as_str(), settings);
        Ok(Self::spawn(
            credentials,
            device_id.into(),
            config,
            settings.request_timeout(),
        ))
    }

    pub(crate) fn spawn(
        credentials: RemoteCredentials,
        device_id: String,
        config: TransportConfig,
        request_timeout: Duration,
    ) -> Self {
        info!(url = %config.url, device_id = %device_id, "Starting remote connection");
        let (transport, incoming) = Transport::spawn(config);
        let state = transport.subscribe_state();

        let inner = Arc::new(WsInner {
            transport,
            credentials,
            device_id,
            request_timeout,
            next_request: AtomicU64::new(1),
            next_sink: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            presence: Mutex::new(HashMap::new()),
        });
        tokio::spawn(dispatch(Arc::downgrade(&inner), incoming, state));

        WsRemote { inner }
    }

    /// Transport state; `Connected` is the platform's "online" signal.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.subscribe_state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Closes the connection and stops reconnecting.
    pub fn shutdown(&self) {
        self.inner.transport.shutdown();
    }
}

impl std::fmt::Debug for WsRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRemote")
            .field("endpoint", &self.inner.credentials.endpoint)
            .field("state", &self.inner.transport.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Request / Reply
// =============================================================================

impl WsInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<RemoteMessage>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sinks(&self) -> MutexGuard<'_, Sinks> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn presence(&self) -> MutexGuard<'_, HashMap<String, DevicePresence>> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn request<F>(&self, build: F) -> SyncResult<RemoteMessage>
    where
        F: FnOnce(RequestId) -> RemoteMessage,
    {
        if !self.transport.is_connected() {
            return Err(SyncError::Disconnected);
        }

        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id, tx);

        let message = build(request_id);
        let operation = message.type_name();
        trace!(request_id, %operation, "Request");
        if let Err(e) = self.transport.send(message).await {
            self.pending().remove(&request_id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(RemoteMessage::Error { code, message, .. })) => {
                Err(error_from_code(operation, &code, message))
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => {
                self.pending().remove(&request_id);
                warn!(request_id, %operation, "Request timed out");
                Err(SyncError::Timeout(self.request_timeout.as_secs()))
            }
        }
    }

    async fn expect_ack<F>(&self, build: F) -> SyncResult<()>
    where
        F: FnOnce(RequestId) -> RemoteMessage,
    {
        match self.request(build).await? {
            RemoteMessage::Ack { .. } => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    async fn authenticate(&self) -> SyncResult<AuthState> {
        let reply = self
            .request(|request_id| RemoteMessage::Authenticate {
                request_id,
                api_key: self.credentials.api_key.clone(),
                project_id: self.credentials.project_id.clone(),
                device_id: self.device_id.clone(),
            })
            .await?;
        match reply {
            RemoteMessage::AuthResult { state, .. } => Ok(state),
            other => Err(unexpected("authResult", &other)),
        }
    }

    async fn subscribe_scope(&self, scope: &str) -> SyncResult<()> {
        self.expect_ack(|request_id| RemoteMessage::Subscribe {
            request_id,
            scope: scope.to_string(),
        })
        .await
    }

    /// Runs after a reconnect: the server forgot this connection's session
    /// and subscriptions.
    async fn restore_session(&self) {
        let scopes: Vec<String> = self.sinks().keys().cloned().collect();
        if scopes.is_empty() {
            return;
        }
        if let Err(e) = self.authenticate().await {
            warn!(%e, "Re-authentication after reconnect failed");
            return;
        }
        for scope in scopes {
            match self.subscribe_scope(&scope).await {
                Ok(()) => debug!(%scope, "Subscription restored"),
                Err(e) => warn!(%scope, %e, "Could not restore subscription"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Inbound routing
    // -------------------------------------------------------------------------

    fn route(&self, message: RemoteMessage) {
        if let Some(request_id) = message.reply_to() {
            match self.pending().remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(message);
                }
                None => debug!(request_id, "Reply for unknown or expired request"),
            }
            return;
        }

        match message {
            RemoteMessage::Event { scope, event } => {
                let mut sinks = self.sinks();
                if let Some(list) = sinks.get_mut(&scope) {
                    list.retain(|(_, sink)| sink.send(event.clone()).is_ok());
                } else {
                    trace!(%scope, "Event for a scope with no subscribers");
                }
            }
            RemoteMessage::Error { code, message, .. } => {
                warn!(%code, %message, "Backend reported an error");
            }
            other => debug!(msg_type = %other.type_name(), "Unexpected message ignored"),
        }
    }

    fn fail_pending(&self) {
        let failed: Vec<_> = self.pending().drain().collect();
        if !failed.is_empty() {
            debug!(count = failed.len(), "Failing requests of a lost connection");
        }
    }

    fn remove_sink(&self, scope: &str, sink_id: u64) -> bool {
        let mut sinks = self.sinks();
        let Some(list) = sinks.get_mut(scope) else {
            return false;
        };
        list.retain(|(id, _)| *id != sink_id);
        if list.is_empty() {
            sinks.remove(scope);
            true
        } else {
            false
        }
    }
}

async fn dispatch(
    weak: Weak<WsInner>,
    mut incoming: mpsc::Receiver<RemoteMessage>,
    mut state: watch::Receiver<ConnectionState>,
) {
    let mut connected = *state.borrow_and_update() == ConnectionState::Connected;
    let mut sessions = u64::from(connected);

    loop {
        tokio::select! {
            message = incoming.recv() => {
                let (Some(message), Some(inner)) = (message, weak.upgrade()) else {
                    break;
                };
                inner.route(message);
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let now_connected = *state.borrow_and_update() == ConnectionState::Connected;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if connected && !now_connected {
                    inner.fail_pending();
                }
                if now_connected && !connected {
                    sessions += 1;
                    if sessions > 1 {
                        tokio::spawn(async move { inner.restore_session().await });
                    }
                }
                connected = now_connected;
            }
        }
    }
    debug!("Remote dispatcher stopped");
}

fn error_from_code(operation: &str, code: &str, message: String) -> SyncError {
    match code {
        "unauthenticated" | "invalid-api-key" | "auth-failed" => SyncError::AuthFailed(message),
        "unavailable" => SyncError::ConnectionFailed(message),
        _ => SyncError::rejected(operation, format!("{}: {}", code, message)),
    }
}

fn unexpected(expected: &str, actual: &RemoteMessage) -> SyncError {
    SyncError::UnexpectedMessageType {
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    }
}

// =============================================================================
// RemoteChannel
// =============================================================================

#[async_trait]
impl RemoteChannel for WsRemote {
    async fn authenticate(&self) -> SyncResult<AuthState> {
        self.inner.authenticate().await
    }

    async fn read_path(&self, path: &str) -> SyncResult<Option<Value>> {
        let reply = self
            .inner
            .request(|request_id| RemoteMessage::Read {
                request_id,
                path: path.to_string(),
            })
            .await?;
        match reply {
            RemoteMessage::ReadResult { data, .. } => Ok(data),
            other => Err(unexpected("readResult", &other)),
        }
    }

    async fn write_path(&self, path: &str, data: &Value) -> SyncResult<()> {
        self.inner
            .expect_ack(|request_id| RemoteMessage::Write {
                request_id,
                path: path.to_string(),
                data: data.clone(),
            })
            .await
    }

    async fn push_event(&self, scope: &str, event: &SyncEvent) -> SyncResult<()> {
        self.inner
            .expect_ack(|request_id| RemoteMessage::PushEvent {
                request_id,
                path: event_path(scope, &event.id),
                event: event.clone(),
            })
            .await
    }

    async fn subscribe_events(
        &self,
        scope: &str,
        sink: mpsc::UnboundedSender<SyncEvent>,
    ) -> SyncResult<RemoteSubscription> {
        let sink_id = self.inner.next_sink.fetch_add(1, Ordering::SeqCst);
        self.inner
            .sinks()
            .entry(scope.to_string())
            .or_default()
            .push((sink_id, sink));

        if let Err(e) = self.inner.subscribe_scope(scope).await {
            self.inner.remove_sink(scope, sink_id);
            return Err(e);
        }

        let weak = Arc::downgrade(&self.inner);
        let scope = scope.to_string();
        Ok(RemoteSubscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.remove_sink(&scope, sink_id) && inner.transport.is_connected() {
                let request_id = inner.next_request.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = inner
                    .transport
                    .try_send(RemoteMessage::Unsubscribe { request_id, scope })
                {
                    debug!(%e, "Unsubscribe not sent");
                }
            }
        }))
    }

    async fn set_presence(&self, scope: &str, presence: &DevicePresence) -> SyncResult<()> {
        let path = presence_path(scope, &presence.device_id);
        self.inner
            .expect_ack(|request_id| RemoteMessage::SetPresence {
                request_id,
                path: path.clone(),
                presence: presence.clone(),
            })
            .await?;
        self.inner.presence().insert(path, presence.clone());
        Ok(())
    }

    async fn on_disconnect_cleanup(&self, scope: &str, device_id: &str) -> SyncResult<()> {
        let path = presence_path(scope, device_id);
        let now = now_millis();
        let offline = match self.inner.presence().get(&path) {
            Some(current) => current.went_offline(now),
            None => DevicePresence::online(device_id, "", now).went_offline(now),
        };
        self.inner
            .expect_ack(|request_id| RemoteMessage::OnDisconnect {
                request_id,
                path,
                presence: offline,
            })
            .await
    }

    async fn read_presence(&self, scope: &str) -> SyncResult<Vec<DevicePresence>> {
        let reply = self
            .inner
            .request(|request_id| RemoteMessage::ReadPresence {
                request_id,
                path: presence_root(scope),
            })
            .await?;
        match reply {
            RemoteMessage::PresenceList { devices, .. } => Ok(devices),
            other => Err(unexpected("presenceList", &other)),
        }
    }
}
