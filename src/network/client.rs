use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::common::{PushEvent, TransportEvent};
use crate::config::AppConfig;
use crate::error::TransportError;

use super::session::Session;
use super::transport::{Frame, Inbound, RealtimeTransport, SERVER_READY};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

const OUTGOING_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl From<&AppConfig> for SocketConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            url: config.socket_url.clone(),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(config.max_reconnect_delay_ms),
        }
    }
}

/// Cloneable handle onto a running [`SocketClient`].
#[derive(Clone)]
pub struct SocketHandle {
    outgoing: mpsc::Sender<String>,
    pending: PendingAcks,
    next_ack: Arc<AtomicU64>,
    state: watch::Receiver<LinkState>,
}

impl SocketHandle {
    pub fn link_state(&self) -> LinkState {
        *self.state.borrow()
    }
}

impl RealtimeTransport for SocketHandle {
    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        // Emits issued while offline wait for the next connection.
        let mut state = self.state.clone();
        state
            .wait_for(|link| *link == LinkState::Connected)
            .await
            .map_err(|_| TransportError::Closed)?;

        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let text = Frame::emit(event, payload, Some(id)).encode()?;
        let (tx, rx) = oneshot::channel();
        let _slot = AckSlot::register(&self.pending, id, tx).await;

        if self.outgoing.send(text).await.is_err() {
            return Err(TransportError::Closed);
        }
        log::debug!("Emitted {event} (ack #{id})");

        rx.await.map_err(|_| TransportError::ConnectionLost)
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if self.link_state() != LinkState::Connected {
            return Err(TransportError::NotConnected);
        }
        let text = Frame::emit(event, payload, None).encode()?;
        self.outgoing.try_send(text).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })?;
        log::debug!("Emitted {event}");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }
}

/// Waiter entry in [`PendingAcks`], removed when the emitting future
/// completes or is dropped.
struct AckSlot {
    pending: PendingAcks,
    id: u64,
}

impl AckSlot {
    async fn register(pending: &PendingAcks, id: u64, waiter: oneshot::Sender<Value>) -> Self {
        let mut acks = pending.lock().await;
        // Entries whose caller gave up while another emit held the lock.
        acks.retain(|_, waiter| !waiter.is_closed());
        acks.insert(id, waiter);
        Self {
            pending: Arc::clone(pending),
            id,
        }
    }
}

impl Drop for AckSlot {
    fn drop(&mut self) {
        if let Ok(mut acks) = self.pending.try_lock() {
            acks.remove(&self.id);
        }
    }
}

enum PumpExit {
    Lost(String),
    Shutdown,
}

/// Owned WebSocket connection for one authenticated session.
///
/// `run` keeps the socket up: it reconnects with exponential backoff,
/// fails outstanding acknowledgements when a connection drops, and
/// forwards lifecycle and push events to the sync layer.
pub struct SocketClient {
    config: SocketConfig,
    session: Session,
    event_sender: mpsc::Sender<TransportEvent>,
    outgoing_receiver: mpsc::Receiver<String>,
    pending: PendingAcks,
    state: watch::Sender<LinkState>,
}

impl SocketClient {
    pub fn new(
        config: SocketConfig,
        session: Session,
        event_sender: mpsc::Sender<TransportEvent>,
    ) -> (Self, SocketHandle) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));

        let handle = SocketHandle {
            outgoing: outgoing_tx,
            pending: Arc::clone(&pending),
            next_ack: Arc::new(AtomicU64::new(1)),
            state: state_rx,
        };
        let client = Self {
            config,
            session,
            event_sender,
            outgoing_receiver: outgoing_rx,
            pending,
            state: state_tx,
        };
        (client, handle)
    }

    /// Runs until every [`SocketHandle`] is dropped.
    pub async fn run(mut self) {
        let mut delay = self.config.reconnect_delay;

        loop {
            self.state.send_replace(LinkState::Connecting);
            log::info!("Connecting to {}", self.config.url);

            match self.connect().await {
                Ok(stream) => {
                    delay = self.config.reconnect_delay;
                    self.discard_stale_frames();
                    self.state.send_replace(LinkState::Connected);
                    log::info!("Socket connected");
                    self.notify(TransportEvent::Connected).await;

                    let exit = self.pump(stream).await;
                    self.state.send_replace(LinkState::Disconnected);
                    self.discard_stale_frames();
                    self.fail_pending().await;

                    match exit {
                        PumpExit::Shutdown => {
                            log::info!("Socket shut down");
                            return;
                        }
                        PumpExit::Lost(reason) => {
                            log::warn!("Socket disconnected: {reason}");
                            self.notify(TransportEvent::Disconnected { reason }).await;
                        }
                    }
                }
                Err(err) => {
                    self.state.send_replace(LinkState::Disconnected);
                    log::warn!("Socket connect error: {err}");
                    self.notify(TransportEvent::ConnectError(err.to_string()))
                        .await;
                }
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.max_reconnect_delay);
        }
    }

    async fn connect(&self) -> Result<WsStream, TransportError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(token) = self.session.access_token().await {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(stream)
    }

    async fn pump(&mut self, stream: WsStream) -> PumpExit {
        let (mut writer, mut reader) = stream.split();

        loop {
            tokio::select! {
                outgoing = self.outgoing_receiver.recv() => {
                    match outgoing {
                        Some(text) => {
                            if let Err(err) = writer.send(WsMessage::Text(text.into())).await {
                                return PumpExit::Lost(err.to_string());
                            }
                        }
                        None => {
                            let _ = writer.send(WsMessage::Close(None)).await;
                            return PumpExit::Shutdown;
                        }
                    }
                }
                incoming = reader.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => self.handle_text(text.as_str()).await,
                        Some(Ok(WsMessage::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.as_str().to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by server".to_string());
                            return PumpExit::Lost(reason);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return PumpExit::Lost(err.to_string()),
                        None => return PumpExit::Lost("stream ended".to_string()),
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        match Frame::decode(text) {
            Ok(Inbound::Ack { id, data }) => {
                match self.pending.lock().await.remove(&id) {
                    Some(waiter) => {
                        // Receiver gone means the caller already timed out.
                        let _ = waiter.send(data);
                    }
                    None => log::debug!("Ack #{id} has no waiter"),
                }
            }
            Ok(Inbound::Event { name, .. }) if name == SERVER_READY => {
                log::info!("Server ready");
                self.notify(TransportEvent::ServerReady).await;
            }
            Ok(Inbound::Event { name, data }) => match PushEvent::decode(&name, data) {
                Ok(Some(push)) => self.notify(TransportEvent::Push(push)).await,
                Ok(None) => log::debug!("Ignoring event {name}"),
                Err(err) => log::warn!("Malformed {name} event: {err}"),
            },
            Err(err) => log::warn!("Dropping undecodable frame: {err}"),
        }
    }

    /// Frames queued for a connection that is gone. Their acks were
    /// tracked on that connection, so they are never replayed.
    fn discard_stale_frames(&mut self) {
        let mut dropped = 0;
        while self.outgoing_receiver.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::warn!("Discarding {dropped} frames queued for a lost connection");
        }
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            log::warn!("Dropping {} unacknowledged emits", pending.len());
        }
        // Dropping the senders wakes every waiter with ConnectionLost.
        pending.clear();
    }

    async fn notify(&self, event: TransportEvent) {
        if let Err(err) = self.event_sender.send(event).await {
            log::warn!("Failed to forward transport event: {err}");
        }
    }
}
