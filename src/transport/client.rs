//! Persistent WebSocket client for the automation backend.
//!
//! - One connection per session, split into a writer task fed by an mpsc
//!   channel and a reader task that routes frames
//! - Responses are matched to pending requests by echoed `id`, falling back
//!   to the oldest pending request with the same `action`
//! - Every request carries a fixed deadline; nothing is retried here
//! - Pushed `opponentDetected` events fan out on a broadcast channel that
//!   survives reconnects

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::wire::{parse_inbound, Inbound, Request, Response};
use crate::detector::Detection;
use crate::error::TransportError;

/// Default backend address
pub const DEFAULT_TRANSPORT_URL: &str = "ws://localhost:8080";
/// Fixed per-request deadline
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Request/response channel to the automation backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// One round-trip. `status: "error"` responses come back as `TransportError::Remote`.
    async fn request(&self, request: Request) -> Result<Response, TransportError>;

    /// Drop the current connection (failing anything in flight) and open a new one
    async fn reconnect(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TRANSPORT_URL.to_string(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

struct Pending {
    id: u64,
    generation: u64,
    action: &'static str,
    tx: oneshot::Sender<Response>,
}

struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct Shared {
    pending: Mutex<Vec<Pending>>,
    events: broadcast::Sender<Detection>,
    connection: Mutex<Option<Connection>>,
}

impl Shared {
    /// Route a response to its waiter. Returns false when nobody was waiting.
    fn dispatch(&self, response: Response) -> bool {
        let waiter = {
            let mut pending = self.pending.lock();
            let pos = match response.id {
                Some(id) => pending.iter().position(|p| p.id == id),
                None => pending.iter().position(|p| p.action == response.action),
            };
            pos.map(|i| pending.remove(i))
        };
        match waiter {
            Some(p) => {
                let _ = p.tx.send(response);
                true
            }
            None => false,
        }
    }

    fn forget(&self, id: u64) {
        self.pending.lock().retain(|p| p.id != id);
    }

    /// Fail every request issued on `generation` (their senders are dropped)
    fn fail_generation(&self, generation: u64) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|p| p.generation != generation);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(generation, dropped, "pending_requests_failed");
        }
    }

    fn teardown(&self, generation: u64) {
        let mut conn = self.connection.lock();
        if conn.as_ref().map(|c| c.generation) == Some(generation) {
            *conn = None;
        }
        drop(conn);
        self.fail_generation(generation);
    }
}

/// WebSocket implementation of [`Transport`]
pub struct WsTransport {
    config: TransportConfig,
    next_id: AtomicU64,
    generation: AtomicU64,
    shared: Arc<Shared>,
}

impl WsTransport {
    /// Connect to the backend
    pub async fn connect(config: TransportConfig) -> Result<Self, TransportError> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Self {
            config,
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            shared: Arc::new(Shared {
                pending: Mutex::new(Vec::new()),
                events,
                connection: Mutex::new(None),
            }),
        };
        transport.open().await?;
        Ok(transport)
    }

    /// Receiver for pushed opponent detections
    pub fn subscribe(&self) -> broadcast::Receiver<Detection> {
        self.shared.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .connection
            .lock()
            .as_ref()
            .map_or(false, |c| !c.reader.is_finished())
    }

    async fn open(&self) -> Result<(), TransportError> {
        let url = self.config.url.as_str();
        info!(url, "transport_connecting");

        let (ws_stream, resp) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!(url, generation, status = %resp.status(), "transport_connected");

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    debug!(error = %e, "transport_write_failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let shared = self.shared.clone();
        let pong_tx = outbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let now_ms = chrono::Utc::now().timestamp_millis() as f64;
                        match parse_inbound(&text, now_ms) {
                            Inbound::Response(resp) => {
                                let action = resp.action.clone();
                                if !shared.dispatch(resp) {
                                    debug!(action = %action, "unsolicited_response_dropped");
                                }
                            }
                            Inbound::Detection(detection) => {
                                debug!(
                                    identifier = %detection.identifier,
                                    timestamp_ms = detection.timestamp_ms,
                                    "detection_event"
                                );
                                // no subscribers is fine
                                let _ = shared.events.send(detection);
                            }
                            Inbound::Ignored => {}
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "transport_close_frame");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "transport_read_failed");
                        break;
                    }
                }
            }
            warn!(generation, "transport_disconnected");
            shared.teardown(generation);
        });

        let previous = self.shared.connection.lock().replace(Connection {
            generation,
            outbound,
            reader,
            writer,
        });
        if let Some(old) = previous {
            old.reader.abort();
            old.writer.abort();
            self.shared.fail_generation(old.generation);
        }
        Ok(())
    }

    fn close_current(&self) {
        let current = self.shared.connection.lock().take();
        if let Some(conn) = current {
            let _ = conn.outbound.send(Message::Close(None));
            conn.reader.abort();
            self.shared.fail_generation(conn.generation);
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(conn) = self.shared.connection.lock().take() {
            conn.reader.abort();
            conn.writer.abort();
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        let action = request.action_name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = request.to_frame(id)?;

        let (outbound, generation) = {
            let conn = self.shared.connection.lock();
            match conn.as_ref() {
                Some(c) => (c.outbound.clone(), c.generation),
                None => return Err(TransportError::Closed),
            }
        };

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().push(Pending {
            id,
            generation,
            action,
            tx,
        });

        if outbound.send(Message::Text(frame)).is_err() {
            self.shared.forget(id);
            return Err(TransportError::Send("writer task gone".to_string()));
        }

        let deadline =
            self.config.request_timeout + Duration::from_millis(request.remote_duration_ms());

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(resp)) => resp.into_result(),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.shared.forget(id);
                warn!(action, id, deadline_ms = deadline.as_millis() as u64, "transport_request_timeout");
                Err(TransportError::Timeout { action })
            }
        }
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.close_current();
        self.open().await
    }
}
