//! Persistent websocket connection shared by the tool clients.
//!
//! [`ControlChannel`] owns the socket and does request/response correlation;
//! the protocol specifics (handshake, frame shapes, error mapping) live in the
//! tool wrappers that hold one.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::Instrument;

use crate::process_controller::ProcessController;

const CLOSE_FLUSH_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The tool answered, but reported that the request failed.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ChannelError {
    /// Errors after which the connection can no longer be trusted.
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            ChannelError::Closed | ChannelError::NotConnected | ChannelError::Protocol(_)
        )
    }
}

/// The capability set every remotely controlled tool client offers.
#[allow(async_fn_in_trait)]
pub trait ControlClient {
    fn name(&self) -> &'static str;

    /// Cheap check that does not open a connection.
    fn is_reachable(&self) -> bool;

    /// Opens the connection and authenticates. Never retries.
    async fn connect(&mut self, timeout: Duration) -> Result<(), ChannelError>;

    async fn send_command(
        &self,
        command: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, ChannelError>;

    /// Safe to call on a closed or never-opened client.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Pulls the correlation id out of an incoming frame, if it is a response.
pub type Correlate = fn(&Value) -> Option<String>;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

pub struct ControlChannel {
    tx: mpsc::Sender<WsMessage>,
    pending: Pending,
    unsolicited: mpsc::Receiver<Value>,
    next_id: AtomicU64,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    closed: bool,
}

impl ControlChannel {
    pub async fn open(url: &str, timeout: Duration, correlate: Correlate) -> Result<Self, ChannelError> {
        let (ws, _) = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(map_connect_error(e)),
            Err(_) => return Err(ChannelError::Timeout(timeout)),
        };
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::channel::<WsMessage>(64);
        let (event_tx, event_rx) = mpsc::channel::<Value>(64);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let span = tracing::debug_span!("control_channel", url = %url);

        let writer = tokio::spawn(
            async move {
                while let Some(msg) = rx.recv().await {
                    let closing = matches!(msg, WsMessage::Close(_));
                    if sink.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                let _ = sink.close().await;
            }
            .instrument(span.clone()),
        );

        let reader = tokio::spawn({
            let pending = pending.clone();
            async move {
                while let Some(msg) = stream.next().await {
                    let Ok(msg) = msg else { break };
                    match msg {
                        WsMessage::Text(text) => {
                            let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                                tracing::debug!("dropping non-json frame");
                                continue;
                            };
                            if let Some(id) = correlate(&frame) {
                                let responder = pending.lock().await.remove(&id);
                                if let Some(responder) = responder {
                                    let _ = responder.send(frame);
                                    continue;
                                }
                            }
                            if event_tx.try_send(frame).is_err() {
                                tracing::debug!("unsolicited queue full; dropping frame");
                            }
                        }
                        WsMessage::Close(_) => break,
                        _ => {}
                    }
                }
                // Wake every waiter with a closed error.
                pending.lock().await.clear();
                tracing::debug!("control channel reader finished");
            }
            .instrument(span)
        });

        Ok(Self {
            tx,
            pending,
            unsolicited: event_rx,
            next_id: AtomicU64::new(1),
            writer,
            reader,
            closed: false,
        })
    }

    pub fn next_request_id(&self) -> String {
        format!("loadout-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_open(&self) -> bool {
        !self.closed && !self.reader.is_finished() && !self.tx.is_closed()
    }

    /// Sends a frame that expects no correlated answer.
    pub async fn send(&self, frame: &Value) -> Result<(), ChannelError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| ChannelError::Protocol(format!("failed to encode frame: {e}")))?;
        self.tx
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Sends `frame` and waits for the response carrying `id`.
    ///
    /// A timeout leaves the connection open.
    pub async fn request(&self, id: &str, frame: &Value, timeout: Duration) -> Result<Value, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }

        let (tx, rx) = oneshot::channel::<Value>();
        self.pending.lock().await.insert(id.to_string(), tx);

        if let Err(e) = self.send(frame).await {
            let _ = self.pending.lock().await.remove(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                let _ = self.pending.lock().await.remove(id);
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Next frame that was not a response to a pending request.
    pub async fn next_unsolicited(&mut self, timeout: Duration) -> Result<Value, ChannelError> {
        match tokio::time::timeout(timeout, self.unsolicited.recv()).await {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(WsMessage::Close(None)).await;
        let _ = tokio::time::timeout(CLOSE_FLUSH_WINDOW, &mut self.writer).await;
        self.reader.abort();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

fn map_connect_error(err: tungstenite::Error) -> ChannelError {
    match err {
        tungstenite::Error::Io(e) => ChannelError::Refused(e.to_string()),
        tungstenite::Error::Http(resp) => {
            ChannelError::Refused(format!("handshake rejected with HTTP {}", resp.status()))
        }
        other => ChannelError::Protocol(other.to_string()),
    }
}

/// Reachability check shared by the tool clients: with a configured process
/// name the tool must be running, otherwise a connect is always worth trying.
pub(crate) fn tool_process_running(controller: &ProcessController, process_name: Option<&str>) -> bool {
    match process_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => controller.find_running(name).is_some(),
        None => true,
    }
}
