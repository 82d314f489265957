//! WebSocket connection to the realtime service.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::config::Config;
use parley_core::error::{ParleyError, Result};
use parley_core::protocol::{ClientEvent, ServerEvent};
use parley_core::types::EpochGate;

use crate::{InboundEvent, RealtimeTransport, TransportEvent};

/// Time allowed for the close handshake before the task is abandoned.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Where and how to connect.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Full WebSocket URL including the `model` query parameter.
    pub url: String,
    pub api_key: String,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl ConnectOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            ParleyError::Config("no API key configured for the realtime service".into())
        })?;
        Ok(Self {
            url: config.realtime_url(),
            api_key,
        })
    }

    fn request(&self) -> Result<Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ParleyError::Transport(format!("invalid URL {}: {e}", self.url)))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| ParleyError::Transport(format!("invalid API key header: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", auth);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        Ok(request)
    }
}

/// Realtime client over a single WebSocket connection.
///
/// Connecting happens in a background task: [`RealtimeClient::connect`]
/// returns immediately and reports [`TransportEvent::Opened`] or
/// [`TransportEvent::Failed`] on the inbound channel. Events queued before
/// the handshake completes are sent right after it.
pub struct RealtimeClient {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// Spawn the connection task. Must be called from within a tokio runtime.
    pub fn connect(
        options: ConnectOptions,
        gate: EpochGate,
    ) -> (Self, mpsc::UnboundedReceiver<InboundEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let reader = Reader {
            gate,
            tx: inbound_tx,
        };
        let task = tokio::spawn(run_connection(options, outbound_rx, reader, cancel.clone()));

        let client = Self {
            outbound: outbound_tx,
            cancel,
            task: Mutex::new(Some(task)),
        };
        (client, inbound_rx)
    }
}

#[async_trait]
impl RealtimeTransport for RealtimeClient {
    fn send(&self, event: ClientEvent) -> Result<()> {
        self.outbound
            .send(event)
            .map_err(|e| ParleyError::Transport(format!("connection closed, dropped {}", e.0.kind())))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                warn!("Realtime connection did not close in time");
            }
        }
        Ok(())
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Emits inbound events stamped with the current epoch.
struct Reader {
    gate: EpochGate,
    tx: mpsc::UnboundedSender<InboundEvent>,
}

impl Reader {
    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(InboundEvent {
            epoch: self.gate.current(),
            event,
        });
    }
}

async fn run_connection(
    options: ConnectOptions,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
    reader: Reader,
    cancel: CancellationToken,
) {
    let request = match options.request() {
        Ok(r) => r,
        Err(e) => {
            reader.emit(TransportEvent::Failed(e.to_string()));
            return;
        }
    };

    info!(url = %options.url, "Connecting to realtime service");
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio_tungstenite::connect_async(request) => result,
    };
    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(%e, "Realtime connection failed");
            reader.emit(TransportEvent::Failed(format!("connect failed: {e}")));
            return;
        }
    };
    info!("Connected to realtime service");
    reader.emit(TransportEvent::Opened);

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                debug!("Realtime connection closed by client");
                break;
            }
            outgoing = outbound.recv() => {
                let Some(event) = outgoing else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let event_id = format!("evt_{}", uuid::Uuid::new_v4().simple());
                let frame = match event.to_frame(&event_id) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(%e, kind = event.kind(), "Failed to encode client event");
                        continue;
                    }
                };
                debug!(kind = event.kind(), %event_id, "Sending client event");
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    warn!(%e, "Realtime send failed");
                    reader.emit(TransportEvent::Failed(format!("send failed: {e}")));
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match ServerEvent::parse(text.as_str()) {
                    Ok(event) => reader.emit(TransportEvent::Server(event)),
                    Err(e) => reader.emit(TransportEvent::Malformed {
                        raw: text.as_str().to_string(),
                        error: e.to_string(),
                    }),
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        warn!(%e, "Failed to answer ping");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty());
                    info!(reason = ?reason, "Realtime connection closed by server");
                    reader.emit(TransportEvent::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%e, "Realtime read failed");
                    reader.emit(TransportEvent::Failed(format!("read failed: {e}")));
                    break;
                }
                None => {
                    reader.emit(TransportEvent::Closed { reason: None });
                    break;
                }
            },
        }
    }
}
