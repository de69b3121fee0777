//! WebSocket client for the relay
//!
//! [`RelayClient`] is both the endpoint's [`MessageChannel`] and, when the
//! relay holds blobs, its [`ContentStore`]. A supervisor task owns the socket,
//! reconnects with backoff when it drops, and routes replies back to the
//! request that is waiting for them. Chunked `Blob` replies are joined
//! before the waiting request sees them.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::protocol::{decode_data, ErrorCode, Frame, MAX_BLOB_SIZE};
use super::reconnect::{Backoff, ReconnectionConfig};
use super::relay::next_frame;
use super::{MessageChannel, Result, TransportError};
use crate::store::{ContentStore, StoreError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Reply>>>>;
type Outbound = Arc<RwLock<Option<mpsc::UnboundedSender<Frame>>>>;

/// Completed answer to a request
#[derive(Debug, PartialEq)]
enum Reply {
    Frame(Frame),
    Blob(Vec<u8>),
}

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// WebSocket URL of the relay
    pub url: String,

    /// Endpoint id to register as
    pub endpoint: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Limit on waiting for a reply; `None` waits forever
    pub request_timeout: Option<Duration>,

    /// Reconnection policy after the connection drops
    pub reconnect: ReconnectionConfig,
}

impl RelayClientConfig {
    pub fn new(url: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
            reconnect: ReconnectionConfig::default(),
        }
    }
}

/// Connection to the relay
pub struct RelayClient {
    config: RelayClientConfig,
    outbound: Outbound,
    pending: Pending,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    supervisor: JoinHandle<()>,
}

impl RelayClient {
    /// Connect and register with the relay
    ///
    /// The first connection must succeed; later drops are retried in the
    /// background according to `config.reconnect`.
    pub async fn connect(config: RelayClientConfig) -> Result<Self> {
        let ws = open(&config).await?;

        let outbound: Outbound = Arc::new(RwLock::new(None));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        // Requests made as soon as connect returns must find a sender
        let outgoing = install_outbound(&outbound);
        let supervisor = tokio::spawn(supervise(
            config.clone(),
            (ws, outgoing),
            Arc::clone(&outbound),
            Arc::clone(&pending),
            inbox_tx,
        ));

        Ok(Self {
            config,
            outbound,
            pending,
            inbox: tokio::sync::Mutex::new(inbox_rx),
            supervisor,
        })
    }

    /// Endpoint id this client registered as
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Whether a relay session is currently up
    pub fn is_connected(&self) -> bool {
        self.outbound
            .read()
            .map(|outbound| outbound.is_some())
            .unwrap_or(false)
    }

    fn forget(&self, request_id: &Uuid) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(request_id);
        }
    }

    async fn request(&self, build: impl FnOnce(Uuid) -> Vec<Frame>) -> Result<Reply> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| TransportError::Connection {
                message: "request table poisoned".to_string(),
            })?
            .insert(request_id, tx);

        let sender = self.outbound.read().ok().and_then(|outbound| outbound.clone());
        let Some(sender) = sender else {
            self.forget(&request_id);
            return Err(TransportError::Connection {
                message: format!("not connected to relay at {}", self.config.url),
            });
        };

        for frame in build(request_id) {
            if sender.send(frame).is_err() {
                self.forget(&request_id);
                return Err(TransportError::ConnectionClosed);
            }
        }

        let reply = match self.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.forget(&request_id);
                    return Err(TransportError::Timeout);
                }
            },
            None => rx.await,
        };

        match reply.map_err(|_| TransportError::ConnectionClosed)? {
            Reply::Frame(Frame::Error { code, message, .. }) => {
                Err(TransportError::Rejected { code, message })
            }
            reply => Ok(reply),
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl MessageChannel for RelayClient {
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    async fn send(&self, destination: &str, payload: &str) -> Result<()> {
        let to = destination.to_string();
        let payload = payload.to_string();
        match self
            .request(move |request_id| {
                vec![Frame::Send {
                    request_id,
                    to,
                    payload,
                }]
            })
            .await?
        {
            Reply::Frame(Frame::Ack { .. }) => Ok(()),
            other => Err(TransportError::Connection {
                message: format!("unexpected reply to send: {}", other.name()),
            }),
        }
    }

    async fn receive(&self) -> Result<Option<String>> {
        Ok(self.inbox.lock().await.recv().await)
    }
}

impl From<TransportError> for StoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => StoreError::Timeout,
            other => StoreError::backend(other.to_string()),
        }
    }
}

#[async_trait]
impl ContentStore for RelayClient {
    async fn put(&self, key: &str, data: Vec<u8>) -> std::result::Result<(), StoreError> {
        let size = data.len();
        let too_large = || StoreError::TooLarge {
            key: key.to_string(),
            size,
            limit: MAX_BLOB_SIZE,
        };
        if size > MAX_BLOB_SIZE {
            return Err(too_large());
        }

        debug!("Uploading {} ({} bytes)", key, size);
        let owned = key.to_string();
        match self
            .request(move |request_id| Frame::put_blob(request_id, &owned, &data))
            .await
        {
            Ok(Reply::Frame(Frame::Ack { .. })) => Ok(()),
            Ok(other) => Err(StoreError::backend(format!(
                "unexpected reply to put: {}",
                other.name()
            ))),
            Err(TransportError::Rejected {
                code: ErrorCode::TooLarge,
                ..
            }) => Err(too_large()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> std::result::Result<Vec<u8>, StoreError> {
        let owned = key.to_string();
        let reply = self
            .request(move |request_id| {
                vec![Frame::GetBlob {
                    request_id,
                    key: owned,
                }]
            })
            .await;

        match reply {
            Ok(Reply::Blob(data)) => Ok(data),
            Ok(other) => Err(StoreError::backend(format!(
                "unexpected reply to get: {}",
                other.name()
            ))),
            Err(TransportError::Rejected {
                code: ErrorCode::NotFound,
                ..
            }) => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Open a socket and complete the hello/welcome exchange
async fn open(config: &RelayClientConfig) -> Result<WsStream> {
    info!("Connecting to relay at {}", config.url);

    let connect = connect_async(config.url.as_str());
    let (mut ws, _response) = tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::WebSocket {
            message: format!("failed to connect to {}: {}", config.url, e),
        })?;

    let hello = Frame::hello(&config.endpoint).to_json()?;
    ws.send(WsMessage::Text(hello.into()))
        .await
        .map_err(|e| TransportError::WebSocket {
            message: e.to_string(),
        })?;

    match next_frame(&mut ws).await? {
        Some(Frame::Welcome { queued }) => {
            info!(
                "Registered with relay as {} ({} queued messages)",
                config.endpoint, queued
            );
            Ok(ws)
        }
        Some(Frame::Error { code, message, .. }) => {
            Err(TransportError::Rejected { code, message })
        }
        Some(other) => Err(TransportError::Connection {
            message: format!("expected welcome, got {}", other.name()),
        }),
        None => Err(TransportError::ConnectionClosed),
    }
}

/// Publish a fresh outbound sender and return its receiving end
fn install_outbound(outbound: &Outbound) -> mpsc::UnboundedReceiver<Frame> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(mut outbound) = outbound.write() {
        *outbound = Some(tx);
    }
    rx
}

async fn supervise(
    config: RelayClientConfig,
    first: (WsStream, mpsc::UnboundedReceiver<Frame>),
    outbound: Outbound,
    pending: Pending,
    inbox_tx: mpsc::UnboundedSender<String>,
) {
    let mut backoff = Backoff::new(config.reconnect.clone());
    let mut next = Some(first);

    loop {
        let (ws, outgoing) = match next.take() {
            Some(session) => session,
            None => match open(&config).await {
                Ok(ws) => (ws, install_outbound(&outbound)),
                Err(e) => {
                    warn!("Relay connection attempt {} failed: {}", backoff.attempts() + 1, e);
                    match backoff.next_delay() {
                        Some(delay) => {
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        None => {
                            error!("Giving up on relay at {}", config.url);
                            break;
                        }
                    }
                }
            },
        };
        backoff.reset();

        run_session(ws, outgoing, &pending, &inbox_tx).await;

        if let Ok(mut outbound) = outbound.write() {
            *outbound = None;
        }
        // Waiters see ConnectionClosed when their sender is dropped
        if let Ok(mut pending) = pending.lock() {
            pending.clear();
        }

        if inbox_tx.is_closed() {
            break;
        }
        warn!("Lost connection to relay, reconnecting");
        match backoff.next_delay() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => break,
        }
    }
}

async fn run_session(
    ws: WsStream,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    pending: &Pending,
    inbox_tx: &mpsc::UnboundedSender<String>,
) {
    let (mut ws_sink, mut ws_stream) = ws.split();

    let writer = async {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize {} frame: {}", frame.name(), e);
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(WsMessage::Text(text.into())).await {
                warn!("Failed to send to relay: {}", e);
                break;
            }
        }
    };

    let reader = async {
        let mut partial = HashMap::new();
        loop {
            match next_frame(&mut ws_stream).await {
                Ok(Some(frame)) => dispatch(frame, pending, &mut partial, inbox_tx),
                Ok(None) => {
                    info!("Relay closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("Relay connection error: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
}

fn dispatch(
    frame: Frame,
    pending: &Pending,
    partial: &mut HashMap<Uuid, Vec<u8>>,
    inbox_tx: &mpsc::UnboundedSender<String>,
) {
    match frame {
        Frame::Deliver { from, payload } => {
            debug!("Delivery from {}: {} bytes", from, payload.len());
            if inbox_tx.send(payload).is_err() {
                debug!("Inbox closed, dropping delivery");
            }
        }
        Frame::Blob {
            request_id,
            data,
            is_final,
        } => {
            let waiting = pending
                .lock()
                .map(|pending| pending.contains_key(&request_id))
                .unwrap_or(false);
            if !waiting {
                partial.remove(&request_id);
                debug!("No waiter for blob chunk {}", request_id);
                return;
            }

            let chunk = match decode_data(&data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    partial.remove(&request_id);
                    let failure = Frame::error(
                        Some(request_id),
                        ErrorCode::Internal,
                        format!("bad blob data: {}", e),
                    );
                    complete(pending, request_id, Reply::Frame(failure));
                    return;
                }
            };

            let buffer = partial.entry(request_id).or_default();
            if buffer.len() + chunk.len() > MAX_BLOB_SIZE {
                partial.remove(&request_id);
                let failure = Frame::error(
                    Some(request_id),
                    ErrorCode::TooLarge,
                    format!("blob exceeds {} bytes", MAX_BLOB_SIZE),
                );
                complete(pending, request_id, Reply::Frame(failure));
                return;
            }
            buffer.extend_from_slice(&chunk);

            if is_final {
                let data = partial.remove(&request_id).unwrap_or_default();
                complete(pending, request_id, Reply::Blob(data));
            }
        }
        reply => match reply.reply_id() {
            Some(request_id) => {
                partial.remove(&request_id);
                complete(pending, request_id, Reply::Frame(reply));
            }
            None => match reply {
                Frame::Error { code, message, .. } => {
                    warn!("Relay reported {:?}: {}", code, message)
                }
                other => debug!("Ignoring {} frame", other.name()),
            },
        },
    }
}

/// Hand `reply` to the request waiting on `request_id`
fn complete(pending: &Pending, request_id: Uuid, reply: Reply) {
    let waiter = pending
        .lock()
        .ok()
        .and_then(|mut pending| pending.remove(&request_id));
    match waiter {
        Some(waiter) => {
            let _ = waiter.send(reply);
        }
        None => debug!("No waiter for reply {}", request_id),
    }
}

impl Reply {
    fn name(&self) -> &'static str {
        match self {
            Reply::Frame(frame) => frame.name(),
            Reply::Blob(_) => "blob",
        }
    }
}
