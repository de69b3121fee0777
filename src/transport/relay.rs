//! Relay server
//!
//! Accepts WebSocket sessions from endpoints, routes `Send` frames to the
//! addressed endpoint and keeps a FIFO mailbox for endpoints that are not
//! connected. It also holds the blobs endpoints put, so one relay is enough
//! to connect two machines. Blob memory is bounded: past the configured
//! capacity the oldest blobs are dropped.

use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::protocol::{decode_data, ErrorCode, Frame, MAX_BLOB_SIZE, PROTOCOL_VERSION};
use super::{Result, TransportError};

/// Blob memory a relay keeps by default
pub const DEFAULT_BLOB_CAPACITY: usize = 512 * 1024 * 1024;

struct Session {
    id: Uuid,
    tx: mpsc::UnboundedSender<Frame>,
    kick: Arc<Notify>,
}

#[derive(Default)]
struct Router {
    sessions: HashMap<String, Session>,
    mailboxes: HashMap<String, VecDeque<Frame>>,
}

/// Blobs by key, oldest dropped first once `capacity` bytes are exceeded
struct BlobMap {
    blobs: HashMap<String, Vec<u8>>,
    order: VecDeque<String>,
    total: usize,
    capacity: usize,
}

impl BlobMap {
    fn new(capacity: usize) -> Self {
        Self {
            blobs: HashMap::new(),
            order: VecDeque::new(),
            total: 0,
            capacity,
        }
    }

    /// Store a blob and return the keys evicted to make room
    ///
    /// The newest blob is always kept, even when it alone exceeds capacity.
    fn insert(&mut self, key: String, data: Vec<u8>) -> Vec<String> {
        self.remove(&key);
        self.total = self.total.saturating_add(data.len());
        self.order.push_back(key.clone());
        self.blobs.insert(key, data);

        let mut evicted = Vec::new();
        while self.total > self.capacity && self.order.len() > 1 {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(data) = self.blobs.remove(&oldest) {
                self.total = self.total.saturating_sub(data.len());
            }
            evicted.push(oldest);
        }
        evicted
    }

    fn remove(&mut self, key: &str) {
        if let Some(data) = self.blobs.remove(key) {
            self.total = self.total.saturating_sub(data.len());
            self.order.retain(|k| k != key);
        }
    }

    fn get(&self, key: &str) -> Option<&Vec<u8>> {
        self.blobs.get(key)
    }
}

/// A `PutBlob` run being received on one connection
struct Upload {
    key: String,
    data: Vec<u8>,
    rejected: bool,
}

struct RelayState {
    router: Mutex<Router>,
    blobs: RwLock<BlobMap>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(DEFAULT_BLOB_CAPACITY)
    }
}

impl RelayState {
    fn new(blob_capacity: usize) -> Self {
        Self {
            router: Mutex::new(Router::default()),
            blobs: RwLock::new(BlobMap::new(blob_capacity)),
        }
    }

    fn router(&self) -> std::sync::MutexGuard<'_, Router> {
        match self.router.lock() {
            Ok(router) => router,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a session and hand it everything queued for its endpoint
    fn attach(
        &self,
        endpoint: &str,
        id: Uuid,
        tx: mpsc::UnboundedSender<Frame>,
        kick: Arc<Notify>,
    ) {
        let mut router = self.router();
        let queued = router.mailboxes.remove(endpoint).unwrap_or_default();

        let _ = tx.send(Frame::Welcome {
            queued: queued.len(),
        });
        for frame in queued {
            let _ = tx.send(frame);
        }

        if let Some(previous) = router
            .sessions
            .insert(endpoint.to_string(), Session { id, tx, kick })
        {
            info!("Endpoint {} reconnected, replacing session {}", endpoint, previous.id);
            previous.kick.notify_one();
        }
    }

    /// Close the endpoint's session; false when it is not connected
    fn kick(&self, endpoint: &str) -> bool {
        match self.router().sessions.remove(endpoint) {
            Some(session) => {
                info!("Disconnecting endpoint {}", endpoint);
                session.kick.notify_one();
                true
            }
            None => false,
        }
    }

    fn detach(&self, endpoint: &str, id: Uuid) {
        let mut router = self.router();
        if router.sessions.get(endpoint).map(|s| s.id) == Some(id) {
            router.sessions.remove(endpoint);
        }
    }

    /// Deliver now if the endpoint is connected, queue otherwise
    fn route(&self, from: &str, to: &str, payload: String) {
        let frame = Frame::Deliver {
            from: from.to_string(),
            payload,
        };

        let mut router = self.router();
        let undelivered = match router.sessions.get(to) {
            Some(session) => match session.tx.send(frame) {
                Ok(()) => None,
                Err(mpsc::error::SendError(frame)) => Some(frame),
            },
            None => Some(frame),
        };

        if let Some(frame) = undelivered {
            debug!("Queueing message for offline endpoint {}", to);
            router.mailboxes.entry(to.to_string()).or_default().push_back(frame);
        }
    }

    fn queued(&self, endpoint: &str) -> usize {
        self.router()
            .mailboxes
            .get(endpoint)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    fn put_blob(&self, key: String, data: Vec<u8>) {
        let evicted = match self.blobs.write() {
            Ok(mut blobs) => blobs.insert(key, data),
            Err(poisoned) => poisoned.into_inner().insert(key, data),
        };
        for key in evicted {
            debug!("Evicted blob {} to stay within capacity", key);
        }
    }

    fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.read().ok().and_then(|blobs| blobs.get(key).cloned())
    }

    fn blob_bytes(&self) -> usize {
        self.blobs.read().map(|blobs| blobs.total).unwrap_or(0)
    }
}

/// WebSocket relay between endpoints
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

/// Control handle on a running relay
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<RelayState>,
}

impl RelayHandle {
    /// Messages waiting for an offline endpoint
    pub fn queued(&self, endpoint: &str) -> usize {
        self.state.queued(endpoint)
    }

    /// Bytes of blob data currently held
    pub fn blob_bytes(&self) -> usize {
        self.state.blob_bytes()
    }

    /// Drop the endpoint's session; it may reconnect
    pub fn disconnect(&self, endpoint: &str) -> bool {
        self.state.kick(endpoint)
    }
}

impl RelayServer {
    /// Bind the relay to `addr`
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(RelayState::default()),
        })
    }

    /// Keep at most `bytes` of blob data, dropping the oldest beyond that
    pub fn with_blob_capacity(mut self, bytes: usize) -> Self {
        self.state = Arc::new(RelayState::new(bytes));
        self
    }

    /// Address the relay is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accept sessions until the listener fails
    pub async fn run(self) -> Result<()> {
        info!("Relay listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream, peer_addr).await {
                    warn!("Session from {} ended with error: {}", peer_addr, e);
                }
            });
        }
    }
}

#[instrument(skip(state, stream))]
async fn handle_connection(
    state: Arc<RelayState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| TransportError::WebSocket {
            message: format!("handshake with {} failed: {}", peer_addr, e),
        })?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let endpoint = match next_frame(&mut ws_stream).await? {
        Some(Frame::Hello { endpoint, version }) => {
            if version != PROTOCOL_VERSION {
                let reply = Frame::error(
                    None,
                    ErrorCode::VersionMismatch,
                    format!("relay speaks version {}", PROTOCOL_VERSION),
                );
                let _ = ws_sink.send(WsMessage::Text(reply.to_json()?.into())).await;
                return Err(TransportError::VersionMismatch {
                    expected: PROTOCOL_VERSION.to_string(),
                    actual: version,
                });
            }
            endpoint
        }
        Some(other) => {
            let reply = Frame::error(
                None,
                ErrorCode::BadRequest,
                format!("expected hello, got {}", other.name()),
            );
            let _ = ws_sink.send(WsMessage::Text(reply.to_json()?.into())).await;
            return Ok(());
        }
        None => return Ok(()),
    };

    let session_id = Uuid::new_v4();
    let kick = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    state.attach(&endpoint, session_id, tx.clone(), Arc::clone(&kick));
    info!("Endpoint {} connected from {}", endpoint, peer_addr);

    // Outbound frame task
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize {} frame: {}", frame.name(), e);
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(WsMessage::Text(text.into())).await {
                debug!("Failed to write to session: {}", e);
                break;
            }
        }
        let _ = ws_sink.send(WsMessage::Close(None)).await;
    });

    let mut uploads = HashMap::new();
    let outcome = loop {
        let next = tokio::select! {
            _ = kick.notified() => break Ok(()),
            next = next_frame(&mut ws_stream) => next,
        };
        match next {
            Ok(Some(frame)) => {
                let replies = handle_frame(&state, &endpoint, &mut uploads, frame);
                if replies.into_iter().any(|reply| tx.send(reply).is_err()) {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    state.detach(&endpoint, session_id);
    drop(tx);
    let _ = writer.await;
    info!("Endpoint {} disconnected", endpoint);
    outcome
}

fn handle_frame(
    state: &RelayState,
    endpoint: &str,
    uploads: &mut HashMap<Uuid, Upload>,
    frame: Frame,
) -> Vec<Frame> {
    match frame {
        Frame::Send {
            request_id,
            to,
            payload,
        } => {
            debug!("{} -> {}: {} bytes", endpoint, to, payload.len());
            state.route(endpoint, &to, payload);
            vec![Frame::Ack { request_id }]
        }
        Frame::PutBlob {
            request_id,
            key,
            data,
            is_final,
        } => {
            let upload = uploads.entry(request_id).or_insert_with(|| Upload {
                key,
                data: Vec::new(),
                rejected: false,
            });

            let mut replies = Vec::new();
            if !upload.rejected {
                match decode_data(&data) {
                    Ok(chunk) if upload.data.len() + chunk.len() > MAX_BLOB_SIZE => {
                        upload.rejected = true;
                        replies.push(Frame::error(
                            Some(request_id),
                            ErrorCode::TooLarge,
                            format!("blob {} exceeds {} bytes", upload.key, MAX_BLOB_SIZE),
                        ));
                    }
                    Ok(chunk) => upload.data.extend_from_slice(&chunk),
                    Err(e) => {
                        upload.rejected = true;
                        replies.push(Frame::error(
                            Some(request_id),
                            ErrorCode::BadRequest,
                            format!("invalid blob data: {}", e),
                        ));
                    }
                }
            }

            if is_final {
                if let Some(upload) = uploads.remove(&request_id) {
                    if !upload.rejected {
                        debug!(
                            "{} stored blob {} ({} bytes)",
                            endpoint,
                            upload.key,
                            upload.data.len()
                        );
                        state.put_blob(upload.key, upload.data);
                        replies.push(Frame::Ack { request_id });
                    }
                }
            }
            replies
        }
        Frame::GetBlob { request_id, key } => match state.get_blob(&key) {
            Some(bytes) => Frame::blob(request_id, &bytes),
            None => vec![Frame::error(
                Some(request_id),
                ErrorCode::NotFound,
                format!("no blob named {}", key),
            )],
        },
        other => {
            warn!("Unexpected {} frame from {}", other.name(), endpoint);
            vec![Frame::error(
                other.reply_id(),
                ErrorCode::BadRequest,
                format!("unexpected {} frame", other.name()),
            )]
        }
    }
}

/// Next protocol frame from the socket; `None` when the peer closed
pub(crate) async fn next_frame<S>(ws_stream: &mut S) -> Result<Option<Frame>>
where
    S: futures_util::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => match Frame::from_json(text.as_str()) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => warn!("Ignoring malformed frame: {}", e),
            },
            Ok(WsMessage::Binary(data)) => {
                warn!("Ignoring unexpected binary message of {} bytes", data.len());
            }
            Ok(WsMessage::Close(_)) => return Ok(None),
            Ok(_) => {}
            Err(e) => {
                return Err(TransportError::WebSocket {
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::BLOB_CHUNK_SIZE;

    #[test]
    fn test_route_queues_for_offline_endpoint() {
        let state = RelayState::default();
        state.route("a", "b", "hello".to_string());
        state.route("a", "b", "again".to_string());
        assert_eq!(state.queued("b"), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.attach("b", Uuid::new_v4(), tx, Arc::new(Notify::new()));
        assert_eq!(rx.try_recv().unwrap(), Frame::Welcome { queued: 2 });
        assert_eq!(
            rx.try_recv().unwrap(),
            Frame::Deliver {
                from: "a".into(),
                payload: "hello".into()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Frame::Deliver {
                from: "a".into(),
                payload: "again".into()
            }
        );
        assert_eq!(state.queued("b"), 0);
    }

    #[test]
    fn test_route_to_dead_session_requeues() {
        let state = RelayState::default();
        let (tx, rx) = mpsc::unbounded_channel();
        state.attach("b", Uuid::new_v4(), tx, Arc::new(Notify::new()));
        drop(rx);

        state.route("a", "b", "kept".to_string());
        assert_eq!(state.queued("b"), 1);
    }

    #[test]
    fn test_stale_detach_keeps_new_session() {
        let state = RelayState::default();
        let old = Uuid::new_v4();
        let (tx_old, _rx_old) = mpsc::unbounded_channel();
        let old_kick = Arc::new(Notify::new());
        state.attach("b", old, tx_old, Arc::clone(&old_kick));
        let (tx_new, mut rx_new) = mpsc::unbounded_channel();
        state.attach("b", Uuid::new_v4(), tx_new, Arc::new(Notify::new()));

        // The replaced session was told to close
        let notified = old_kick.notified();
        tokio::pin!(notified);
        assert!(futures_util::FutureExt::now_or_never(notified.as_mut()).is_some());

        state.detach("b", old);
        state.route("a", "b", "to new".to_string());
        let _welcome = rx_new.try_recv().unwrap();
        assert!(matches!(rx_new.try_recv().unwrap(), Frame::Deliver { .. }));
    }

    fn get(state: &RelayState, key: &str) -> Vec<Frame> {
        let request_id = Uuid::new_v4();
        handle_frame(
            state,
            "b",
            &mut HashMap::new(),
            Frame::GetBlob {
                request_id,
                key: key.into(),
            },
        )
    }

    #[test]
    fn test_blob_frames() {
        let state = RelayState::default();
        let mut uploads = HashMap::new();
        let id = Uuid::new_v4();
        let replies: Vec<Frame> = Frame::put_blob(id, "image-a.bmp", b"BM")
            .into_iter()
            .flat_map(|frame| handle_frame(&state, "a", &mut uploads, frame))
            .collect();
        assert_eq!(replies, vec![Frame::Ack { request_id: id }]);

        let reply = get(&state, "image-a.bmp");
        assert!(matches!(
            reply.as_slice(),
            [Frame::Blob { data, is_final: true, .. }] if decode_data(data).unwrap() == b"BM"
        ));

        let reply = get(&state, "missing");
        assert!(matches!(
            reply.as_slice(),
            [Frame::Error {
                code: ErrorCode::NotFound,
                ..
            }]
        ));
    }

    #[test]
    fn test_chunked_upload_acks_once_complete() {
        let state = RelayState::default();
        let mut uploads = HashMap::new();
        let id = Uuid::new_v4();
        let data: Vec<u8> = (0..BLOB_CHUNK_SIZE * 2 + 3).map(|i| (i % 7) as u8).collect();

        let frames = Frame::put_blob(id, "big.bin", &data);
        assert_eq!(frames.len(), 3);
        let last = frames.len() - 1;
        for (index, frame) in frames.into_iter().enumerate() {
            let replies = handle_frame(&state, "a", &mut uploads, frame);
            if index == last {
                assert_eq!(replies, vec![Frame::Ack { request_id: id }]);
            } else {
                assert!(replies.is_empty());
                assert_eq!(state.get_blob("big.bin"), None);
            }
        }
        assert!(uploads.is_empty());
        assert_eq!(state.get_blob("big.bin"), Some(data));
    }

    #[test]
    fn test_bad_chunk_rejects_upload_once() {
        let state = RelayState::default();
        let mut uploads = HashMap::new();
        let id = Uuid::new_v4();
        let chunk = |data: &str, is_final| Frame::PutBlob {
            request_id: id,
            key: "x".into(),
            data: data.into(),
            is_final,
        };

        let replies = handle_frame(&state, "a", &mut uploads, chunk("!!", false));
        assert!(matches!(
            replies.as_slice(),
            [Frame::Error {
                code: ErrorCode::BadRequest,
                ..
            }]
        ));
        assert!(handle_frame(&state, "a", &mut uploads, chunk("AP8K", true)).is_empty());
        assert!(uploads.is_empty());
        assert_eq!(state.get_blob("x"), None);
    }

    #[test]
    fn test_blobs_evicted_oldest_first() {
        let state = RelayState::new(10);
        state.put_blob("one".into(), vec![1; 4]);
        state.put_blob("two".into(), vec![2; 4]);
        assert_eq!(state.blob_bytes(), 8);

        state.put_blob("three".into(), vec![3; 4]);
        assert_eq!(state.get_blob("one"), None);
        assert_eq!(state.get_blob("two"), Some(vec![2; 4]));
        assert_eq!(state.get_blob("three"), Some(vec![3; 4]));
        assert_eq!(state.blob_bytes(), 8);

        // Overwriting counts only the new size and refreshes the age
        state.put_blob("two".into(), vec![2; 2]);
        assert_eq!(state.blob_bytes(), 6);
        state.put_blob("four".into(), vec![4; 4]);
        assert_eq!(state.get_blob("three"), None);
        assert_eq!(state.get_blob("two"), Some(vec![2; 2]));
        assert_eq!(state.blob_bytes(), 6);
    }

    #[test]
    fn test_oversized_blob_kept_alone() {
        let state = RelayState::new(10);
        state.put_blob("small".into(), vec![0; 4]);
        state.put_blob("huge".into(), vec![0; 32]);
        assert_eq!(state.get_blob("small"), None);
        assert_eq!(state.get_blob("huge").map(|b| b.len()), Some(32));
        assert_eq!(state.blob_bytes(), 32);
    }

    #[test]
    fn test_kick_removes_session() {
        let state = RelayState::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.attach("b", Uuid::new_v4(), tx, Arc::new(Notify::new()));

        assert!(state.kick("b"));
        assert!(!state.kick("b"));
        state.route("a", "b", "later".to_string());
        assert_eq!(state.queued("b"), 1);
    }
}
