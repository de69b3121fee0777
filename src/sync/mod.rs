//! Sync engine
//!
//! One engine runs per endpoint. Local clipboard changes are queued for a
//! publish worker that reads, encodes and sends the content to the peer.
//! Messages from the peer are decoded and written to the local clipboard
//! under the [`LoopGuard`], so the change notification our own write causes
//! is not sent back. Publish and apply never overlap.
//!
//! Every failure ends up at one boundary ([`SyncEngine::report`]): it is
//! logged with its [`ErrorKind`], recorded in [`SyncStatus`] and broadcast as
//! a [`SyncEvent::Failed`], and the engine carries on.

pub mod codec;
pub mod guard;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub use codec::Codec;
pub use guard::LoopGuard;

use crate::clipboard::{read_content, write_content, ClipboardError, ClipboardPort, ReadError};
use crate::config::Config;
use crate::content::{BlobKeys, ContentKind, EncodingError, WireFormat};
use crate::store::{ContentStore, StoreError};
use crate::transport::{MessageChannel, TransportError};

/// Errors at the engine boundary
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Clipboard access failed: {0}")]
    Clipboard(#[from] ClipboardError),

    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StoreError),

    #[error("Encoding failed: {0}")]
    Encoding(#[from] EncodingError),
}

impl From<ReadError> for SyncError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Clipboard(e) => SyncError::Clipboard(e),
            ReadError::Encoding(e) => SyncError::Encoding(e),
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Clipboard(_) => ErrorKind::ClipboardAccess,
            SyncError::Transport(_) => ErrorKind::Transport,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::Encoding(_) => ErrorKind::Encoding,
        }
    }
}

/// Class of a failure, as logged and reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ClipboardAccess,
    Transport,
    Storage,
    Encoding,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ClipboardAccess => write!(f, "clipboard_access"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Storage => write!(f, "storage"),
            ErrorKind::Encoding => write!(f, "encoding"),
        }
    }
}

/// What the engine is doing right now
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Publishing,
    Applying,
}

/// Direction of a sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Local change sent to the peer
    Publish,
    /// Peer message written to the local clipboard
    Apply,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Publish => write!(f, "publish"),
            Operation::Apply => write!(f, "apply"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub operation: Operation,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Counters and last failure of an engine
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub state: EngineState,
    /// Messages sent to the peer
    pub published: u64,
    /// Peer messages written to the clipboard
    pub applied: u64,
    /// Local notifications dropped by the loop guard
    pub dropped: u64,
    /// Local notifications folded into an already queued publish
    pub coalesced: u64,
    /// Publishes and applies that failed
    pub failed: u64,
    pub last_error: Option<LastError>,
}

/// Engine activity, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Published {
        kind: ContentKind,
    },
    Applied {
        kind: ContentKind,
    },
    /// A local change notification arrived inside the quiet period
    Suppressed,
    Failed {
        operation: Operation,
        kind: ErrorKind,
        message: String,
    },
}

/// Identity and tuning of one endpoint's engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub local_id: String,
    pub remote_id: String,
    /// How long local notifications stay suppressed after an apply
    pub quiet_period: Duration,
    pub wire_format: WireFormat,
    pub blob_keys: BlobKeys,
    /// Where fetched files are written
    pub scratch_dir: PathBuf,
}

impl EngineSettings {
    pub fn new(local_id: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            quiet_period: Duration::from_millis(500),
            wire_format: WireFormat::default(),
            blob_keys: BlobKeys::default(),
            scratch_dir: std::env::temp_dir().join("clipmirror"),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            local_id: config.local_id.clone(),
            remote_id: config.remote_id.clone(),
            quiet_period: config.quiet_period(),
            wire_format: config.sync.wire_format,
            blob_keys: config.sync.blob_keys,
            scratch_dir: config.scratch_dir(),
        }
    }
}

struct EngineInner {
    settings: EngineSettings,
    clipboard: Arc<dyn ClipboardPort>,
    channel: Arc<dyn MessageChannel>,
    codec: Codec,
    guard: LoopGuard,
    /// Held for the whole of one publish or apply
    busy: Mutex<()>,
    status: RwLock<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    publish_tx: RwLock<Option<mpsc::Sender<()>>>,
}

/// Clipboard sync engine for one endpoint
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

/// Aborts the engine's background tasks when `run` returns or is dropped
struct Workers(Vec<JoinHandle<()>>);

impl Drop for Workers {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

impl SyncEngine {
    pub fn new(
        settings: EngineSettings,
        clipboard: Arc<dyn ClipboardPort>,
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        let codec = Codec::new(store, &settings.local_id, &settings.remote_id)
            .with_format(settings.wire_format)
            .with_blob_keys(settings.blob_keys)
            .with_scratch_dir(&settings.scratch_dir);
        let (events, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(EngineInner {
                settings,
                clipboard,
                channel,
                codec,
                guard: LoopGuard::new(),
                busy: Mutex::new(()),
                status: RwLock::new(SyncStatus::default()),
                events,
                publish_tx: RwLock::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Snapshot of counters, state and last failure
    pub fn status(&self) -> SyncStatus {
        self.inner
            .status
            .read()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Whether [`SyncEngine::run`] is watching the clipboard
    pub fn is_running(&self) -> bool {
        self.inner
            .publish_tx
            .read()
            .map(|tx| tx.is_some())
            .unwrap_or(false)
    }

    /// Whether local notifications are currently being dropped
    pub fn is_suppressed(&self) -> bool {
        self.inner.guard.is_suppressed()
    }

    fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        if let Ok(mut status) = self.inner.status.write() {
            f(&mut status);
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn record_suppressed(&self) {
        debug!("Dropping local clipboard change inside quiet period");
        self.update_status(|status| status.dropped += 1);
        self.emit(SyncEvent::Suppressed);
    }

    /// Handle a local clipboard change notification
    ///
    /// Returns whether a publish is now pending. Notifications inside the
    /// quiet period are dropped; a notification that arrives while a publish
    /// is already queued is folded into it.
    pub fn on_local_change(&self) -> bool {
        if self.inner.guard.is_suppressed() {
            self.record_suppressed();
            return false;
        }

        let sender = self
            .inner
            .publish_tx
            .read()
            .ok()
            .and_then(|tx| tx.clone());
        let Some(sender) = sender else {
            debug!("Engine not running, ignoring local clipboard change");
            return false;
        };

        match sender.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                self.update_status(|status| status.coalesced += 1);
                true
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    /// Read the local clipboard and send it to the peer
    ///
    /// Returns the kind of content sent, or `None` if the clipboard was empty
    /// or the quiet period began after the change was queued.
    #[instrument(skip(self), fields(to = %self.inner.settings.remote_id))]
    pub async fn publish(&self) -> Result<Option<ContentKind>, SyncError> {
        let inner = &self.inner;
        let _busy = inner.busy.lock().await;

        if inner.guard.is_suppressed() {
            self.record_suppressed();
            return Ok(None);
        }

        self.update_status(|status| status.state = EngineState::Publishing);
        let result = self.read_and_send().await;
        self.update_status(|status| status.state = EngineState::Idle);

        if let Ok(Some(kind)) = &result {
            info!("Published {} to {}", kind, inner.settings.remote_id);
            self.update_status(|status| status.published += 1);
            self.emit(SyncEvent::Published { kind: *kind });
        }
        result
    }

    async fn read_and_send(&self) -> Result<Option<ContentKind>, SyncError> {
        let inner = &self.inner;
        let Some(content) = read_content(inner.clipboard.as_ref()).await? else {
            debug!("Clipboard is empty, nothing to publish");
            return Ok(None);
        };

        let payload = inner.codec.encode(&content).await?;
        inner
            .channel
            .send(&inner.settings.remote_id, &payload)
            .await?;
        Ok(Some(content.kind()))
    }

    /// Decode a message from the peer and write it to the local clipboard
    ///
    /// Suppression is raised before anything else and released a quiet period
    /// after this returns, whether or not the apply succeeded.
    #[instrument(skip(self, payload), fields(from = %self.inner.settings.remote_id, len = payload.len()))]
    pub async fn apply(&self, payload: &str) -> Result<ContentKind, SyncError> {
        let inner = &self.inner;
        let _suppression = inner.guard.suppress(inner.settings.quiet_period);
        let _busy = inner.busy.lock().await;

        self.update_status(|status| status.state = EngineState::Applying);
        let result = self.decode_and_write(payload).await;
        self.update_status(|status| status.state = EngineState::Idle);

        if let Ok(kind) = &result {
            info!("Applied {} from {}", kind, inner.settings.remote_id);
            self.update_status(|status| status.applied += 1);
            self.emit(SyncEvent::Applied { kind: *kind });
        }
        result
    }

    async fn decode_and_write(&self, payload: &str) -> Result<ContentKind, SyncError> {
        let content = self.inner.codec.decode(payload).await?;
        write_content(self.inner.clipboard.as_ref(), &content).await?;
        Ok(content.kind())
    }

    /// Apply a message and swallow any failure after reporting it
    pub async fn handle_message(&self, payload: &str) -> Option<ContentKind> {
        match self.apply(payload).await {
            Ok(kind) => Some(kind),
            Err(e) => {
                self.report(Operation::Apply, &e);
                None
            }
        }
    }

    /// Publish and swallow any failure after reporting it
    pub async fn handle_local_change(&self) -> Option<ContentKind> {
        match self.publish().await {
            Ok(kind) => kind,
            Err(e) => {
                self.report(Operation::Publish, &e);
                None
            }
        }
    }

    /// The one place failures are logged and recorded
    fn report(&self, operation: Operation, err: &SyncError) {
        let kind = err.kind();
        warn!(%operation, %kind, "Discarding failed {}: {}", operation, err);

        let message = err.to_string();
        self.update_status(|status| {
            status.failed += 1;
            status.last_error = Some(LastError {
                operation,
                kind,
                message: message.clone(),
                at: Utc::now(),
            });
        });
        self.emit(SyncEvent::Failed {
            operation,
            kind,
            message,
        });
    }

    /// Run until the message channel closes
    ///
    /// Spawns the clipboard watcher and the publish worker, then receives
    /// peer messages on the calling task. Dropping the returned future stops
    /// everything.
    pub async fn run(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        let mut watcher = inner.clipboard.watch().await?;

        let (publish_tx, mut publish_rx) = mpsc::channel::<()>(1);
        if let Ok(mut slot) = inner.publish_tx.write() {
            *slot = Some(publish_tx);
        }

        info!(
            "Sync engine running as {} (peer {}, clipboard {})",
            inner.settings.local_id,
            inner.settings.remote_id,
            inner.clipboard.name()
        );

        let watcher_engine = self.clone();
        let watch_task = tokio::spawn(async move {
            while let Some(event) = watcher.receiver.recv().await {
                debug!("Local clipboard change #{}", event.sequence);
                watcher_engine.on_local_change();
            }
            warn!("Clipboard watcher stopped");
        });

        let publish_engine = self.clone();
        let publish_task = tokio::spawn(async move {
            while publish_rx.recv().await.is_some() {
                publish_engine.handle_local_change().await;
            }
        });

        let _workers = Workers(vec![watch_task, publish_task]);

        loop {
            match inner.channel.receive().await {
                Ok(Some(payload)) => {
                    self.handle_message(&payload).await;
                }
                Ok(None) => {
                    info!("Message channel closed, stopping sync engine");
                    break;
                }
                Err(e) => {
                    error!("Error receiving from message channel: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        if let Ok(mut slot) = inner.publish_tx.write() {
            *slot = None;
        }
        Ok(())
    }
}
