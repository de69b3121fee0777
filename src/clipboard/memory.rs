//! In-process clipboard
//!
//! Behaves like an OS clipboard from the engine's point of view: every write,
//! including the engine's own, produces a change event.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ClipboardError, ClipboardEvent, ClipboardPort, ClipboardWatcher};

/// Formats present on the clipboard at one moment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipboardSnapshot {
    pub text: Option<String>,
    pub image: Option<Vec<u8>>,
    pub files: Option<Vec<PathBuf>>,
}

impl ClipboardSnapshot {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn image(bmp: Vec<u8>) -> Self {
        Self {
            image: Some(bmp),
            ..Self::default()
        }
    }

    pub fn files(paths: Vec<PathBuf>) -> Self {
        Self {
            files: Some(paths),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_image(mut self, bmp: Vec<u8>) -> Self {
        self.image = Some(bmp);
        self
    }

    pub fn with_files(mut self, paths: Vec<PathBuf>) -> Self {
        self.files = Some(paths);
        self
    }
}

/// Clipboard held in memory
#[derive(Default)]
pub struct MemoryClipboard {
    state: Mutex<ClipboardSnapshot>,
    watchers: Mutex<Vec<mpsc::Sender<ClipboardEvent>>>,
    sequence: AtomicU64,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the clipboard as a user copy would, then notify watchers
    pub fn copy(&self, snapshot: ClipboardSnapshot) {
        self.replace(snapshot);
    }

    /// Current clipboard contents
    pub fn snapshot(&self) -> ClipboardSnapshot {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Number of successful writes made through the port setters
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the port setters fail as if another process held the clipboard
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn replace(&self, snapshot: ClipboardSnapshot) {
        if let Ok(mut state) = self.state.lock() {
            *state = snapshot;
        }
        self.notify();
    }

    fn write(&self, snapshot: ClipboardSnapshot) -> Result<(), ClipboardError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ClipboardError::Unavailable(
                "clipboard is held by another process".to_string(),
            ));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.replace(snapshot);
        Ok(())
    }

    fn notify(&self) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = ClipboardEvent { sequence };

        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.retain(|tx| !tx.is_closed());
            for tx in watchers.iter() {
                if tx.try_send(event).is_err() {
                    debug!("Dropping clipboard event {} for a lagging watcher", sequence);
                }
            }
        }
    }

    fn has(&self, f: impl FnOnce(&ClipboardSnapshot) -> bool) -> bool {
        self.state.lock().map(|state| f(&state)).unwrap_or(false)
    }

    fn read<T>(&self, f: impl FnOnce(&ClipboardSnapshot) -> Option<T>) -> Option<T> {
        self.state.lock().ok().and_then(|state| f(&state))
    }
}

#[async_trait]
impl ClipboardPort for MemoryClipboard {
    async fn has_text(&self) -> Result<bool, ClipboardError> {
        Ok(self.has(|s| s.text.is_some()))
    }

    async fn get_text(&self) -> Result<String, ClipboardError> {
        self.read(|s| s.text.clone()).ok_or(ClipboardError::NoContent)
    }

    async fn has_image(&self) -> Result<bool, ClipboardError> {
        Ok(self.has(|s| s.image.is_some()))
    }

    async fn get_image(&self) -> Result<Vec<u8>, ClipboardError> {
        self.read(|s| s.image.clone()).ok_or(ClipboardError::NoContent)
    }

    async fn has_file_list(&self) -> Result<bool, ClipboardError> {
        Ok(self.has(|s| s.files.is_some()))
    }

    async fn get_file_list(&self) -> Result<Vec<PathBuf>, ClipboardError> {
        self.read(|s| s.files.clone()).ok_or(ClipboardError::NoContent)
    }

    async fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        self.write(ClipboardSnapshot::text(text))
    }

    async fn set_image(&self, bmp: &[u8]) -> Result<(), ClipboardError> {
        self.write(ClipboardSnapshot::image(bmp.to_vec()))
    }

    async fn set_file_list(&self, paths: &[PathBuf]) -> Result<(), ClipboardError> {
        self.write(ClipboardSnapshot::files(paths.to_vec()))
    }

    fn name(&self) -> &str {
        "memory"
    }

    async fn watch(&self) -> Result<ClipboardWatcher, ClipboardError> {
        let (tx, rx) = mpsc::channel(64);
        self.watchers
            .lock()
            .map_err(|_| ClipboardError::WatchError("watcher list poisoned".to_string()))?
            .push(tx);
        Ok(ClipboardWatcher::new(rx, ()))
    }
}
