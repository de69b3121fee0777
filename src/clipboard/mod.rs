//! Clipboard port used by the sync engine
//!
//! This module provides a platform-agnostic interface for reading and writing
//! the local clipboard and for being told when it changes. Change events carry
//! no content: the engine re-reads the clipboard when one arrives.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::content::{ClipboardContent, EncodingError, FileSource, ImageFormat};

pub mod memory;
pub mod system;

pub use memory::{ClipboardSnapshot, MemoryClipboard};
pub use system::SystemClipboard;

/// Clipboard change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipboardEvent {
    /// Monotonic change counter of the emitting provider
    pub sequence: u64,
}

/// Clipboard watcher for monitoring changes
pub struct ClipboardWatcher {
    /// Channel receiver for clipboard events
    pub receiver: mpsc::Receiver<ClipboardEvent>,
    /// Handle to stop watching
    _handle: Box<dyn Send + Sync>,
}

impl ClipboardWatcher {
    /// Create a new watcher with the given receiver
    pub fn new(
        receiver: mpsc::Receiver<ClipboardEvent>,
        handle: impl Send + Sync + 'static,
    ) -> Self {
        Self {
            receiver,
            _handle: Box::new(handle),
        }
    }
}

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Clipboard held by another process or otherwise not accessible
    #[error("Clipboard unavailable: {0}")]
    Unavailable(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// No content of the requested type
    #[error("No clipboard content available")]
    NoContent,

    /// Unsupported content type
    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),

    /// Watch error
    #[error("Failed to watch clipboard: {0}")]
    WatchError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local clipboard access
#[async_trait]
pub trait ClipboardPort: Send + Sync {
    /// Whether the clipboard currently holds text
    async fn has_text(&self) -> Result<bool, ClipboardError>;

    /// Current clipboard text
    async fn get_text(&self) -> Result<String, ClipboardError>;

    /// Whether the clipboard currently holds an image
    async fn has_image(&self) -> Result<bool, ClipboardError>;

    /// Current clipboard image, BMP-encoded
    async fn get_image(&self) -> Result<Vec<u8>, ClipboardError>;

    /// Whether the clipboard currently holds a file-drop list
    async fn has_file_list(&self) -> Result<bool, ClipboardError>;

    /// Current file-drop list, in order
    async fn get_file_list(&self) -> Result<Vec<PathBuf>, ClipboardError>;

    /// Replace the clipboard with text
    async fn set_text(&self, text: &str) -> Result<(), ClipboardError>;

    /// Replace the clipboard with a BMP-encoded image
    async fn set_image(&self, bmp: &[u8]) -> Result<(), ClipboardError>;

    /// Replace the clipboard with a file-drop list
    async fn set_file_list(&self, paths: &[PathBuf]) -> Result<(), ClipboardError>;

    /// Get provider name
    fn name(&self) -> &str;

    /// Start watching for clipboard changes
    async fn watch(&self) -> Result<ClipboardWatcher, ClipboardError>;
}

/// Errors from [`read_content`]
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Clipboard(#[from] ClipboardError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Read the clipboard as exactly one kind of content
///
/// Types are checked in a fixed order: text, then image, then files. The
/// first one present wins even if others are on the clipboard too.
pub async fn read_content(
    port: &dyn ClipboardPort,
) -> Result<Option<ClipboardContent>, ReadError> {
    if port.has_text().await? {
        return Ok(Some(ClipboardContent::Text(port.get_text().await?)));
    }

    if port.has_image().await? {
        let data = port.get_image().await?;
        return Ok(Some(ClipboardContent::image(data, ImageFormat::Bmp)));
    }

    if port.has_file_list().await? {
        let paths = port.get_file_list().await?;
        if !paths.is_empty() {
            return Ok(Some(ClipboardContent::files(paths)?));
        }
    }

    Ok(None)
}

/// Write content to the clipboard through the matching setter
pub async fn write_content(
    port: &dyn ClipboardPort,
    content: &ClipboardContent,
) -> Result<(), ClipboardError> {
    match content {
        ClipboardContent::Text(text) => port.set_text(text).await,
        ClipboardContent::Image { data, format } => {
            if *format != ImageFormat::Bmp {
                return Err(ClipboardError::UnsupportedType(format!(
                    "image/{}",
                    format.extension()
                )));
            }
            port.set_image(data).await
        }
        ClipboardContent::FileSet(entries) => {
            let paths = entries
                .iter()
                .map(|entry| match &entry.source {
                    FileSource::Path(path) => Ok(path.clone()),
                    FileSource::Bytes(_) => Err(ClipboardError::UnsupportedType(format!(
                        "in-memory file {}",
                        entry.name
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            port.set_file_list(&paths).await
        }
    }
}
