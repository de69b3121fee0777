//! Desktop clipboard through arboard
//!
//! arboard has no change notification, so [`SystemClipboard::watch`] polls a
//! fingerprint of the clipboard and emits one event per observed change.
//! Images cross this boundary as BMP; arboard itself deals in raw RGBA.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::{ClipboardError, ClipboardEvent, ClipboardPort, ClipboardWatcher};

impl From<arboard::Error> for ClipboardError {
    fn from(err: arboard::Error) -> Self {
        match err {
            arboard::Error::ContentNotAvailable => ClipboardError::NoContent,
            arboard::Error::ClipboardOccupied => ClipboardError::Unavailable(err.to_string()),
            arboard::Error::ConversionFailure => {
                ClipboardError::UnsupportedType(err.to_string())
            }
            other => ClipboardError::Platform(other.to_string()),
        }
    }
}

/// Desktop clipboard provider
pub struct SystemClipboard {
    inner: Arc<Mutex<arboard::Clipboard>>,
    poll_interval: Duration,
}

impl SystemClipboard {
    /// Connect to the desktop clipboard
    pub fn new(poll_interval: Duration) -> Result<Self, ClipboardError> {
        let clipboard = arboard::Clipboard::new()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(clipboard)),
            poll_interval,
        })
    }

    /// Run a clipboard operation on the blocking pool
    async fn with_clipboard<T, F>(&self, f: F) -> Result<T, ClipboardError>
    where
        F: FnOnce(&mut arboard::Clipboard) -> Result<T, ClipboardError> + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(Arc::clone(&self.inner), f).await
    }

    async fn present<T, F>(&self, f: F) -> Result<bool, ClipboardError>
    where
        F: FnOnce(&mut arboard::Clipboard) -> Result<T, ClipboardError> + Send + 'static,
        T: Send + 'static,
    {
        match self.with_clipboard(f).await {
            Ok(_) => Ok(true),
            Err(ClipboardError::NoContent) | Err(ClipboardError::UnsupportedType(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

async fn run_blocking<T, F>(
    inner: Arc<Mutex<arboard::Clipboard>>,
    f: F,
) -> Result<T, ClipboardError>
where
    F: FnOnce(&mut arboard::Clipboard) -> Result<T, ClipboardError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut clipboard = inner
            .lock()
            .map_err(|_| ClipboardError::Platform("clipboard handle poisoned".to_string()))?;
        f(&mut clipboard)
    })
    .await
    .map_err(|e| ClipboardError::Platform(format!("clipboard task failed: {}", e)))?
}

fn read_text(clipboard: &mut arboard::Clipboard) -> Result<String, ClipboardError> {
    let text = clipboard.get_text()?;
    if text.is_empty() {
        return Err(ClipboardError::NoContent);
    }
    Ok(text)
}

fn read_image_bmp(clipboard: &mut arboard::Clipboard) -> Result<Vec<u8>, ClipboardError> {
    let data = clipboard.get_image()?;
    let rgba = image::RgbaImage::from_raw(
        data.width as u32,
        data.height as u32,
        data.bytes.into_owned(),
    )
    .ok_or_else(|| ClipboardError::UnsupportedType("malformed RGBA image".to_string()))?;

    let mut bmp = Vec::new();
    image::DynamicImage::ImageRgba8(rgba)
        .write_to(&mut Cursor::new(&mut bmp), image::ImageFormat::Bmp)
        .map_err(|e| ClipboardError::UnsupportedType(format!("BMP encoding failed: {}", e)))?;
    Ok(bmp)
}

fn read_files(clipboard: &mut arboard::Clipboard) -> Result<Vec<PathBuf>, ClipboardError> {
    let files = clipboard.get().file_list()?;
    if files.is_empty() {
        return Err(ClipboardError::NoContent);
    }
    Ok(files)
}

/// Hash of whatever is on the clipboard, `None` when it is empty
fn fingerprint(clipboard: &mut arboard::Clipboard) -> Option<[u8; 32]> {
    let mut hasher = Sha256::new();
    if let Ok(text) = clipboard.get_text() {
        hasher.update(b"text");
        hasher.update(text.as_bytes());
    } else if let Ok(image) = clipboard.get_image() {
        hasher.update(b"image");
        hasher.update((image.width as u64).to_le_bytes());
        hasher.update((image.height as u64).to_le_bytes());
        hasher.update(&image.bytes);
    } else if let Ok(files) = clipboard.get().file_list() {
        hasher.update(b"files");
        for file in files {
            hasher.update(file.to_string_lossy().as_bytes());
            hasher.update([0u8]);
        }
    } else {
        return None;
    }
    Some(hasher.finalize().into())
}

struct PollerHandle(JoinHandle<()>);

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl ClipboardPort for SystemClipboard {
    async fn has_text(&self) -> Result<bool, ClipboardError> {
        self.present(read_text).await
    }

    async fn get_text(&self) -> Result<String, ClipboardError> {
        self.with_clipboard(read_text).await
    }

    async fn has_image(&self) -> Result<bool, ClipboardError> {
        self.present(|clipboard| clipboard.get_image().map_err(ClipboardError::from))
            .await
    }

    async fn get_image(&self) -> Result<Vec<u8>, ClipboardError> {
        self.with_clipboard(read_image_bmp).await
    }

    async fn has_file_list(&self) -> Result<bool, ClipboardError> {
        self.present(read_files).await
    }

    async fn get_file_list(&self) -> Result<Vec<PathBuf>, ClipboardError> {
        self.with_clipboard(read_files).await
    }

    async fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        let text = text.to_string();
        self.with_clipboard(move |clipboard| Ok(clipboard.set_text(text)?))
            .await
    }

    async fn set_image(&self, bmp: &[u8]) -> Result<(), ClipboardError> {
        let decoded = image::load_from_memory_with_format(bmp, image::ImageFormat::Bmp)
            .map_err(|e| ClipboardError::UnsupportedType(format!("invalid BMP: {}", e)))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();

        self.with_clipboard(move |clipboard| {
            let data = arboard::ImageData {
                width: width as usize,
                height: height as usize,
                bytes: Cow::Owned(decoded.into_raw()),
            };
            Ok(clipboard.set_image(data)?)
        })
        .await
    }

    async fn set_file_list(&self, paths: &[PathBuf]) -> Result<(), ClipboardError> {
        let paths = paths.to_vec();
        self.with_clipboard(move |clipboard| Ok(clipboard.set().file_list(paths.as_slice())?))
            .await
    }

    fn name(&self) -> &str {
        "system"
    }

    async fn watch(&self) -> Result<ClipboardWatcher, ClipboardError> {
        let (tx, rx) = mpsc::channel(16);
        let inner = Arc::clone(&self.inner);
        let poll_interval = self.poll_interval;

        let mut last = run_blocking(Arc::clone(&inner), |clipboard| Ok(fingerprint(clipboard)))
            .await?;

        let task = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sequence = 0u64;

            loop {
                ticker.tick().await;

                let current =
                    match run_blocking(Arc::clone(&inner), |clipboard| Ok(fingerprint(clipboard)))
                        .await
                    {
                        Ok(current) => current,
                        Err(e) => {
                            warn!("Failed to poll clipboard: {}", e);
                            continue;
                        }
                    };

                if current == last {
                    trace!("Clipboard unchanged");
                    continue;
                }
                last = current;
                sequence += 1;

                let digest = current
                    .map(|hash| hex::encode(&hash[..6]))
                    .unwrap_or_else(|| "empty".to_string());
                debug!("Clipboard changed (event {}, {})", sequence, digest);
                if tx.send(ClipboardEvent { sequence }).await.is_err() {
                    debug!("Clipboard watcher dropped, stopping poller");
                    break;
                }
            }
        });

        Ok(ClipboardWatcher::new(rx, PollerHandle(task)))
    }
}
