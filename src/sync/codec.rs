//! Content encoding with blob offloading
//!
//! Text travels inside the message. Images and files are put in the
//! [`ContentStore`] first and the message only names them; decoding fetches
//! them back. A failed put or get abandons the whole operation, and blobs that
//! were already uploaded are left in place.
//!
//! Received files are written to a fresh directory under the scratch dir.
//! Only the latest file set is kept there; its predecessor is removed once
//! the new one is complete.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::SyncError;
use crate::content::wire::{file_name_of, image_key};
use crate::content::{
    BlobKeys, ClipboardContent, EncodingError, FileEntry, ImageFormat, WireFormat, WireMessage,
};
use crate::store::{ContentStore, StoreError};

/// Encodes local content for the peer and decodes the peer's messages
#[derive(Clone)]
pub struct Codec {
    store: Arc<dyn ContentStore>,
    local_id: String,
    remote_id: String,
    format: WireFormat,
    blob_keys: BlobKeys,
    scratch_dir: PathBuf,
    last_scratch: Arc<Mutex<Option<PathBuf>>>,
}

impl Codec {
    pub fn new(
        store: Arc<dyn ContentStore>,
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            format: WireFormat::default(),
            blob_keys: BlobKeys::default(),
            scratch_dir: std::env::temp_dir().join("clipmirror"),
            last_scratch: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_blob_keys(mut self, blob_keys: BlobKeys) -> Self {
        self.blob_keys = blob_keys;
        self
    }

    /// Directory fetched files are written under
    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Turn content into a channel payload, uploading any blobs it needs
    pub async fn encode(&self, content: &ClipboardContent) -> Result<String, SyncError> {
        let message = match content {
            ClipboardContent::Text(text) => WireMessage::Text { text: text.clone() },
            ClipboardContent::Image { data, format } => {
                let bmp = to_bmp(data, *format)?;
                let key = image_key(&self.local_id);
                debug!("Uploading image as {} ({} bytes)", key, bmp.len());
                self.store.put(&key, bmp).await?;
                WireMessage::Image { key }
            }
            ClipboardContent::FileSet(entries) => {
                check_file_names(entries.iter().map(|entry| entry.name.as_str()))?;

                let transfer = Uuid::new_v4();
                let mut keys = Vec::with_capacity(entries.len());
                for entry in entries {
                    let data = entry.read().await?;
                    let key = self.blob_keys.key_for(&self.local_id, transfer, &entry.name);
                    debug!("Uploading file {} ({} bytes)", key, data.len());
                    self.store.put(&key, data).await?;
                    keys.push(key);
                }
                WireMessage::Files { keys }
            }
        };

        Ok(self.format.render(&message)?)
    }

    /// Turn a payload from the peer back into content, fetching its blobs
    pub async fn decode(&self, payload: &str) -> Result<ClipboardContent, SyncError> {
        match self.format.parse(payload, &self.remote_id)? {
            WireMessage::Text { text } => Ok(ClipboardContent::Text(text)),
            WireMessage::Image { key } => {
                let data = self.fetch(&key).await?;
                image::load_from_memory_with_format(&data, image::ImageFormat::Bmp)
                    .map_err(EncodingError::from)?;
                Ok(ClipboardContent::image(data, ImageFormat::Bmp))
            }
            WireMessage::Files { keys } => {
                check_file_names(keys.iter().map(|key| file_name_of(key)))?;

                // Fetch everything before touching the disk
                let mut blobs = Vec::with_capacity(keys.len());
                for key in &keys {
                    blobs.push((file_name_of(key).to_string(), self.fetch(key).await?));
                }

                let dir = self.scratch_dir.join(Uuid::new_v4().to_string());
                let entries = match write_files(&dir, blobs).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        remove_scratch(&dir).await;
                        return Err(e.into());
                    }
                };

                let previous = self
                    .last_scratch
                    .lock()
                    .ok()
                    .and_then(|mut last| last.replace(dir));
                if let Some(previous) = previous {
                    remove_scratch(&previous).await;
                }
                Ok(ClipboardContent::FileSet(entries))
            }
        }
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, SyncError> {
        match self.store.get(key).await {
            Ok(data) => Ok(data),
            Err(StoreError::NotFound { key }) => Err(EncodingError::MissingBlob { key }.into()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_files(
    dir: &Path,
    blobs: Vec<(String, Vec<u8>)>,
) -> Result<Vec<FileEntry>, EncodingError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| EncodingError::FileWrite {
            path: dir.to_path_buf(),
            source,
        })?;

    let mut entries = Vec::with_capacity(blobs.len());
    for (name, data) in blobs {
        let path = dir.join(&name);
        tokio::fs::write(&path, &data)
            .await
            .map_err(|source| EncodingError::FileWrite {
                path: path.clone(),
                source,
            })?;
        entries.push(FileEntry::from_path(path)?);
    }
    Ok(entries)
}

async fn remove_scratch(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed scratch directory {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove scratch directory {}: {}", dir.display(), e),
    }
}

/// Bring image bytes into the BMP form images travel in
fn to_bmp(data: &[u8], format: ImageFormat) -> Result<Vec<u8>, EncodingError> {
    match format {
        ImageFormat::Bmp => Ok(data.to_vec()),
        other => {
            let image = image::load_from_memory_with_format(data, other.codec_format())?;
            let mut bmp = Cursor::new(Vec::new());
            image.write_to(&mut bmp, image::ImageFormat::Bmp)?;
            Ok(bmp.into_inner())
        }
    }
}

/// File names must be usable both as wire segments and as local file names
fn check_file_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<(), EncodingError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['$', '/', '\\'])
        {
            return Err(EncodingError::InvalidFileName(name.to_string()));
        }
        if !seen.insert(name) {
            return Err(EncodingError::DuplicateFileName(name.to_string()));
        }
    }
    if seen.is_empty() {
        return Err(EncodingError::EmptyFileSet);
    }
    Ok(())
}
