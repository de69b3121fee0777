//! Typed clipboard content and its wire representation
//!
//! [`ClipboardContent`] is what the engine reads from and writes to the local
//! clipboard. [`wire`] defines how a piece of content is named on the message
//! channel; the blobs it references live in a [`crate::store::ContentStore`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod wire;

pub use wire::{BlobKeys, WireFormat, WireMessage, FILE_PREFIX, IMAGE_SENTINEL};

/// Image encodings the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Windows bitmap, the format images travel in
    Bmp,
    /// PNG, transcoded to BMP before publishing
    Png,
}

impl ImageFormat {
    /// File extension used for blob names
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Bmp => "bmp",
            ImageFormat::Png => "png",
        }
    }

    pub(crate) fn codec_format(&self) -> image::ImageFormat {
        match self {
            ImageFormat::Bmp => image::ImageFormat::Bmp,
            ImageFormat::Png => image::ImageFormat::Png,
        }
    }
}

/// Where the bytes of a file entry come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Contents already in memory
    Bytes(Vec<u8>),
    /// A file on the local disk
    Path(PathBuf),
}

/// One file of a [`ClipboardContent::FileSet`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Bare file name, no directory components
    pub name: String,
    /// Where to read the contents from
    pub source: FileSource,
}

impl FileEntry {
    /// Build an entry for a file on disk, named after its last path component
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, EncodingError> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| EncodingError::InvalidFileName(path.display().to_string()))?
            .to_string();

        Ok(Self {
            name,
            source: FileSource::Path(path),
        })
    }

    /// Build an entry from in-memory contents
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source: FileSource::Bytes(data),
        }
    }

    /// Local path of the entry, if it is backed by a file
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Bytes(_) => None,
        }
    }

    /// Read the full contents of the entry
    pub async fn read(&self) -> Result<Vec<u8>, EncodingError> {
        match &self.source {
            FileSource::Bytes(data) => Ok(data.clone()),
            FileSource::Path(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| EncodingError::FileRead {
                        path: path.clone(),
                        source,
                    })
            }
        }
    }
}

/// Content of the clipboard, exactly one kind at a time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardContent {
    /// Plain text
    Text(String),
    /// A single encoded image
    Image { data: Vec<u8>, format: ImageFormat },
    /// One or more files in file-drop order
    FileSet(Vec<FileEntry>),
}

/// Discriminant of [`ClipboardContent`], used for logging and status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    Files,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentKind::Text => write!(f, "text"),
            ContentKind::Image => write!(f, "image"),
            ContentKind::Files => write!(f, "files"),
        }
    }
}

impl ClipboardContent {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        ClipboardContent::Text(text.into())
    }

    /// Create image content
    pub fn image(data: Vec<u8>, format: ImageFormat) -> Self {
        ClipboardContent::Image { data, format }
    }

    /// Create a file set from local paths, keeping their order
    pub fn files<I, P>(paths: I) -> Result<Self, EncodingError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let entries = paths
            .into_iter()
            .map(FileEntry::from_path)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClipboardContent::FileSet(entries))
    }

    /// Which kind of content this is
    pub fn kind(&self) -> ContentKind {
        match self {
            ClipboardContent::Text(_) => ContentKind::Text,
            ClipboardContent::Image { .. } => ContentKind::Image,
            ClipboardContent::FileSet(_) => ContentKind::Files,
        }
    }

    /// Get content as text if possible
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ClipboardContent::Text(text) => Some(text),
            _ => None,
        }
    }

    /// File names of a file set, in order
    pub fn file_names(&self) -> Vec<&str> {
        match self {
            ClipboardContent::FileSet(entries) => {
                entries.iter().map(|entry| entry.name.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Errors turning content into a wire message or back
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Envelope payload could not be parsed or produced
    #[error("Malformed wire message: {0}")]
    Malformed(String),

    /// A referenced blob does not exist in the store
    #[error("Referenced blob is missing: {key}")]
    MissingBlob { key: String },

    /// Image bytes could not be decoded or transcoded
    #[error("Invalid image data: {0}")]
    Image(#[from] image::ImageError),

    /// File name cannot be carried by the wire grammar or used locally
    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    /// Same file name appears twice in one file set
    #[error("Duplicate file name in file set: {0}")]
    DuplicateFileName(String),

    /// A file set with no files
    #[error("File set is empty")]
    EmptyFileSet,

    /// Local file backing a file entry could not be read
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Fetched file could not be written to the scratch directory
    #[error("Failed to write {path}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
