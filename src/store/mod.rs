//! Named blob storage for payloads that do not fit in a message
//!
//! Images and files are put under a key by the publishing endpoint and fetched
//! by the peer after it receives the message that references them.

use async_trait::async_trait;
use thiserror::Error;

pub mod directory;
pub mod memory;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

/// Blob store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No blob stored under the key
    #[error("Blob not found: {key}")]
    NotFound { key: String },

    /// Key cannot be mapped onto the backend
    #[error("Invalid blob key: {key:?}")]
    InvalidKey { key: String },

    /// Backend rejected or failed the request
    #[error("Storage backend error: {message}")]
    Backend { message: String },

    /// Blob exceeds what the backend accepts
    #[error("Blob {key} is {size} bytes, limit is {limit}")]
    TooLarge {
        key: String,
        size: usize,
        limit: usize,
    },

    /// Request did not complete in time
    #[error("Storage request timed out")]
    Timeout,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
        }
    }
}

/// Put/get of named binary blobs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous blob
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StoreError>;

    /// Fetch the blob stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}
