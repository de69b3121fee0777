//! # ClipMirror
//!
//! Mirrors clipboard content (text, a single image, or a set of files)
//! between two endpoints. Small notifications travel over a message relay,
//! payloads that do not fit in a message body are offloaded to a blob store
//! and referenced by name.
//!
//! Each endpoint runs the same [`sync::SyncEngine`] configured with its own
//! identity and its peer's identity.

pub mod cli;
pub mod clipboard;
pub mod config;
pub mod content;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use content::ClipboardContent;
pub use sync::{SyncEngine, SyncError};

/// Result type alias for ClipMirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ClipMirror operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Clipboard operation error
    #[error("Clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// Blob store error
    #[error("Storage error: {0}")]
    Store(#[from] store::StoreError),

    /// Wire encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] content::EncodingError),

    /// Sync engine error
    #[error("Sync error: {0}")]
    Sync(#[from] sync::SyncError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_blob() -> Result<Vec<u8>> {
        let fetched: std::result::Result<Vec<u8>, store::StoreError> =
            Err(store::StoreError::NotFound {
                key: "image-a.bmp".to_string(),
            });
        Ok(fetched?)
    }

    #[test]
    fn test_component_errors_convert() {
        let err = missing_blob().unwrap_err();
        assert!(matches!(err, Error::Store(store::StoreError::NotFound { .. })));
        assert_eq!(err.to_string(), "Storage error: Blob not found: image-a.bmp");

        let err: Error = transport::TransportError::ConnectionClosed.into();
        assert_eq!(err.to_string(), "Transport error: Connection closed");
    }
}
