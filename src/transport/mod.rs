//! Message channel between the two endpoints
//!
//! This module provides the [`MessageChannel`] seam the engine sends through
//! and receives from, an in-process hub for tests and single-host setups, and
//! a WebSocket relay with per-endpoint queues and blob storage.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod protocol;
pub mod reconnect;
pub mod relay;
pub mod websocket;

pub use memory::{MemoryChannel, MemoryHub};
pub use protocol::{ErrorCode, Frame, PROTOCOL_VERSION};
pub use reconnect::{Backoff, ReconnectionConfig};
pub use relay::{RelayHandle, RelayServer};
pub use websocket::{RelayClient, RelayClientConfig};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket protocol error
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// Could not reach the relay or hand a message to it
    #[error("Connection failed: {message}")]
    Connection { message: String },

    /// Relay refused the request
    #[error("Relay rejected request ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    /// Message serialization/deserialization error
    #[error("Data format error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Protocol version mismatch
    #[error("Incompatible relay protocol: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Publish/receive channel addressed by endpoint id
///
/// Delivery is at most once: a message handed out by [`receive`] is removed
/// from the channel. Ordering is FIFO per sender.
///
/// [`receive`]: MessageChannel::receive
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Send one payload to `destination`
    async fn send(&self, destination: &str, payload: &str) -> Result<()>;

    /// Wait for the next payload addressed to this endpoint
    ///
    /// Returns `Ok(None)` once the channel is closed for good.
    async fn receive(&self) -> Result<Option<String>>;
}
