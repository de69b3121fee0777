//! Wire protocol between relay clients and the relay server
//!
//! Every WebSocket text frame carries one JSON-encoded [`Frame`]. A client
//! opens with `Hello`, the server answers `Welcome` and then flushes whatever
//! was queued for that endpoint as `Deliver` frames. Requests carry a
//! `request_id` echoed by the server's `Ack`, `Blob` or `Error` reply.
//!
//! Blob bodies are split into chunks of at most [`BLOB_CHUNK_SIZE`] bytes so
//! no single WebSocket message grows with the blob. A `PutBlob` request and
//! a `Blob` reply are a run of frames sharing one `request_id`, the last one
//! marked `is_final`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: &str = "2";

/// Raw bytes carried by one `PutBlob` or `Blob` frame
pub const BLOB_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest blob the relay accepts
pub const MAX_BLOB_SIZE: usize = 256 * 1024 * 1024;

/// Path the relay serves WebSocket upgrades on
pub const RELAY_PATH: &str = "/clipmirror";

/// Error classes the relay reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Requested blob does not exist
    NotFound,
    /// Frame is invalid in the current session state
    BadRequest,
    /// Client speaks another protocol version
    VersionMismatch,
    /// Blob exceeds [`MAX_BLOB_SIZE`]
    TooLarge,
    /// Server-side failure
    Internal,
}

/// Relay protocol frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client registers as `endpoint`
    Hello { endpoint: String, version: String },

    /// Server accepted the session; `queued` messages follow
    Welcome { queued: usize },

    /// Client sends `payload` to endpoint `to`
    Send {
        request_id: Uuid,
        to: String,
        payload: String,
    },

    /// Server delivers a payload addressed to this endpoint
    Deliver { from: String, payload: String },

    /// Client stores one chunk of a blob; `data` is base64
    PutBlob {
        request_id: Uuid,
        key: String,
        data: String,
        is_final: bool,
    },

    /// Client fetches a blob
    GetBlob { request_id: Uuid, key: String },

    /// Server returns one chunk of a blob; `data` is base64
    Blob {
        request_id: Uuid,
        data: String,
        is_final: bool,
    },

    /// Request completed
    Ack { request_id: Uuid },

    /// Request or session failed
    Error {
        request_id: Option<Uuid>,
        code: ErrorCode,
        message: String,
    },
}

impl Frame {
    pub fn hello(endpoint: impl Into<String>) -> Self {
        Frame::Hello {
            endpoint: endpoint.into(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Frames uploading `data` under `key`, in order
    pub fn put_blob(request_id: Uuid, key: &str, data: &[u8]) -> Vec<Self> {
        chunked(data, |data, is_final| Frame::PutBlob {
            request_id,
            key: key.to_string(),
            data,
            is_final,
        })
    }

    /// Frames returning `data` for `request_id`, in order
    pub fn blob(request_id: Uuid, data: &[u8]) -> Vec<Self> {
        chunked(data, |data, is_final| Frame::Blob {
            request_id,
            data,
            is_final,
        })
    }

    pub fn error(request_id: Option<Uuid>, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error {
            request_id,
            code,
            message: message.into(),
        }
    }

    /// Request id of a reply frame
    pub fn reply_id(&self) -> Option<Uuid> {
        match self {
            Frame::Ack { request_id } | Frame::Blob { request_id, .. } => Some(*request_id),
            Frame::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Frame name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Send { .. } => "send",
            Frame::Deliver { .. } => "deliver",
            Frame::PutBlob { .. } => "put_blob",
            Frame::GetBlob { .. } => "get_blob",
            Frame::Blob { .. } => "blob",
            Frame::Ack { .. } => "ack",
            Frame::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Split `data` into base64 chunks; an empty blob is one empty final chunk
fn chunked(data: &[u8], mut frame: impl FnMut(String, bool) -> Frame) -> Vec<Frame> {
    if data.is_empty() {
        return vec![frame(String::new(), true)];
    }
    let count = data.len().div_ceil(BLOB_CHUNK_SIZE);
    data.chunks(BLOB_CHUNK_SIZE)
        .enumerate()
        .map(|(index, chunk)| frame(BASE64.encode(chunk), index + 1 == count))
        .collect()
}

/// Decode the base64 body of a `PutBlob` or `Blob` frame
pub fn decode_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hello_json() {
        let json = Frame::hello("desk").to_json().unwrap();
        assert_eq!(json, r#"{"type":"hello","endpoint":"desk","version":"2"}"#);
    }

    #[test]
    fn test_blob_data_is_base64() {
        let id = Uuid::nil();
        let frames = Frame::put_blob(id, "image-a.bmp", &[0, 255, 10]);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::PutBlob { data, is_final, .. } => {
                assert_eq!(data, "AP8K");
                assert!(is_final);
                assert_eq!(decode_data(data).unwrap(), vec![0, 255, 10]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        let parsed = Frame::from_json(&frames[0].to_json().unwrap()).unwrap();
        assert_eq!(parsed, frames[0]);
    }

    #[test]
    fn test_large_blob_is_chunked() {
        let id = Uuid::new_v4();
        let data: Vec<u8> = (0..BLOB_CHUNK_SIZE * 2 + 17).map(|i| i as u8).collect();
        let frames = Frame::blob(id, &data);
        assert_eq!(frames.len(), 3);

        let mut joined = Vec::new();
        for (index, frame) in frames.iter().enumerate() {
            let Frame::Blob {
                request_id,
                data,
                is_final,
            } = frame
            else {
                panic!("unexpected frame {:?}", frame);
            };
            assert_eq!(*request_id, id);
            assert_eq!(*is_final, index == 2);
            let chunk = decode_data(data).unwrap();
            assert!(chunk.len() <= BLOB_CHUNK_SIZE);
            joined.extend_from_slice(&chunk);
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn test_empty_blob_is_one_final_frame() {
        let frames = Frame::put_blob(Uuid::nil(), "empty.txt", &[]);
        assert!(matches!(
            frames.as_slice(),
            [Frame::PutBlob { data, is_final: true, .. }] if data.is_empty()
        ));
    }

    #[test]
    fn test_reply_id() {
        let id = Uuid::new_v4();
        assert_eq!(Frame::Ack { request_id: id }.reply_id(), Some(id));
        assert_eq!(
            Frame::error(Some(id), ErrorCode::NotFound, "gone").reply_id(),
            Some(id)
        );
        assert_eq!(Frame::Welcome { queued: 0 }.reply_id(), None);
    }

    #[test]
    fn test_unknown_frame_rejected() {
        assert!(Frame::from_json(r#"{"type":"shout"}"#).is_err());
    }
}
