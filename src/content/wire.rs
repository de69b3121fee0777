//! Wire grammar shared by both endpoints
//!
//! The legacy grammar is the only bit-exact contract between peers:
//!
//! ```text
//! message   := sentinel | file-list | text
//! sentinel  := "%$IMAGE"
//! file-list := "%$FILE$" segment ("$" segment)* "$"?
//! segment   := any string not containing "$"
//! text      := any other string
//! ```
//!
//! Text that equals the sentinel or starts with the file prefix is read back
//! as an image or file reference. [`WireFormat::Envelope`] avoids that by
//! tagging every message, at the cost of compatibility with legacy peers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EncodingError;

/// Literal payload announcing an image blob from the sender
pub const IMAGE_SENTINEL: &str = "%$IMAGE";

/// Prefix of a payload listing file blobs
pub const FILE_PREFIX: &str = "%$FILE$";

/// Separator between file blob names
pub const SEGMENT_DELIMITER: char = '$';

/// Blob name an endpoint publishes its clipboard image under
pub fn image_key(endpoint_id: &str) -> String {
    format!("image-{}.bmp", endpoint_id)
}

/// Local file name for a blob key: the text after the last `/`
pub fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Decoded form of a message on the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WireMessage {
    /// Literal text
    Text { text: String },
    /// Image stored under `key`
    Image { key: String },
    /// Files stored under `keys`, in clipboard order
    Files { keys: Vec<String> },
}

/// Encoding used for messages on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Sentinel/prefix grammar, compatible with existing peers
    #[default]
    Legacy,
    /// JSON object with an explicit `kind` tag
    Envelope,
}

impl WireFormat {
    /// Render a message into a channel payload
    pub fn render(&self, message: &WireMessage) -> Result<String, EncodingError> {
        if let WireMessage::Files { keys } = message {
            validate_keys(keys)?;
        }

        match self {
            WireFormat::Legacy => Ok(match message {
                WireMessage::Text { text } => text.clone(),
                WireMessage::Image { .. } => IMAGE_SENTINEL.to_string(),
                WireMessage::Files { keys } => {
                    let mut payload = String::from(FILE_PREFIX);
                    for key in keys {
                        payload.push_str(key);
                        payload.push(SEGMENT_DELIMITER);
                    }
                    payload
                }
            }),
            WireFormat::Envelope => serde_json::to_string(message)
                .map_err(|e| EncodingError::Malformed(e.to_string())),
        }
    }

    /// Parse a channel payload sent by `sender_id`
    pub fn parse(&self, payload: &str, sender_id: &str) -> Result<WireMessage, EncodingError> {
        match self {
            WireFormat::Legacy => {
                if payload == IMAGE_SENTINEL {
                    return Ok(WireMessage::Image {
                        key: image_key(sender_id),
                    });
                }

                if let Some(rest) = payload.strip_prefix(FILE_PREFIX) {
                    let keys = rest
                        .split(SEGMENT_DELIMITER)
                        .filter(|segment| !segment.is_empty())
                        .map(str::to_string)
                        .collect();
                    return Ok(WireMessage::Files { keys });
                }

                Ok(WireMessage::Text {
                    text: payload.to_string(),
                })
            }
            WireFormat::Envelope => {
                let message: WireMessage = serde_json::from_str(payload)
                    .map_err(|e| EncodingError::Malformed(e.to_string()))?;
                // A sender only ever publishes its own image slot
                if let WireMessage::Image { key } = &message {
                    let expected = image_key(sender_id);
                    if *key != expected {
                        return Err(EncodingError::Malformed(format!(
                            "image key {:?} from {} is not {:?}",
                            key, sender_id, expected
                        )));
                    }
                }
                Ok(message)
            }
        }
    }
}

fn validate_keys(keys: &[String]) -> Result<(), EncodingError> {
    if keys.is_empty() {
        return Err(EncodingError::EmptyFileSet);
    }
    for key in keys {
        if key.is_empty() || key.contains(SEGMENT_DELIMITER) {
            return Err(EncodingError::InvalidFileName(key.clone()));
        }
    }
    Ok(())
}

/// How file blobs are named in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKeys {
    /// The bare file name; same-named transfers overwrite each other
    #[default]
    Bare,
    /// `<sender>/<transfer id>/<file name>`
    PerTransfer,
}

impl BlobKeys {
    /// Store key for `file_name` within one transfer
    pub fn key_for(&self, sender_id: &str, transfer: Uuid, file_name: &str) -> String {
        match self {
            BlobKeys::Bare => file_name.to_string(),
            BlobKeys::PerTransfer => format!("{}/{}/{}", sender_id, transfer, file_name),
        }
    }
}
