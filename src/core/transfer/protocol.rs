//! Wire messages of the chunked file-transfer protocol.
//!
//! Every message is a JSON object tagged by `type`:
//!
//! | type            | fields                                  |
//! |-----------------|-----------------------------------------|
//! | `file-init`     | filename, totalChunks, totalSize        |
//! | `file-chunk`    | filename, index, totalChunks, data (b64)|
//! | `file-ack`      | filename, index                         |
//! | `file-complete` | filename, totalChunks, totalSize        |
//! | `file-error`    | filename, reason                        |
//!
//! Anything that is not JSON, or JSON with an unknown `type`, is plain text
//! for the sub-channel and classified as [`Inbound::Raw`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

const KNOWN_TYPES: [&str; 5] = [
    "file-init",
    "file-chunk",
    "file-ack",
    "file-complete",
    "file-error",
];

/// Indices and counts are signed on the wire; the browser sends plain JS
/// numbers and a negative index must be reported, not fail to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum FileMessage {
    FileInit {
        filename: String,
        total_chunks: i64,
        total_size: u64,
    },
    FileChunk {
        filename: String,
        index: i64,
        #[serde(default)]
        total_chunks: i64,
        data: String,
    },
    FileAck {
        filename: String,
        index: i64,
    },
    FileComplete {
        filename: String,
        total_chunks: i64,
        total_size: u64,
    },
    FileError {
        filename: String,
        reason: String,
    },
}

impl FileMessage {
    pub fn filename(&self) -> &str {
        match self {
            Self::FileInit { filename, .. }
            | Self::FileChunk { filename, .. }
            | Self::FileAck { filename, .. }
            | Self::FileComplete { filename, .. }
            | Self::FileError { filename, .. } => filename,
        }
    }

    pub fn ack(filename: &str, index: u32) -> Self {
        Self::FileAck {
            filename: filename.to_string(),
            index: i64::from(index),
        }
    }

    pub fn error(filename: &str, reason: impl Into<String>) -> Self {
        Self::FileError {
            filename: filename.to_string(),
            reason: reason.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Classification of one inbound payload on the upload sub-channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(FileMessage),
    /// A known `type` whose fields did not parse.
    Malformed {
        kind: String,
        filename: Option<String>,
        error: String,
    },
    Raw(String),
}

pub fn classify(payload: &str) -> Inbound {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return Inbound::Raw(payload.to_string());
    };
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) if KNOWN_TYPES.contains(&kind) => kind.to_string(),
        _ => return Inbound::Raw(payload.to_string()),
    };
    let filename = value
        .get("filename")
        .and_then(Value::as_str)
        .map(str::to_string);

    match serde_json::from_value::<FileMessage>(value) {
        Ok(message) => Inbound::Message(message),
        Err(e) => Inbound::Malformed {
            kind,
            filename,
            error: e.to_string(),
        },
    }
}
