//! Live media relay from an external encoder into an outbound track.

pub mod ffmpeg;
pub mod pipeline;
pub mod source;

pub use pipeline::MediaPipeline;

use crate::core::config::{AUDIO_FRAME_DURATION, VIDEO_FRAME_DURATION};
use crate::core::session::transport::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Interval the encoder is configured to emit units at.
    pub fn frame_duration(self) -> Duration {
        match self {
            Self::Audio => AUDIO_FRAME_DURATION,
            Self::Video => VIDEO_FRAME_DURATION,
        }
    }

    /// Track identity announced to the remote peer.
    pub fn track_spec(self) -> TrackSpec {
        match self {
            Self::Audio => TrackSpec {
                kind: self,
                id: "audio".into(),
                stream_id: "microphone".into(),
            },
            Self::Video => TrackSpec {
                kind: self,
                id: "video".into(),
                stream_id: "camera".into(),
            },
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpec {
    pub kind: MediaKind,
    pub id: String,
    pub stream_id: String,
}

/// One encoded unit read from the media source.
///
/// `duration` is the encoder's frame interval. Packet-based tracks carry
/// their own timing and may ignore it.
#[derive(Debug, Clone)]
pub struct MediaUnit {
    pub data: Bytes,
    pub duration: Duration,
}

/// Outbound media track owned by the session transport.
#[async_trait]
pub trait OutboundTrack: Send + Sync {
    async fn write_unit(&self, unit: MediaUnit) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("streaming already in progress")]
    AlreadyStreaming,
    #[error("track not created")]
    TrackNotCreated,
    #[error("failed to start media source: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("media source read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("track write failed: {0}")]
    Write(#[source] TransportError),
}
