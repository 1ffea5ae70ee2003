//! Single active real-time session: negotiation, teardown, and wiring of
//! the data channel, mux and media pipelines to session events.

pub mod link;
pub mod manager;
pub mod rtc;
pub mod transport;

pub use manager::SessionManager;
pub use transport::SessionDescription;
use transport::TransportError;

use crate::core::media::MediaKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("invalid session description type {0:?}, expected offer")]
    InvalidRole(String),
    #[error("failed to create peer connection: {0}")]
    CreateSession(#[source] TransportError),
    #[error("failed to create {kind} track: {source}")]
    CreateTrack {
        kind: MediaKind,
        source: TransportError,
    },
    #[error("failed to add {kind} track: {source}")]
    AttachTrack {
        kind: MediaKind,
        source: TransportError,
    },
    #[error("failed to set remote description: {0}")]
    SetRemoteDescription(#[source] TransportError),
    #[error("failed to create answer: {0}")]
    CreateAnswer(#[source] TransportError),
    #[error("failed to set local description: {0}")]
    SetLocalDescription(#[source] TransportError),
    #[error("ICE gathering failed: {0}")]
    Gathering(#[source] TransportError),
    #[error("no local description after ICE gathering")]
    MissingLocalDescription,
    #[error("negotiation task failed: {0}")]
    Interrupted(String),
}
