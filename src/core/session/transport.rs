//! Capabilities the session manager consumes from the real-time transport.
//!
//! Transport callbacks never touch manager state directly. They push a
//! [`SessionEvent`] into the per-session channel handed to
//! [`TransportSession::on_data_channel`], and the manager's event task reacts.

use crate::core::media::{OutboundTrack, TrackSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque failure reported by the transport stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl FromStr for SdpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(Self::Offer),
            "answer" => Ok(Self::Answer),
            "pranswer" => Ok(Self::Pranswer),
            "rollback" => Ok(Self::Rollback),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        })
    }
}

/// A session description as exchanged over signalling. `kind` stays a raw
/// string so an unexpected role reaches the manager and is rejected there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn sdp_kind(&self) -> Option<SdpKind> {
        self.kind.parse().ok()
    }
}

/// Events raised by the transport for one session.
pub enum SessionEvent {
    /// The remote peer opened a data channel.
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpened,
    ChannelClosed,
    Message(String),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataChannel(dc) => write!(f, "DataChannel({})", dc.label()),
            Self::ChannelOpened => f.write_str("ChannelOpened"),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::Message(m) => write!(f, "Message({} bytes)", m.len()),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory for transport sessions.
#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    type Session: TransportSession;

    async fn create_session(&self) -> Result<Self::Session, TransportError>;
}

/// One negotiated connection.
#[async_trait]
pub trait TransportSession: Send + Sync + 'static {
    type Track: OutboundTrack + 'static;

    fn create_track(&self, spec: &TrackSpec) -> Result<Arc<Self::Track>, TransportError>;

    /// Must be called before [`set_remote_description`](Self::set_remote_description).
    async fn add_track(&self, track: Arc<Self::Track>) -> Result<(), TransportError>;

    /// Route this session's data-channel events into `events`.
    fn on_data_channel(&self, events: EventSender);

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Resolve once candidate gathering has finished.
    async fn gathering_complete(&self) -> Result<(), TransportError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self) -> Result<(), TransportError>;
}
