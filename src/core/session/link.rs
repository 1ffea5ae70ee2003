//! The current session's data channel, shared with the mux as its sink.

use super::transport::DataChannel;
use crate::core::mux::{MessageSink, MuxError};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tracing::trace;

#[derive(Default)]
pub struct DataLink {
    channel: RwLock<Option<Arc<dyn DataChannel>>>,
}

impl DataLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `channel`, returning whatever it replaced.
    pub fn set(&self, channel: Arc<dyn DataChannel>) -> Option<Arc<dyn DataChannel>> {
        self.channel
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .replace(channel)
    }

    pub fn take(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.write().unwrap_or_else(|p| p.into_inner()).take()
    }

    pub fn current(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|dc| dc.is_open())
    }
}

#[async_trait]
impl MessageSink for DataLink {
    async fn send_text(&self, text: String) -> Result<(), MuxError> {
        let channel = self.current().ok_or(MuxError::NotConnected)?;
        if !channel.is_open() {
            return Err(MuxError::ChannelNotOpen);
        }
        trace!(event = "data_channel_send", bytes = text.len());
        channel
            .send_text(text)
            .await
            .map_err(|e| MuxError::Send(e.to_string()))
    }
}
