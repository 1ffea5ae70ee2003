//! Sub-channel multiplexing over a single text data channel.
//!
//! # Wire format
//!
//! ```text
//! <6-byte sub-channel id><payload>
//! ```
//!
//! There is no delimiter and no escaping. Ids are reserved by the protocol;
//! a payload that itself begins with a registered id is delivered to that id
//! (see DESIGN.md, open questions).
//!
//! Inbound messages whose prefix has no registration are dropped for routed
//! consumers. Generic consumers registered with [`ChannelMux::on_any`] see
//! every inbound message untouched, routed or not.

use crate::core::config::SUB_CHANNEL_ID_LENGTH;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Callback invoked with an inbound payload.
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("sub-channel id must be exactly 6 bytes, got {0:?}")]
    InvalidId(String),
    #[error("data channel is not available")]
    NotConnected,
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("data channel send failed: {0}")]
    Send(String),
}

/// Outbound side of the physical data channel.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), MuxError>;
}

fn validate_id(id: &str) -> Result<(), MuxError> {
    if id.len() == SUB_CHANNEL_ID_LENGTH {
        Ok(())
    } else {
        Err(MuxError::InvalidId(id.to_string()))
    }
}

pub struct ChannelMux {
    sink: Arc<dyn MessageSink>,
    routes: RwLock<HashMap<String, Vec<MessageCallback>>>,
    generic: RwLock<Vec<MessageCallback>>,
}

impl ChannelMux {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            routes: RwLock::new(HashMap::new()),
            generic: RwLock::new(Vec::new()),
        }
    }

    /// Register `on_message` for sub-channel `id`. Registrations persist for
    /// the life of the mux; several callbacks may share one id.
    pub fn register(&self, id: &str, on_message: MessageCallback) -> Result<(), MuxError> {
        validate_id(id)?;
        if let Ok(mut routes) = self.routes.write() {
            routes.entry(id.to_string()).or_default().push(on_message);
        }
        Ok(())
    }

    /// Register a consumer that receives every inbound message verbatim.
    pub fn on_any(&self, on_message: MessageCallback) {
        if let Ok(mut generic) = self.generic.write() {
            generic.push(on_message);
        }
    }

    /// Route one inbound message.
    ///
    /// Callback lists are cloned out of the lock before invocation, so a
    /// callback may register further sub-channels without deadlocking.
    pub fn dispatch(&self, raw: &str) {
        let generic: Vec<MessageCallback> = self
            .generic
            .read()
            .map(|g| g.clone())
            .unwrap_or_default();
        for callback in &generic {
            callback(raw);
        }

        let Some(id) = raw.get(..SUB_CHANNEL_ID_LENGTH) else {
            trace!(event = "mux_short_message", bytes = raw.len(), "Message shorter than sub-channel id");
            return;
        };

        let routed: Option<Vec<MessageCallback>> = self
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(id).cloned());

        match routed {
            Some(callbacks) => {
                let payload = &raw[SUB_CHANNEL_ID_LENGTH..];
                for callback in &callbacks {
                    callback(payload);
                }
            }
            None => {
                trace!(event = "mux_unrouted", sub_channel = %id, "No registration for sub-channel");
            }
        }
    }

    /// Send `payload` on sub-channel `id` as `<id><payload>`.
    pub async fn send(&self, id: &str, payload: &str) -> Result<(), MuxError> {
        validate_id(id)?;
        let mut framed = String::with_capacity(id.len() + payload.len());
        framed.push_str(id);
        framed.push_str(payload);
        self.sink.send_text(framed).await
    }

    /// Open a handle bound to one sub-channel id.
    pub fn open_channel(self: &Arc<Self>, id: &str) -> Result<SubChannel, MuxError> {
        validate_id(id)?;
        Ok(SubChannel {
            mux: Arc::clone(self),
            id: id.to_string(),
        })
    }
}

/// A logical channel multiplexed over the physical data channel.
#[derive(Clone)]
pub struct SubChannel {
    mux: Arc<ChannelMux>,
    id: String,
}

impl SubChannel {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn on_message(&self, on_message: MessageCallback) {
        // The id was validated when the handle was opened.
        if let Err(e) = self.mux.register(&self.id, on_message) {
            warn!(event = "sub_channel_register_failure", sub_channel = %self.id, error = %e);
        }
    }

    /// Deliver this sub-channel's payloads, in arrival order, to a queue.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_message(Arc::new(move |payload: &str| {
            let _ = tx.send(payload.to_string());
        }));
        rx
    }

    pub async fn send(&self, payload: &str) -> Result<(), MuxError> {
        self.mux.send(&self.id, payload).await
    }
}
