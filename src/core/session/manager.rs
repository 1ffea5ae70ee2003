//! Session lifecycle.
//!
//! `negotiate` runs entirely under one async mutex on a detached task: the
//! previous session is torn down before the new one is created, so callers
//! never observe a half-built session, and a caller that gives up midway
//! cannot leave one behind. Each session gets an event task that owns its
//! reaction to data-channel events; teardown fires the session's stop signal
//! and joins that task before touching the pipelines, so an outgoing session
//! can never restart media after it has been stopped.

use super::NegotiateError;
use super::link::DataLink;
use super::transport::{
    EventSender, SdpKind, SessionDescription, SessionEvent, SessionTransport, TransportError,
    TransportSession,
};
use crate::core::config::ICE_GATHER_TIMEOUT;
use crate::core::media::MediaPipeline;
use crate::core::mux::{ChannelMux, MessageSink, MuxError};
use crate::utils::sos::StopSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ActiveSession<S> {
    id: Uuid,
    transport: Arc<S>,
    stop: StopSignal,
    events: JoinHandle<()>,
}

pub struct SessionManager<T: SessionTransport> {
    shared: Arc<Shared<T>>,
    gather_timeout: Duration,
}

struct Shared<T: SessionTransport> {
    transport: T,
    pipelines: Arc<[MediaPipeline]>,
    link: Arc<DataLink>,
    mux: Arc<ChannelMux>,
    current: Mutex<Option<ActiveSession<T::Session>>>,
}

impl<T: SessionTransport> SessionManager<T> {
    /// `pipelines` holds one pipeline per enabled media kind.
    pub fn new(transport: T, pipelines: Vec<MediaPipeline>) -> Self {
        let link = Arc::new(DataLink::new());
        let sink: Arc<dyn MessageSink> = link.clone();
        Self {
            shared: Arc::new(Shared {
                transport,
                pipelines: Arc::from(pipelines),
                mux: Arc::new(ChannelMux::new(sink)),
                link,
                current: Mutex::new(None),
            }),
            gather_timeout: ICE_GATHER_TIMEOUT,
        }
    }

    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    /// Inbound messages of every session are dispatched through this mux.
    pub fn mux(&self) -> &Arc<ChannelMux> {
        &self.shared.mux
    }

    /// Replace any active session with one negotiated from `offer`.
    ///
    /// The swap runs on its own task: dropping the returned future does not
    /// interrupt teardown of the previous session or cleanup of a failed one.
    pub async fn negotiate(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiateError> {
        if offer.sdp_kind() != Some(SdpKind::Offer) {
            return Err(NegotiateError::InvalidRole(offer.kind));
        }

        let shared = Arc::clone(&self.shared);
        let gather_timeout = self.gather_timeout;
        match tokio::spawn(async move { shared.replace_session(offer, gather_timeout).await }).await
        {
            Ok(result) => result,
            Err(e) => Err(NegotiateError::Interrupted(e.to_string())),
        }
    }

    /// Send raw text on the current data channel, bypassing the mux.
    #[allow(dead_code)]
    pub async fn send_data(&self, text: &str) -> Result<(), MuxError> {
        debug!(event = "send_data", bytes = text.len());
        self.shared.link.send_text(text.to_string()).await
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link.is_connected()
    }

    /// Tear down the active session, if any. Runs to completion even if the
    /// caller is dropped.
    pub async fn shutdown(&self) {
        let shared = Arc::clone(&self.shared);
        if let Err(e) = tokio::spawn(async move { shared.shutdown().await }).await {
            warn!(event = "session_shutdown_failure", error = %e);
        }
    }
}

impl<T: SessionTransport> Shared<T> {
    async fn replace_session(
        &self,
        offer: SessionDescription,
        gather_timeout: Duration,
    ) -> Result<SessionDescription, NegotiateError> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            self.teardown(previous).await;
        }

        let id = Uuid::new_v4();
        info!(event = "negotiate_start", session = %id, "Negotiating new session");

        let transport = Arc::new(
            self.transport
                .create_session()
                .await
                .map_err(NegotiateError::CreateSession)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let answer = match self
            .establish(transport.as_ref(), offer, events_tx, gather_timeout)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(event = "negotiate_failure", session = %id, error = %e);
                if let Err(close_err) = transport.close().await {
                    debug!(event = "session_close_failure", session = %id, error = %close_err);
                }
                return Err(e);
            }
        };

        let stop = StopSignal::new();
        let events = tokio::spawn(run_events(
            id,
            events_rx,
            stop.clone(),
            Arc::clone(&self.link),
            Arc::clone(&self.mux),
            Arc::clone(&self.pipelines),
        ));
        *current = Some(ActiveSession {
            id,
            transport,
            stop,
            events,
        });

        info!(event = "negotiate_complete", session = %id, "Session established");
        Ok(answer)
    }

    async fn establish(
        &self,
        session: &T::Session,
        offer: SessionDescription,
        events: EventSender,
        gather_timeout: Duration,
    ) -> Result<SessionDescription, NegotiateError> {
        // Tracks must exist before the remote description is applied.
        for pipeline in self.pipelines.iter() {
            let kind = pipeline.kind();
            let track = pipeline
                .create_track(session)
                .map_err(|source| NegotiateError::CreateTrack { kind, source })?;
            session
                .add_track(track)
                .await
                .map_err(|source| NegotiateError::AttachTrack { kind, source })?;
            debug!(event = "track_attached", kind = %kind);
        }

        session.on_data_channel(events);

        session
            .set_remote_description(offer)
            .await
            .map_err(NegotiateError::SetRemoteDescription)?;
        let answer = session
            .create_answer()
            .await
            .map_err(NegotiateError::CreateAnswer)?;
        session
            .set_local_description(answer)
            .await
            .map_err(NegotiateError::SetLocalDescription)?;

        match tokio::time::timeout(gather_timeout, session.gathering_complete()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(NegotiateError::Gathering(e)),
            Err(_) => {
                return Err(NegotiateError::Gathering(TransportError::new(format!(
                    "timed out after {gather_timeout:?}"
                ))));
            }
        }

        session
            .local_description()
            .await
            .ok_or(NegotiateError::MissingLocalDescription)
    }

    /// Best-effort: every step runs even if an earlier one failed.
    async fn teardown(&self, session: ActiveSession<T::Session>) {
        info!(event = "session_teardown", session = %session.id, "Tearing down session");

        session.stop.fire();
        if let Err(e) = session.events.await {
            warn!(event = "session_events_join_failure", session = %session.id, error = %e);
        }

        stop_pipelines(&self.pipelines).await;

        if let Some(channel) = self.link.take() {
            if let Err(e) = channel.close().await {
                warn!(event = "data_channel_close_failure", session = %session.id, error = %e);
            }
        }

        if let Err(e) = session.transport.close().await {
            warn!(event = "session_close_failure", session = %session.id, error = %e);
        }
    }

    async fn shutdown(&self) {
        let mut current = self.current.lock().await;
        if let Some(session) = current.take() {
            self.teardown(session).await;
        }
    }
}

async fn start_pipelines(pipelines: &[MediaPipeline]) {
    for pipeline in pipelines {
        if let Err(e) = pipeline.start().await {
            warn!(event = "pipeline_start_failure", kind = %pipeline.kind(), error = %e);
        }
    }
}

async fn stop_pipelines(pipelines: &[MediaPipeline]) {
    for pipeline in pipelines {
        pipeline.stop().await;
    }
}

async fn run_events(
    id: Uuid,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    stop: StopSignal,
    link: Arc<DataLink>,
    mux: Arc<ChannelMux>,
    pipelines: Arc<[MediaPipeline]>,
) {
    loop {
        let event = select! {
            biased;
            _ = stop.wait() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            SessionEvent::DataChannel(channel) => {
                info!(event = "data_channel_received", session = %id, label = %channel.label());
                if let Some(previous) = link.set(channel) {
                    debug!(event = "data_channel_replaced", session = %id, label = %previous.label());
                }
            }
            SessionEvent::ChannelOpened => {
                info!(event = "data_channel_open", session = %id, "Data channel opened");
                start_pipelines(&pipelines).await;
            }
            SessionEvent::ChannelClosed => {
                info!(event = "data_channel_closed", session = %id, "Data channel closed by peer");
                stop_pipelines(&pipelines).await;
            }
            SessionEvent::Message(text) => mux.dispatch(&text),
        }
    }
    debug!(event = "session_events_stopped", session = %id);
}
