//! Session transport backed by `webrtc-rs`.
//!
//! The device is publicly reachable, so by default it runs ICE-lite and
//! answers with host candidates only.

use super::transport::{
    DataChannel, EventSender, SdpKind, SessionDescription, SessionEvent, SessionTransport,
    TransportError, TransportSession,
};
use crate::core::config::RELAY_BUFFER_SIZE;
use crate::core::media::{MediaKind, MediaUnit, OutboundTrack, TrackSpec};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        TransportError::new(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RtcOptions {
    pub ice_lite: bool,
    pub stun_servers: Vec<String>,
}

impl Default for RtcOptions {
    fn default() -> Self {
        Self {
            ice_lite: true,
            stun_servers: Vec::new(),
        }
    }
}

pub struct WebRtcTransport {
    api: API,
    options: RtcOptions,
}

impl WebRtcTransport {
    pub fn new(options: RtcOptions) -> Result<Self, TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;

        let mut settings = SettingEngine::default();
        settings.set_lite(options.ice_lite);

        let api = APIBuilder::new()
            .with_setting_engine(settings)
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        info!(
            event = "webrtc_api_ready",
            ice_lite = options.ice_lite,
            stun_servers = options.stun_servers.len()
        );
        Ok(Self { api, options })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.options.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.options.stun_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionTransport for WebRtcTransport {
    type Session = WebRtcSession;

    async fn create_session(&self) -> Result<WebRtcSession, TransportError> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", "Peer connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", "Peer connection failed");
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", "Peer connection disconnected");
                    }
                    RTCPeerConnectionState::Closed => {
                        info!(event = "webrtc_closed", "Peer connection closed");
                    }
                    other => debug!(event = "webrtc_state", state = %other),
                }
            })
        }));

        Ok(WebRtcSession {
            pc,
            gathering: Mutex::new(None),
        })
    }
}

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let sdp = desc.sdp;
    let rtc = match desc.kind.parse::<SdpKind>() {
        Ok(SdpKind::Offer) => RTCSessionDescription::offer(sdp)?,
        Ok(SdpKind::Answer) => RTCSessionDescription::answer(sdp)?,
        Ok(SdpKind::Pranswer) => RTCSessionDescription::pranswer(sdp)?,
        Ok(SdpKind::Rollback) | Err(_) => {
            return Err(TransportError::new(format!(
                "unsupported session description type {:?}",
                desc.kind
            )));
        }
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    SessionDescription {
        kind: desc.sdp_type.to_string(),
        sdp: desc.sdp,
    }
}

#[async_trait]
impl TransportSession for WebRtcSession {
    type Track = RtpTrack;

    fn create_track(&self, spec: &TrackSpec) -> Result<Arc<RtpTrack>, TransportError> {
        let track = TrackLocalStaticRTP::new(
            codec_for(spec.kind),
            spec.id.clone(),
            spec.stream_id.clone(),
        );
        Ok(Arc::new(RtpTrack {
            inner: Arc::new(track),
        }))
    }

    async fn add_track(&self, track: Arc<RtpTrack>) -> Result<(), TransportError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.inner.clone();
        let sender = self.pc.add_track(local).await?;

        // Interceptors only see RTCP if someone reads it.
        tokio::spawn(async move {
            let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    fn on_data_channel(&self, events: EventSender) {
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                Box::pin(async move {
                    info!(event = "dc_announced", channel = %dc.label(), id = dc.id());
                    let _ = events.send(SessionEvent::DataChannel(Arc::new(RtcDataChannel {
                        inner: dc.clone(),
                    })));
                    attach_channel_handlers(&dc, events);
                })
            }));
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Ok(from_rtc(self.pc.create_answer(None).await?))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        // The promise must exist before gathering can start.
        let done = self.pc.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(done);
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn gathering_complete(&self) -> Result<(), TransportError> {
        let pending = self.gathering.lock().await.take();
        match pending {
            Some(mut done) => {
                // The sender is dropped once gathering completes.
                let _ = done.recv().await;
                Ok(())
            }
            None if self.pc.ice_gathering_state() == RTCIceGatheringState::Complete => Ok(()),
            None => Err(TransportError::new("local description not set")),
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.map(from_rtc)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn attach_channel_handlers(dc: &Arc<RTCDataChannel>, events: EventSender) {
    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            let _ = tx.send(SessionEvent::Message(text));
        })
    }));

    let label = dc.label().to_string();
    dc.on_error(Box::new(move |err| {
        let label = label.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %label, %err, "Data channel transport error");
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(SessionEvent::ChannelClosed);
        })
    }));

    // Registered last: fires immediately if the channel is already open.
    dc.on_open(Box::new(move || {
        let tx = events.clone();
        Box::pin(async move {
            let _ = tx.send(SessionEvent::ChannelOpened);
        })
    }));
}

pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.inner.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await?;
        Ok(())
    }
}

/// RTP track fed with packets straight from the encoder.
pub struct RtpTrack {
    inner: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl OutboundTrack for RtpTrack {
    async fn write_unit(&self, unit: MediaUnit) -> Result<(), TransportError> {
        self.inner.write(&unit.data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::SessionManager;

    #[test]
    fn converts_descriptions_by_type() {
        let bad = SessionDescription {
            kind: "rollback".into(),
            sdp: String::new(),
        };
        assert!(to_rtc(bad).is_err());

        let rtc = RTCSessionDescription::answer("v=0\r\n".into());
        if let Ok(rtc) = rtc {
            let desc = from_rtc(rtc);
            assert_eq!(desc.sdp_kind(), Some(SdpKind::Answer));
        }
    }

    #[test]
    fn codecs_match_encoder_output() {
        assert_eq!(codec_for(MediaKind::Video).mime_type, MIME_TYPE_VP8);
        let opus = codec_for(MediaKind::Audio);
        assert_eq!(opus.mime_type, MIME_TYPE_OPUS);
        assert_eq!(opus.clock_rate, 48000);
    }

    #[tokio::test]
    async fn answers_a_browser_style_offer() {
        let transport = WebRtcTransport::new(RtcOptions::default()).unwrap();
        let manager = SessionManager::new(transport, Vec::new());

        let mut media = MediaEngine::default();
        media.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media).build();
        let browser = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        browser.create_data_channel("data", None).await.unwrap();
        let offer = browser.create_offer(None).await.unwrap();
        let mut gathered = browser.gathering_complete_promise().await;
        browser.set_local_description(offer).await.unwrap();
        let _ = gathered.recv().await;
        let offer = from_rtc(browser.local_description().await.unwrap());

        let answer = manager.negotiate(offer).await.unwrap();
        assert_eq!(answer.sdp_kind(), Some(SdpKind::Answer));
        assert!(answer.sdp.contains("m=application"));

        manager.shutdown().await;
        browser.close().await.unwrap();
    }
}
