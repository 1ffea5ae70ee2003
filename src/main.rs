mod core;
mod utils;
mod workers;

use crate::core::media::MediaKind;
use crate::core::media::ffmpeg::{FfmpegSource, SourceProfile};
use crate::core::media::pipeline::MediaPipeline;
use crate::core::session::SessionManager;
use crate::core::session::rtc::{RtcOptions, WebRtcTransport};
use crate::core::signalling::{self, Negotiator};
use crate::core::transfer::{TransferRegistry, spawn_upload_listener};
use crate::utils::file_log::FileLogLayer;
use crate::utils::sos::StopSignal;
use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workers::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load()?;

    // webrtc_ice reports late STUN responses as "unknown TransactionID"
    // warnings; keep the agent quiet unless tracing everything.
    let filter = match args.verbose {
        0 => "warn,pilink=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let file_layer = args
        .log_file
        .as_deref()
        .map(FileLogLayer::new)
        .transpose()
        .context("Failed to open log file")?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let mut pipelines = Vec::new();
    if !args.no_video {
        pipelines.push(media_pipeline(
            &args,
            MediaKind::Video,
            args.video_profile(),
            args.video_rtp_port(),
        )?);
    }
    if !args.no_audio {
        pipelines.push(media_pipeline(
            &args,
            MediaKind::Audio,
            args.audio_profile(),
            args.audio_rtp_port(),
        )?);
    }

    let transport = WebRtcTransport::new(RtcOptions {
        ice_lite: args.ice_lite(),
        stun_servers: args.stun.clone(),
    })
    .context("Failed to initialize WebRTC API")?;
    let manager = Arc::new(
        SessionManager::new(transport, pipelines).with_gather_timeout(args.gather_timeout()),
    );

    manager.mux().on_any(Arc::new(log_data_channel_message));

    let stop = StopSignal::new();

    let upload_root = args.upload_root();
    let uploads = manager
        .mux()
        .open_channel(args.upload_channel_id())
        .context("Invalid upload channel id")?;
    let upload_task = spawn_upload_listener(
        uploads,
        Arc::new(TransferRegistry::new(&upload_root)),
        args.transfer_max_idle(),
        stop.clone(),
    );
    info!(
        event = "upload_ready",
        channel = args.upload_channel_id(),
        dir = %upload_root.display(),
        "Accepting uploads"
    );

    let stop_on_ctrl_c = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!(event = "shutdown_requested", "Ctrl+C received, shutting down");
        stop_on_ctrl_c.fire();
    });

    let server_stop = stop.clone();
    let negotiator: Arc<dyn Negotiator> = manager.clone();
    let served = signalling::serve(args.http_addr(), negotiator, async move {
        server_stop.wait().await
    })
    .await;

    stop.fire();
    info!(
        event = "session_closing",
        connected = manager.is_connected(),
        "Closing active session"
    );
    manager.shutdown().await;
    if let Err(e) = upload_task.await {
        warn!(event = "upload_listener_panicked", error = %e);
    }
    info!(event = "shutdown_complete", "Bye");
    served
}

/// Upload chunks carry whole base64 payloads; keep them out of `info` output.
fn log_data_channel_message(raw: &str) {
    debug!(event = "data_channel_message", bytes = raw.len(), payload = %raw);
}

fn media_pipeline(
    args: &Args,
    kind: MediaKind,
    profile: SourceProfile,
    port: u16,
) -> anyhow::Result<MediaPipeline> {
    let source = FfmpegSource::new(kind, profile, port, args.ffmpeg_binary(), args.ffmpeg_log)
        .with_context(|| format!("Invalid {kind} source"))?;
    Ok(MediaPipeline::new(kind, Arc::new(source)))
}
