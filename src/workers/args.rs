//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`config.toml` or `--config <path>`)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{
    DEFAULT_AUDIO_PORT, DEFAULT_FFMPEG_BIN, DEFAULT_HTTP_PORT, DEFAULT_TRANSFER_IDLE_SECS,
    DEFAULT_UPLOAD_CHANNEL, DEFAULT_UPLOAD_DIR, DEFAULT_VIDEO_PORT, ICE_GATHER_TIMEOUT,
};
use crate::core::media::ffmpeg::SourceProfile;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// pilink - WebRTC camera/microphone relay and file drop.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[serde(default, rename_all = "kebab-case")]
pub struct Args {
    /// TOML configuration file. Defaults to ./config.toml when present.
    #[clap(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// HTTP signalling port [default: 8080].
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Address the signalling endpoint binds to [default: 0.0.0.0].
    #[clap(long)]
    pub bind: Option<IpAddr>,

    /// Do not stream video.
    #[clap(long)]
    pub no_video: bool,

    /// Do not stream audio.
    #[clap(long)]
    pub no_audio: bool,

    /// Video capture source: test, v4l2:<device> or dshow:<name> [default: test].
    #[clap(long)]
    pub video_source: Option<SourceProfile>,

    /// Audio capture source: test, alsa:<device> or dshow:<name> [default: test].
    #[clap(long)]
    pub audio_source: Option<SourceProfile>,

    /// Local UDP port the video encoder sends RTP to [default: 5004].
    #[clap(long)]
    pub video_port: Option<u16>,

    /// Local UDP port the audio encoder sends RTP to [default: 5006].
    #[clap(long)]
    pub audio_port: Option<u16>,

    /// Path to the ffmpeg binary [default: ffmpeg].
    #[clap(long)]
    pub ffmpeg: Option<PathBuf>,

    /// Let ffmpeg write to this process's stdout/stderr.
    #[clap(long)]
    pub ffmpeg_log: bool,

    /// Directory received files are written under [default: ./received_files].
    #[clap(long)]
    pub upload_dir: Option<PathBuf>,

    /// Sub-channel id used by the uploader [default: 123456].
    #[clap(long)]
    pub upload_channel: Option<String>,

    /// Seconds without chunk activity before a transfer is dropped; 0 disables [default: 300].
    #[clap(long)]
    pub transfer_idle_secs: Option<u64>,

    /// Run ICE-lite, answering with host candidates only [default: true].
    #[clap(long, value_name = "BOOL")]
    pub ice_lite: Option<bool>,

    /// Seconds to wait for ICE candidate gathering before failing an offer [default: 15].
    #[clap(long)]
    pub gather_timeout_secs: Option<u64>,

    /// STUN server URL. May be repeated.
    #[clap(long = "stun", value_name = "URL")]
    pub stun: Vec<String>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also append logs to this file.
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        let mut cli_args = Args::parse();
        cli_args.upload_dir = cli_args.upload_dir.map(Self::resolve_path);
        cli_args.log_file = cli_args.log_file.map(Self::resolve_path);

        let file_args = match &cli_args.config {
            Some(path) => Some(Self::from_file(path)?),
            None => {
                let default_path = PathBuf::from("config.toml");
                if default_path.exists() {
                    Some(Self::from_file(&default_path)?)
                } else {
                    None
                }
            }
        };

        Ok(match file_args {
            Some(file_args) => Self::merge(file_args, cli_args),
            None => cli_args,
        })
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Args>(content)?)
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.config.is_some() {
            file.config = cli.config;
        }
        if cli.port.is_some() {
            file.port = cli.port;
        }
        if cli.bind.is_some() {
            file.bind = cli.bind;
        }
        if cli.no_video {
            file.no_video = true;
        }
        if cli.no_audio {
            file.no_audio = true;
        }
        if cli.video_source.is_some() {
            file.video_source = cli.video_source;
        }
        if cli.audio_source.is_some() {
            file.audio_source = cli.audio_source;
        }
        if cli.video_port.is_some() {
            file.video_port = cli.video_port;
        }
        if cli.audio_port.is_some() {
            file.audio_port = cli.audio_port;
        }
        if cli.ffmpeg.is_some() {
            file.ffmpeg = cli.ffmpeg;
        }
        if cli.ffmpeg_log {
            file.ffmpeg_log = true;
        }
        if cli.upload_dir.is_some() {
            file.upload_dir = cli.upload_dir;
        }
        if cli.upload_channel.is_some() {
            file.upload_channel = cli.upload_channel;
        }
        if cli.transfer_idle_secs.is_some() {
            file.transfer_idle_secs = cli.transfer_idle_secs;
        }
        if cli.ice_lite.is_some() {
            file.ice_lite = cli.ice_lite;
        }
        if cli.gather_timeout_secs.is_some() {
            file.gather_timeout_secs = cli.gather_timeout_secs;
        }
        if !cli.stun.is_empty() {
            file.stun = cli.stun;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.log_file.is_some() {
            file.log_file = cli.log_file;
        }
        file
    }

    // ── Resolved settings ────────────────────────────────────────────────────

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            self.port.unwrap_or(DEFAULT_HTTP_PORT),
        )
    }

    pub fn video_profile(&self) -> SourceProfile {
        self.video_source.clone().unwrap_or(SourceProfile::Test)
    }

    pub fn audio_profile(&self) -> SourceProfile {
        self.audio_source.clone().unwrap_or(SourceProfile::Test)
    }

    pub fn video_rtp_port(&self) -> u16 {
        self.video_port.unwrap_or(DEFAULT_VIDEO_PORT)
    }

    pub fn audio_rtp_port(&self) -> u16 {
        self.audio_port.unwrap_or(DEFAULT_AUDIO_PORT)
    }

    pub fn ffmpeg_binary(&self) -> PathBuf {
        self.ffmpeg
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_BIN))
    }

    pub fn upload_root(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR))
    }

    pub fn upload_channel_id(&self) -> &str {
        self.upload_channel
            .as_deref()
            .unwrap_or(DEFAULT_UPLOAD_CHANNEL)
    }

    /// `None` when idle expiry is disabled.
    pub fn transfer_max_idle(&self) -> Option<Duration> {
        match self.transfer_idle_secs.unwrap_or(DEFAULT_TRANSFER_IDLE_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn ice_lite(&self) -> bool {
        self.ice_lite.unwrap_or(true)
    }

    pub fn gather_timeout(&self) -> Duration {
        self.gather_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(ICE_GATHER_TIMEOUT)
    }
}
