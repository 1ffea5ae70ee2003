//! ffmpeg as the media source process.
//!
//! The encoder sends RTP to `127.0.0.1:<port>`, where the relay has already
//! bound a UDP socket. Each datagram is one unit. The child is spawned with
//! `kill_on_drop`, and [`SourceProcess::kill`] waits for it to exit before
//! the socket is dropped.

use super::MediaKind;
use super::source::{MediaSource, ReadOutcome, SourceProcess};
use crate::core::config::RELAY_READ_TIMEOUT;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Where the encoder captures from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceProfile {
    /// Synthetic lavfi source: test pattern for video, sine tone for audio.
    Test,
    V4l2(String),
    Alsa(String),
    Dshow(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceProfileError {
    #[error("unknown media source {0:?} (expected test, v4l2:<device>, alsa:<device> or dshow:<name>)")]
    Unknown(String),
    #[error("media source {profile} cannot capture {kind}")]
    Unsupported { profile: String, kind: MediaKind },
}

impl FromStr for SourceProfile {
    type Err = SourceProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "test" {
            return Ok(Self::Test);
        }
        let unknown = || SourceProfileError::Unknown(s.to_string());
        let (scheme, device) = s.split_once(':').ok_or_else(unknown)?;
        if device.is_empty() {
            return Err(unknown());
        }
        match scheme {
            "v4l2" => Ok(Self::V4l2(device.to_string())),
            "alsa" => Ok(Self::Alsa(device.to_string())),
            "dshow" => Ok(Self::Dshow(device.to_string())),
            _ => Err(unknown()),
        }
    }
}

impl TryFrom<String> for SourceProfile {
    type Error = SourceProfileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceProfile> for String {
    fn from(profile: SourceProfile) -> Self {
        profile.to_string()
    }
}

impl fmt::Display for SourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => f.write_str("test"),
            Self::V4l2(dev) => write!(f, "v4l2:{dev}"),
            Self::Alsa(dev) => write!(f, "alsa:{dev}"),
            Self::Dshow(name) => write!(f, "dshow:{name}"),
        }
    }
}

impl SourceProfile {
    pub fn supports(&self, kind: MediaKind) -> bool {
        match self {
            Self::Test | Self::Dshow(_) => true,
            Self::V4l2(_) => kind == MediaKind::Video,
            Self::Alsa(_) => kind == MediaKind::Audio,
        }
    }

    fn input_args(&self, kind: MediaKind) -> Vec<String> {
        let args: Vec<&str> = match (self, kind) {
            (Self::Test, MediaKind::Video) => {
                vec!["-re", "-f", "lavfi", "-i", "testsrc=size=640x480:rate=30"]
            }
            (Self::Test, MediaKind::Audio) => {
                vec!["-re", "-f", "lavfi", "-i", "sine=frequency=440:sample_rate=48000"]
            }
            (Self::V4l2(dev), _) => vec!["-f", "v4l2", "-i", dev.as_str()],
            (Self::Alsa(dev), _) => vec!["-f", "alsa", "-i", dev.as_str()],
            (Self::Dshow(name), kind) => {
                return vec![
                    "-f".into(),
                    "dshow".into(),
                    "-i".into(),
                    format!("{kind}={name}"),
                ];
            }
        };
        args.into_iter().map(String::from).collect()
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegSource {
    kind: MediaKind,
    profile: SourceProfile,
    port: u16,
    binary: PathBuf,
    log_output: bool,
}

impl FfmpegSource {
    pub fn new(
        kind: MediaKind,
        profile: SourceProfile,
        port: u16,
        binary: impl Into<PathBuf>,
        log_output: bool,
    ) -> Result<Self, SourceProfileError> {
        if !profile.supports(kind) {
            return Err(SourceProfileError::Unsupported {
                profile: profile.to_string(),
                kind,
            });
        }
        Ok(Self {
            kind,
            profile,
            port,
            binary: binary.into(),
            log_output,
        })
    }

    /// Full ffmpeg argument list.
    pub fn command_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-loglevel", "warning", "-hide_banner", "-nostats"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(self.profile.input_args(self.kind));

        let encoder: &[&str] = match self.kind {
            MediaKind::Video => &[
                "-c:v",
                "libvpx",
                "-deadline",
                "realtime",
                "-cpu-used",
                "8",
                "-video_size",
                "640x480",
                "-framerate",
                "30",
                "-b:v",
                "1.5M",
                "-an",
            ],
            MediaKind::Audio => &[
                "-c:a",
                "libopus",
                "-frame_duration",
                "20",
                "-application",
                "voip",
                "-b:a",
                "48k",
                "-vn",
            ],
        };
        args.extend(encoder.iter().map(|s| s.to_string()));
        args.push("-f".into());
        args.push("rtp".into());
        args.push(format!("rtp://127.0.0.1:{}", self.port));
        args
    }

    fn output(&self) -> Stdio {
        if self.log_output {
            Stdio::inherit()
        } else {
            Stdio::null()
        }
    }
}

#[async_trait]
impl MediaSource for FfmpegSource {
    async fn spawn(&self) -> io::Result<Box<dyn SourceProcess>> {
        // Bind first so no early packet is lost and a busy port fails fast.
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))).await?;

        let args = self.command_args();
        debug!(event = "ffmpeg_spawn", kind = %self.kind, binary = %self.binary.display(), args = ?args);
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(self.output())
            .stderr(self.output())
            .kill_on_drop(true)
            .spawn()?;

        info!(
            event = "ffmpeg_started",
            kind = %self.kind,
            source = %self.profile,
            port = self.port,
            pid = child.id().unwrap_or_default()
        );
        Ok(Box::new(FfmpegProcess {
            kind: self.kind,
            child,
            socket: Some(socket),
        }))
    }
}

struct FfmpegProcess {
    kind: MediaKind,
    child: Child,
    socket: Option<UdpSocket>,
}

#[async_trait]
impl SourceProcess for FfmpegProcess {
    async fn read_unit(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(ReadOutcome::Closed);
        };
        match tokio::time::timeout(RELAY_READ_TIMEOUT, socket.recv_from(buf)).await {
            Ok(Ok((n, _))) => Ok(ReadOutcome::Unit(n)),
            Ok(Err(e)) => Err(e),
            Err(_) => match self.child.try_wait()? {
                Some(status) => {
                    info!(event = "ffmpeg_exited", kind = %self.kind, status = %status);
                    Ok(ReadOutcome::Closed)
                }
                None => Ok(ReadOutcome::Timeout),
            },
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        let result = match self.child.try_wait()? {
            Some(_) => Ok(()),
            None => self.child.kill().await,
        };
        self.socket = None;
        debug!(event = "ffmpeg_killed", kind = %self.kind);
        result
    }
}
