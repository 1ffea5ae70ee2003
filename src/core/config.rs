//! Centralized configuration constants for pilink.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Values that operators are expected to change (ports,
//! devices, directories) are exposed through `workers::args` instead.

use std::time::Duration;

// ── Channel Multiplexing ─────────────────────────────────────────────────────

/// Length in bytes of the sub-channel id that prefixes every mux message.
pub const SUB_CHANNEL_ID_LENGTH: usize = 6;

/// Sub-channel used by the browser uploader when nothing else is configured.
pub const DEFAULT_UPLOAD_CHANNEL: &str = "123456";

// ── File Transfer ────────────────────────────────────────────────────────────

/// Default destination root for received files.
pub const DEFAULT_UPLOAD_DIR: &str = "./received_files";

/// Default idle time after which an abandoned transfer is discarded.
pub const DEFAULT_TRANSFER_IDLE_SECS: u64 = 300;

/// How often the idle-transfer sweeper wakes up.
pub const TRANSFER_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

// ── Media Relay ──────────────────────────────────────────────────────────────

/// Local UDP port the video encoder sends RTP to.
pub const DEFAULT_VIDEO_PORT: u16 = 5004;

/// Local UDP port the audio encoder sends RTP to.
pub const DEFAULT_AUDIO_PORT: u16 = 5006;

/// Relay read buffer. 1500 bytes covers a single RTP packet at Ethernet MTU.
pub const RELAY_BUFFER_SIZE: usize = 1500;

/// Read deadline on the relay socket; a timeout is only a chance to
/// observe the stop signal and encoder liveness.
pub const RELAY_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Opus frame interval configured on the audio encoder.
pub const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);

/// Frame interval for the 30 fps video encoder.
pub const VIDEO_FRAME_DURATION: Duration = Duration::from_millis(33);

/// Default encoder binary.
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";

// ── Connection / Network ─────────────────────────────────────────────────────

/// Default port of the HTTP signalling endpoint.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Upper bound on ICE candidate gathering before the answer is returned.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);
