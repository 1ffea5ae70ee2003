//! Per-kind relay from a media source process into an outbound track.
//!
//! Each `start` allocates a fresh [`StopSignal`] and spawns one relay task
//! that owns the source process for its whole life. `stop` fires the signal
//! and awaits the task, which kills the process on its way out, so once
//! `stop` returns the encoder is gone and its local port is free again.

use super::source::{MediaSource, ReadOutcome, SourceProcess};
use super::{MediaKind, MediaUnit, OutboundTrack, PipelineError};
use crate::core::config::RELAY_BUFFER_SIZE;
use crate::core::session::transport::{TransportError, TransportSession};
use crate::utils::sos::StopSignal;
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Running {
    stop: StopSignal,
    task: JoinHandle<()>,
}

pub struct MediaPipeline {
    kind: MediaKind,
    source: Arc<dyn MediaSource>,
    track: StdMutex<Option<Arc<dyn OutboundTrack>>>,
    running: Mutex<Option<Running>>,
}

impl MediaPipeline {
    pub fn new(kind: MediaKind, source: Arc<dyn MediaSource>) -> Self {
        Self {
            kind,
            source,
            track: StdMutex::new(None),
            running: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Create this pipeline's outbound track on `session` and make it the
    /// relay target. The caller attaches the returned track to the session.
    pub fn create_track<S: TransportSession>(
        &self,
        session: &S,
    ) -> Result<Arc<S::Track>, TransportError> {
        let track = session.create_track(&self.kind.track_spec())?;
        let outbound: Arc<dyn OutboundTrack> = track.clone();
        self.bind_track(outbound);
        Ok(track)
    }

    pub(crate) fn bind_track(&self, track: Arc<dyn OutboundTrack>) {
        *self.track.lock().unwrap_or_else(|p| p.into_inner()) = Some(track);
    }

    fn current_track(&self) -> Option<Arc<dyn OutboundTrack>> {
        self.track.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Launch the source and begin relaying. Returns without waiting for
    /// the relay; spawn failures inside the task are logged.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(PipelineError::AlreadyStreaming);
        }
        let track = self.current_track().ok_or(PipelineError::TrackNotCreated)?;

        // A previous run that ended on its own has already killed its
        // process; joining it just reaps the task.
        if let Some(previous) = running.take() {
            let _ = previous.task.await;
        }

        let stop = StopSignal::new();
        let task = tokio::spawn(relay(
            self.kind,
            Arc::clone(&self.source),
            track,
            stop.clone(),
        ));
        *running = Some(Running { stop, task });
        debug!(event = "pipeline_start_requested", kind = %self.kind);
        Ok(())
    }

    /// Stop relaying and terminate the source. A no-op when not running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return;
        };
        run.stop.fire();
        if let Err(e) = run.task.await {
            warn!(event = "pipeline_join_failure", kind = %self.kind, error = %e);
        }
        info!(event = "pipeline_stopped", kind = %self.kind);
    }
}

#[cfg(test)]
impl MediaPipeline {
    pub(crate) async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }
}

async fn relay(
    kind: MediaKind,
    source: Arc<dyn MediaSource>,
    track: Arc<dyn OutboundTrack>,
    stop: StopSignal,
) {
    let mut process = match source.spawn().await {
        Ok(process) => process,
        Err(e) => {
            let e = PipelineError::Spawn(e);
            error!(event = "pipeline_spawn_failure", kind = %kind, error = %e);
            return;
        }
    };
    info!(event = "pipeline_started", kind = %kind);

    let result = pump(process.as_mut(), track.as_ref(), &stop, kind.frame_duration()).await;

    if let Err(e) = process.kill().await {
        warn!(event = "source_kill_failure", kind = %kind, error = %e);
    }

    match result {
        Ok(()) => debug!(event = "relay_finished", kind = %kind),
        Err(e) => error!(event = "relay_failure", kind = %kind, error = %e),
    }
}

async fn pump(
    process: &mut dyn SourceProcess,
    track: &dyn OutboundTrack,
    stop: &StopSignal,
    frame_duration: Duration,
) -> Result<(), PipelineError> {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let outcome = select! {
            biased;
            _ = stop.wait() => return Ok(()),
            outcome = process.read_unit(&mut buf) => outcome.map_err(PipelineError::Read)?,
        };

        match outcome {
            ReadOutcome::Timeout => continue,
            ReadOutcome::Closed => return Ok(()),
            ReadOutcome::Unit(n) => {
                let unit = MediaUnit {
                    data: Bytes::copy_from_slice(&buf[..n]),
                    duration: frame_duration,
                };
                track.write_unit(unit).await.map_err(PipelineError::Write)?;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::config::AUDIO_FRAME_DURATION;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    pub(crate) enum Feed {
        Unit(Vec<u8>),
        Close,
        Fail,
    }

    /// Source whose processes read from one shared feed.
    pub(crate) struct FakeSource {
        feed: Arc<Mutex<mpsc::UnboundedReceiver<Feed>>>,
        pub spawned: AtomicUsize,
        pub live: Arc<AtomicUsize>,
        pub fail_spawn: AtomicBool,
        /// Milliseconds each process takes to die once killed.
        pub kill_delay_ms: Arc<AtomicU64>,
    }

    impl FakeSource {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Feed>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let source = Arc::new(Self {
                feed: Arc::new(Mutex::new(rx)),
                spawned: AtomicUsize::new(0),
                live: Arc::new(AtomicUsize::new(0)),
                fail_spawn: AtomicBool::new(false),
                kill_delay_ms: Arc::new(AtomicU64::new(0)),
            });
            (source, tx)
        }

        pub fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }
    }

    struct FakeProcess {
        feed: Arc<Mutex<mpsc::UnboundedReceiver<Feed>>>,
        live: Arc<AtomicUsize>,
        kill_delay_ms: Arc<AtomicU64>,
        killed: bool,
    }

    #[async_trait]
    impl MediaSource for FakeSource {
        async fn spawn(&self) -> io::Result<Box<dyn SourceProcess>> {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no encoder"));
            }
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeProcess {
                feed: self.feed.clone(),
                live: self.live.clone(),
                kill_delay_ms: self.kill_delay_ms.clone(),
                killed: false,
            }))
        }
    }

    #[async_trait]
    impl SourceProcess for FakeProcess {
        async fn read_unit(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            let mut feed = self.feed.lock().await;
            match tokio::time::timeout(Duration::from_millis(20), feed.recv()).await {
                Err(_) => Ok(ReadOutcome::Timeout),
                Ok(Some(Feed::Unit(data))) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(ReadOutcome::Unit(data.len()))
                }
                Ok(Some(Feed::Fail)) => Err(io::Error::other("encoder pipe broke")),
                Ok(Some(Feed::Close)) | Ok(None) => Ok(ReadOutcome::Closed),
            }
        }

        async fn kill(&mut self) -> io::Result<()> {
            if !self.killed {
                self.killed = true;
                let delay = self.kill_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeTrack {
        pub units: StdMutex<Vec<MediaUnit>>,
        pub fail: AtomicBool,
    }

    impl FakeTrack {
        pub fn written(&self) -> Vec<Vec<u8>> {
            self.units
                .lock()
                .unwrap()
                .iter()
                .map(|u| u.data.to_vec())
                .collect()
        }
    }

    #[async_trait]
    impl OutboundTrack for FakeTrack {
        async fn write_unit(&self, unit: MediaUnit) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::new("track closed"));
            }
            self.units.lock().unwrap().push(unit);
            Ok(())
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_stopped(pipeline: &MediaPipeline) {
        for _ in 0..200 {
            if !pipeline.is_running().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipeline still running");
    }

    #[tokio::test]
    async fn start_without_track_fails() {
        let (source, _feed) = FakeSource::new();
        let pipeline = MediaPipeline::new(MediaKind::Video, source);
        assert!(matches!(
            pipeline.start().await,
            Err(PipelineError::TrackNotCreated)
        ));
    }

    #[tokio::test]
    async fn relays_units_with_frame_duration() {
        let (source, feed) = FakeSource::new();
        let track = Arc::new(FakeTrack::default());
        let pipeline = MediaPipeline::new(MediaKind::Audio, source.clone());
        pipeline.bind_track(track.clone());

        pipeline.start().await.unwrap();
        assert!(matches!(
            pipeline.start().await,
            Err(PipelineError::AlreadyStreaming)
        ));

        feed.send(Feed::Unit(b"one".to_vec())).unwrap();
        feed.send(Feed::Unit(b"two".to_vec())).unwrap();
        eventually(|| track.written().len() == 2).await;

        assert_eq!(track.written(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(track
            .units
            .lock()
            .unwrap()
            .iter()
            .all(|u| u.duration == AUDIO_FRAME_DURATION));

        pipeline.stop().await;
        assert_eq!(source.live(), 0);
        assert!(!pipeline.is_running().await);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_before_start() {
        let (source, _feed) = FakeSource::new();
        let pipeline = MediaPipeline::new(MediaKind::Video, source.clone());
        pipeline.stop().await;

        pipeline.bind_track(Arc::new(FakeTrack::default()));
        pipeline.start().await.unwrap();
        eventually(|| source.live() == 1).await;
        pipeline.stop().await;
        pipeline.stop().await;
        assert_eq!(source.live(), 0);
    }

    #[tokio::test]
    async fn restart_after_stop_spawns_fresh_process() {
        let (source, _feed) = FakeSource::new();
        let pipeline = MediaPipeline::new(MediaKind::Video, source.clone());
        pipeline.bind_track(Arc::new(FakeTrack::default()));

        pipeline.start().await.unwrap();
        eventually(|| source.live() == 1).await;
        pipeline.stop().await;
        assert_eq!(source.live(), 0);

        pipeline.start().await.unwrap();
        eventually(|| source.spawned.load(Ordering::SeqCst) == 2).await;
        assert_eq!(source.live(), 1);
        pipeline.stop().await;
        assert_eq!(source.live(), 0);
    }

    #[tokio::test]
    async fn closed_source_ends_relay_cleanly() {
        let (source, feed) = FakeSource::new();
        let pipeline = MediaPipeline::new(MediaKind::Audio, source.clone());
        pipeline.bind_track(Arc::new(FakeTrack::default()));
        pipeline.start().await.unwrap();

        feed.send(Feed::Close).unwrap();
        eventually(|| source.spawned.load(Ordering::SeqCst) == 1 && source.live() == 0).await;
        wait_stopped(&pipeline).await;

        // A finished run does not block a new start.
        pipeline.start().await.unwrap();
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn read_and_write_failures_end_relay_and_kill_source() {
        let (source, feed) = FakeSource::new();
        let track = Arc::new(FakeTrack::default());
        let pipeline = MediaPipeline::new(MediaKind::Video, source.clone());
        pipeline.bind_track(track.clone());

        pipeline.start().await.unwrap();
        feed.send(Feed::Fail).unwrap();
        eventually(|| source.spawned.load(Ordering::SeqCst) == 1 && source.live() == 0).await;
        wait_stopped(&pipeline).await;

        track.fail.store(true, Ordering::SeqCst);
        pipeline.start().await.unwrap();
        feed.send(Feed::Unit(b"frame".to_vec())).unwrap();
        eventually(|| source.spawned.load(Ordering::SeqCst) == 2 && source.live() == 0).await;
        wait_stopped(&pipeline).await;
    }

    #[tokio::test]
    async fn spawn_failure_leaves_pipeline_stopped() {
        let (source, _feed) = FakeSource::new();
        source.fail_spawn.store(true, Ordering::SeqCst);
        let pipeline = MediaPipeline::new(MediaKind::Audio, source.clone());
        pipeline.bind_track(Arc::new(FakeTrack::default()));

        pipeline.start().await.unwrap();
        wait_stopped(&pipeline).await;
        assert_eq!(source.live(), 0);
        assert_eq!(source.spawned.load(Ordering::SeqCst), 0);
    }
}
