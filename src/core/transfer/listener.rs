//! Upload sub-channel consumer.
//!
//! Payloads are handled one at a time in arrival order, so acknowledgments
//! leave in the order chunks were processed. The final disk write runs on the
//! blocking pool; the registry lock is never held across it.

use super::protocol::{FileMessage, Inbound, classify};
use super::registry::{ChunkProgress, TransferRegistry, TransferRejection};
use crate::core::config::TRANSFER_SWEEP_INTERVAL;
use crate::core::mux::SubChannel;
use crate::utils::sos::StopSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct UploadHandler {
    registry: Arc<TransferRegistry>,
    channel: SubChannel,
}

impl UploadHandler {
    pub fn new(registry: Arc<TransferRegistry>, channel: SubChannel) -> Self {
        Self { registry, channel }
    }

    pub async fn handle(&self, payload: &str) {
        match classify(payload) {
            Inbound::Raw(text) => {
                info!(event = "upload_channel_text", sub_channel = %self.channel.id(), text = %text);
            }
            Inbound::Malformed {
                kind,
                filename,
                error,
            } => {
                warn!(event = "transfer_message_malformed", kind = %kind, error = %error);
                if let Some(filename) = filename {
                    self.reject(&filename, TransferRejection::Malformed).await;
                }
            }
            Inbound::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&self, message: FileMessage) {
        match message {
            FileMessage::FileInit {
                filename,
                total_chunks,
                total_size,
            } => {
                if let Err(rejection) = self.registry.begin(&filename, total_chunks, total_size) {
                    self.reject(&filename, rejection).await;
                }
            }
            FileMessage::FileChunk {
                filename,
                index,
                data,
                ..
            } => self.handle_chunk(&filename, index, &data).await,
            FileMessage::FileError { filename, reason } => {
                if self.registry.cancel(&filename) {
                    warn!(event = "transfer_cancelled_by_peer", filename = %filename, reason = %reason);
                } else {
                    self.reject(&filename, TransferRejection::NoActiveTransfer)
                        .await;
                }
            }
            FileMessage::FileAck { filename, .. } | FileMessage::FileComplete { filename, .. } => {
                if self.registry.is_active(&filename) {
                    debug!(event = "transfer_reply_ignored", filename = %filename);
                } else {
                    self.reject(&filename, TransferRejection::NoActiveTransfer)
                        .await;
                }
            }
        }
    }

    async fn handle_chunk(&self, filename: &str, index: i64, data: &str) {
        let progress = match self.registry.accept_chunk(filename, index, data) {
            Ok(progress) => progress,
            Err(rejection) => {
                self.reject(filename, rejection).await;
                return;
            }
        };

        match progress {
            ChunkProgress::Pending { index, duplicate } => {
                if duplicate {
                    debug!(event = "chunk_duplicate_acked", filename = %filename, index);
                }
                self.reply(&FileMessage::ack(filename, index)).await;
            }
            ChunkProgress::Ready { index, transfer } => {
                self.reply(&FileMessage::ack(filename, index)).await;
                debug!(event = "transfer_committing", filename = %transfer.filename());

                let committed = tokio::task::spawn_blocking(move || transfer.commit()).await;
                match committed {
                    Ok(Ok(done)) => {
                        info!(
                            event = "transfer_complete",
                            filename = %done.filename,
                            path = %done.path.display(),
                            bytes = done.size,
                            "File received"
                        );
                        self.reply(&FileMessage::FileComplete {
                            filename: done.filename,
                            total_chunks: i64::from(done.total_chunks),
                            total_size: done.size,
                        })
                        .await;
                    }
                    Ok(Err(rejection)) => self.reject(filename, rejection).await,
                    Err(e) => {
                        warn!(event = "transfer_commit_panicked", filename = %filename, error = %e);
                        self.reject(filename, TransferRejection::WriteFailed).await;
                    }
                }
            }
        }
    }

    /// Remove transfers that saw no chunk for `max_idle` and tell the peer.
    pub async fn sweep(&self, max_idle: Duration) {
        for filename in self.registry.expire_idle(max_idle) {
            self.reject(&filename, TransferRejection::TimedOut).await;
        }
    }

    async fn reject(&self, filename: &str, rejection: TransferRejection) {
        warn!(event = "transfer_rejected", filename = %filename, reason = %rejection);
        self.reply(&FileMessage::error(filename, rejection.to_string()))
            .await;
    }

    async fn reply(&self, message: &FileMessage) {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(event = "transfer_reply_encode_failure", error = %e);
                return;
            }
        };
        if let Err(e) = self.channel.send(&text).await {
            debug!(event = "transfer_reply_send_failure", filename = %message.filename(), error = %e);
        }
    }
}

/// Subscribe `channel` and serve uploads until `stop` fires.
///
/// With `max_idle` set, abandoned transfers are swept every
/// `TRANSFER_SWEEP_INTERVAL`.
pub fn spawn_upload_listener(
    channel: SubChannel,
    registry: Arc<TransferRegistry>,
    max_idle: Option<Duration>,
    stop: StopSignal,
) -> JoinHandle<()> {
    let mut inbound = channel.subscribe();
    let handler = UploadHandler::new(registry, channel);

    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(TRANSFER_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                _ = stop.wait() => break,
                payload = inbound.recv() => match payload {
                    Some(payload) => handler.handle(&payload).await,
                    None => break,
                },
                _ = sweep.tick(), if max_idle.is_some() => {
                    if let Some(max_idle) = max_idle {
                        handler.sweep(max_idle).await;
                    }
                }
            }
        }
        debug!(event = "upload_listener_stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mux::ChannelMux;
    use crate::core::mux::tests::RecordingSink;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::Value;
    use std::path::PathBuf;

    struct Rig {
        handler: UploadHandler,
        registry: Arc<TransferRegistry>,
        sink: Arc<RecordingSink>,
        root: PathBuf,
    }

    impl Rig {
        fn new(name: &str) -> Self {
            let root = std::env::temp_dir()
                .join("pilink_test")
                .join("listener")
                .join(name);
            let _ = std::fs::remove_dir_all(&root);
            let sink = Arc::new(RecordingSink::default());
            let mux = Arc::new(ChannelMux::new(sink.clone()));
            let channel = mux.open_channel("123456").unwrap();
            let registry = Arc::new(TransferRegistry::new(&root));
            Self {
                handler: UploadHandler::new(registry.clone(), channel),
                registry,
                sink,
                root,
            }
        }

        /// Replies with the sub-channel prefix stripped.
        fn replies(&self) -> Vec<Value> {
            self.sink
                .frames()
                .iter()
                .map(|f| {
                    assert!(f.starts_with("123456"), "unexpected frame {f}");
                    serde_json::from_str(&f[6..]).unwrap()
                })
                .collect()
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn init(name: &str, total_chunks: i64, total_size: u64) -> String {
        serde_json::json!({
            "type": "file-init",
            "filename": name,
            "totalChunks": total_chunks,
            "totalSize": total_size,
        })
        .to_string()
    }

    fn chunk(name: &str, index: i64, data: &[u8]) -> String {
        serde_json::json!({
            "type": "file-chunk",
            "filename": name,
            "index": index,
            "totalChunks": 0,
            "data": STANDARD.encode(data),
        })
        .to_string()
    }

    #[tokio::test]
    async fn out_of_order_upload_acks_then_completes() {
        let rig = Rig::new("a_txt");
        rig.handler.handle(&init("a.txt", 3, 9)).await;
        rig.handler.handle(&chunk("a.txt", 1, b"def")).await;
        rig.handler.handle(&chunk("a.txt", 0, b"abc")).await;
        rig.handler.handle(&chunk("a.txt", 2, b"ghi")).await;

        let replies = rig.replies();
        assert_eq!(replies.len(), 4);
        for (reply, index) in replies.iter().zip([1, 0, 2]) {
            assert_eq!(reply["type"], "file-ack");
            assert_eq!(reply["filename"], "a.txt");
            assert_eq!(reply["index"], index);
        }
        assert_eq!(replies[3]["type"], "file-complete");
        assert_eq!(replies[3]["totalChunks"], 3);
        assert_eq!(replies[3]["totalSize"], 9);

        let written = std::fs::read(rig.root.join("a.txt")).unwrap();
        assert_eq!(written, b"abcdefghi");
        assert!(!rig.registry.is_active("a.txt"));
    }

    #[tokio::test]
    async fn out_of_bounds_chunk_fails_transfer_and_allows_restart() {
        let rig = Rig::new("b_txt");
        rig.handler.handle(&init("b.txt", 2, 6)).await;
        rig.handler.handle(&chunk("b.txt", 5, b"abc")).await;

        let replies = rig.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "file-error");
        assert_eq!(replies[0]["reason"], "chunk index out of bounds");
        assert!(!rig.registry.is_active("b.txt"));

        rig.handler.handle(&init("b.txt", 2, 6)).await;
        assert!(rig.registry.is_active("b.txt"));
        assert_eq!(rig.replies().len(), 1);
    }

    #[tokio::test]
    async fn traversal_filename_is_refused_before_any_write() {
        let rig = Rig::new("traversal");
        rig.handler.handle(&init("../../etc/passwd", 1, 3)).await;
        rig.handler.handle(&chunk("../../etc/passwd", 0, b"bad")).await;

        let reasons: Vec<Value> = rig.replies().iter().map(|r| r["reason"].clone()).collect();
        assert_eq!(reasons, vec!["invalid filename", "no active transfer"]);
        assert!(!rig.root.exists());
    }

    #[tokio::test]
    async fn duplicate_init_is_rejected_and_transfer_survives() {
        let rig = Rig::new("dup_init");
        rig.handler.handle(&init("c.txt", 2, 4)).await;
        rig.handler.handle(&chunk("c.txt", 0, b"ab")).await;
        rig.handler.handle(&init("c.txt", 9, 99)).await;
        rig.handler.handle(&chunk("c.txt", 1, b"cd")).await;

        let replies = rig.replies();
        assert_eq!(replies[1]["type"], "file-error");
        assert_eq!(replies[1]["reason"], "transfer already active");
        assert_eq!(replies.last().unwrap()["type"], "file-complete");
        assert_eq!(std::fs::read(rig.root.join("c.txt")).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn bad_payload_and_missing_transfer_are_reported() {
        let rig = Rig::new("bad_payload");
        rig.handler.handle(&init("d.bin", 2, 2)).await;
        rig.handler
            .handle(r#"{"type":"file-chunk","filename":"d.bin","index":0,"totalChunks":2,"data":"%%%"}"#)
            .await;
        rig.handler.handle(&chunk("d.bin", 1, b"x")).await;
        rig.handler
            .handle(r#"{"type":"file-ack","filename":"nobody","index":0}"#)
            .await;

        let reasons: Vec<Value> = rig.replies().iter().map(|r| r["reason"].clone()).collect();
        assert_eq!(
            reasons,
            vec!["invalid chunk payload", "no active transfer", "no active transfer"]
        );
    }

    #[tokio::test]
    async fn raw_text_gets_no_reply() {
        let rig = Rig::new("raw");
        rig.handler.handle("hello device").await;
        rig.handler.handle(r#"{"type":"steer","angle":4}"#).await;
        assert!(rig.sink.frames().is_empty());
    }

    #[tokio::test]
    async fn malformed_known_message_is_answered_when_filename_known() {
        let rig = Rig::new("malformed");
        rig.handler
            .handle(r#"{"type":"file-init","filename":"e.txt","totalChunks":"x"}"#)
            .await;
        rig.handler.handle(r#"{"type":"file-chunk"}"#).await;

        let replies = rig.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["filename"], "e.txt");
        assert_eq!(replies[0]["reason"], "invalid message");
    }

    #[tokio::test]
    async fn unwritable_destination_reports_write_failure() {
        let rig = Rig::new("unwritable");
        std::fs::create_dir_all(rig.root.join("a.txt").join("occupied")).unwrap();

        rig.handler.handle(&init("a.txt", 1, 3)).await;
        rig.handler.handle(&chunk("a.txt", 0, b"abc")).await;

        let replies = rig.replies();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["type"], "file-ack");
        assert_eq!(replies[1]["type"], "file-error");
        assert_eq!(replies[1]["filename"], "a.txt");
        assert_eq!(replies[1]["reason"], "failed to write file");
        assert!(!rig.registry.is_active("a.txt"));
        assert!(rig.root.join("a.txt").is_dir());
        assert!(!rig.root.join("a.txt.part").exists());
    }

    #[tokio::test]
    async fn peer_error_for_unknown_file_is_answered() {
        let rig = Rig::new("peer_error_unknown");
        rig.handler
            .handle(r#"{"type":"file-error","filename":"ghost.txt","reason":"user aborted"}"#)
            .await;

        let replies = rig.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "file-error");
        assert_eq!(replies[0]["filename"], "ghost.txt");
        assert_eq!(replies[0]["reason"], "no active transfer");
    }

    #[tokio::test]
    async fn peer_error_cancels_without_reply() {
        let rig = Rig::new("peer_error");
        rig.handler.handle(&init("f.txt", 3, 3)).await;
        rig.handler
            .handle(r#"{"type":"file-error","filename":"f.txt","reason":"user aborted"}"#)
            .await;
        assert!(!rig.registry.is_active("f.txt"));
        assert!(rig.sink.frames().is_empty());
    }

    #[tokio::test]
    async fn sweep_reports_timed_out_transfers() {
        let rig = Rig::new("sweep");
        rig.handler.handle(&init("g.txt", 2, 2)).await;
        rig.handler.sweep(Duration::ZERO).await;

        let replies = rig.replies();
        assert_eq!(replies[0]["reason"], "transfer timed out");
        assert!(!rig.registry.is_active("g.txt"));
    }

    #[tokio::test]
    async fn spawned_listener_serves_until_stopped() {
        let root = std::env::temp_dir()
            .join("pilink_test")
            .join("listener")
            .join("spawned");
        let _ = std::fs::remove_dir_all(&root);
        let sink = Arc::new(RecordingSink::default());
        let mux = Arc::new(ChannelMux::new(sink.clone()));
        let registry = Arc::new(TransferRegistry::new(&root));
        let stop = StopSignal::new();
        let task = spawn_upload_listener(
            mux.open_channel("123456").unwrap(),
            registry.clone(),
            None,
            stop.clone(),
        );

        mux.dispatch(&format!("123456{}", init("h.txt", 1, 2)));
        mux.dispatch(&format!("123456{}", chunk("h.txt", 0, b"hi")));

        for _ in 0..200 {
            if sink.frames().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.frames().len(), 2);
        assert_eq!(std::fs::read(root.join("h.txt")).unwrap(), b"hi");

        stop.fire();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&root);
    }
}
