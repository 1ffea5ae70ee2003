//! In-flight transfers keyed by filename.
//!
//! All map mutations happen under one mutex. Work that does not need the map
//! (base64 decoding, concatenation, disk writes) is done outside it: a
//! finished transfer is removed from the map first and handed back to the
//! caller as a [`ReadyTransfer`].

use super::assembler::{ChunkAssembler, InsertOutcome};
use crate::utils::atomic_write::atomic_write;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashMap;
use std::path::{Component, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Why a transfer message was refused. `Display` is the wire `reason`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferRejection {
    #[error("invalid filename")]
    InvalidFilename,
    #[error("invalid chunk count")]
    InvalidChunkCount,
    #[error("transfer already active")]
    AlreadyActive,
    #[error("no active transfer")]
    NoActiveTransfer,
    #[error("chunk index out of bounds")]
    IndexOutOfBounds,
    #[error("invalid chunk payload")]
    InvalidPayload,
    #[error("missing chunk {0}")]
    MissingChunk(u32),
    #[error("failed to write file")]
    WriteFailed,
    #[error("transfer timed out")]
    TimedOut,
    #[error("invalid message")]
    Malformed,
}

/// Result of accepting one chunk.
#[derive(Debug)]
pub enum ChunkProgress {
    /// `duplicate` marks an index that had already arrived; its bytes were
    /// not replaced.
    Pending { index: u32, duplicate: bool },
    /// Every index has arrived; the transfer is no longer in the registry.
    Ready { index: u32, transfer: ReadyTransfer },
}

/// A fully received transfer, detached from the registry.
#[derive(Debug)]
pub struct ReadyTransfer {
    filename: String,
    destination: PathBuf,
    assembler: ChunkAssembler,
}

/// A transfer whose bytes are on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub filename: String,
    pub path: PathBuf,
    pub total_chunks: u32,
    pub size: u64,
}

impl ReadyTransfer {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Reassemble and write the file. Blocking I/O.
    pub fn commit(self) -> Result<CompletedTransfer, TransferRejection> {
        let total_chunks = self.assembler.total_chunks();
        let declared = self.assembler.declared_size();
        let data = self
            .assembler
            .assemble()
            .map_err(TransferRejection::MissingChunk)?;

        if data.len() as u64 != declared {
            warn!(
                event = "transfer_size_mismatch",
                filename = %self.filename,
                declared,
                actual = data.len(),
                "Reassembled size differs from declared size"
            );
        }

        atomic_write(&self.destination, &data).map_err(|e| {
            error!(
                event = "transfer_write_failure",
                filename = %self.filename,
                path = %self.destination.display(),
                error = %e,
                "Failed to write received file"
            );
            TransferRejection::WriteFailed
        })?;

        info!(
            event = "transfer_written",
            filename = %self.filename,
            path = %self.destination.display(),
            bytes = data.len(),
            "Wrote received file"
        );

        Ok(CompletedTransfer {
            filename: self.filename,
            path: self.destination,
            total_chunks,
            size: data.len() as u64,
        })
    }
}

/// Sanitize a peer-supplied filename into a path relative to the
/// destination root.
///
/// Backslashes count as separators, `.` and empty components are dropped
/// and `..` pops a previous component. A name that would climb above the
/// root, that is empty once cleaned, or that carries a drive prefix
/// (`C:`) is refused. Other colons are ordinary characters.
pub fn sanitize_relative_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            _ if part.contains('\0') || has_drive_prefix(part) => return None,
            _ => parts.push(part),
        }
    }

    if parts.is_empty() {
        return None;
    }

    let path: PathBuf = parts.iter().collect();
    path.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then_some(path)
}

fn has_drive_prefix(part: &str) -> bool {
    let bytes = part.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

pub struct TransferRegistry {
    root: PathBuf,
    transfers: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug)]
struct Entry {
    destination: PathBuf,
    assembler: ChunkAssembler,
}

impl TransferRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            transfers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock leaves a consistent map; keep going.
        self.transfers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handle `file-init`.
    pub fn begin(
        &self,
        filename: &str,
        total_chunks: i64,
        total_size: u64,
    ) -> Result<(), TransferRejection> {
        let relative = sanitize_relative_path(filename).ok_or(TransferRejection::InvalidFilename)?;
        let total_chunks = u32::try_from(total_chunks)
            .ok()
            .filter(|n| *n > 0)
            .ok_or(TransferRejection::InvalidChunkCount)?;

        let mut transfers = self.lock();
        if transfers.contains_key(filename) {
            return Err(TransferRejection::AlreadyActive);
        }
        transfers.insert(
            filename.to_string(),
            Entry {
                destination: self.root.join(relative),
                assembler: ChunkAssembler::new(total_chunks, total_size),
            },
        );
        drop(transfers);

        info!(
            event = "transfer_started",
            filename = %filename,
            total_chunks,
            total_size,
            "Receiving file"
        );
        Ok(())
    }

    /// Handle `file-chunk`.
    ///
    /// Out-of-range indices and undecodable payloads discard the transfer.
    pub fn accept_chunk(
        &self,
        filename: &str,
        index: i64,
        data_b64: &str,
    ) -> Result<ChunkProgress, TransferRejection> {
        let decoded = STANDARD.decode(data_b64);

        let mut transfers = self.lock();
        let Some(entry) = transfers.get_mut(filename) else {
            return Err(TransferRejection::NoActiveTransfer);
        };

        let Some(index) = u32::try_from(index)
            .ok()
            .filter(|i| entry.assembler.contains(*i))
        else {
            transfers.remove(filename);
            return Err(TransferRejection::IndexOutOfBounds);
        };

        let Ok(data) = decoded else {
            transfers.remove(filename);
            return Err(TransferRejection::InvalidPayload);
        };

        let duplicate = entry.assembler.insert(index, data) == InsertOutcome::Duplicate;
        let received = entry.assembler.received();
        let total = entry.assembler.total_chunks();
        debug!(event = "chunk_received", filename = %filename, index, received, total, duplicate);

        if !entry.assembler.is_complete() {
            return Ok(ChunkProgress::Pending { index, duplicate });
        }

        let Some(entry) = transfers.remove(filename) else {
            return Err(TransferRejection::NoActiveTransfer);
        };
        Ok(ChunkProgress::Ready {
            index,
            transfer: ReadyTransfer {
                filename: filename.to_string(),
                destination: entry.destination,
                assembler: entry.assembler,
            },
        })
    }

    /// Drop an active transfer. Returns whether one existed.
    pub fn cancel(&self, filename: &str) -> bool {
        self.lock().remove(filename).is_some()
    }

    /// Remove transfers idle for longer than `max_idle`; returns their names.
    pub fn expire_idle(&self, max_idle: Duration) -> Vec<String> {
        let mut transfers = self.lock();
        let expired: Vec<String> = transfers
            .iter()
            .filter(|(_, e)| e.assembler.last_activity().elapsed() >= max_idle)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            transfers.remove(name);
        }
        expired
    }

    pub fn is_active(&self, filename: &str) -> bool {
        self.lock().contains_key(filename)
    }
}

#[cfg(test)]
impl TransferRegistry {
    pub(crate) fn received_chunks(&self, filename: &str) -> Option<u32> {
        self.lock().get(filename).map(|e| e.assembler.received())
    }

    pub(crate) fn active_count(&self) -> usize {
        self.lock().len()
    }
}
