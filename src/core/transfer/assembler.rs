//! Per-transfer chunk collection and reassembly.
//!
//! Chunks may arrive in any order and more than once. The first payload
//! stored for an index wins; re-deliveries are acknowledged but never
//! overwrite. Storage is sparse, so a peer declaring a huge chunk count
//! costs nothing until it actually sends data.

use std::collections::BTreeMap;
use std::time::Instant;

/// Whether an inserted chunk was new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    Duplicate,
}

#[derive(Debug)]
pub struct ChunkAssembler {
    total_chunks: u32,
    total_size: u64,
    chunks: BTreeMap<u32, Vec<u8>>,
    last_activity: Instant,
}

impl ChunkAssembler {
    pub fn new(total_chunks: u32, total_size: u64) -> Self {
        Self {
            total_chunks,
            total_size,
            chunks: BTreeMap::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Declared size from `file-init`; informational only.
    pub fn declared_size(&self) -> u64 {
        self.total_size
    }

    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn contains(&self, index: u32) -> bool {
        index < self.total_chunks
    }

    /// Store `data` at `index`. The caller has bounds-checked `index`.
    pub fn insert(&mut self, index: u32, data: Vec<u8>) -> InsertOutcome {
        debug_assert!(self.contains(index));
        self.last_activity = Instant::now();
        match self.chunks.entry(index) {
            std::collections::btree_map::Entry::Occupied(_) => InsertOutcome::Duplicate,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(data);
                InsertOutcome::Stored
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.total_chunks
    }

    /// Concatenate chunks `0..total_chunks` in index order.
    ///
    /// Returns the first missing index if there is a gap.
    pub fn assemble(self) -> Result<Vec<u8>, u32> {
        let capacity: usize = self.chunks.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(capacity);
        let mut chunks = self.chunks;
        for index in 0..self.total_chunks {
            match chunks.remove(&index) {
                Some(part) => out.extend_from_slice(&part),
                None => return Err(index),
            }
        }
        Ok(out)
    }
}
