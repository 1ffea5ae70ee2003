use async_trait::async_trait;
use std::io;

/// Result of one poll of a running media source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes of one encoded unit were written into the buffer.
    Unit(usize),
    /// Nothing arrived within the poll interval.
    Timeout,
    /// The source ended; no further units will arrive.
    Closed,
}

/// Spawns encoder processes for one media kind.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn spawn(&self) -> io::Result<Box<dyn SourceProcess>>;
}

/// A running encoder and the output it produces.
///
/// `kill` must leave nothing running and release any local resource (such
/// as a bound port) before it returns.
#[async_trait]
pub trait SourceProcess: Send {
    async fn read_unit(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    async fn kill(&mut self) -> io::Result<()>;
}
