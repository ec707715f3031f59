//! promptdump reassembly - in-order TCP byte streams from captured segments
//!
//! The [`Assembler`] tracks every directional flow it sees, reorders and
//! de-duplicates segments by sequence number, and hands contiguous bytes to
//! a per-flow [`Stream`] created by a [`StreamFactory`]. Consumers that want
//! an `AsyncRead` view of a half-stream use [`ReaderStream`].

use async_trait::async_trait;
use promptdump_core::{FlowId, ReassemblySettings};

pub mod assembler;
pub mod reader;

pub use assembler::Assembler;
pub use reader::{reader_channel, ReaderStream};

/// A run of contiguous bytes delivered to a [`Stream`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembly {
    pub bytes: Vec<u8>,

    /// Bytes lost immediately before this chunk (0 when contiguous)
    pub skip: u64,

    /// First bytes after a SYN
    pub start: bool,
}

/// Receiver of one directional flow's reassembled bytes
#[async_trait]
pub trait Stream: Send {
    /// Called with in-order data as it becomes available. Awaiting here
    /// back-pressures the assembler.
    async fn reassembled(&mut self, chunks: Vec<Reassembly>);

    /// Called when the flow ends (FIN, RST, idle flush or shutdown).
    /// Implementations must tolerate repeated calls.
    fn reassembly_complete(&mut self);
}

/// Creates a [`Stream`] for each new directional flow
pub trait StreamFactory: Send {
    fn new_stream(&self, flow: FlowId) -> Box<dyn Stream>;
}

/// Assembler tuning
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Out-of-order segments buffered per flow before the gap is skipped
    pub max_buffered_segments: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_buffered_segments: 1024,
        }
    }
}

impl From<&ReassemblySettings> for AssemblerConfig {
    fn from(settings: &ReassemblySettings) -> Self {
        Self {
            max_buffered_segments: settings.max_buffered_segments.max(1),
        }
    }
}
