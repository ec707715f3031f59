//! Decoded TCP segments

use crate::flow::FlowId;

/// TCP control flags relevant to stream reassembly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

/// One TCP segment as decoded from a captured packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    /// Direction the segment travels in
    pub flow: FlowId,

    /// Sequence number of the first payload byte (or of the SYN)
    pub seq: u32,

    pub flags: TcpFlags,

    /// Transport-layer payload
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub fn new(flow: FlowId, seq: u32, flags: TcpFlags, payload: Vec<u8>) -> Self {
        Self {
            flow,
            seq,
            flags,
            payload,
        }
    }
}
