//! Sequence-number tracking and in-order delivery per directional flow

use crate::{AssemblerConfig, Reassembly, Stream, StreamFactory};
use promptdump_core::{FlowId, TcpSegment};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, trace};

/// Signed distance from `b` to `a` in sequence space
fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

struct Pending {
    seq: u32,
    payload: Vec<u8>,
}

/// State of one direction of a connection
struct HalfConnection {
    stream: Box<dyn Stream>,
    next_seq: Option<u32>,
    fin_seq: Option<u32>,
    pending: Vec<Pending>,
    /// Set after a SYN until the first bytes are delivered
    start: bool,
    last_seen: Instant,
}

impl HalfConnection {
    fn new(stream: Box<dyn Stream>, now: Instant) -> Self {
        Self {
            stream,
            next_seq: None,
            fin_seq: None,
            pending: Vec::new(),
            start: false,
            last_seen: now,
        }
    }

    fn is_ahead(&self, seq: u32) -> bool {
        self.next_seq.is_some_and(|next| seq_diff(seq, next) > 0)
    }

    /// Deliver the part of `payload` past `next_seq`. The segment must not
    /// start after `next_seq`.
    fn accept(&mut self, seq: u32, mut payload: Vec<u8>, skip: u64, chunks: &mut Vec<Reassembly>) {
        let Some(next) = self.next_seq else {
            return;
        };
        let overlap = seq_diff(seq, next).min(0).unsigned_abs() as usize;
        if overlap >= payload.len() {
            return;
        }
        payload.drain(..overlap);
        self.next_seq = Some(next.wrapping_add(payload.len() as u32));
        chunks.push(Reassembly {
            bytes: payload,
            skip,
            start: std::mem::take(&mut self.start),
        });
    }

    /// Deliver buffered segments that have become contiguous
    fn drain_ready(&mut self, chunks: &mut Vec<Reassembly>) {
        while let Some(next) = self.next_seq {
            let Some(idx) = self
                .pending
                .iter()
                .position(|p| seq_diff(p.seq, next) <= 0)
            else {
                return;
            };
            let p = self.pending.swap_remove(idx);
            self.accept(p.seq, p.payload, 0, chunks);
        }
    }

    /// Give up on the missing bytes before the earliest buffered segment
    fn skip_gap(&mut self, chunks: &mut Vec<Reassembly>) {
        let Some(next) = self.next_seq else {
            return;
        };
        let Some(idx) = (0..self.pending.len()).min_by_key(|&i| seq_diff(self.pending[i].seq, next))
        else {
            return;
        };
        let p = self.pending.swap_remove(idx);
        let skip = seq_diff(p.seq, next).max(0) as u64;
        self.next_seq = Some(p.seq);
        self.accept(p.seq, p.payload, skip, chunks);
        self.drain_ready(chunks);
    }

    /// Push all buffered data through, skipping gaps. Returns whether
    /// anything was buffered.
    fn flush_pending(&mut self, chunks: &mut Vec<Reassembly>) -> bool {
        let had_pending = !self.pending.is_empty();
        while !self.pending.is_empty() {
            self.skip_gap(chunks);
        }
        had_pending
    }

    /// Every byte before the FIN has been delivered
    fn finished(&self) -> bool {
        matches!(
            (self.next_seq, self.fin_seq),
            (Some(next), Some(fin)) if seq_diff(next, fin) >= 0
        )
    }
}

/// TCP stream reassembler
///
/// Not thread safe; meant to be driven from a single packet loop. Each
/// directional flow gets its own [`Stream`] from the factory.
pub struct Assembler<F: StreamFactory> {
    factory: F,
    config: AssemblerConfig,
    connections: HashMap<FlowId, HalfConnection>,
    /// Flows ended by FIN or RST, with the time they closed. Late
    /// retransmissions on them are dropped until a new SYN reopens the flow.
    closed: HashMap<FlowId, Instant>,
}

impl<F: StreamFactory> Assembler<F> {
    pub fn new(factory: F, config: AssemblerConfig) -> Self {
        Self {
            factory,
            config,
            connections: HashMap::new(),
            closed: HashMap::new(),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Number of directional flows currently tracked
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Feed one segment
    pub async fn assemble(&mut self, segment: TcpSegment) {
        self.assemble_at(segment, Instant::now()).await
    }

    /// Feed one segment observed at `now`
    pub async fn assemble_at(&mut self, segment: TcpSegment, now: Instant) {
        let TcpSegment {
            flow,
            seq,
            flags,
            payload,
        } = segment;

        if !self.connections.contains_key(&flow) {
            if self.closed.contains_key(&flow) {
                if !flags.syn {
                    trace!("Ignoring segment for closed flow {}", flow);
                    return;
                }
                self.closed.remove(&flow);
            }
            // A stray ACK/FIN/RST does not start a stream
            if !flags.syn && payload.is_empty() {
                trace!("Ignoring control segment for unknown flow {}", flow);
                return;
            }
            debug!("New stream {}", flow);
            let stream = self.factory.new_stream(flow);
            self.connections
                .insert(flow, HalfConnection::new(stream, now));
        }

        let max_buffered = self.config.max_buffered_segments;
        let Some(conn) = self.connections.get_mut(&flow) else {
            return;
        };
        conn.last_seen = now;

        let mut chunks = Vec::new();
        let data_seq = if flags.syn {
            if conn.next_seq.is_none() {
                conn.next_seq = Some(seq.wrapping_add(1));
                conn.start = true;
            }
            seq.wrapping_add(1)
        } else {
            seq
        };
        let payload_len = payload.len() as u32;

        if !payload.is_empty() {
            if conn.next_seq.is_none() {
                conn.next_seq = Some(data_seq);
            }
            if conn.is_ahead(data_seq) {
                conn.pending.push(Pending {
                    seq: data_seq,
                    payload,
                });
                if conn.pending.len() > max_buffered {
                    debug!("Too many out-of-order segments on {}, skipping gap", flow);
                    conn.skip_gap(&mut chunks);
                }
            } else {
                conn.accept(data_seq, payload, 0, &mut chunks);
                conn.drain_ready(&mut chunks);
            }
        }

        if flags.fin {
            conn.fin_seq = Some(data_seq.wrapping_add(payload_len));
        }
        if flags.rst {
            conn.flush_pending(&mut chunks);
        }
        let done = flags.rst || conn.finished();

        if !chunks.is_empty() {
            conn.stream.reassembled(chunks).await;
        }
        if done {
            self.close(&flow, now);
        }
    }

    /// Flush and close every flow idle since before `cutoff`. Returns the
    /// number of flows that had buffered data pushed through and the
    /// number of flows closed.
    pub async fn flush_older_than(&mut self, cutoff: Instant) -> (usize, usize) {
        self.closed.retain(|_, closed_at| *closed_at >= cutoff);
        let idle: Vec<FlowId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.last_seen < cutoff)
            .map(|(flow, _)| *flow)
            .collect();
        self.flush_flows(idle).await
    }

    /// Flush and close every flow. Returns the number of flows closed.
    pub async fn flush_all(&mut self) -> usize {
        self.closed.clear();
        let all: Vec<FlowId> = self.connections.keys().copied().collect();
        self.flush_flows(all).await.1
    }

    async fn flush_flows(&mut self, flows: Vec<FlowId>) -> (usize, usize) {
        let mut flushed = 0;
        let mut closed = 0;
        for flow in flows {
            let Some(mut conn) = self.connections.remove(&flow) else {
                continue;
            };
            let mut chunks = Vec::new();
            if conn.flush_pending(&mut chunks) {
                flushed += 1;
            }
            if !chunks.is_empty() {
                conn.stream.reassembled(chunks).await;
            }
            conn.stream.reassembly_complete();
            closed += 1;
        }
        (flushed, closed)
    }

    fn close(&mut self, flow: &FlowId, now: Instant) {
        if let Some(mut conn) = self.connections.remove(flow) {
            trace!("Stream {} complete", flow);
            conn.stream.reassembly_complete();
            self.closed.insert(*flow, now);
        }
    }
}
