//! Run statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters reported at the end of a dumper run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumperStats {
    /// TCP segments fed to reassembly
    pub packets: u64,
    pub decode_errors: u64,
    /// Connections seen
    pub sessions: u64,
    pub requests: u64,
    pub responses: u64,
    /// Connections dropped as not HTTP
    pub discarded: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub packets: AtomicU64,
    pub decode_errors: AtomicU64,
    pub sessions: AtomicU64,
    pub requests: AtomicU64,
    pub responses: AtomicU64,
    pub discarded: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DumperStats {
        DumperStats {
            packets: self.packets.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
