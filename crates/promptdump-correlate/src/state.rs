//! Per-connection state shared by both half-stream handlers

use crate::key::ConnectionKey;
use parking_lot::Mutex;
use promptdump_core::Request;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Whether a connection's traffic is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verdict {
    Undetermined = 0,
    Keep = 1,
    Discard = 2,
}

impl Verdict {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Verdict::Keep,
            2 => Verdict::Discard,
            _ => Verdict::Undetermined,
        }
    }
}

#[derive(Default)]
struct Backlog {
    /// Requests not yet claimed, in arrival order
    requests: VecDeque<Arc<Request>>,
    /// Requests claimed so far; the pairing cursor
    claimed: usize,
}

/// State of one TCP connection
///
/// Requests are appended by the request-carrying half-stream and claimed
/// in FIFO order by the response-carrying one. Claimed requests are
/// released from the backlog; only the cursor position is kept.
pub struct ConnectionState {
    key: ConnectionKey,
    id: String,
    backlog: Mutex<Backlog>,
    verdict: AtomicU8,
    request_side_active: AtomicBool,
    changed: Notify,
}

impl ConnectionState {
    pub fn new(key: ConnectionKey) -> Self {
        Self {
            key,
            id: key.to_string(),
            backlog: Mutex::new(Backlog::default()),
            verdict: AtomicU8::new(Verdict::Undetermined as u8),
            request_side_active: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Session identifier reported to the notifier
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn append_request(&self, request: Arc<Request>) {
        self.backlog.lock().requests.push_back(request);
        self.changed.notify_waiters();
    }

    /// Claim the request at the cursor and advance it, or `None` if every
    /// request seen so far has already been claimed. Never blocks on
    /// anything but the backlog lock.
    pub fn claim_next_request(&self) -> Option<Arc<Request>> {
        let mut backlog = self.backlog.lock();
        let request = backlog.requests.pop_front()?;
        backlog.claimed += 1;
        Some(request)
    }

    /// Position of the pairing cursor
    pub fn claimed(&self) -> usize {
        self.backlog.lock().claimed
    }

    /// Requests waiting to be claimed
    pub fn unclaimed(&self) -> usize {
        self.backlog.lock().requests.len()
    }

    pub fn verdict(&self) -> Verdict {
        Verdict::from_u8(self.verdict.load(Ordering::Acquire))
    }

    /// Mark the connection as HTTP. Returns `false` if it was already
    /// discarded.
    pub fn keep(&self) -> bool {
        match self.verdict.compare_exchange(
            Verdict::Undetermined as u8,
            Verdict::Keep as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => Verdict::from_u8(current) == Verdict::Keep,
        }
    }

    /// Stop processing this connection. Overrides an earlier keep. Returns
    /// whether this call changed the verdict.
    pub fn discard(&self) -> bool {
        let previous = self.verdict.swap(Verdict::Discard as u8, Ordering::AcqRel);
        self.changed.notify_waiters();
        Verdict::from_u8(previous) != Verdict::Discard
    }

    pub fn is_discarded(&self) -> bool {
        self.verdict() == Verdict::Discard
    }

    /// Record whether a request-carrying handler is running
    pub fn set_request_side_active(&self, active: bool) {
        self.request_side_active.store(active, Ordering::Release);
        self.changed.notify_waiters();
    }

    pub fn request_side_active(&self) -> bool {
        self.request_side_active.load(Ordering::Acquire)
    }

    /// Notified on request append, request side exit and discard
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }
}
