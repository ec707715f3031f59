//! Session registry: one shared state per connection

use crate::key::ConnectionKey;
use crate::state::ConnectionState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use promptdump_core::FlowId;
use std::sync::{Arc, Weak};

/// Maps canonical connection keys to their shared state.
///
/// Entries are weak: a connection's state lives as long as one of its
/// half-streams holds it. Dead entries are dropped by [`purge`].
///
/// [`purge`]: SessionRegistry::purge
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionKey, Weak<ConnectionState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load or create the state for the connection `flow` belongs to.
    ///
    /// `flow` and its reverse resolve to the same state. The returned flag
    /// is `true` for exactly one caller per connection, even when both
    /// directions register concurrently.
    pub fn register(&self, flow: &FlowId) -> (Arc<ConnectionState>, bool) {
        let key = ConnectionKey::new(flow);
        match self.sessions.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Some(state) = entry.get().upgrade() {
                    return (state, false);
                }
                let state = Arc::new(ConnectionState::new(key));
                entry.insert(Arc::downgrade(&state));
                (state, true)
            }
            Entry::Vacant(entry) => {
                let state = Arc::new(ConnectionState::new(key));
                entry.insert(Arc::downgrade(&state));
                (state, true)
            }
        }
    }

    /// Live state for `flow`'s connection, if any
    pub fn get(&self, flow: &FlowId) -> Option<Arc<ConnectionState>> {
        self.sessions
            .get(&ConnectionKey::new(flow))
            .and_then(|entry| entry.upgrade())
    }

    /// Drop entries whose state is gone. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, state| state.strong_count() > 0);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn flow() -> FlowId {
        FlowId::from_addrs(
            "10.1.1.1:43210".parse().unwrap(),
            "10.1.1.2:8080".parse().unwrap(),
        )
    }

    #[test]
    fn test_reverse_flow_gets_same_state() {
        let registry = SessionRegistry::new();
        let (a, a_new) = registry.register(&flow());
        let (b, b_new) = registry.register(&flow().reverse());

        assert!(a_new);
        assert!(!b_new);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&flow()).unwrap(), &a));
    }

    #[test]
    fn test_concurrent_registration_creates_once() {
        let registry = Arc::new(SessionRegistry::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let f = if i % 2 == 0 { flow() } else { flow().reverse() };
                    barrier.wait();
                    registry.register(&f)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(_, is_new)| *is_new).count(), 1);
        let first = &results[0].0;
        assert!(results.iter().all(|(state, _)| Arc::ptr_eq(state, first)));
    }

    #[test]
    fn test_purge_drops_dead_sessions() {
        let registry = SessionRegistry::new();
        let (state, _) = registry.register(&flow());
        assert_eq!(registry.purge(), 0);

        drop(state);
        assert!(registry.get(&flow()).is_none());
        assert_eq!(registry.purge(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregistering_dead_session_is_new() {
        let registry = SessionRegistry::new();
        let (state, _) = registry.register(&flow());
        drop(state);

        let (_state, is_new) = registry.register(&flow().reverse());
        assert!(is_new);
    }
}
