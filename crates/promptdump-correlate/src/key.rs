//! Direction-independent connection identity

use promptdump_core::FlowId;
use std::fmt;
use std::net::SocketAddr;

/// Canonical key of a TCP connection.
///
/// Both endpoints are ordered by network address first and port second,
/// so a flow and its reverse produce the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    low: SocketAddr,
    high: SocketAddr,
}

impl ConnectionKey {
    pub fn new(flow: &FlowId) -> Self {
        let (a, b) = (flow.src(), flow.dst());
        if (a.ip(), a.port()) <= (b.ip(), b.port()) {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// The endpoints in canonical order
    pub fn endpoints(&self) -> (SocketAddr, SocketAddr) {
        (self.low, self.high)
    }
}

impl From<&FlowId> for ConnectionKey {
    fn from(flow: &FlowId) -> Self {
        Self::new(flow)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(src: &str, dst: &str) -> FlowId {
        FlowId::from_addrs(src.parse().unwrap(), dst.parse().unwrap())
    }

    #[test]
    fn test_reverse_flows_share_key() {
        let f = flow("192.168.1.20:8080", "192.168.1.10:51000");
        assert_eq!(ConnectionKey::new(&f), ConnectionKey::new(&f.reverse()));
        assert_eq!(
            ConnectionKey::new(&f).to_string(),
            "192.168.1.10:51000-192.168.1.20:8080"
        );
    }

    #[test]
    fn test_same_address_ordered_by_port() {
        let key = ConnectionKey::new(&flow("127.0.0.1:11434", "127.0.0.1:52000"));
        let (low, high) = key.endpoints();
        assert_eq!(low.port(), 11434);
        assert_eq!(high.port(), 52000);
    }

    #[test]
    fn test_address_compared_numerically() {
        // 10.0.0.9 < 10.0.0.10 even though "10.0.0.10" sorts first as text
        let key = ConnectionKey::new(&flow("10.0.0.10:80", "10.0.0.9:40000"));
        assert_eq!(key.endpoints().0, "10.0.0.9:40000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_distinct_connections_differ() {
        let a = ConnectionKey::new(&flow("[::1]:40000", "[::1]:80"));
        let b = ConnectionKey::new(&flow("[::1]:40001", "[::1]:80"));
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "[::1]:80-[::1]:40000");
    }
}
