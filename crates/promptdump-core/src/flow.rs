//! Directional flow identities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A directional pair of endpoints at one protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Flow<E> {
    pub src: E,
    pub dst: E,
}

impl<E: Copy> Flow<E> {
    pub fn new(src: E, dst: E) -> Self {
        Self { src, dst }
    }

    /// The same flow seen from the other side
    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    pub fn endpoints(&self) -> (E, E) {
        (self.src, self.dst)
    }
}

impl<E: fmt::Display> fmt::Display for Flow<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

/// Network-layer flow (addresses)
pub type NetworkFlow = Flow<IpAddr>;

/// Transport-layer flow (ports)
pub type TransportFlow = Flow<u16>;

/// Identity of one direction of a TCP connection, at both layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId {
    pub net: NetworkFlow,
    pub transport: TransportFlow,
}

impl FlowId {
    pub fn new(net: NetworkFlow, transport: TransportFlow) -> Self {
        Self { net, transport }
    }

    /// Build from socket addresses, `src` sending to `dst`
    pub fn from_addrs(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            net: Flow::new(src.ip(), dst.ip()),
            transport: Flow::new(src.port(), dst.port()),
        }
    }

    pub fn reverse(&self) -> Self {
        Self {
            net: self.net.reverse(),
            transport: self.transport.reverse(),
        }
    }

    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.net.src, self.transport.src)
    }

    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.net.dst, self.transport.dst)
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src(), self.dst())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowId {
        FlowId::from_addrs(
            "10.0.0.1:51000".parse().unwrap(),
            "10.0.0.2:11434".parse().unwrap(),
        )
    }

    #[test]
    fn test_reverse_swaps_both_layers() {
        let f = flow();
        let r = f.reverse();
        assert_eq!(r.src(), f.dst());
        assert_eq!(r.dst(), f.src());
        assert_eq!(r.reverse(), f);
    }

    #[test]
    fn test_display() {
        assert_eq!(flow().to_string(), "10.0.0.1:51000->10.0.0.2:11434");
        assert_eq!(flow().transport.to_string(), "51000->11434");

        let v6 = FlowId::from_addrs("[::1]:80".parse().unwrap(), "[::1]:5000".parse().unwrap());
        assert_eq!(v6.to_string(), "[::1]:80->[::1]:5000");
    }
}
