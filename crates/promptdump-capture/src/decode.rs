//! Link/IP/TCP decoding of captured frames

use crate::{CaptureError, CaptureResult};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use promptdump_core::{Flow, FlowId, TcpFlags, TcpSegment};
use std::net::IpAddr;

/// DLT_NULL (BSD loopback)
const LINKTYPE_NULL: i32 = 0;
/// DLT_EN10MB
const LINKTYPE_ETHERNET: i32 = 1;
/// DLT_RAW (BSD numbering)
const LINKTYPE_RAW_BSD: i32 = 12;
/// DLT_LOOP (OpenBSD loopback)
const LINKTYPE_LOOP: i32 = 108;
/// LINKTYPE_RAW
const LINKTYPE_RAW: i32 = 101;
/// Linux cooked capture v1
const LINKTYPE_LINUX_SLL: i32 = 113;
const LINKTYPE_IPV4: i32 = 228;
const LINKTYPE_IPV6: i32 = 229;

const LOOPBACK_HEADER_LEN: usize = 4;
const LINUX_SLL_HEADER_LEN: usize = 16;

/// Decode one captured frame into a TCP segment.
///
/// Returns `Ok(None)` for frames that are well formed but not TCP over
/// IPv4/IPv6 (ARP, UDP, ...); those are simply not our business.
pub fn decode_packet(linktype: i32, data: &[u8]) -> CaptureResult<Option<TcpSegment>> {
    let sliced = match linktype {
        LINKTYPE_ETHERNET => SlicedPacket::from_ethernet(data),
        LINKTYPE_NULL | LINKTYPE_LOOP => SlicedPacket::from_ip(strip(data, LOOPBACK_HEADER_LEN)?),
        LINKTYPE_LINUX_SLL => SlicedPacket::from_ip(strip(data, LINUX_SLL_HEADER_LEN)?),
        LINKTYPE_RAW | LINKTYPE_RAW_BSD | LINKTYPE_IPV4 | LINKTYPE_IPV6 => {
            SlicedPacket::from_ip(data)
        }
        other => {
            return Err(CaptureError::Decode(format!(
                "unsupported link type {}",
                other
            )))
        }
    }
    .map_err(|e| CaptureError::Decode(e.to_string()))?;

    let net = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => Flow::new(
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ipv6)) => Flow::new(
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return Ok(None),
    };

    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return Ok(None),
    };

    let flags = TcpFlags {
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
    };

    Ok(Some(TcpSegment::new(
        FlowId::new(net, Flow::new(tcp.source_port(), tcp.destination_port())),
        tcp.sequence_number(),
        flags,
        tcp.payload().to_vec(),
    )))
}

fn strip(data: &[u8], len: usize) -> CaptureResult<&[u8]> {
    data.get(len..)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| CaptureError::Decode(format!("frame shorter than {} byte link header", len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    const PAYLOAD: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    fn ethernet_frame() -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 1, 10], [192, 168, 1, 20], 64)
            .tcp(51000, 8080, 1000, 65535);
        let mut frame = Vec::with_capacity(builder.size(PAYLOAD.len()));
        builder.write(&mut frame, PAYLOAD).unwrap();
        frame
    }

    #[test]
    fn test_decode_ethernet_ipv4_tcp() {
        let segment = decode_packet(LINKTYPE_ETHERNET, &ethernet_frame())
            .unwrap()
            .unwrap();
        assert_eq!(segment.flow.to_string(), "192.168.1.10:51000->192.168.1.20:8080");
        assert_eq!(segment.seq, 1000);
        assert_eq!(segment.payload, PAYLOAD);
        assert!(!segment.flags.syn);
    }

    #[test]
    fn test_decode_loopback_ipv6_syn() {
        let builder = PacketBuilder::ipv6(
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
            64,
        )
        .tcp(51000, 11434, 77, 65535)
        .syn();
        let mut frame = vec![30, 0, 0, 0];
        builder.write(&mut frame, &[]).unwrap();

        let segment = decode_packet(LINKTYPE_NULL, &frame).unwrap().unwrap();
        assert_eq!(segment.flow.to_string(), "[::1]:51000->[::1]:11434");
        assert!(segment.flags.syn);
        assert!(segment.payload.is_empty());
    }

    #[test]
    fn test_decode_raw_ip() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(80, 40000, 5, 65535)
            .fin()
            .ack(9);
        let mut frame = Vec::new();
        builder.write(&mut frame, b"bye").unwrap();

        let segment = decode_packet(LINKTYPE_RAW, &frame).unwrap().unwrap();
        assert!(segment.flags.fin);
        assert!(segment.flags.ack);
        assert_eq!(segment.payload, b"bye");
    }

    #[test]
    fn test_decode_udp_is_skipped() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).udp(5353, 5353);
        let mut frame = Vec::new();
        builder.write(&mut frame, b"mdns").unwrap();

        assert!(decode_packet(LINKTYPE_RAW, &frame).unwrap().is_none());
    }

    #[test]
    fn test_decode_errors() {
        let frame = ethernet_frame();
        assert!(matches!(
            decode_packet(LINKTYPE_ETHERNET, &frame[..20]),
            Err(CaptureError::Decode(_))
        ));
        assert!(matches!(
            decode_packet(LINKTYPE_NULL, &[2, 0]),
            Err(CaptureError::Decode(_))
        ));
        assert!(matches!(
            decode_packet(9999, &frame),
            Err(CaptureError::Decode(_))
        ));
    }
}
