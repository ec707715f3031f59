//! Packet sources
//!
//! Provides a unified interface over where TCP segments come from:
//!
//! - **libpcap**: live interface or offline capture file ([`open_capture`])
//! - **Channels**: segments pushed by other tasks ([`PacketStream::channel`])
//! - **Synthetic**: generated conversations for demos and tests ([`TestGenerator`])

use async_trait::async_trait;
use promptdump_core::{ConfigError, TcpSegment};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod decode;
pub mod pcap_source;
pub mod test_generator;

pub use decode::decode_packet;
pub use pcap_source::open_capture;
pub use test_generator::{Conversation, TestGenerator, TestGeneratorConfig};

/// Capture error type
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("error opening capture source {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: pcap::Error,
    },

    #[error("error setting BPF filter {filter:?}: {source}")]
    Filter {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    #[error("error decoding a packet: {0}")]
    Decode(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// Something that yields decoded TCP segments.
///
/// `next_packet` returns `None` once the source is exhausted. Errors are
/// per packet and never end the stream. Implementations must be cancel
/// safe: the orchestrator polls them inside `tokio::select!`.
#[async_trait]
pub trait PacketSource: Send {
    async fn next_packet(&mut self) -> Option<CaptureResult<TcpSegment>>;
}

/// Channel-backed packet source.
///
/// The producing side (capture thread, generator task, test) holds the
/// sender; the stream ends when every sender is dropped.
pub struct PacketStream {
    rx: mpsc::Receiver<CaptureResult<TcpSegment>>,
}

impl PacketStream {
    /// Create a stream and the sender feeding it
    pub fn channel(capacity: usize) -> (mpsc::Sender<CaptureResult<TcpSegment>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// A stream that replays the given segments and then ends
    pub fn from_segments(segments: Vec<TcpSegment>) -> Self {
        let (tx, stream) = Self::channel(segments.len());
        for segment in segments {
            // Capacity equals the segment count, so this never fails
            let _ = tx.try_send(Ok(segment));
        }
        stream
    }
}

#[async_trait]
impl PacketSource for PacketStream {
    async fn next_packet(&mut self) -> Option<CaptureResult<TcpSegment>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptdump_core::{FlowId, TcpFlags};

    fn segment(seq: u32) -> TcpSegment {
        TcpSegment::new(
            FlowId::from_addrs(
                "10.0.0.1:40000".parse().unwrap(),
                "10.0.0.2:80".parse().unwrap(),
            ),
            seq,
            TcpFlags::default(),
            b"x".to_vec(),
        )
    }

    #[tokio::test]
    async fn test_from_segments_replays_in_order() {
        let mut stream = PacketStream::from_segments(vec![segment(1), segment(2)]);
        assert_eq!(stream.next_packet().await.unwrap().unwrap().seq, 1);
        assert_eq!(stream.next_packet().await.unwrap().unwrap().seq, 2);
        assert!(stream.next_packet().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_passes_errors_through() {
        let (tx, mut stream) = PacketStream::channel(4);
        tx.send(Err(CaptureError::Decode("truncated".into())))
            .await
            .unwrap();
        tx.send(Ok(segment(7))).await.unwrap();
        drop(tx);

        assert!(matches!(
            stream.next_packet().await,
            Some(Err(CaptureError::Decode(_)))
        ));
        assert_eq!(stream.next_packet().await.unwrap().unwrap().seq, 7);
        assert!(stream.next_packet().await.is_none());
    }
}
