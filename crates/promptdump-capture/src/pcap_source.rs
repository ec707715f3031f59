//! libpcap-backed packet source
//!
//! The capture handle is opened synchronously so that a bad interface, an
//! unreadable file or an invalid BPF filter are reported to the caller
//! before anything runs. Reading happens on a blocking thread that pushes
//! decoded segments into a [`PacketStream`].

use crate::decode::decode_packet;
use crate::{CaptureError, CaptureResult, PacketStream};
use pcap::{Activated, Capture};
use promptdump_core::{CaptureSettings, CaptureSource, TcpSegment};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Open the capture described by `settings` and start reading from it.
///
/// Must be called from within a tokio runtime.
pub fn open_capture(settings: &CaptureSettings) -> CaptureResult<PacketStream> {
    let (tx, stream) = PacketStream::channel(settings.channel_capacity);

    match settings.source()? {
        CaptureSource::Live(device) => {
            let mut capture = Capture::from_device(device.as_str())
                .and_then(|c| {
                    c.promisc(settings.promiscuous)
                        .snaplen(settings.snaplen)
                        .timeout(i32::try_from(settings.read_timeout_ms).unwrap_or(i32::MAX))
                        .immediate_mode(true)
                        .open()
                })
                .map_err(|source| CaptureError::Open {
                    target: device.clone(),
                    source,
                })?;
            apply_filter(&mut capture, &settings.bpf_filter)?;
            info!(
                "Capturing on {} (filter: {:?}, promiscuous: {})",
                device, settings.bpf_filter, settings.promiscuous
            );
            spawn_pump(capture, tx);
        }
        CaptureSource::Offline(path) => {
            let mut capture =
                Capture::from_file(&path).map_err(|source| CaptureError::Open {
                    target: path.display().to_string(),
                    source,
                })?;
            apply_filter(&mut capture, &settings.bpf_filter)?;
            info!(
                "Reading {} (filter: {:?})",
                path.display(),
                settings.bpf_filter
            );
            spawn_pump(capture, tx);
        }
    }

    Ok(stream)
}

fn apply_filter<T: Activated + ?Sized>(
    capture: &mut Capture<T>,
    filter: &str,
) -> CaptureResult<()> {
    if filter.trim().is_empty() {
        return Ok(());
    }
    capture
        .filter(filter, true)
        .map_err(|source| CaptureError::Filter {
            filter: filter.to_string(),
            source,
        })
}

fn spawn_pump<T>(capture: Capture<T>, tx: mpsc::Sender<CaptureResult<TcpSegment>>)
where
    T: Activated + ?Sized + 'static,
    Capture<T>: Send,
{
    tokio::task::spawn_blocking(move || pump(capture, tx));
}

/// Read packets until the capture is exhausted or the consumer goes away
fn pump<T: Activated + ?Sized>(
    mut capture: Capture<T>,
    tx: mpsc::Sender<CaptureResult<TcpSegment>>,
) {
    let linktype = capture.get_datalink().0;
    let mut packets: u64 = 0;

    loop {
        let item = match capture.next_packet() {
            Ok(packet) => {
                packets += 1;
                match decode_packet(linktype, packet.data) {
                    Ok(Some(segment)) => Ok(segment),
                    Ok(None) => continue,
                    Err(e) => Err(e),
                }
            }
            Err(pcap::Error::TimeoutExpired) => {
                if tx.is_closed() {
                    break;
                }
                continue;
            }
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => {
                warn!("Capture read failed: {}", e);
                break;
            }
        };

        if tx.blocking_send(item).is_err() {
            debug!("Packet consumer dropped, stopping capture");
            break;
        }
    }

    info!("Capture finished after {} packets", packets);
}
