pub mod n3ds;
pub mod transfer;
pub mod usb;

use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{trace, warn};
use rusb::{Device, DeviceDescriptor, DeviceHandle, UsbContext};

use crate::error::{CaptureError, Result};
use crate::profile::DeviceFilter;
use crate::stats::PipelineStats;

/// Bytes from one completed transfer.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub data: Bytes,
    /// Monotonic per endpoint, assigned in completion order
    pub sequence: u64,
    pub endpoint: u8,
    /// False for timeouts, stalls and short reads
    pub success: bool,
    pub received_at: Instant,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Chunk(RawChunk),
    /// The device is gone; nothing follows
    DeviceLost,
    /// The transport was stopped on request; nothing follows
    Closed,
}

/// Producer side of the bounded channel between a transport and the
/// assembly thread.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: SyncSender<TransportEvent>,
    stats: Arc<PipelineStats>,
}

impl EventSender {
    pub fn new(tx: SyncSender<TransportEvent>, stats: Arc<PipelineStats>) -> Self {
        Self { tx, stats }
    }

    /// Hands a chunk over without blocking. A full channel drops the chunk;
    /// the assembler notices the sequence gap. Returns false once the
    /// receiving side is gone.
    pub fn chunk(&self, chunk: RawChunk) -> bool {
        PipelineStats::bump(&self.stats.chunks);
        if !chunk.success {
            PipelineStats::bump(&self.stats.failed_transfers);
        }

        match self.tx.try_send(TransportEvent::Chunk(chunk)) {
            Ok(()) => true,
            Err(TrySendError::Full(TransportEvent::Chunk(chunk))) => {
                trace!("assembler behind, dropped chunk {}", chunk.sequence);
                PipelineStats::bump(&self.stats.dropped_chunks);
                true
            }
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Device loss must not be dropped, so this one waits for room.
    pub fn device_lost(&self) {
        warn!("capture device lost");
        let _ = self.tx.send(TransportEvent::DeviceLost);
    }
}

/// Something that produces [`RawChunk`]s from a capture device.
pub trait Transport: Send {
    /// Begins issuing transfers. Every completed transfer produces exactly
    /// one chunk on `events`, in completion order.
    fn start(&mut self, events: EventSender) -> Result<()>;

    /// Cancels outstanding transfers. Idempotent; once it returns no more
    /// events are sent.
    fn stop(&mut self);
}

/// Finds and opens the first device matching `filter`.
pub fn open_device<T: UsbContext>(
    context: &T,
    filter: &DeviceFilter,
) -> Result<(Device<T>, DeviceDescriptor, DeviceHandle<T>)> {
    let devices = context.devices()?;

    for device in devices.iter() {
        let device_desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };

        if filter.matches(device_desc.vendor_id(), device_desc.product_id()) {
            let handle = device.open()?;
            return Ok((device, device_desc, handle));
        }
    }

    Err(CaptureError::DeviceNotFound {
        vendor_id: filter.vendor_id,
        product_id: filter.product_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn chunk(sequence: u64, success: bool) -> RawChunk {
        RawChunk {
            data: Bytes::from_static(&[1, 2, 3]),
            sequence,
            endpoint: 0x82,
            success,
            received_at: Instant::now(),
        }
    }

    #[test]
    fn full_channel_drops_and_counts() {
        let stats = Arc::new(PipelineStats::default());
        let (tx, rx) = mpsc::sync_channel(1);
        let sender = EventSender::new(tx, Arc::clone(&stats));

        assert!(sender.chunk(chunk(0, true)));
        assert!(sender.chunk(chunk(1, false)));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.chunks, 2);
        assert_eq!(snapshot.failed_transfers, 1);
        assert_eq!(snapshot.dropped_chunks, 1);

        match rx.recv().unwrap() {
            TransportEvent::Chunk(c) => assert_eq!(c.sequence, 0),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn closed_receiver_reports_false() {
        let (tx, rx) = mpsc::sync_channel(4);
        drop(rx);
        let sender = EventSender::new(tx, Arc::new(PipelineStats::default()));
        assert!(!sender.chunk(chunk(0, true)));
    }
}
