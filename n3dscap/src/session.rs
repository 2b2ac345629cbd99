use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::assemble::{Flow, StreamAssembler};
use crate::capture::{EventSender, Transport, TransportEvent};
use crate::error::{CaptureError, Result};
use crate::profile::DeviceProfile;
use crate::stats::PipelineStats;
use crate::sync::SyncBuffer;

/// Chunks buffered between the transport and the assembly thread.
pub const CHANNEL_DEPTH: usize = 64;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// A running transport plus the thread that assembles its output.
pub struct CaptureSession {
    transport: Box<dyn Transport>,
    closer: SyncSender<TransportEvent>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
}

impl CaptureSession {
    pub fn start(
        mut transport: Box<dyn Transport>,
        profile: DeviceProfile,
        sync: Arc<SyncBuffer>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        profile.validate().map_err(CaptureError::Protocol)?;

        let (tx, rx) = mpsc::sync_channel(CHANNEL_DEPTH);
        let assembler = StreamAssembler::new(profile, sync, Arc::clone(&stats));

        let worker = {
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name("assembler".to_string())
                .spawn(move || run(assembler, rx, &stats))
                .map_err(CaptureError::Io)?
        };

        let events = EventSender::new(tx.clone(), Arc::clone(&stats));
        if let Err(err) = transport.start(events) {
            let _ = tx.send(TransportEvent::Closed);
            let _ = worker.join();
            return Err(err);
        }

        Ok(Self {
            transport,
            closer: tx,
            worker: Some(worker),
            stats,
        })
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Stops the transport and waits for the assembly thread. Idempotent.
    pub fn stop(&mut self) {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return,
        };

        self.transport.stop();
        // the worker may already be gone after a device loss
        let _ = self.closer.send(TransportEvent::Closed);
        if worker.join().is_err() {
            error!("assembler thread panicked");
        }
        info!("capture session stopped: {:?}", self.stats.snapshot());
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut assembler: StreamAssembler, rx: Receiver<TransportEvent>, stats: &PipelineStats) {
    let mut last_report = Instant::now();

    loop {
        let flow = match rx.recv_timeout(STATS_INTERVAL) {
            Ok(event) => assembler.handle(event),
            Err(RecvTimeoutError::Timeout) => Flow::Continue,
            Err(RecvTimeoutError::Disconnected) => Flow::Stop,
        };
        if flow == Flow::Stop {
            break;
        }

        if last_report.elapsed() >= STATS_INTERVAL {
            debug!("{:?}", stats.snapshot());
            last_report = Instant::now();
        }
    }
    debug!("assembler thread finished");
}
