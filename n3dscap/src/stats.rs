use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the conditions the pipeline recovers from on its own.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub chunks: AtomicU64,
    pub failed_transfers: AtomicU64,
    pub dropped_chunks: AtomicU64,
    pub frames: AtomicU64,
    pub corrupt_frames: AtomicU64,
    pub audio_blocks: AtomicU64,
    pub audio_underruns: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub chunks: u64,
    pub failed_transfers: u64,
    pub dropped_chunks: u64,
    pub frames: u64,
    pub corrupt_frames: u64,
    pub audio_blocks: u64,
    pub audio_underruns: u64,
}

impl PipelineStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chunks: self.chunks.load(Ordering::Relaxed),
            failed_transfers: self.failed_transfers.load(Ordering::Relaxed),
            dropped_chunks: self.dropped_chunks.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            corrupt_frames: self.corrupt_frames.load(Ordering::Relaxed),
            audio_blocks: self.audio_blocks.load(Ordering::Relaxed),
            audio_underruns: self.audio_underruns.load(Ordering::Relaxed),
        }
    }
}
