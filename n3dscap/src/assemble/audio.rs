use std::time::Duration;

use crate::frame::AudioBlock;
use crate::profile::AudioFormat;

/// Cuts the PCM carried in frame bodies into fixed-size [`AudioBlock`]s.
pub struct AudioAssembler {
    format: AudioFormat,
    pending: Vec<i16>,
    pending_underrun: bool,
    // sample frames already handed out, drives the block timestamps
    clock: u64,
    sequence: u64,
}

impl AudioAssembler {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            pending: Vec::with_capacity(format.block_samples() * 2),
            pending_underrun: false,
            clock: 0,
            sequence: 0,
        }
    }

    /// Appends little endian PCM. A trailing odd byte is ignored.
    pub fn push_bytes(&mut self, data: &[u8], out: &mut Vec<AudioBlock>) {
        self.pending.extend(
            data.chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        self.drain(out);
    }

    /// Stands in silence for `frames` sample frames that never arrived.
    pub fn fill_gap(&mut self, frames: usize, out: &mut Vec<AudioBlock>) {
        if frames == 0 {
            return;
        }
        let samples = frames * self.format.channels as usize;
        self.pending.resize(self.pending.len() + samples, 0);
        self.pending_underrun = true;
        self.drain(out);
    }

    /// Sample frames waiting for the next block boundary.
    pub fn buffered_frames(&self) -> usize {
        self.pending.len() / self.format.channels.max(1) as usize
    }

    fn drain(&mut self, out: &mut Vec<AudioBlock>) {
        let block_samples = self.format.block_samples();
        if block_samples == 0 {
            return;
        }

        while self.pending.len() >= block_samples {
            let samples: Vec<i16> = self.pending.drain(..block_samples).collect();
            out.push(AudioBlock {
                samples,
                sample_count: block_samples,
                channels: self.format.channels,
                timestamp: self.timestamp(),
                sequence: self.sequence,
                underrun: self.pending_underrun,
            });
            self.sequence += 1;
            self.clock += self.format.block_frames as u64;
            // silence left over belongs to the next block too
            self.pending_underrun = self.pending_underrun && !self.pending.is_empty();
        }
    }

    fn timestamp(&self) -> Duration {
        let rate = self.format.sample_rate.max(1) as u128;
        Duration::from_nanos((self.clock as u128 * 1_000_000_000 / rate) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> AudioFormat {
        AudioFormat {
            sample_rate: 1000,
            channels: 2,
            bytes_per_frame_body: 16,
            block_frames: 4,
        }
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn blocks_are_fixed_size_and_clocked() {
        let mut assembler = AudioAssembler::new(format());
        let mut out = Vec::new();

        let samples: Vec<i16> = (0..20).collect();
        assembler.push_bytes(&pcm(&samples), &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].valid_samples(), &samples[..8]);
        assert_eq!(out[1].valid_samples(), &samples[8..16]);
        assert_eq!(out[0].timestamp, Duration::ZERO);
        assert_eq!(out[1].timestamp, Duration::from_millis(4));
        assert_eq!(out[1].sequence, 1);
        assert_eq!(assembler.buffered_frames(), 2);
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        let mut assembler = AudioAssembler::new(format());
        let mut out = Vec::new();
        let mut bytes = pcm(&[1, 2, 3]);
        bytes.push(0x7F);

        assembler.push_bytes(&bytes, &mut out);
        assert!(out.is_empty());
        assert_eq!(assembler.pending, vec![1, 2, 3]);
    }

    #[test]
    fn gap_emits_silent_underrun_block() {
        let mut assembler = AudioAssembler::new(format());
        let mut out = Vec::new();

        assembler.push_bytes(&pcm(&[5; 8]), &mut out);
        assembler.fill_gap(4, &mut out);
        assembler.push_bytes(&pcm(&[6; 8]), &mut out);

        assert_eq!(out.len(), 3);
        assert!(!out[0].underrun);
        assert!(out[1].underrun);
        assert!(out[1].is_silent());
        assert!(!out[2].underrun);
        assert_eq!(out[2].timestamp, Duration::from_millis(8));
    }
}
