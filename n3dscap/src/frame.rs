use std::time::{Duration, Instant};

use bytes::Bytes;

/// One decoded video frame in display orientation.
///
/// `pixels` is RGBA8, `width * height * 4` bytes. A frame that was cut short
/// by the device is still published so the consumer notices the loss, but its
/// `valid` flag is cleared and its pixels must not be shown.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pixels: Bytes,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub captured_at: Instant,
    pub valid: bool,
}

impl VideoFrame {
    pub const BYTES_PER_PIXEL: usize = 4;

    pub fn new(pixels: Bytes, width: u32, height: u32, sequence: u64, captured_at: Instant) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize * Self::BYTES_PER_PIXEL);
        Self {
            pixels,
            width,
            height,
            sequence,
            captured_at,
            valid: true,
        }
    }

    pub fn truncated(width: u32, height: u32, sequence: u64, captured_at: Instant) -> Self {
        let len = width as usize * height as usize * Self::BYTES_PER_PIXEL;
        Self {
            pixels: Bytes::from(vec![0u8; len]),
            width,
            height,
            sequence,
            captured_at,
            valid: false,
        }
    }

    pub fn stride(&self) -> usize {
        self.width as usize * Self::BYTES_PER_PIXEL
    }
}

/// A fixed-size block of interleaved PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub samples: Vec<i16>,
    /// Number of valid interleaved samples in `samples`
    pub sample_count: usize,
    pub channels: u16,
    /// Position of the first sample on the capture audio clock
    pub timestamp: Duration,
    pub sequence: u64,
    /// Some or all of the block is substituted silence
    pub underrun: bool,
}

impl AudioBlock {
    pub fn frames(&self) -> usize {
        self.sample_count / self.channels.max(1) as usize
    }

    pub fn valid_samples(&self) -> &[i16] {
        &self.samples[..self.sample_count]
    }

    pub fn is_silent(&self) -> bool {
        self.valid_samples().iter().all(|s| *s == 0)
    }
}
