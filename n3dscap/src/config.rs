//! User-adjustable presentation settings.
//!
//! Input handling writes, the render tick reads a snapshot once per tick.

use std::sync::{Arc, PoisonError, RwLock};

pub const MAX_VOLUME: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleFactor {
    #[default]
    One,
    OneAndHalf,
    Two,
}

impl ScaleFactor {
    /// Scale as an exact numerator / denominator pair.
    pub fn ratio(self) -> (u32, u32) {
        match self {
            ScaleFactor::One => (1, 1),
            ScaleFactor::OneAndHalf => (3, 2),
            ScaleFactor::Two => (2, 1),
        }
    }

    pub fn apply(self, length: u32) -> u32 {
        let (num, den) = self.ratio();
        length * num / den
    }

    pub fn as_f32(self) -> f32 {
        let (num, den) = self.ratio();
        num as f32 / den as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub scale: ScaleFactor,
    pub crop: bool,
    pub volume: u8,
    pub muted: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scale: ScaleFactor::One,
            crop: false,
            volume: MAX_VOLUME,
            muted: false,
        }
    }
}

impl PipelineConfig {
    /// Linear gain: `volume / 100`, zero when muted.
    pub fn apply_volume(&self, input: &[i16], output: &mut Vec<i16>) {
        output.clear();
        if self.muted || self.volume == 0 {
            output.resize(input.len(), 0);
            return;
        }

        let volume = self.volume.min(MAX_VOLUME) as i32;
        output.extend(
            input
                .iter()
                .map(|s| (*s as i32 * volume / MAX_VOLUME as i32) as i16),
        );
    }
}

/// Shared handle to the live [`PipelineConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<PipelineConfig>>,
}

impl ConfigHandle {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> PipelineConfig {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F: FnOnce(&mut PipelineConfig)>(&self, f: F) -> PipelineConfig {
        let mut config = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut config);
        *config
    }

    pub fn set_scale(&self, scale: ScaleFactor) -> PipelineConfig {
        self.update(|c| c.scale = scale)
    }

    pub fn toggle_crop(&self) -> PipelineConfig {
        self.update(|c| c.crop = !c.crop)
    }

    /// Moves the volume by `delta`, clamped to 0..=100.
    pub fn adjust_volume(&self, delta: i16) -> PipelineConfig {
        self.update(|c| {
            c.volume = (c.volume as i16)
                .saturating_add(delta)
                .clamp(0, MAX_VOLUME as i16) as u8;
        })
    }

    pub fn toggle_mute(&self) -> PipelineConfig {
        self.update(|c| c.muted = !c.muted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mute_zeroes_everything() {
        let config = PipelineConfig {
            muted: true,
            ..Default::default()
        };
        let mut out = Vec::new();
        config.apply_volume(&[i16::MAX, i16::MIN, 1234, -1], &mut out);
        assert_eq!(out, vec![0, 0, 0, 0]);
    }

    #[test]
    fn half_volume_halves_amplitude() {
        let input = [1000, -2000, 32000, -32000];

        let mut full = Vec::new();
        PipelineConfig::default().apply_volume(&input, &mut full);

        let mut half = Vec::new();
        PipelineConfig {
            volume: 50,
            ..Default::default()
        }
        .apply_volume(&input, &mut half);

        assert_eq!(full, input.to_vec());
        for (h, f) in half.iter().zip(full.iter()) {
            assert_eq!(*h * 2, *f);
        }
    }

    #[test]
    fn volume_is_clamped() {
        let handle = ConfigHandle::default();
        assert_eq!(handle.adjust_volume(25).volume, 100);
        assert_eq!(handle.adjust_volume(-130).volume, 0);
        assert_eq!(handle.adjust_volume(5).volume, 5);
    }

    #[test]
    fn extreme_volume_steps_saturate() {
        let handle = ConfigHandle::default();
        assert_eq!(handle.adjust_volume(i16::MAX).volume, 100);
        assert_eq!(handle.adjust_volume(i16::MIN).volume, 0);
        assert_eq!(handle.adjust_volume(i16::MIN).volume, 0);
        assert_eq!(handle.adjust_volume(i16::MAX).volume, 100);
    }

    #[test]
    fn toggles_flip_state() {
        let handle = ConfigHandle::default();
        assert!(handle.toggle_crop().crop);
        assert!(!handle.toggle_crop().crop);
        assert!(handle.toggle_mute().muted);
        assert_eq!(handle.set_scale(ScaleFactor::Two).scale, ScaleFactor::Two);
        assert_eq!(handle.snapshot().scale, ScaleFactor::Two);
    }

    #[test]
    fn scale_ratios() {
        assert_eq!(ScaleFactor::One.apply(400), 400);
        assert_eq!(ScaleFactor::OneAndHalf.apply(400), 600);
        assert_eq!(ScaleFactor::Two.apply(384), 768);
    }
}
