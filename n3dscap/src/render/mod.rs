//! The consumer side of the pipeline, driven by an external tick.

pub mod compose;

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, trace};

use crate::config::{ConfigHandle, PipelineConfig, ScaleFactor};
use crate::frame::VideoFrame;
use crate::profile::ScreenRegion;
use crate::sync::{LinkState, SyncBuffer};

use compose::Layout;

/// Something that can put an RGBA8 image on screen.
///
/// `present` is only called when the image changed; the renderer keeps
/// showing the last one in between.
pub trait Renderer {
    fn present(&mut self, pixels: &[u8], width: u32, height: u32);

    /// Called once when the capture device goes away.
    fn disconnected(&mut self) {}
}

/// Something that plays interleaved 16 bit PCM.
pub trait AudioSink {
    fn write(&mut self, samples: &[i16], sample_count: usize);

    /// Drops anything queued but not yet played.
    fn flush(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentState {
    Live,
    Disconnected,
}

/// What one call to [`RenderCoordinator::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// The renderer got a `present` call
    pub presented: bool,
    /// A frame not shown before became current
    pub new_frame: bool,
    /// A corrupt frame arrived and the previous one was held instead
    pub held_frame: bool,
    /// An audio block went to the sink
    pub audio_written: bool,
    /// This tick noticed the device loss
    pub disconnected: bool,
}

const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct FpsCounter {
    frames: u32,
    window_start: Instant,
    fps: f32,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            frames: 0,
            window_start: Instant::now(),
            fps: 0.0,
        }
    }

    fn tick(&mut self, new_frame: bool) {
        if new_frame {
            self.frames += 1;
        }
        let elapsed = self.window_start.elapsed();
        if elapsed >= FPS_WINDOW {
            self.fps = self.frames as f32 / elapsed.as_secs_f32();
            self.frames = 0;
            self.window_start = Instant::now();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ComposeKey {
    frame: u64,
    scale: ScaleFactor,
    crop: bool,
}

/// Pulls the newest frame and audio block from a [`SyncBuffer`] on every tick
/// and hands them, transformed by the current [`PipelineConfig`], to the
/// renderer and the audio sink. Never waits on the capture side.
pub struct RenderCoordinator<R, A> {
    renderer: R,
    sink: A,
    config: ConfigHandle,
    screens: Vec<ScreenRegion>,
    sync: Arc<SyncBuffer>,
    state: PresentState,

    video_generation: u64,
    last_valid: Option<Arc<VideoFrame>>,
    composed: Vec<u8>,
    composed_size: (u32, u32),
    composed_key: Option<ComposeKey>,

    audio_generation: u64,
    last_block: Option<u64>,
    dropped_blocks: u64,
    volume_buffer: Vec<i16>,

    fps: FpsCounter,
}

impl<R: Renderer, A: AudioSink> RenderCoordinator<R, A> {
    pub fn new(
        renderer: R,
        sink: A,
        config: ConfigHandle,
        screens: Vec<ScreenRegion>,
        sync: Arc<SyncBuffer>,
    ) -> Self {
        Self {
            renderer,
            sink,
            config,
            screens,
            sync,
            state: PresentState::Live,
            video_generation: 0,
            last_valid: None,
            composed: Vec::new(),
            composed_size: (0, 0),
            composed_key: None,
            audio_generation: 0,
            last_block: None,
            dropped_blocks: 0,
            volume_buffer: Vec::new(),
            fps: FpsCounter::new(),
        }
    }

    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if self.state == PresentState::Disconnected {
            return report;
        }
        if self.sync.link_state() == LinkState::Lost {
            info!("capture link lost, presenting disconnected state");
            self.state = PresentState::Disconnected;
            self.renderer.disconnected();
            self.sink.flush();
            report.disconnected = true;
            return report;
        }

        let config = self.config.snapshot();
        self.tick_video(&config, &mut report);
        self.tick_audio(&config, &mut report);
        self.fps.tick(report.new_frame);

        report
    }

    fn tick_video(&mut self, config: &PipelineConfig, report: &mut TickReport) {
        if let Some(claimed) = self.sync.claim_video() {
            if claimed.generation != self.video_generation {
                self.video_generation = claimed.generation;
                if claimed.item.valid {
                    self.last_valid = Some(claimed.item);
                    report.new_frame = true;
                } else {
                    trace!("holding previous frame over corrupt frame {}", claimed.item.sequence);
                    report.held_frame = true;
                }
            }
        }

        let frame = match &self.last_valid {
            Some(frame) => frame,
            None => return,
        };

        let key = ComposeKey {
            frame: frame.sequence,
            scale: config.scale,
            crop: config.crop,
        };
        if self.composed_key == Some(key) {
            return;
        }
        let layout = Layout::stacked(&self.screens, config.crop);
        self.composed_size = compose::compose(frame, &layout, config.scale, &mut self.composed);
        self.composed_key = Some(key);

        let (width, height) = self.composed_size;
        self.renderer.present(&self.composed, width, height);
        report.presented = true;
    }

    fn tick_audio(&mut self, config: &PipelineConfig, report: &mut TickReport) {
        let claimed = match self.sync.claim_audio() {
            Some(claimed) if claimed.generation != self.audio_generation => claimed,
            _ => return,
        };
        self.audio_generation = claimed.generation;

        let block = &claimed.item;
        if let Some(last) = self.last_block {
            let missed = block.sequence.saturating_sub(last + 1);
            if missed > 0 {
                trace!("{} audio blocks replaced before playback", missed);
                self.dropped_blocks += missed;
            }
        }
        self.last_block = Some(block.sequence);

        config.apply_volume(block.valid_samples(), &mut self.volume_buffer);
        self.sink.write(&self.volume_buffer, block.sample_count);
        report.audio_written = true;
    }

    /// Switches to a fresh buffer after a reconnect.
    pub fn attach(&mut self, sync: Arc<SyncBuffer>) {
        self.sync = sync;
        self.state = PresentState::Live;
        self.video_generation = 0;
        self.audio_generation = 0;
        self.last_block = None;
        self.last_valid = None;
        self.composed_key = None;
    }

    pub fn state(&self) -> PresentState {
        self.state
    }

    /// New valid frames per second over the last second.
    pub fn fps(&self) -> f32 {
        self.fps.fps
    }

    /// Audio blocks that were replaced in the buffer before being played.
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped_blocks
    }

    /// Size of what the renderer is currently given.
    pub fn output_size(&self) -> (u32, u32) {
        self.composed_size
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn sink(&self) -> &A {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut A {
        &mut self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::AudioBlock;
    use crate::profile::DeviceProfile;
    use bytes::Bytes;

    #[derive(Default)]
    struct Screen {
        frames: Vec<(u8, u32, u32)>,
        disconnects: usize,
    }

    impl Renderer for Screen {
        fn present(&mut self, pixels: &[u8], width: u32, height: u32) {
            self.frames.push((pixels[0], width, height));
        }

        fn disconnected(&mut self) {
            self.disconnects += 1;
        }
    }

    #[derive(Default)]
    struct Speaker {
        blocks: Vec<Vec<i16>>,
        flushes: usize,
    }

    impl AudioSink for Speaker {
        fn write(&mut self, samples: &[i16], sample_count: usize) {
            self.blocks.push(samples[..sample_count].to_vec());
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    fn frame(shade: u8, sequence: u64, valid: bool) -> VideoFrame {
        let mut frame = VideoFrame::new(
            Bytes::from(vec![shade; 720 * 240 * 4]),
            720,
            240,
            sequence,
            Instant::now(),
        );
        frame.valid = valid;
        frame
    }

    fn block(value: i16, sequence: u64) -> AudioBlock {
        AudioBlock {
            samples: vec![value; 4],
            sample_count: 4,
            channels: 2,
            timestamp: Duration::ZERO,
            sequence,
            underrun: false,
        }
    }

    fn coordinator(
        config: PipelineConfig,
    ) -> (RenderCoordinator<Screen, Speaker>, Arc<SyncBuffer>) {
        let sync = Arc::new(SyncBuffer::new());
        let coordinator = RenderCoordinator::new(
            Screen::default(),
            Speaker::default(),
            ConfigHandle::new(config),
            DeviceProfile::n3ds().screens,
            Arc::clone(&sync),
        );
        (coordinator, sync)
    }

    #[test]
    fn nothing_published_means_no_calls() {
        let (mut coordinator, _sync) = coordinator(PipelineConfig::default());
        assert_eq!(coordinator.tick(), TickReport::default());
        assert!(coordinator.renderer().frames.is_empty());
        assert!(coordinator.sink().blocks.is_empty());
    }

    #[test]
    fn corrupt_frame_holds_previous() {
        let (mut coordinator, sync) = coordinator(PipelineConfig::default());

        sync.publish_video(frame(7, 0, true));
        coordinator.tick();
        sync.publish_video(frame(0, 1, false));
        let report = coordinator.tick();

        assert!(report.held_frame);
        assert!(!report.presented);
        let shades: Vec<u8> = coordinator.renderer().frames.iter().map(|f| f.0).collect();
        assert_eq!(shades, vec![7]);
    }

    #[test]
    fn unchanged_image_is_presented_once() {
        let (mut coordinator, sync) = coordinator(PipelineConfig::default());
        sync.publish_video(frame(4, 0, true));

        assert!(coordinator.tick().presented);
        assert!(!coordinator.tick().presented);
        assert!(!coordinator.tick().presented);
        assert_eq!(coordinator.renderer().frames.len(), 1);

        coordinator.config().toggle_crop();
        assert!(coordinator.tick().presented);
        sync.publish_video(frame(5, 1, true));
        assert!(coordinator.tick().presented);
        assert_eq!(coordinator.renderer().frames.len(), 3);
    }

    #[test]
    fn audio_block_is_written_once_with_volume() {
        let config = PipelineConfig {
            volume: 50,
            ..PipelineConfig::default()
        };
        let (mut coordinator, sync) = coordinator(config);

        sync.publish_audio(block(1000, 0));
        coordinator.tick();
        coordinator.tick();
        sync.publish_audio(block(-1000, 2));
        coordinator.tick();

        assert_eq!(coordinator.sink().blocks, vec![vec![500; 4], vec![-500; 4]]);
        assert_eq!(coordinator.dropped_blocks(), 1);
    }

    #[test]
    fn config_change_recomposes_same_frame() {
        let (mut coordinator, sync) = coordinator(PipelineConfig::default());
        sync.publish_video(frame(3, 0, true));

        coordinator.tick();
        coordinator.config().set_scale(ScaleFactor::Two);
        coordinator.config().toggle_crop();
        coordinator.tick();

        let sizes: Vec<(u32, u32)> = coordinator
            .renderer()
            .frames
            .iter()
            .map(|f| (f.1, f.2))
            .collect();
        assert_eq!(sizes, vec![(400, 480), (512, 768)]);
    }

    #[test]
    fn lost_link_disconnects_once_and_goes_quiet() {
        let (mut coordinator, sync) = coordinator(PipelineConfig::default());
        sync.publish_video(frame(1, 0, true));
        coordinator.tick();

        sync.publish_video(frame(2, 1, true));
        sync.publish_audio(block(5, 0));
        sync.mark_lost();

        assert!(coordinator.tick().disconnected);
        assert_eq!(coordinator.tick(), TickReport::default());
        assert_eq!(coordinator.state(), PresentState::Disconnected);
        assert_eq!(coordinator.renderer().frames.len(), 1);
        assert_eq!(coordinator.renderer().disconnects, 1);
        assert_eq!(coordinator.sink().flushes, 1);
        assert!(coordinator.sink().blocks.is_empty());

        let fresh = Arc::new(SyncBuffer::new());
        fresh.publish_video(frame(9, 0, true));
        coordinator.attach(fresh);
        assert!(coordinator.tick().new_frame);
        assert_eq!(coordinator.renderer().frames.last().unwrap().0, 9);
    }
}
