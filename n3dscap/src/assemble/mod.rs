pub mod audio;
pub mod frame;
pub mod parse;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info, warn};

use crate::capture::TransportEvent;
use crate::frame::{AudioBlock, VideoFrame};
use crate::profile::DeviceProfile;
use crate::stats::PipelineStats;
use crate::sync::SyncBuffer;

use audio::AudioAssembler;
use frame::{FrameAssembler, FrameEvent};

// longest run of missing frames stood in with silence, two seconds of capture
const MAX_FILLED_FRAMES: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Turns transport events into published frames and audio blocks.
pub struct StreamAssembler {
    profile: DeviceProfile,
    frames: FrameAssembler,
    audio: AudioAssembler,
    sync: Arc<SyncBuffer>,
    stats: Arc<PipelineStats>,
    frame_sequence: u64,
    frame_events: Vec<FrameEvent>,
    blocks: Vec<AudioBlock>,
}

impl StreamAssembler {
    pub fn new(profile: DeviceProfile, sync: Arc<SyncBuffer>, stats: Arc<PipelineStats>) -> Self {
        Self {
            frames: FrameAssembler::new(profile.framing.clone(), profile.body_len()),
            audio: AudioAssembler::new(profile.audio),
            profile,
            sync,
            stats,
            frame_sequence: 0,
            frame_events: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn handle(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Chunk(chunk) => {
                self.frames.push(&chunk, &mut self.frame_events);

                let mut events = std::mem::take(&mut self.frame_events);
                for event in events.drain(..) {
                    match event {
                        FrameEvent::Ready(body) => self.frame_ready(body, chunk.received_at),
                        FrameEvent::Discarded { received, reason } => {
                            debug!(
                                "frame {} discarded after {} bytes: {:?}",
                                self.frame_sequence, received, reason
                            );
                            self.frames_lost(1, chunk.received_at);
                        }
                        FrameEvent::Missed(count) => {
                            debug!("{} frames missing before chunk {}", count, chunk.sequence);
                            self.frames_lost(count, chunk.received_at);
                        }
                    }
                }
                self.frame_events = events;
                Flow::Continue
            }
            TransportEvent::DeviceLost => {
                warn!("{} disconnected", self.profile.name);
                self.sync.mark_lost();
                Flow::Stop
            }
            TransportEvent::Closed => {
                info!("capture stream closed");
                Flow::Stop
            }
        }
    }

    fn frame_ready(&mut self, body: Bytes, captured_at: Instant) {
        let video = &self.profile.video;
        let decoded = parse::split_body(video, &body)
            .and_then(|(image, pcm)| parse::decode_image(video, image).map(|px| (px, pcm)));

        let (pixels, pcm) = match decoded {
            Some(parts) => parts,
            None => {
                warn!("frame body of {} bytes does not match the profile", body.len());
                self.frames_lost(1, captured_at);
                return;
            }
        };

        let (width, height) = video.frame_size();
        let sequence = self.next_sequence();
        self.sync
            .publish_video(VideoFrame::new(pixels, width, height, sequence, captured_at));
        PipelineStats::bump(&self.stats.frames);

        self.audio.push_bytes(pcm, &mut self.blocks);
        self.publish_blocks();
    }

    /// Publishes an invalid frame so the consumer holds its last good one,
    /// and keeps the audio clock going with `count` frames' worth of silence.
    fn frames_lost(&mut self, count: u64, captured_at: Instant) {
        let (width, height) = self.profile.video.frame_size();
        self.frame_sequence += count - 1;
        let sequence = self.next_sequence();
        self.sync
            .publish_video(VideoFrame::truncated(width, height, sequence, captured_at));
        PipelineStats::add(&self.stats.corrupt_frames, count);

        if count > MAX_FILLED_FRAMES {
            warn!("{} frames lost, audio clock skips ahead", count);
        }
        let filled = count.min(MAX_FILLED_FRAMES) as usize;
        self.audio
            .fill_gap(self.profile.audio.frames_per_body() * filled, &mut self.blocks);
        self.publish_blocks();
    }

    fn publish_blocks(&mut self) {
        for block in self.blocks.drain(..) {
            if block.underrun {
                PipelineStats::bump(&self.stats.audio_underruns);
            }
            PipelineStats::bump(&self.stats.audio_blocks);
            self.sync.publish_audio(block);
        }
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.frame_sequence;
        self.frame_sequence += 1;
        sequence
    }
}
