//! Single-slot exchange between the assembly thread and the render tick.
//!
//! Each slot holds the newest published item. Publishing replaces the slot
//! without waiting for the consumer; claiming hands out a shared reference and
//! leaves the item in place, so a stalled producer makes the renderer repeat
//! the last frame instead of showing nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::frame::{AudioBlock, VideoFrame};

/// A claimed slot item together with the publish generation it came from.
#[derive(Debug, Clone)]
pub struct Claimed<T> {
    pub generation: u64,
    pub item: Arc<T>,
}

#[derive(Debug)]
struct Slot<T> {
    current: Option<Arc<T>>,
    generation: u64,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            current: None,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Streaming,
    Lost,
}

#[derive(Debug)]
pub struct SyncBuffer {
    video: Mutex<Slot<VideoFrame>>,
    audio: Mutex<Slot<AudioBlock>>,
    lost: AtomicBool,
}

impl Default for SyncBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncBuffer {
    pub fn new() -> Self {
        Self {
            video: Mutex::new(Slot::new()),
            audio: Mutex::new(Slot::new()),
            lost: AtomicBool::new(false),
        }
    }

    /// Replaces the current frame and returns its generation. Never waits on
    /// the consumer.
    pub fn publish_video(&self, frame: VideoFrame) -> u64 {
        publish(&self.video, frame)
    }

    pub fn publish_audio(&self, block: AudioBlock) -> u64 {
        publish(&self.audio, block)
    }

    pub fn claim_video(&self) -> Option<Claimed<VideoFrame>> {
        claim(&self.video)
    }

    pub fn claim_audio(&self) -> Option<Claimed<AudioBlock>> {
        claim(&self.audio)
    }

    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    pub fn link_state(&self) -> LinkState {
        if self.lost.load(Ordering::Acquire) {
            LinkState::Lost
        } else {
            LinkState::Streaming
        }
    }
}

fn publish<T>(slot: &Mutex<Slot<T>>, item: T) -> u64 {
    // build the Arc outside the lock, keep the critical section to a swap
    let item = Arc::new(item);
    let (previous, generation) = {
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.generation += 1;
        (slot.current.replace(item), slot.generation)
    };
    // the old frame may be the last reference, free it after unlocking
    drop(previous);
    generation
}

fn claim<T>(slot: &Mutex<Slot<T>>) -> Option<Claimed<T>> {
    let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    slot.current.as_ref().map(|item| Claimed {
        generation: slot.generation,
        item: Arc::clone(item),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::thread;
    use std::time::{Duration, Instant};

    fn frame(sequence: u64) -> VideoFrame {
        VideoFrame::new(
            Bytes::from(vec![sequence as u8; 2 * 2 * 4]),
            2,
            2,
            sequence,
            Instant::now(),
        )
    }

    fn block(sequence: u64) -> AudioBlock {
        AudioBlock {
            samples: vec![sequence as i16; 4],
            sample_count: 4,
            channels: 2,
            timestamp: Duration::ZERO,
            sequence,
            underrun: false,
        }
    }

    #[test]
    fn empty_slots_claim_nothing() {
        let sync = SyncBuffer::new();
        assert!(sync.claim_video().is_none());
        assert!(sync.claim_audio().is_none());
        assert_eq!(sync.link_state(), LinkState::Streaming);
    }

    #[test]
    fn newest_publish_wins() {
        let sync = SyncBuffer::new();
        sync.publish_video(frame(1));
        sync.publish_video(frame(2));
        sync.publish_video(frame(3));

        let claimed = sync.claim_video().unwrap();
        assert_eq!(claimed.item.sequence, 3);
        assert_eq!(claimed.generation, 3);
    }

    #[test]
    fn repeated_claim_returns_same_content() {
        let sync = SyncBuffer::new();
        sync.publish_video(frame(7));

        let first = sync.claim_video().unwrap();
        let second = sync.claim_video().unwrap();
        assert_eq!(first.generation, second.generation);
        assert!(Arc::ptr_eq(&first.item, &second.item));
        assert_eq!(first.item.pixels, second.item.pixels);
    }

    #[test]
    fn claimed_item_survives_replacement() {
        let sync = SyncBuffer::new();
        sync.publish_audio(block(1));
        let held = sync.claim_audio().unwrap();
        sync.publish_audio(block(2));

        assert_eq!(held.item.sequence, 1);
        assert_eq!(sync.claim_audio().unwrap().item.sequence, 2);
    }

    #[test]
    fn concurrent_claims_never_go_backwards() {
        let sync = Arc::new(SyncBuffer::new());
        let producer = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                for sequence in 1..=2000 {
                    sync.publish_video(frame(sequence));
                }
            })
        };

        let mut last = 0;
        while !producer.is_finished() {
            if let Some(claimed) = sync.claim_video() {
                assert!(claimed.item.sequence >= last);
                assert_eq!(claimed.item.sequence, claimed.generation);
                last = claimed.item.sequence;
            }
        }
        producer.join().unwrap();
        assert_eq!(sync.claim_video().unwrap().item.sequence, 2000);
    }

    #[test]
    fn lost_link_is_sticky() {
        let sync = SyncBuffer::new();
        sync.mark_lost();
        sync.publish_video(frame(1));
        assert_eq!(sync.link_state(), LinkState::Lost);
    }
}
