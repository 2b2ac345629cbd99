//! Frame boundary detection over the raw chunk stream.

use bytes::{Bytes, BytesMut};
use log::trace;
use memchr::memmem;

use crate::capture::RawChunk;
use crate::profile::Framing;

// bytes of skipped or interrupted data shown in trace output
const HEX_PREVIEW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    SeekingHeader,
    AccumulatingBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// A new header turned up before the body was complete
    HeaderInterrupted,
    /// Chunks went missing between the transport and the assembler
    SequenceGap,
    /// The transport reported the transfer as failed
    TransferFailed,
    /// A per-transfer frame came back shorter than a body
    ShortTransfer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete frame body, exactly `body_len` bytes
    Ready(Bytes),
    /// A partial frame was thrown away
    Discarded {
        received: usize,
        reason: DiscardReason,
    },
    /// Whole frames that never reached the assembler
    Missed(u64),
}

pub struct FrameAssembler {
    framing: Framing,
    finder: Option<memmem::Finder<'static>>,
    body_len: usize,
    state: AssemblerState,
    body: BytesMut,
    // tail of the last chunk that may hold the start of a marker
    carry: Vec<u8>,
    next_sequence: Option<u64>,
}

impl FrameAssembler {
    pub fn new(framing: Framing, body_len: usize) -> Self {
        let finder = match &framing {
            Framing::Marker { pattern } => Some(memmem::Finder::new(pattern).into_owned()),
            Framing::PerTransfer => None,
        };

        Self {
            framing,
            finder,
            body_len,
            state: AssemblerState::SeekingHeader,
            body: BytesMut::with_capacity(body_len),
            carry: Vec::new(),
            next_sequence: None,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Bytes of the frame body collected so far.
    pub fn buffered(&self) -> usize {
        self.body.len()
    }

    /// Feeds one chunk, appending whatever it completes or breaks to `out`.
    pub fn push(&mut self, chunk: &RawChunk, out: &mut Vec<FrameEvent>) {
        let missed = match self.next_sequence {
            Some(expected) if chunk.sequence > expected => chunk.sequence - expected,
            _ => 0,
        };
        self.next_sequence = Some(chunk.sequence.wrapping_add(1));

        match self.framing {
            Framing::PerTransfer => self.push_per_transfer(chunk, missed, out),
            Framing::Marker { .. } => {
                if missed > 0 {
                    trace!("chunk sequence jumped to {}", chunk.sequence);
                    self.resync(DiscardReason::SequenceGap, out);
                }
                if !chunk.success {
                    // bytes of a failed transfer are not trusted, even the marker
                    self.resync(DiscardReason::TransferFailed, out);
                    return;
                }
                self.scan(&chunk.data, out);
            }
        }
    }

    fn push_per_transfer(&mut self, chunk: &RawChunk, missed: u64, out: &mut Vec<FrameEvent>) {
        // every missing transfer was a frame
        if missed > 0 {
            trace!("{} transfers missing before {}", missed, chunk.sequence);
            out.push(FrameEvent::Missed(missed));
        }

        if chunk.success && chunk.data.len() >= self.body_len {
            out.push(FrameEvent::Ready(chunk.data.slice(..self.body_len)));
        } else if !chunk.data.is_empty() {
            trace!(
                "short transfer of {} bytes: {}",
                chunk.data.len(),
                preview(&chunk.data)
            );
            out.push(FrameEvent::Discarded {
                received: chunk.data.len(),
                reason: DiscardReason::ShortTransfer,
            });
        }
        // an empty failed transfer is a timeout with no frame pending
    }

    fn resync(&mut self, reason: DiscardReason, out: &mut Vec<FrameEvent>) {
        if self.state == AssemblerState::AccumulatingBody {
            out.push(FrameEvent::Discarded {
                received: self.body.len(),
                reason,
            });
            self.body.clear();
        }
        self.carry.clear();
        self.state = AssemblerState::SeekingHeader;
    }

    fn scan(&mut self, data: &[u8], out: &mut Vec<FrameEvent>) {
        let finder = match &self.finder {
            Some(finder) => finder.clone(),
            None => return,
        };
        let marker_len = finder.needle().len();
        let keep = marker_len - 1;

        let mut pos = 0;
        while pos < data.len() {
            let rest = &data[pos..];

            match self.state {
                AssemblerState::SeekingHeader => {
                    if !self.carry.is_empty() {
                        let carried = self.carry.len();
                        let mut joined = std::mem::take(&mut self.carry);
                        joined.extend_from_slice(&rest[..rest.len().min(keep)]);

                        if let Some(i) = finder.find(&joined).filter(|i| *i < carried) {
                            pos += i + marker_len - carried;
                            self.state = AssemblerState::AccumulatingBody;
                            continue;
                        }
                        if rest.len() < keep {
                            self.carry = joined[joined.len().saturating_sub(keep)..].to_vec();
                            return;
                        }
                    }

                    match finder.find(rest) {
                        Some(i) => {
                            if i > 0 {
                                trace!("skipped {} bytes before header: {}", i, preview(rest));
                            }
                            pos += i + marker_len;
                            self.state = AssemblerState::AccumulatingBody;
                        }
                        None => {
                            self.carry = rest[rest.len().saturating_sub(keep)..].to_vec();
                            return;
                        }
                    }
                }
                AssemblerState::AccumulatingBody => {
                    let take = (self.body_len - self.body.len()).min(rest.len());

                    if let Some(consumed) = self.interrupted_by_header(&finder, rest, take) {
                        trace!(
                            "header after {} of {} body bytes: {}",
                            self.body.len() + consumed,
                            self.body_len,
                            preview(&rest[consumed..])
                        );
                        out.push(FrameEvent::Discarded {
                            received: self.body.len() + consumed,
                            reason: DiscardReason::HeaderInterrupted,
                        });
                        self.body.clear();
                        pos += consumed;
                        self.state = AssemblerState::SeekingHeader;
                        continue;
                    }

                    self.body.extend_from_slice(&rest[..take]);
                    pos += take;

                    if self.body.len() == self.body_len {
                        out.push(FrameEvent::Ready(self.body.split().freeze()));
                        self.body.reserve(self.body_len);
                        self.state = AssemblerState::SeekingHeader;
                    }
                }
            }
        }
    }

    /// Looks for a marker starting inside the next `take` body bytes, or one
    /// that began in the tail of the body collected so far. Returns how many
    /// bytes of `rest` precede it.
    ///
    /// A marker straddling the old body tail is reported as zero bytes
    /// consumed after trimming the body back to where the marker starts, so
    /// the seek state picks it up through `carry`.
    fn interrupted_by_header(
        &mut self,
        finder: &memmem::Finder<'static>,
        rest: &[u8],
        take: usize,
    ) -> Option<usize> {
        let keep = finder.needle().len() - 1;

        let tail_len = self.body.len().min(keep);
        if tail_len > 0 {
            let tail_start = self.body.len() - tail_len;
            let mut joined = self.body[tail_start..].to_vec();
            joined.extend_from_slice(&rest[..rest.len().min(keep)]);

            if let Some(i) = finder.find(&joined).filter(|i| *i < tail_len) {
                self.carry = joined[i..tail_len].to_vec();
                self.body.truncate(tail_start + i);
                return Some(0);
            }
        }

        let window = &rest[..rest.len().min(take + keep)];
        finder.find(window).filter(|i| *i < take)
    }
}

fn preview(data: &[u8]) -> String {
    hex::encode(&data[..data.len().min(HEX_PREVIEW)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const MARKER: [u8; 4] = [0x33, 0xCC, 0x00, 0x00];

    fn chunk(sequence: u64, data: &[u8]) -> RawChunk {
        RawChunk {
            data: Bytes::copy_from_slice(data),
            sequence,
            endpoint: 0x82,
            success: true,
            received_at: Instant::now(),
        }
    }

    fn marker_assembler(body_len: usize) -> FrameAssembler {
        FrameAssembler::new(
            Framing::Marker {
                pattern: MARKER.to_vec(),
            },
            body_len,
        )
    }

    fn body(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8) | 0x01).collect()
    }

    fn ready(events: &[FrameEvent]) -> Vec<Bytes> {
        events
            .iter()
            .filter_map(|e| match e {
                FrameEvent::Ready(body) => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn header_then_body_across_chunks_yields_one_frame() {
        let mut assembler = marker_assembler(32);
        let payload = body(7, 32);
        let mut stream = vec![0xAA, 0xBB];
        stream.extend_from_slice(&MARKER);
        stream.extend_from_slice(&payload);

        let mut out = Vec::new();
        for (seq, part) in stream.chunks(5).enumerate() {
            assembler.push(&chunk(seq as u64, part), &mut out);
        }

        assert_eq!(ready(&out), vec![Bytes::from(payload)]);
        assert_eq!(out.len(), 1);
        assert_eq!(assembler.state(), AssemblerState::SeekingHeader);
    }

    #[test]
    fn second_header_discards_partial_frame_and_next_frame_still_assembles() {
        let mut assembler = marker_assembler(16);
        let good = body(40, 16);

        let mut stream = MARKER.to_vec();
        stream.extend_from_slice(&body(1, 6));
        stream.extend_from_slice(&MARKER);
        stream.extend_from_slice(&good);

        let mut out = Vec::new();
        assembler.push(&chunk(0, &stream), &mut out);

        assert_eq!(
            out[0],
            FrameEvent::Discarded {
                received: 6,
                reason: DiscardReason::HeaderInterrupted
            }
        );
        assert_eq!(ready(&out), vec![Bytes::from(good)]);
    }

    #[test]
    fn marker_split_between_chunks_is_found() {
        let mut assembler = marker_assembler(8);
        let payload = body(3, 8);

        let mut out = Vec::new();
        assembler.push(&chunk(0, &[0x10, 0x11, 0x33, 0xCC]), &mut out);
        assert_eq!(assembler.state(), AssemblerState::SeekingHeader);

        let mut second = vec![0x00, 0x00];
        second.extend_from_slice(&payload);
        assembler.push(&chunk(1, &second), &mut out);

        assert_eq!(ready(&out), vec![Bytes::from(payload)]);
    }

    #[test]
    fn interrupting_marker_split_between_chunks_is_found() {
        let mut assembler = marker_assembler(32);
        let good = body(9, 32);

        let mut first = MARKER.to_vec();
        first.extend_from_slice(&body(2, 5));
        first.extend_from_slice(&MARKER[..3]);
        let mut second = vec![MARKER[3]];
        second.extend_from_slice(&good);

        let mut out = Vec::new();
        assembler.push(&chunk(0, &first), &mut out);
        assembler.push(&chunk(1, &second), &mut out);

        assert_eq!(
            out[0],
            FrameEvent::Discarded {
                received: 5,
                reason: DiscardReason::HeaderInterrupted
            }
        );
        assert_eq!(ready(&out), vec![Bytes::from(good)]);
    }

    #[test]
    fn sequence_gap_drops_partial_frame() {
        let mut assembler = marker_assembler(16);
        let mut out = Vec::new();

        let mut first = MARKER.to_vec();
        first.extend_from_slice(&body(0, 10));
        assembler.push(&chunk(0, &first), &mut out);
        assembler.push(&chunk(2, &body(0, 6)), &mut out);

        assert_eq!(
            out,
            vec![FrameEvent::Discarded {
                received: 10,
                reason: DiscardReason::SequenceGap
            }]
        );
        assert_eq!(assembler.state(), AssemblerState::SeekingHeader);
    }

    #[test]
    fn failed_transfer_resets_to_seeking() {
        let mut assembler = marker_assembler(16);
        let mut out = Vec::new();

        let mut first = MARKER.to_vec();
        first.extend_from_slice(&body(0, 4));
        assembler.push(&chunk(0, &first), &mut out);

        let mut failed = chunk(1, &body(0, 12));
        failed.success = false;
        assembler.push(&failed, &mut out);

        assert_eq!(
            out,
            vec![FrameEvent::Discarded {
                received: 4,
                reason: DiscardReason::TransferFailed
            }]
        );
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn per_transfer_framing() {
        let mut assembler = FrameAssembler::new(Framing::PerTransfer, 8);
        let mut out = Vec::new();

        // padded to the transfer size, body at offset 0
        let mut padded = body(1, 8);
        padded.extend_from_slice(&[0; 4]);
        assembler.push(&chunk(0, &padded), &mut out);

        let mut timeout = chunk(1, &[]);
        timeout.success = false;
        assembler.push(&timeout, &mut out);

        let mut short = chunk(2, &body(1, 5));
        short.success = false;
        assembler.push(&short, &mut out);

        assert_eq!(
            out,
            vec![
                FrameEvent::Ready(Bytes::from(body(1, 8))),
                FrameEvent::Discarded {
                    received: 5,
                    reason: DiscardReason::ShortTransfer
                },
            ]
        );
    }

    #[test]
    fn per_transfer_gap_counts_every_missing_frame() {
        let mut assembler = FrameAssembler::new(Framing::PerTransfer, 8);
        let mut out = Vec::new();

        assembler.push(&chunk(0, &body(1, 8)), &mut out);
        assembler.push(&chunk(4, &body(2, 8)), &mut out);

        assert_eq!(
            out,
            vec![
                FrameEvent::Ready(Bytes::from(body(1, 8))),
                FrameEvent::Missed(3),
                FrameEvent::Ready(Bytes::from(body(2, 8))),
            ]
        );
    }
}
