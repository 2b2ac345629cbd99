//! Audio sink backed by the default cpal output device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, info, warn};
use n3dscap::AudioSink;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use simple_error::SimpleError;

/// Silence queued ahead of the first block.
pub const LATENCY_MS: u32 = 100;

/// Streaming linear interpolation between two sample rates.
///
/// Keeps the last input frame and the fractional read position between calls
/// so consecutive blocks join without clicks.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    channels: usize,
    step: f64,
    position: f64,
    previous: Vec<f32>,
}

impl LinearResampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            step: source_rate as f64 / target_rate.max(1) as f64,
            position: 0.0,
            previous: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.previous.clear();
    }

    /// Resamples interleaved `input`, appending to `output`.
    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        let channels = self.channels;
        let frames = input.len() / channels;
        if frames == 0 {
            return;
        }

        if (self.step - 1.0).abs() < f64::EPSILON {
            output.extend_from_slice(&input[..frames * channels]);
            return;
        }

        // frame -1 is the tail of the previous call
        let carried = !self.previous.is_empty();
        let frame_at = |index: isize, channel: usize| -> f32 {
            if index < 0 {
                self.previous[channel]
            } else {
                input[index as usize * channels + channel]
            }
        };

        let first = if carried { -1.0 } else { 0.0 };
        let mut position = self.position.max(first);
        let last = (frames - 1) as f64;

        while position < last {
            let base = position.floor();
            let frac = (position - base) as f32;
            let i0 = base as isize;
            for channel in 0..channels {
                let a = frame_at(i0, channel);
                let b = frame_at(i0 + 1, channel);
                output.push(a + (b - a) * frac);
            }
            position += self.step;
        }

        // continue from the last frame of this block next time
        self.position = position - last - 1.0;
        self.previous.clear();
        self.previous
            .extend_from_slice(&input[(frames - 1) * channels..frames * channels]);
    }
}

/// Device side of the ring, run from the cpal callback.
///
/// After a flush it plays silence until the ring holds the latency again, so
/// a reconnect starts with the same cushion as a fresh stream.
struct Playout {
    consumer: HeapConsumer<f32>,
    latency_samples: usize,
    priming: bool,
    flush: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
}

impl Playout {
    fn fill(&mut self, data: &mut [f32]) {
        if self.flush.swap(false, Ordering::AcqRel) {
            while self.consumer.pop().is_some() {}
            self.priming = true;
        }

        if self.priming {
            if self.consumer.len() < self.latency_samples {
                data.fill(0.0);
                return;
            }
            self.priming = false;
        }

        let mut input_fell_behind = false;
        for sample in data {
            *sample = match self.consumer.pop() {
                Some(s) => s,
                None => {
                    input_fell_behind = true;
                    0.0
                }
            };
        }
        if input_fell_behind {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Plays capture audio through the default output device.
///
/// Blocks go through a fixed size ring between [`AudioSink::write`] and the
/// device callback. A full ring drops the newest samples, an empty one plays
/// silence. The ring starts with [`LATENCY_MS`] of silence queued and gets the
/// same cushion back after every flush.
pub struct CpalSink {
    producer: HeapProducer<f32>,
    _stream: cpal::Stream,
    flush: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    resampler: LinearResampler,
    source_channels: usize,
    output_channels: usize,
    converted: Vec<f32>,
    resampled: Vec<f32>,
    mapped: Vec<f32>,
    dropped: u64,
}

impl CpalSink {
    pub fn new(source_rate: u32, source_channels: u16) -> Result<Self, SimpleError> {
        let host = cpal::default_host();
        let output_device = host
            .default_output_device()
            .ok_or_else(|| SimpleError::new("no audio output device"))?;

        let supported = output_device
            .default_output_config()
            .map_err(|e| SimpleError::new(format!("no usable output config: {}", e)))?;
        if supported.sample_format() != cpal::SampleFormat::F32 {
            warn!(
                "output device prefers {:?}, asking for f32 anyway",
                supported.sample_format()
            );
        }
        let config: cpal::StreamConfig = supported.into();

        let output_channels = config.channels as usize;
        let latency_frames = (LATENCY_MS as f32 / 1_000.0) * config.sample_rate.0 as f32;
        let latency_samples = latency_frames as usize * output_channels;

        let ring = HeapRb::<f32>::new(latency_samples * 2);
        let (mut producer, consumer) = ring.split();

        for _ in 0..latency_samples {
            // The ring buffer has twice as much space as necessary to add
            // latency here, so this should never fail
            let _ = producer.push(0.0);
        }

        let flush = Arc::new(AtomicBool::new(false));
        let underruns = Arc::new(AtomicU64::new(0));

        let mut playout = Playout {
            consumer,
            latency_samples,
            priming: false,
            flush: Arc::clone(&flush),
            underruns: Arc::clone(&underruns),
        };
        let output_data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            playout.fill(data);
        };

        let output_stream = output_device
            .build_output_stream(
                &config,
                output_data_fn,
                |err| error!("audio output error: {}", err),
                None,
            )
            .map_err(|e| SimpleError::new(format!("could not open audio output: {}", e)))?;
        output_stream
            .play()
            .map_err(|e| SimpleError::new(format!("could not start audio output: {}", e)))?;

        info!(
            "audio output: {}Hz {}ch, resampling from {}Hz {}ch, {}ms latency",
            config.sample_rate.0, output_channels, source_rate, source_channels, LATENCY_MS
        );

        let source_channels = source_channels.max(1) as usize;
        Ok(Self {
            producer,
            _stream: output_stream,
            flush,
            underruns,
            resampler: LinearResampler::new(source_rate, config.sample_rate.0, source_channels),
            source_channels,
            output_channels,
            converted: Vec::new(),
            resampled: Vec::new(),
            mapped: Vec::new(),
            dropped: 0,
        })
    }

    /// Times the device callback found the ring empty.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Samples thrown away because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, samples: &[i16], sample_count: usize) {
        let samples = &samples[..sample_count.min(samples.len())];

        self.converted.clear();
        self.converted
            .extend(samples.iter().map(|&s| s as f32 / i16::MAX as f32));

        self.resampled.clear();
        self.resampler.process(&self.converted, &mut self.resampled);

        map_channels(
            &self.resampled,
            self.source_channels,
            self.output_channels,
            &mut self.mapped,
        );

        let pushed = self.producer.push_slice(&self.mapped);
        if pushed < self.mapped.len() {
            let lost = (self.mapped.len() - pushed) as u64;
            if self.dropped == 0 {
                debug!("audio ring full, dropping newest samples");
            }
            self.dropped += lost;
        }
    }

    fn flush(&mut self) {
        self.flush.store(true, Ordering::Release);
        self.resampler.reset();
    }
}

/// Converts interleaved audio between channel counts. Extra output channels
/// repeat the last input channel; fewer output channels average the input.
pub fn map_channels(input: &[f32], from: usize, to: usize, output: &mut Vec<f32>) {
    output.clear();
    if from == to {
        output.extend_from_slice(input);
        return;
    }

    for frame in input.chunks_exact(from) {
        if to < from {
            let mixed = frame.iter().sum::<f32>() / from as f32;
            output.extend(std::iter::repeat(mixed).take(to));
        } else {
            output.extend_from_slice(frame);
            let last = frame[from - 1];
            output.extend(std::iter::repeat(last).take(to - from));
        }
    }
}
