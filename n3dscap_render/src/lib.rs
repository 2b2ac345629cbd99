//! Concrete renderer and audio sink for the capture pipeline.

mod audio;
mod primitive;
mod render;
mod screen;

pub use audio::{map_channels, CpalSink, LinearResampler, LATENCY_MS};
pub use render::State;
