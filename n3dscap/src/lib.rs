//! Capture pipeline for the N3DS USB capture board.
//!
//! USB transfers come in on a libusb event thread, are cut into frames and
//! audio blocks on an assembly thread, and meet the render loop in a
//! [`SyncBuffer`] holding only the newest of each.

pub mod assemble;
pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod profile;
pub mod render;
pub mod session;
pub mod stats;
pub mod sync;

pub use capture::usb::{DeviceInfo, TransportStopper, UsbTransport};
pub use capture::{EventSender, RawChunk, Transport, TransportEvent};
pub use config::{ConfigHandle, PipelineConfig, ScaleFactor};
pub use error::{CaptureError, Result};
pub use frame::{AudioBlock, VideoFrame};
pub use profile::DeviceProfile;
pub use render::{AudioSink, PresentState, RenderCoordinator, Renderer, TickReport};
pub use session::CaptureSession;
pub use stats::{PipelineStats, StatsSnapshot};
pub use sync::{Claimed, LinkState, SyncBuffer};
