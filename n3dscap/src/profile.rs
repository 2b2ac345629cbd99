//! Device-specific constants.
//!
//! Everything the pipeline needs to know about a particular capture board
//! lives in a [`DeviceProfile`]. The numbers for the N3DS board were measured
//! on real hardware; other boards get their own profile rather than special
//! cases inside the assemblers.

use std::time::Duration;

// N3DS capture board (loopy's FX2 + FPGA design)
pub const N3DS_VID: u16 = 0x16D0;
pub const N3DS_PID: u16 = 0x06A3;

pub const N3DS_CONFIGURATION: u8 = 1;
pub const N3DS_INTERFACE: u8 = 0;
pub const N3DS_CAPTURE_ENDPOINT: u8 = 0x82;

pub const CMDOUT_CAPTURE_START: u8 = 0x40;
pub const CMDOUT_I2C_WRITE: u8 = 0x21;
pub const CMDIN_I2C_READ: u8 = 0x21;
pub const I2CADDR_3DSCONFIG: u16 = 0x14;
pub const N3DSCFG_BITSTREAM_VER: u8 = 1;

pub const N3DS_AUDIO_BYTES: usize = 0x88C;
pub const N3DS_SAMPLE_RATE: u32 = 0x7FD8;
pub const N3DS_CHANNELS: u16 = 2;

// the board sends the two screens as one 240 pixel wide column strip
pub const N3DS_SOURCE_WIDTH: u32 = 240;
pub const N3DS_SOURCE_HEIGHT: u32 = 720;
pub const N3DS_IMAGE_BYTES: usize = (N3DS_SOURCE_WIDTH * N3DS_SOURCE_HEIGHT * 3) as usize;
pub const N3DS_FRAME_BYTES: usize = N3DS_IMAGE_BYTES + N3DS_AUDIO_BYTES;

pub const N3DS_TOP_WIDTH: u32 = 400;
pub const N3DS_BOTTOM_WIDTH: u32 = 320;
pub const N3DS_SCREEN_HEIGHT: u32 = 240;

// native DS resolution, shown centred on both screens
pub const DS_WIDTH: u32 = 256;
pub const DS_HEIGHT: u32 = 192;

const MAX_PACKET_SIZE: usize = 0x200;

/// Vendor/product pair used to pick the capture card out of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceFilter {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// Vendor control request sent before every bulk read on boards that only
/// capture on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub timeout: Duration,
}

/// How the transport keeps data flowing from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub configuration: u8,
    pub interface: u8,
    pub endpoint: u8,
    /// Bytes requested per bulk transfer
    pub transfer_len: usize,
    pub timeout: Duration,
    /// Number of transfers kept in flight at once
    pub queue_depth: usize,
    pub trigger: Option<ControlRequest>,
    /// Transfers shorter than this are reported as failed
    pub min_complete_len: usize,
    /// Delay after the start-up command before the first transfer
    pub settle: Duration,
}

/// How frame boundaries are found in the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// A fixed marker precedes every frame body
    Marker { pattern: Vec<u8> },
    /// Every successful transfer starts with exactly one frame body
    PerTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgb565 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    /// 90 degrees counter-clockwise
    Ccw90,
}

/// The image portion of a frame body as the device sends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub source_width: u32,
    pub source_height: u32,
    pub pixel_format: PixelFormat,
    pub rotation: Rotation,
}

impl VideoFormat {
    pub fn source_bytes(&self) -> usize {
        self.source_width as usize * self.source_height as usize * self.pixel_format.bytes_per_pixel()
    }

    /// Dimensions after rotation, i.e. of the published [`crate::VideoFrame`].
    pub fn frame_size(&self) -> (u32, u32) {
        match self.rotation {
            Rotation::None => (self.source_width, self.source_height),
            Rotation::Ccw90 => (self.source_height, self.source_width),
        }
    }
}

/// Interleaved signed 16 bit little endian PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes of PCM carried by each frame body
    pub bytes_per_frame_body: usize,
    /// Sample frames (one sample per channel) per published block
    pub block_frames: usize,
}

impl AudioFormat {
    pub fn frames_per_body(&self) -> usize {
        self.bytes_per_frame_body / (2 * self.channels as usize)
    }

    pub fn block_samples(&self) -> usize {
        self.block_frames * self.channels as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }
}

/// One physical screen inside the normalised frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenRegion {
    pub name: &'static str,
    pub full: Rect,
    pub crop: Rect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub name: &'static str,
    pub filter: DeviceFilter,
    pub transfer: TransferPlan,
    pub framing: Framing,
    pub video: VideoFormat,
    pub audio: AudioFormat,
    pub screens: Vec<ScreenRegion>,
}

impl DeviceProfile {
    /// Profile for the N3DS capture board.
    pub fn n3ds() -> Self {
        let transfer_len = (N3DS_FRAME_BYTES + MAX_PACKET_SIZE - 1) & !(MAX_PACKET_SIZE - 1);
        let frames_per_body = N3DS_AUDIO_BYTES / (2 * N3DS_CHANNELS as usize);

        let top = Rect::new(0, 0, N3DS_TOP_WIDTH, N3DS_SCREEN_HEIGHT);
        let bottom = Rect::new(N3DS_TOP_WIDTH, 0, N3DS_BOTTOM_WIDTH, N3DS_SCREEN_HEIGHT);

        Self {
            name: "N3DS capture board",
            filter: DeviceFilter::new(N3DS_VID, N3DS_PID),
            transfer: TransferPlan {
                configuration: N3DS_CONFIGURATION,
                interface: N3DS_INTERFACE,
                endpoint: N3DS_CAPTURE_ENDPOINT,
                transfer_len,
                timeout: Duration::from_millis(50),
                // the board captures one frame per request
                queue_depth: 1,
                trigger: Some(ControlRequest {
                    request: CMDOUT_CAPTURE_START,
                    value: 0,
                    index: 0,
                    timeout: Duration::from_millis(30),
                }),
                min_complete_len: N3DS_FRAME_BYTES,
                settle: Duration::from_millis(500),
            },
            framing: Framing::PerTransfer,
            video: VideoFormat {
                source_width: N3DS_SOURCE_WIDTH,
                source_height: N3DS_SOURCE_HEIGHT,
                pixel_format: PixelFormat::Rgb24,
                rotation: Rotation::Ccw90,
            },
            audio: AudioFormat {
                sample_rate: N3DS_SAMPLE_RATE,
                channels: N3DS_CHANNELS,
                bytes_per_frame_body: N3DS_AUDIO_BYTES,
                block_frames: frames_per_body,
            },
            screens: vec![
                ScreenRegion {
                    name: "top",
                    full: top,
                    crop: centred(top, DS_WIDTH, DS_HEIGHT),
                },
                ScreenRegion {
                    name: "bottom",
                    full: bottom,
                    crop: centred(bottom, DS_WIDTH, DS_HEIGHT),
                },
            ],
        }
    }

    /// Bytes of one complete frame body (video followed by audio).
    pub fn body_len(&self) -> usize {
        self.video.source_bytes() + self.audio.bytes_per_frame_body
    }

    /// Checks the numbers agree with each other.
    pub fn validate(&self) -> Result<(), String> {
        let (width, height) = self.video.frame_size();
        let frame = Rect::new(0, 0, width, height);

        if self.screens.is_empty() {
            return Err("profile has no screens".to_string());
        }
        for screen in &self.screens {
            if !frame.contains(&screen.full) {
                return Err(format!("{} screen lies outside the frame", screen.name));
            }
            if !screen.full.contains(&screen.crop) {
                return Err(format!("{} crop lies outside the screen", screen.name));
            }
        }
        if self.audio.channels == 0 || self.audio.block_frames == 0 {
            return Err("audio block must hold at least one sample".to_string());
        }
        if self.audio.bytes_per_frame_body % (2 * self.audio.channels as usize) != 0 {
            return Err("audio bytes per frame is not a whole number of samples".to_string());
        }
        if self.transfer.queue_depth == 0 {
            return Err("transfer queue depth must be at least one".to_string());
        }
        if let Framing::Marker { pattern } = &self.framing {
            if pattern.is_empty() {
                return Err("frame marker must not be empty".to_string());
            }
        }
        if self.framing == Framing::PerTransfer && self.transfer.transfer_len < self.body_len() {
            return Err("transfer is shorter than a frame body".to_string());
        }
        Ok(())
    }
}

fn centred(outer: Rect, width: u32, height: u32) -> Rect {
    Rect::new(
        outer.x + (outer.width - width) / 2,
        outer.y + (outer.height - height) / 2,
        width,
        height,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n3ds_profile_is_consistent() {
        let profile = DeviceProfile::n3ds();
        assert_eq!(profile.validate(), Ok(()));
        assert_eq!(profile.body_len(), 518_400 + 0x88C);
        assert_eq!(profile.transfer.transfer_len % 512, 0);
        assert!(profile.transfer.transfer_len >= profile.body_len());
        assert_eq!(profile.video.frame_size(), (720, 240));
        assert_eq!(profile.audio.block_frames, 547);
    }

    #[test]
    fn n3ds_crop_is_centred_ds_area() {
        let profile = DeviceProfile::n3ds();
        assert_eq!(profile.screens[0].crop, Rect::new(72, 24, 256, 192));
        assert_eq!(profile.screens[1].crop, Rect::new(432, 24, 256, 192));
    }

    #[test]
    fn validate_rejects_crop_outside_screen() {
        let mut profile = DeviceProfile::n3ds();
        profile.screens[1].crop = Rect::new(0, 0, 256, 192);
        assert!(profile.validate().is_err());
    }
}
