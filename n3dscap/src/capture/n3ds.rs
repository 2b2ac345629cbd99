//! Vendor requests understood by the N3DS capture board firmware.

use std::time::Duration;

use log::debug;
use rusb::{DeviceHandle, Direction, Recipient, RequestType, UsbContext};

use crate::error::{CaptureError, Result};
use crate::profile::{CMDIN_I2C_READ, CMDOUT_I2C_WRITE, I2CADDR_3DSCONFIG, N3DSCFG_BITSTREAM_VER};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(30);

// the config window is read through a 256 byte I2C page
const MAX_CONFIG_READ: usize = 256;

fn vendor_out() -> u8 {
    rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device)
}

fn vendor_in() -> u8 {
    rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device)
}

/// Reads `buf.len()` bytes of the board's configuration space starting at
/// `cfg_addr`.
pub fn read_config<T: UsbContext>(
    handle: &DeviceHandle<T>,
    cfg_addr: u8,
    buf: &mut [u8],
) -> Result<()> {
    if buf.is_empty() || buf.len() > MAX_CONFIG_READ {
        return Err(CaptureError::Protocol(format!(
            "config read of {} bytes out of range",
            buf.len()
        )));
    }

    handle.write_control(
        vendor_out(),
        CMDOUT_I2C_WRITE,
        I2CADDR_3DSCONFIG,
        0,
        &[cfg_addr],
        CONTROL_TIMEOUT,
    )?;

    let len = handle.read_control(
        vendor_in(),
        CMDIN_I2C_READ,
        I2CADDR_3DSCONFIG,
        0,
        buf,
        CONTROL_TIMEOUT,
    )?;
    if len != buf.len() {
        return Err(CaptureError::Protocol(format!(
            "config read returned {} of {} bytes",
            len,
            buf.len()
        )));
    }

    debug!("config {:#04x}: {}", cfg_addr, hex::encode(&*buf));
    Ok(())
}

pub fn bitstream_version<T: UsbContext>(handle: &DeviceHandle<T>) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_config(handle, N3DSCFG_BITSTREAM_VER, &mut buf)?;
    Ok(buf[0])
}
