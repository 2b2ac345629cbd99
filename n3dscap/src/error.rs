use std::fmt;

/// Errors that reach the top-level control flow.
///
/// Per-transfer and per-frame problems (timeouts, short reads, corrupt frames,
/// audio underruns) never show up here; they are recovered inside the pipeline
/// and only counted in [`crate::PipelineStats`].
#[derive(Debug)]
pub enum CaptureError {
    /// No attached device matched the filter
    DeviceNotFound { vendor_id: u16, product_id: u16 },
    /// The device exists but the OS refused to open or claim it
    PermissionDenied(String),
    /// The device went away while it was in use
    DeviceLost,
    /// A transport was started twice, or used after stop
    InvalidState(&'static str),
    /// Device replied with something the profile did not expect
    Protocol(String),
    /// Any other libusb failure
    Usb(rusb::Error),
    Io(std::io::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::DeviceNotFound {
                vendor_id,
                product_id,
            } => write!(
                f,
                "no capture device {:04x}:{:04x} attached",
                vendor_id, product_id
            ),
            CaptureError::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            CaptureError::DeviceLost => write!(f, "capture device disconnected"),
            CaptureError::InvalidState(msg) => write!(f, "invalid transport state: {}", msg),
            CaptureError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            CaptureError::Usb(err) => write!(f, "usb error: {}", err),
            CaptureError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Usb(err) => Some(err),
            CaptureError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusb::Error> for CaptureError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Access => CaptureError::PermissionDenied(err.to_string()),
            rusb::Error::NoDevice => CaptureError::DeviceLost,
            other => CaptureError::Usb(other),
        }
    }
}

impl CaptureError {
    /// Start-up failures end the process; everything else may be retried.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::DeviceNotFound { .. } | CaptureError::PermissionDenied(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_maps_to_permission_denied() {
        let err = CaptureError::from(rusb::Error::Access);
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn no_device_maps_to_device_lost() {
        let err = CaptureError::from(rusb::Error::NoDevice);
        assert!(matches!(err, CaptureError::DeviceLost));
        assert!(!err.is_startup_fatal());
    }

    #[test]
    fn not_found_message_has_ids() {
        let err = CaptureError::DeviceNotFound {
            vendor_id: 0x16d0,
            product_id: 0x06a3,
        };
        assert_eq!(err.to_string(), "no capture device 16d0:06a3 attached");
    }
}
