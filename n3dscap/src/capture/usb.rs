use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use log::{debug, info, warn};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, Recipient, RequestType};

use super::transfer::TransferRing;
use super::{n3ds, open_device, EventSender, Transport};
use crate::error::{CaptureError, Result};
use crate::profile::{DeviceFilter, DeviceProfile, TransferPlan, N3DS_PID, N3DS_VID};

/// What `--device-info` prints.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub speed: rusb::Speed,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub bitstream_version: Option<u8>,
}

impl DeviceInfo {
    fn read(
        device: &Device<Context>,
        desc: &DeviceDescriptor,
        handle: &DeviceHandle<Context>,
        filter: &DeviceFilter,
    ) -> Self {
        let bitstream_version = if *filter == DeviceFilter::new(N3DS_VID, N3DS_PID) {
            match n3ds::bitstream_version(handle) {
                Ok(version) => Some(version),
                Err(err) => {
                    warn!("could not read bitstream version: {}", err);
                    None
                }
            }
        } else {
            None
        };

        Self {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            speed: device.speed(),
            manufacturer: handle.read_manufacturer_string_ascii(desc).ok(),
            product: handle.read_product_string_ascii(desc).ok(),
            serial: handle.read_serial_number_string_ascii(desc).ok(),
            bitstream_version,
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            self.bus, self.address, self.vendor_id, self.product_id
        )?;
        writeln!(f, "  speed:        {:?}", self.speed)?;
        writeln!(
            f,
            "  manufacturer: {}",
            self.manufacturer.as_deref().unwrap_or("-")
        )?;
        writeln!(f, "  product:      {}", self.product.as_deref().unwrap_or("-"))?;
        writeln!(f, "  serial:       {}", self.serial.as_deref().unwrap_or("-"))?;
        match self.bitstream_version {
            Some(version) => write!(f, "  bitstream:    {}", version),
            None => write!(f, "  bitstream:    -"),
        }
    }
}

/// Lets the stop path give the claimed interface back.
trait InterfaceOwner: Send + Sync {
    fn release(&mut self, interface: u8) -> rusb::Result<()>;
}

impl InterfaceOwner for DeviceHandle<Context> {
    fn release(&mut self, interface: u8) -> rusb::Result<()> {
        self.release_interface(interface)
    }
}

/// Everything `stop` tears down, behind one lock.
struct Link<H = DeviceHandle<Context>> {
    ring: Option<TransferRing>,
    handle: Arc<H>,
    interface: u8,
    claimed: bool,
}

impl<H: InterfaceOwner> Link<H> {
    fn new(handle: H, interface: u8) -> Self {
        Self {
            ring: None,
            handle: Arc::new(handle),
            interface,
            claimed: true,
        }
    }

    fn shut_down(&mut self) {
        if let Some(mut ring) = self.ring.take() {
            ring.shutdown();
        }

        if !self.claimed {
            return;
        }
        // the ring held the only other reference to the handle
        match Arc::get_mut(&mut self.handle) {
            Some(handle) => {
                if let Err(err) = handle.release(self.interface) {
                    warn!("could not release interface {}: {}", self.interface, err);
                }
                self.claimed = false;
                debug!("released interface {}", self.interface);
            }
            None => warn!("interface {} still in use, not released", self.interface),
        }
    }
}

// holds the lock for the whole shutdown so a second caller cannot return
// while callbacks are still running
fn stop_link<H: InterfaceOwner>(link: &Mutex<Link<H>>) {
    link.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .shut_down();
}

/// Stops a [`UsbTransport`] from any thread.
#[derive(Clone)]
pub struct TransportStopper {
    link: Arc<Mutex<Link>>,
}

impl TransportStopper {
    /// Cancels the transfers and releases the capture interface. Idempotent.
    pub fn stop(&self) {
        stop_link(&self.link);
    }
}

/// The capture card reached through libusb.
pub struct UsbTransport {
    link: Arc<Mutex<Link>>,
    plan: TransferPlan,
    started: bool,
    info: DeviceInfo,
}

impl UsbTransport {
    /// Finds the device, claims the capture interface and runs the start-up
    /// command.
    pub fn open(profile: &DeviceProfile) -> Result<Self> {
        let context = Context::new()?;
        let (device, desc, mut handle) = open_device(&context, &profile.filter)?;
        let plan = profile.transfer.clone();

        info!(
            "Opened {} {:04x}:{:04x}",
            profile.name,
            desc.vendor_id(),
            desc.product_id()
        );

        // not supported everywhere, and harmless when there is no kernel driver
        let _ = handle.set_auto_detach_kernel_driver(true);

        if let Err(err) = handle.set_active_configuration(plan.configuration) {
            warn!("could not select configuration {}: {}", plan.configuration, err);
        }

        handle
            .claim_interface(plan.interface)
            .map_err(|err| match err {
                rusb::Error::Access | rusb::Error::Busy => CaptureError::PermissionDenied(format!(
                    "could not claim interface {}: {}",
                    plan.interface, err
                )),
                other => other.into(),
            })?;
        let link = Link::new(handle, plan.interface);

        if let Some(trigger) = plan.trigger {
            let request_type =
                rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
            link.handle.write_control(
                request_type,
                trigger.request,
                trigger.value,
                trigger.index,
                &[],
                trigger.timeout,
            )?;
        }
        thread::sleep(plan.settle);

        let info = DeviceInfo::read(&device, &desc, &link.handle, &profile.filter);

        Ok(Self {
            link: Arc::new(Mutex::new(link)),
            plan,
            started: false,
            info,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn stopper(&self) -> TransportStopper {
        TransportStopper {
            link: Arc::clone(&self.link),
        }
    }
}

impl Transport for UsbTransport {
    fn start(&mut self, events: EventSender) -> Result<()> {
        if self.started {
            return Err(CaptureError::InvalidState("transport already started"));
        }

        let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        if !link.claimed {
            return Err(CaptureError::InvalidState("transport already stopped"));
        }
        let ring = TransferRing::start(Arc::clone(&link.handle), &self.plan, events)?;
        link.ring = Some(ring);
        self.started = true;
        info!("Starting capture on endpoint {:#04x}", self.plan.endpoint);
        Ok(())
    }

    fn stop(&mut self) {
        stop_link(&self.link);
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeHandle {
        released: AtomicUsize,
    }

    impl InterfaceOwner for FakeHandle {
        fn release(&mut self, interface: u8) -> rusb::Result<()> {
            assert_eq!(interface, 0);
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn released(link: &Mutex<Link<FakeHandle>>) -> usize {
        link.lock().unwrap().handle.released.load(Ordering::SeqCst)
    }

    #[test]
    fn stop_releases_interface_once() {
        let link = Mutex::new(Link::new(FakeHandle::default(), 0));

        stop_link(&link);
        assert_eq!(released(&link), 1);
        assert!(!link.lock().unwrap().claimed);

        stop_link(&link);
        assert_eq!(released(&link), 1);
    }

    #[test]
    fn shared_handle_is_kept_until_free() {
        let link = Mutex::new(Link::new(FakeHandle::default(), 0));
        let borrowed = Arc::clone(&link.lock().unwrap().handle);

        stop_link(&link);
        assert!(link.lock().unwrap().claimed);

        drop(borrowed);
        stop_link(&link);
        assert_eq!(released(&link), 1);
    }

    #[test]
    fn stop_from_another_thread() {
        let link = Arc::new(Mutex::new(Link::new(FakeHandle::default(), 0)));
        let remote = Arc::clone(&link);

        thread::spawn(move || stop_link(&remote)).join().unwrap();
        stop_link(&link);
        assert_eq!(released(&link), 1);
    }
}
