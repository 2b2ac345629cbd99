//! Asynchronous libusb transfers kept permanently in flight.
//!
//! Every slot owns one `libusb_transfer` and its buffer. A completion callback
//! turns the finished transfer into a [`RawChunk`] and resubmits it, so the
//! device always has `queue_depth` requests waiting. Boards that capture on
//! demand get a control "trigger" transfer before every read on the same slot.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

extern crate libusb1_sys as usbffi;

use bytes::Bytes;
use log::{debug, error, trace, warn};
use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use usbffi::constants::{
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NO_DEVICE, LIBUSB_TRANSFER_CANCELLED,
    LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE,
};

use super::{EventSender, RawChunk};
use crate::error::{CaptureError, Result};
use crate::profile::{ControlRequest, TransferPlan};

const EVENT_TIMEOUT: libc::timeval = libc::timeval {
    tv_sec: 0,
    tv_usec: 100_000,
};

const CONTROL_SETUP_SIZE: usize = 8;

// longest we wait for cancelled transfers to call back
const CANCEL_GRACE: Duration = Duration::from_secs(2);
const CANCEL_POLL: Duration = Duration::from_millis(50);

struct RingShared {
    events: EventSender,
    sequence: AtomicU64,
    stopping: AtomicBool,
    lost: AtomicBool,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl RingShared {
    fn enlist(&self) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn retire(&self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn report_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            self.events.device_lost();
        }
    }

    fn halted(&self) -> bool {
        self.stopping.load(Ordering::Acquire) || self.lost.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Trigger,
    Read,
}

struct TransferSlot {
    transfer: *mut usbffi::libusb_transfer,
    device: *mut usbffi::libusb_device_handle,
    shared: Arc<RingShared>,
    endpoint: u8,
    timeout_ms: u32,
    min_complete_len: usize,
    buffer: Vec<u8>,
    setup: Vec<u8>,
    trigger: Option<ControlRequest>,
    phase: Phase,
}

impl TransferSlot {
    fn first_phase(trigger: &Option<ControlRequest>) -> Phase {
        if trigger.is_some() {
            Phase::Trigger
        } else {
            Phase::Read
        }
    }

    fn arm(&mut self) {
        let user_data = self as *mut TransferSlot as *mut c_void;

        match (self.phase, self.trigger) {
            (Phase::Trigger, Some(trigger)) => unsafe {
                let request_type =
                    rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
                usbffi::libusb_fill_control_setup(
                    self.setup.as_mut_ptr(),
                    request_type,
                    trigger.request,
                    trigger.value,
                    trigger.index,
                    0,
                );
                usbffi::libusb_fill_control_transfer(
                    self.transfer,
                    self.device,
                    self.setup.as_mut_ptr(),
                    transfer_finished as _,
                    user_data,
                    trigger.timeout.as_millis() as u32,
                );
            },
            _ => unsafe {
                usbffi::libusb_fill_bulk_transfer(
                    self.transfer,
                    self.device,
                    self.endpoint,
                    self.buffer.as_mut_ptr(),
                    self.buffer.len() as i32,
                    transfer_finished as _,
                    user_data,
                    self.timeout_ms,
                );
            },
        }
    }

    fn submit(&mut self) -> bool {
        self.arm();

        let rc = unsafe { usbffi::libusb_submit_transfer(self.transfer) };
        if rc == 0 {
            return true;
        }

        if rc != LIBUSB_ERROR_NO_DEVICE {
            error!("could not submit transfer on {:#04x}: error {}", self.endpoint, rc);
        }
        // a slot that cannot be resubmitted leaves the pipeline without data
        self.shared.report_lost();
        false
    }

    fn emit(&self, data: &[u8], success: bool) -> bool {
        let chunk = RawChunk {
            data: Bytes::copy_from_slice(data),
            sequence: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            endpoint: self.endpoint,
            success,
            received_at: Instant::now(),
        };
        self.shared.events.chunk(chunk)
    }

    /// Handles a finished transfer. Returns whether the slot goes back out.
    fn complete(&mut self, status: i32, actual_length: usize) -> bool {
        match status {
            LIBUSB_TRANSFER_CANCELLED => return false,
            LIBUSB_TRANSFER_NO_DEVICE => {
                self.shared.report_lost();
                return false;
            }
            _ => {}
        }

        if self.shared.halted() {
            return false;
        }

        match self.phase {
            Phase::Trigger => {
                if status == LIBUSB_TRANSFER_COMPLETED {
                    self.phase = Phase::Read;
                    true
                } else {
                    trace!("capture trigger failed with status {}", status);
                    self.emit(&[], false)
                }
            }
            Phase::Read => {
                let len = actual_length.min(self.buffer.len());
                let success = status == LIBUSB_TRANSFER_COMPLETED && len >= self.min_complete_len;
                if !success {
                    trace!("transfer status {} with {} bytes", status, len);
                }

                let delivered = self.emit(&self.buffer[..len], success);

                self.phase = Self::first_phase(&self.trigger);
                delivered
            }
        }
    }
}

extern "system" fn transfer_finished(transfer_ptr: *mut usbffi::libusb_transfer) {
    let (user_data, status, actual_length) = {
        let transfer: &usbffi::libusb_transfer = unsafe { &*transfer_ptr };
        (
            transfer.user_data,
            transfer.status,
            transfer.actual_length.max(0) as usize,
        )
    };

    if user_data.is_null() {
        return;
    }

    // SAFETY: user_data is the slot that owns this transfer. The ring frees
    // slots only after every transfer has been retired.
    let slot = unsafe { &mut *(user_data as *mut TransferSlot) };

    if !(slot.complete(status, actual_length) && slot.submit()) {
        slot.shared.retire();
    }
}

/// A running set of in-flight transfers plus the thread that pumps libusb
/// events for them.
pub struct TransferRing {
    slots: Vec<*mut TransferSlot>,
    transfers: Vec<*mut usbffi::libusb_transfer>,
    shared: Arc<RingShared>,
    pump_stop: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    // keeps the device open for as long as transfers reference it
    _handle: Arc<DeviceHandle<Context>>,
}

// SAFETY: the slots and transfers are only touched by the libusb event thread
// while in flight, and by `shutdown` once all of them are retired.
unsafe impl Send for TransferRing {}

impl TransferRing {
    pub fn start(
        handle: Arc<DeviceHandle<Context>>,
        plan: &TransferPlan,
        events: EventSender,
    ) -> Result<Self> {
        let shared = Arc::new(RingShared {
            events,
            sequence: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        });

        let pump_stop = Arc::new(AtomicBool::new(false));
        let pump = {
            let context = handle.context().clone();
            let stop = Arc::clone(&pump_stop);
            thread::Builder::new()
                .name("usb-events".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        let rc = unsafe {
                            usbffi::libusb_handle_events_timeout(
                                context.as_raw(),
                                &EVENT_TIMEOUT as *const libc::timeval,
                            )
                        };
                        if rc < 0 && rc != LIBUSB_ERROR_INTERRUPTED {
                            warn!("libusb event handling failed: {}", rc);
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                    debug!("usb event thread stopped");
                })
                .map_err(CaptureError::Io)?
        };

        let mut ring = Self {
            slots: Vec::with_capacity(plan.queue_depth),
            transfers: Vec::with_capacity(plan.queue_depth),
            shared: Arc::clone(&shared),
            pump_stop,
            pump: Some(pump),
            _handle: Arc::clone(&handle),
        };

        for _ in 0..plan.queue_depth {
            let transfer = unsafe { usbffi::libusb_alloc_transfer(0) };
            if transfer.is_null() {
                ring.shutdown();
                return Err(CaptureError::Protocol(
                    "libusb_alloc_transfer returned null".to_string(),
                ));
            }

            let slot = Box::new(TransferSlot {
                transfer,
                device: handle.as_raw(),
                shared: Arc::clone(&shared),
                endpoint: plan.endpoint,
                timeout_ms: plan.timeout.as_millis() as u32,
                min_complete_len: plan.min_complete_len,
                buffer: vec![0u8; plan.transfer_len],
                setup: vec![0u8; CONTROL_SETUP_SIZE],
                trigger: plan.trigger,
                phase: TransferSlot::first_phase(&plan.trigger),
            });

            ring.transfers.push(transfer);
            ring.slots.push(Box::into_raw(slot));
        }

        for &slot in &ring.slots {
            shared.enlist();
            // SAFETY: the slot is not in flight yet, nothing else references it
            let submitted = unsafe { (*slot).submit() };
            if !submitted {
                shared.retire();
            }
        }

        debug!(
            "{} transfers of {} bytes in flight on {:#04x}",
            plan.queue_depth, plan.transfer_len, plan.endpoint
        );

        Ok(ring)
    }

    fn cancel_all(&self) {
        for &transfer in &self.transfers {
            // NOT_FOUND just means the transfer is between callback and resubmit
            unsafe {
                usbffi::libusb_cancel_transfer(transfer);
            }
        }
    }

    /// Waits for every slot to retire, cancelling again while waiting in case
    /// a callback resubmitted after the first cancel.
    fn drain(&self) -> bool {
        let deadline = Instant::now() + CANCEL_GRACE;
        let mut in_flight = self
            .shared
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while *in_flight > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .idle
                .wait_timeout(in_flight, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            in_flight = guard;
            if *in_flight > 0 {
                self.cancel_all();
            }
        }
        true
    }

    pub fn shutdown(&mut self) {
        if self.pump.is_none() {
            return;
        }

        self.shared.stopping.store(true, Ordering::Release);
        self.cancel_all();
        let drained = self.drain();

        self.pump_stop.store(true, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                error!("usb event thread panicked");
            }
        }

        if drained {
            for slot in self.slots.drain(..) {
                // SAFETY: every transfer has called back and was not resubmitted
                let slot = unsafe { Box::from_raw(slot) };
                unsafe { usbffi::libusb_free_transfer(slot.transfer) };
            }
        } else {
            // freeing a transfer libusb still owns is worse than leaking it
            error!(
                "{} transfers still in flight after cancel, leaking them",
                self.slots.len()
            );
            self.slots.clear();
        }
        self.transfers.clear();
        debug!("transfer ring stopped");
    }
}

impl Drop for TransferRing {
    fn drop(&mut self) {
        self.shutdown();
    }
}
