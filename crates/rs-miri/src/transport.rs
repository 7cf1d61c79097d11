//! USB transport layer for MiriSDR devices.
//!
//! The streaming engine talks to the bus through the [`Transport`] trait so it
//! can be driven by libusb ([`UsbTransport`]) or by an in-memory test double.
//! Completions are collected while the event pump runs and handed back to the
//! caller on the same thread.

use std::ffi::c_void;
use std::os::raw::{c_int, c_uint};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusb::{ffi, Context, Device, DeviceHandle, UsbContext};

use crate::error::{Error, Result};
use crate::format::TransferKind;
use crate::DeviceId;

/// Timeout for USB control transfers.
const CTRL_TIMEOUT: Duration = Duration::from_millis(2000);

/// Timeout of bulk and isochronous data transfers (milliseconds).
const TRANSFER_TIMEOUT_MS: c_uint = 1000;

/// Sample data endpoint.
pub const DATA_ENDPOINT: u8 = 0x81;

/// Streaming interface.
pub const INTERFACE: u8 = 0;

/// Last status reported for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    /// Allocated, never submitted.
    #[default]
    Idle,
    /// Submitted, completion not yet seen.
    Pending,
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

/// Per-packet result of an isochronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub actual_length: usize,
    pub status: TransferStatus,
}

/// A finished transfer, as reported by [`Transport::handle_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Pool slot the transfer was allocated for.
    pub slot: usize,
    pub status: TransferStatus,
    pub actual_length: usize,
    /// Empty for bulk transfers.
    pub packets: Vec<IsoPacket>,
}

/// USB host-controller operations used by the streaming engine.
pub trait Transport {
    /// Transport-level transfer descriptor.
    type Transfer;

    /// Select an alternate setting of `interface`.
    fn set_alt_setting(&mut self, interface: u8, setting: u8) -> rusb::Result<()>;

    /// Vendor control request towards the device.
    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> rusb::Result<usize>;

    /// Allocate a transfer descriptor for pool slot `slot`.
    fn alloc_transfer(&mut self, slot: usize, kind: TransferKind) -> rusb::Result<Self::Transfer>;

    /// Release a descriptor that is not in flight.
    fn free_transfer(&mut self, transfer: Self::Transfer);

    /// Submit `transfer` to read up to `length` bytes into `buffer`.
    ///
    /// # Safety
    ///
    /// The transport may write into `buffer` until the transfer's completion
    /// has been returned by [`Transport::handle_events`]. The caller must keep
    /// the buffer allocated, unmoved and otherwise untouched until then.
    unsafe fn submit(
        &mut self,
        transfer: &mut Self::Transfer,
        buffer: &mut [u8],
        length: usize,
    ) -> rusb::Result<()>;

    /// Request cancellation of an in-flight transfer.
    fn cancel(&mut self, transfer: &mut Self::Transfer) -> rusb::Result<()>;

    /// Pump pending events for at most `timeout`, appending finished transfers
    /// to `completed`. `rusb::Error::Interrupted` is retryable.
    fn handle_events(&mut self, timeout: Duration, completed: &mut Vec<Completion>) -> rusb::Result<()>;
}

/// libusb-backed transport for an opened MiriSDR device.
pub struct UsbTransport {
    device: DeviceHandle<Context>,
    id: DeviceId,
    completions: Arc<Mutex<Vec<Completion>>>,
}

/// Asynchronous libusb transfer owned by a [`UsbTransport`] pool slot.
pub struct LibusbTransfer {
    raw: NonNull<ffi::libusb_transfer>,
    kind: TransferKind,
    state: Box<CallbackState>,
}

// SAFETY: the raw transfer is only touched from the thread driving the
// session; libusb itself does not tie transfers to a thread.
unsafe impl Send for LibusbTransfer {}

struct CallbackState {
    slot: usize,
    queue: Arc<Mutex<Vec<Completion>>>,
}

impl UsbTransport {
    /// Open the first available MiriSDR device.
    ///
    /// # Returns
    ///
    /// - `Ok(UsbTransport)` if a device was found and opened
    /// - `Err(Error::DeviceNotFound)` if no supported device is connected
    pub fn open_first() -> Result<Self> {
        Self::open_by_index(0)
    }

    /// Open a specific MiriSDR device by index.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based device index (in order of enumeration)
    pub fn open_by_index(index: usize) -> Result<Self> {
        let context = Context::new()?;
        let devices = context.devices()?;

        let mut count = 0;
        for device in devices.iter() {
            let desc = device.device_descriptor()?;

            if let Some(id) = DeviceId::lookup(desc.vendor_id(), desc.product_id()) {
                if count == index {
                    return Self::open_device(&device, *id);
                }
                count += 1;
            }
        }

        Err(Error::DeviceNotFound)
    }

    /// List all connected MiriSDR devices.
    pub fn list_devices() -> Result<Vec<String>> {
        let context = Context::new()?;
        let devices = context.devices()?;
        let mut result = Vec::new();

        for device in devices.iter() {
            let desc = device.device_descriptor()?;

            if let Some(id) = DeviceId::lookup(desc.vendor_id(), desc.product_id()) {
                result.push(format!(
                    "{} (Bus {:03} Device {:03})",
                    id.name,
                    device.bus_number(),
                    device.address()
                ));
            }
        }

        Ok(result)
    }

    /// Open a device handle, detaching a kernel driver if one is bound and
    /// claiming the streaming interface.
    fn open_device(device: &Device<Context>, id: DeviceId) -> Result<Self> {
        let handle = device
            .open()
            .map_err(|e| Error::OpenFailed(format!("{}: {}", id.name, e)))?;

        #[cfg(target_os = "linux")]
        {
            if handle.kernel_driver_active(INTERFACE).unwrap_or(false) {
                tracing::debug!("Detaching kernel driver from interface {}", INTERFACE);
                if let Err(e) = handle.detach_kernel_driver(INTERFACE) {
                    tracing::warn!(
                        "Failed to detach kernel driver (msi001/msi2500 may be loaded): {}",
                        e
                    );
                }
            }
        }

        handle.claim_interface(INTERFACE)?;
        tracing::debug!("Opened {}", id.name);

        Ok(UsbTransport {
            device: handle,
            id,
            completions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Identity of the opened device.
    pub fn device_id(&self) -> DeviceId {
        self.id
    }
}

impl Transport for UsbTransport {
    type Transfer = LibusbTransfer;

    fn set_alt_setting(&mut self, interface: u8, setting: u8) -> rusb::Result<()> {
        self.device.set_alternate_setting(interface, setting)
    }

    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> rusb::Result<usize> {
        self.device
            .write_control(request_type, request, value, index, data, CTRL_TIMEOUT)
    }

    fn alloc_transfer(&mut self, slot: usize, kind: TransferKind) -> rusb::Result<LibusbTransfer> {
        // SAFETY: plain allocation, checked for null below.
        let raw = unsafe { ffi::libusb_alloc_transfer(kind.iso_packets() as c_int) };
        let raw = NonNull::new(raw).ok_or(rusb::Error::NoMem)?;

        Ok(LibusbTransfer {
            raw,
            kind,
            state: Box::new(CallbackState {
                slot,
                queue: Arc::clone(&self.completions),
            }),
        })
    }

    fn free_transfer(&mut self, transfer: LibusbTransfer) {
        // SAFETY: the pool only frees transfers that are not in flight.
        unsafe { ffi::libusb_free_transfer(transfer.raw.as_ptr()) };
    }

    unsafe fn submit(
        &mut self,
        transfer: &mut LibusbTransfer,
        buffer: &mut [u8],
        length: usize,
    ) -> rusb::Result<()> {
        let length = length.min(buffer.len());
        let t = transfer.raw.as_ptr();

        (*t).dev_handle = self.device.as_raw();
        (*t).flags = 0;
        (*t).endpoint = DATA_ENDPOINT;
        (*t).timeout = TRANSFER_TIMEOUT_MS;
        (*t).buffer = buffer.as_mut_ptr();
        (*t).length = length as c_int;
        (*t).actual_length = 0;
        (*t).callback = transfer_callback;
        (*t).user_data = &*transfer.state as *const CallbackState as *mut c_void;

        match transfer.kind {
            TransferKind::Bulk => {
                (*t).transfer_type = ffi::constants::LIBUSB_TRANSFER_TYPE_BULK as _;
                (*t).num_iso_packets = 0;
            }
            TransferKind::Isochronous => {
                let packets = transfer.kind.iso_packets();
                (*t).transfer_type = ffi::constants::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS as _;
                (*t).num_iso_packets = packets as c_int;

                let desc = ptr::addr_of_mut!((*t).iso_packet_desc) as *mut ffi::libusb_iso_packet_descriptor;
                for i in 0..packets {
                    (*desc.add(i)).length = (length / packets) as c_uint;
                }
            }
        }

        match ffi::libusb_submit_transfer(t) {
            0 => Ok(()),
            err => Err(from_libusb(err)),
        }
    }

    fn cancel(&mut self, transfer: &mut LibusbTransfer) -> rusb::Result<()> {
        // SAFETY: the transfer was allocated by libusb and is still owned by the pool.
        match unsafe { ffi::libusb_cancel_transfer(transfer.raw.as_ptr()) } {
            0 => Ok(()),
            err => Err(from_libusb(err)),
        }
    }

    fn handle_events(&mut self, timeout: Duration, completed: &mut Vec<Completion>) -> rusb::Result<()> {
        let result = self.device.context().handle_events(Some(timeout));

        let mut queue = self
            .completions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        completed.append(&mut queue);

        result
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.device.release_interface(INTERFACE) {
            tracing::debug!("Failed to release USB interface: {}", e);
        }

        // DeviceHandle will automatically close the device when dropped
        tracing::debug!("{} closed", self.id.name);
    }
}

/// Invoked by libusb from inside `handle_events`.
extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb hands back a transfer filled by `submit`, whose user data
    // points at the CallbackState boxed in the owning LibusbTransfer.
    unsafe {
        let state = &*((*transfer).user_data as *const CallbackState);

        let count = (*transfer).num_iso_packets.max(0) as usize;
        let desc = ptr::addr_of!((*transfer).iso_packet_desc) as *const ffi::libusb_iso_packet_descriptor;
        let packets = (0..count)
            .map(|i| {
                let packet = &*desc.add(i);
                IsoPacket {
                    actual_length: packet.actual_length as usize,
                    status: transfer_status(packet.status as i32),
                }
            })
            .collect();

        let completion = Completion {
            slot: state.slot,
            status: transfer_status((*transfer).status as i32),
            actual_length: (*transfer).actual_length.max(0) as usize,
            packets,
        };

        state
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(completion);
    }
}

/// Map a `libusb_transfer_status` value.
fn transfer_status(code: i32) -> TransferStatus {
    match code {
        0 => TransferStatus::Completed,
        2 => TransferStatus::TimedOut,
        3 => TransferStatus::Cancelled,
        4 => TransferStatus::Stall,
        5 => TransferStatus::NoDevice,
        6 => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// rusb keeps its own libusb error mapping private.
fn from_libusb(err: c_int) -> rusb::Error {
    use rusb::ffi::constants::*;

    match err {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}
