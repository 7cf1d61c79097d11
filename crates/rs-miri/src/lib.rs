//! Streaming engine for Mirics MSi2500 based Software Defined Radios.
//!
//! # Overview
//!
//! `rs-miri` pulls sample data off a MiriSDR dongle: it keeps a pool of
//! asynchronous USB transfers in flight, decodes the packed wire blocks into
//! host-order signed samples and hands them to a callback, either as produced
//! or re-framed into fixed-size chunks. Tuner and gain control are left to
//! other tools.
//!
//! # Sample Formats
//!
//! The device sends 1024-byte blocks: a 16-byte header carrying a running
//! sample address, then 1008 bytes of packed I/Q data. See [`SampleFormat`]
//! for the five supported packings. The address is used to detect and report
//! dropped samples.
//!
//! # Example
//!
//! ```no_run
//! use rs_miri::{MiriSdr, SampleFormat};
//!
//! let mut sdr = MiriSdr::open_first()?;
//! let handle = sdr.handle();
//!
//! let mut received = 0;
//! sdr.start_session(SampleFormat::S16_504, 0, 0, |samples| {
//!     received += samples.len();
//!     if received > 1 << 24 {
//!         let _ = handle.cancel();
//!     }
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod control;
pub mod convert;
pub mod error;
pub mod format;
pub mod framer;
pub mod pool;
pub mod stream;
pub mod transport;

pub use config::StreamConfig;
pub use control::{AsyncStatus, StreamHandle};
pub use error::{CancelOutcome, Error, Result};
pub use format::{SampleFormat, TransferKind, DEFAULT_BUFFER_COUNT};
pub use stream::{MiriSdr, StreamStats};
pub use transport::{Transport, UsbTransport};

/// USB identity of a supported receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: &'static str,
}

impl DeviceId {
    /// Find a supported device by USB VID/PID.
    pub fn lookup(vendor_id: u16, product_id: u16) -> Option<&'static DeviceId> {
        KNOWN_DEVICES
            .iter()
            .find(|id| id.vendor_id == vendor_id && id.product_id == product_id)
    }
}

// MSi2500 based receivers (USB VID/PID)
pub const KNOWN_DEVICES: &[DeviceId] = &[
    DeviceId {
        vendor_id: 0x1df7,
        product_id: 0x2500,
        name: "Mirics MSi2500 default (e.g. VTX3D card)",
    },
    DeviceId {
        vendor_id: 0x2040,
        product_id: 0xd300,
        name: "Hauppauge WinTV 133559 LF",
    },
    DeviceId {
        vendor_id: 0x07ca,
        product_id: 0x8591,
        name: "AverMedia A859 Pure DVBT",
    },
    DeviceId {
        vendor_id: 0x04bb,
        product_id: 0x0537,
        name: "IO-DATA GV-TV100 stick",
    },
    DeviceId {
        vendor_id: 0x0511,
        product_id: 0x0037,
        name: "Logitec LDT-1S310U/J",
    },
];
