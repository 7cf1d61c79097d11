//! Error types for rs-miri operations.

use thiserror::Error;

use crate::control::AsyncStatus;

/// Result type for rs-miri operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening or streaming from a MiriSDR device.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation is not valid from the current streaming status.
    #[error("Invalid streaming state: {0:?}")]
    InvalidState(AsyncStatus),

    /// USB submission, cancellation, control or event handling failed.
    #[error("USB transport error: {0}")]
    Transport(#[from] rusb::Error),

    /// Unknown transfer kind, sample format or device.
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The streaming session failed; the device must be closed before reuse.
    #[error("Device failed, close it before streaming again")]
    DeviceFailed,

    /// No MiriSDR device found.
    #[error("No MiriSDR device found")]
    DeviceNotFound,

    /// Failed to open device.
    #[error("Failed to open device: {0}")]
    OpenFailed(String),
}

/// Outcome of a cancellation request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The session was running or paused and is now draining.
    Canceling,
    /// Nothing to cancel: the session is inactive or already draining.
    AlreadyCanceled,
}
