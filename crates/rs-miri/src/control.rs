//! Streaming status and cross-thread session control.
//!
//! The status is the only piece of session state shared between threads. The
//! drive loop inside [`MiriSdr::start_session`](crate::MiriSdr::start_session)
//! owns everything else and acts on requests it observes here.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{CancelOutcome, Error, Result};

/// Lifecycle of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AsyncStatus {
    /// No transfers outstanding.
    Inactive = 0,
    /// Outstanding transfers are being drained.
    Canceling = 1,
    /// Transfers submitted, samples delivered.
    Running = 2,
    /// Transfers retired, pool kept for resume.
    Paused = 3,
    /// Terminal until the device is closed.
    Failed = 4,
    /// Pause requested, drive loop retiring transfers.
    Pausing = 5,
    /// Resume requested, drive loop resubmitting transfers.
    Resuming = 6,
}

impl AsyncStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AsyncStatus::Inactive,
            1 => AsyncStatus::Canceling,
            2 => AsyncStatus::Running,
            3 => AsyncStatus::Paused,
            5 => AsyncStatus::Pausing,
            6 => AsyncStatus::Resuming,
            _ => AsyncStatus::Failed,
        }
    }
}

#[derive(Debug)]
struct Shared {
    status: AtomicU8,
    poll_interval_us: AtomicU64,
}

/// Thread-safe control of a device's streaming session.
///
/// Obtained from [`MiriSdr::handle`](crate::MiriSdr::handle). Use it from a
/// thread other than the one blocked in `start_session`; only
/// [`StreamHandle::cancel`] may also be called from the sample callback.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    pub(crate) fn new(poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                status: AtomicU8::new(AsyncStatus::Inactive as u8),
                poll_interval_us: AtomicU64::new(poll_interval.as_micros() as u64),
            }),
        }
    }

    pub fn status(&self) -> AsyncStatus {
        AsyncStatus::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    /// Ask the session to stop. Returns immediately.
    ///
    /// # Returns
    ///
    /// - `Ok(CancelOutcome::Canceling)` if a running or paused session is now draining
    /// - `Ok(CancelOutcome::AlreadyCanceled)` if inactive or already draining
    /// - `Err(Error::DeviceFailed)` if the session failed
    pub fn cancel(&self) -> Result<CancelOutcome> {
        let mut current = self.status();
        loop {
            match current {
                AsyncStatus::Inactive | AsyncStatus::Canceling => {
                    return Ok(CancelOutcome::AlreadyCanceled)
                }
                AsyncStatus::Failed => return Err(Error::DeviceFailed),
                AsyncStatus::Running
                | AsyncStatus::Paused
                | AsyncStatus::Pausing
                | AsyncStatus::Resuming => {
                    match self.compare_exchange(current, AsyncStatus::Canceling) {
                        Ok(()) => return Ok(CancelOutcome::Canceling),
                        Err(actual) => current = actual,
                    }
                }
            }
        }
    }

    /// Cancel and poll until the session is inactive or failed.
    pub fn cancel_and_wait(&self) -> Result<()> {
        match self.status() {
            AsyncStatus::Inactive => return Ok(()),
            AsyncStatus::Failed => return Err(Error::DeviceFailed),
            _ => {}
        }

        self.cancel()?;

        loop {
            match self.status() {
                AsyncStatus::Inactive => return Ok(()),
                AsyncStatus::Failed => return Err(Error::DeviceFailed),
                _ => thread::sleep(self.poll_interval()),
            }
        }
    }

    /// Retire all transfers and stop the device streaming, keeping the pool.
    ///
    /// Only valid while running; blocks until the drive loop has drained.
    pub fn pause(&self) -> Result<()> {
        self.request(AsyncStatus::Running, AsyncStatus::Pausing)?;

        match self.wait_while(AsyncStatus::Pausing) {
            AsyncStatus::Paused => Ok(()),
            AsyncStatus::Failed => Err(Error::DeviceFailed),
            other => Err(Error::InvalidState(other)),
        }
    }

    /// Resubmit the pool and restart streaming after [`StreamHandle::pause`].
    pub fn resume(&self) -> Result<()> {
        self.request(AsyncStatus::Paused, AsyncStatus::Resuming)?;

        match self.wait_while(AsyncStatus::Resuming) {
            AsyncStatus::Running => Ok(()),
            AsyncStatus::Failed => Err(Error::DeviceFailed),
            other => Err(Error::InvalidState(other)),
        }
    }

    /// Pause then resume, flushing partially framed output.
    pub fn reset_buffer(&self) -> Result<()> {
        self.pause()?;
        self.resume()
    }

    pub(crate) fn set_poll_interval(&self, interval: Duration) {
        self.shared
            .poll_interval_us
            .store(interval.as_micros() as u64, Ordering::Relaxed);
    }

    /// Atomically move from `from` to `to`; false if the status was not `from`.
    pub(crate) fn transition(&self, from: AsyncStatus, to: AsyncStatus) -> bool {
        self.compare_exchange(from, to).is_ok()
    }

    /// Mark the session failed. Failure overrides any pending request.
    pub(crate) fn fail(&self) {
        self.shared
            .status
            .store(AsyncStatus::Failed as u8, Ordering::Release);
    }

    fn request(&self, from: AsyncStatus, to: AsyncStatus) -> Result<()> {
        match self.compare_exchange(from, to) {
            Ok(()) => Ok(()),
            Err(AsyncStatus::Failed) => Err(Error::DeviceFailed),
            Err(actual) => Err(Error::InvalidState(actual)),
        }
    }

    fn wait_while(&self, status: AsyncStatus) -> AsyncStatus {
        loop {
            let current = self.status();
            if current != status {
                return current;
            }
            thread::sleep(self.poll_interval());
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.shared.poll_interval_us.load(Ordering::Relaxed))
    }

    fn compare_exchange(&self, from: AsyncStatus, to: AsyncStatus) -> std::result::Result<(), AsyncStatus> {
        self.shared
            .status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(AsyncStatus::from_u8)
    }
}
