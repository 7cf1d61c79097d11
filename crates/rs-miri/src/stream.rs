//! Streaming session: transfer submission, completion dispatch and the
//! blocking drive loop.

use std::thread;

use rusb::{Direction, Recipient, RequestType};

use crate::config::StreamConfig;
use crate::control::{AsyncStatus, StreamHandle};
use crate::convert::{convert, AddressTracker};
use crate::error::{CancelOutcome, Error, Result};
use crate::format::{SampleFormat, TransferKind, DEFAULT_BUFFER_COUNT, ISO_PACKET_SIZE};
use crate::framer::OutputFramer;
use crate::pool::{TransferDescriptor, TransferPool};
use crate::transport::{Completion, TransferStatus, Transport, UsbTransport, INTERFACE};

/// Vendor request starting the sample stream.
const STREAMING_START: u8 = 0x43;

/// Vendor request stopping the sample stream.
const STREAMING_STOP: u8 = 0x45;

/// Sample-loss counters accumulated since the device was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Address discontinuities detected.
    pub loss_events: u64,
    /// Samples skipped by the device, summed over all discontinuities.
    pub lost_samples: u64,
}

/// A MiriSDR device and its streaming engine.
///
/// Tuning and gain control are out of scope; this type only moves samples.
pub struct MiriSdr<T: Transport> {
    transport: T,
    transfer_kind: TransferKind,
    config: StreamConfig,
    handle: StreamHandle,
    pool: TransferPool<T::Transfer>,
    format: SampleFormat,
    framer: OutputFramer,
    tracker: AddressTracker,
    sync_loss: i64,
    scratch: Vec<u8>,
    completions: Vec<Completion>,
    stats: StreamStats,
}

impl MiriSdr<UsbTransport> {
    /// Open the first available MiriSDR device.
    pub fn open_first() -> Result<Self> {
        Ok(Self::new(UsbTransport::open_first()?))
    }

    /// Open a specific MiriSDR device by enumeration index.
    pub fn open(index: usize) -> Result<Self> {
        Ok(Self::new(UsbTransport::open_by_index(index)?))
    }
}

impl<T: Transport> MiriSdr<T> {
    /// Wrap an opened transport. The session starts inactive, in bulk mode.
    pub fn new(transport: T) -> Self {
        let config = StreamConfig::default();
        Self {
            transport,
            transfer_kind: TransferKind::default(),
            handle: StreamHandle::new(config.poll_interval),
            config,
            pool: TransferPool::default(),
            format: SampleFormat::S16_504,
            framer: OutputFramer::default(),
            tracker: AddressTracker::new(),
            sync_loss: 0,
            scratch: Vec::new(),
            completions: Vec::new(),
            stats: StreamStats::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Handle for cancelling, pausing or resuming from another thread.
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> AsyncStatus {
        self.handle.status()
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Sample address the next wire block is expected to carry.
    pub fn expected_address(&self) -> u32 {
        self.tracker.expected()
    }

    pub fn transfer_kind(&self) -> TransferKind {
        self.transfer_kind
    }

    /// Select bulk or isochronous transfers for the next session.
    pub fn set_transfer_kind(&mut self, kind: TransferKind) -> Result<()> {
        match self.status() {
            AsyncStatus::Inactive => {}
            AsyncStatus::Failed => return Err(Error::DeviceFailed),
            other => return Err(Error::InvalidState(other)),
        }
        self.transfer_kind = kind;
        Ok(())
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn set_stream_config(&mut self, config: StreamConfig) {
        self.handle.set_poll_interval(config.poll_interval);
        self.config = config;
    }

    /// Stream samples until cancelled or failed.
    ///
    /// Blocks the calling thread, which drives all transfer completions.
    /// `callback` receives decoded samples in host byte order: whatever each
    /// transfer produced when `frame_size` is 0, otherwise frames of exactly
    /// `frame_size` bytes. A `buffer_count` of 0 selects the default of 32.
    ///
    /// # Returns
    ///
    /// - `Ok(())` once the session was cancelled and drained
    /// - `Err(Error::DeviceFailed)` if a transfer failed or the device was already failed
    /// - `Err(Error::InvalidState(_))` if a session is already active
    /// - `Err(Error::Transport(_))` if allocation, submission or event handling failed
    pub fn start_session<F>(
        &mut self,
        format: SampleFormat,
        buffer_count: usize,
        frame_size: usize,
        mut callback: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]),
    {
        match self.status() {
            AsyncStatus::Inactive => {}
            AsyncStatus::Failed => return Err(Error::DeviceFailed),
            other => return Err(Error::InvalidState(other)),
        }

        let buffer_count = if buffer_count == 0 {
            DEFAULT_BUFFER_COUNT
        } else {
            buffer_count
        };
        let kind = self.transfer_kind;

        self.format = format;
        self.framer = OutputFramer::new(frame_size);

        tracing::debug!(
            "Starting {:?} session: {} ({} bit), {} buffers, frame size {}",
            kind,
            format,
            format.bits(),
            buffer_count,
            self.framer.frame_size()
        );

        self.tracker.reset();
        self.sync_loss = 0;

        let needed = format.decoded_len(kind.buffer_len());
        if self.scratch.len() < needed {
            self.scratch.resize(needed, 0);
        }

        if let Err(e) = self.transport.set_alt_setting(INTERFACE, kind.alt_setting()) {
            tracing::warn!(
                "Failed to select alternate setting {} for {:?} transfers: {}",
                kind.alt_setting(),
                kind,
                e
            );
        }

        if let Err(e) = self.pool.allocate(&mut self.transport, kind, buffer_count) {
            tracing::error!("Failed to allocate transfers: {}", e);
            self.pool.free(&mut self.transport);
            return Err(e.into());
        }

        if let Err(e) = self.submit_all() {
            tracing::error!("Failed to submit transfers: {}", e);
            self.reclaim_in_flight();
            self.pool.free(&mut self.transport);
            return Err(e.into());
        }

        self.streaming_control(STREAMING_START);
        self.handle.transition(AsyncStatus::Inactive, AsyncStatus::Running);

        let result = self.drive(&mut callback);

        if self.status() == AsyncStatus::Failed {
            self.reclaim_in_flight();
        }
        self.pool.free(&mut self.transport);
        thread::sleep(self.config.settle_delay);
        self.streaming_control(STREAMING_STOP);

        tracing::debug!("Session ended: {:?}", self.status());
        result
    }

    /// Request cancellation; see [`StreamHandle::cancel`].
    pub fn cancel(&self) -> Result<CancelOutcome> {
        self.handle.cancel()
    }

    /// Stop any session and release the device.
    pub fn close(self) {
        if let Err(e) = self.handle.cancel_and_wait() {
            tracing::debug!("Closing device after session error: {}", e);
        }
    }

    /// Pump events and act on the status until the session ends.
    fn drive(&mut self, callback: &mut dyn FnMut(&[u8])) -> Result<()> {
        loop {
            match self.pump(callback) {
                Ok(()) | Err(rusb::Error::Interrupted) => {}
                Err(e) => {
                    tracing::error!("Event handling failed: {}", e);
                    self.handle.fail();
                    return Err(e.into());
                }
            }

            match self.status() {
                AsyncStatus::Running | AsyncStatus::Paused => {}
                AsyncStatus::Canceling => {
                    if self.cancel_pending() == 0
                        && self.handle.transition(AsyncStatus::Canceling, AsyncStatus::Inactive)
                    {
                        tracing::debug!("All transfers retired");
                        // Flush any event still queued for the retired transfers.
                        if let Err(e) = self.pump(callback) {
                            tracing::debug!("Final event pump failed: {}", e);
                        }
                        return Ok(());
                    }
                }
                AsyncStatus::Pausing => {
                    if self.cancel_pending() == 0 {
                        thread::sleep(self.config.settle_delay);
                        self.streaming_control(STREAMING_STOP);
                        self.handle.transition(AsyncStatus::Pausing, AsyncStatus::Paused);
                    }
                }
                AsyncStatus::Resuming => {
                    self.framer.reset();
                    if let Err(e) = self.submit_all() {
                        tracing::error!("Failed to resubmit transfers: {}", e);
                        self.handle.fail();
                        return Err(e.into());
                    }
                    self.streaming_control(STREAMING_START);
                    self.handle.transition(AsyncStatus::Resuming, AsyncStatus::Running);
                }
                AsyncStatus::Failed => return Err(Error::DeviceFailed),
                AsyncStatus::Inactive => return Ok(()),
            }
        }
    }

    /// One event pump, dispatching every completion it reported.
    fn pump(&mut self, callback: &mut dyn FnMut(&[u8])) -> rusb::Result<()> {
        let mut completions = std::mem::take(&mut self.completions);
        let result = self
            .transport
            .handle_events(self.config.event_timeout, &mut completions);

        for completion in completions.drain(..) {
            self.dispatch(completion, callback);
        }
        self.completions = completions;

        result
    }

    /// Handle one finished transfer: decode, deliver and resubmit while running.
    fn dispatch(&mut self, completion: Completion, callback: &mut dyn FnMut(&[u8])) {
        let status = self.status();
        let format = self.format;
        let kind = self.pool.kind();

        let Some(descriptor) = self.pool.get_mut(completion.slot) else {
            tracing::error!("Completion for unknown transfer {}", completion.slot);
            self.handle.fail();
            return;
        };
        descriptor.status = completion.status;

        match completion.status {
            TransferStatus::Completed => {}
            TransferStatus::Cancelled => return,
            other => {
                tracing::error!("Transfer {} failed: {:?}", completion.slot, other);
                self.handle.fail();
                return;
            }
        }

        if status != AsyncStatus::Running {
            return;
        }

        let decoded = decode_transfer(
            format,
            kind,
            &descriptor.buffer,
            &completion,
            &mut self.tracker,
            &mut self.scratch,
            &mut self.stats,
        );

        if decoded.bytes > 0 {
            self.framer.feed(&self.scratch[..decoded.bytes], callback);
        }

        let mut length = kind.buffer_len();
        if kind == TransferKind::Bulk {
            self.sync_loss += i64::from(decoded.loss_events);
            if self.sync_loss > self.config.loss_threshold(self.pool.len()) {
                self.sync_loss = 1 - self.pool.len() as i64;
                length = length.saturating_sub(self.config.resync_margin);
                tracing::warn!(
                    "Sync lost, shortening next bulk transfer to {} bytes",
                    length
                );
            }
        }

        // The callback may have cancelled the session.
        if self.status() != AsyncStatus::Running {
            return;
        }

        if let Some(descriptor) = self.pool.get_mut(completion.slot) {
            if let Err(e) = submit_transfer(&mut self.transport, descriptor, length) {
                tracing::error!("Failed to resubmit transfer {}: {}", completion.slot, e);
                self.handle.fail();
            }
        }
    }

    fn submit_all(&mut self) -> rusb::Result<()> {
        let length = self.pool.kind().buffer_len();
        for descriptor in self.pool.iter_mut() {
            submit_transfer(&mut self.transport, descriptor, length)?;
        }
        Ok(())
    }

    /// Request cancellation of every pending transfer, returning how many
    /// were still pending.
    fn cancel_pending(&mut self) -> usize {
        let mut pending = 0;
        for descriptor in self.pool.iter_mut().filter(|d| d.is_pending()) {
            if let Err(e) = self.transport.cancel(&mut descriptor.transfer) {
                tracing::debug!("Cancel request failed: {}", e);
            }
            pending += 1;
        }
        pending
    }

    /// Bounded cancel-and-pump rounds so that as few transfers as possible
    /// are still in flight when the pool is released.
    fn reclaim_in_flight(&mut self) {
        for _ in 0..self.config.failure_drain_rounds {
            if self.cancel_pending() == 0 {
                return;
            }
            if let Err(e) = self.pump(&mut |_: &[u8]| {}) {
                tracing::debug!("Event handling failed while draining: {}", e);
            }
        }
    }

    fn streaming_control(&mut self, request: u8) {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Endpoint);
        if let Err(e) = self.transport.control_out(request_type, request, 0, 0, &[]) {
            tracing::warn!("Streaming control request {:#04x} failed: {}", request, e);
        }
    }
}

impl<T: Transport> Drop for MiriSdr<T> {
    fn drop(&mut self) {
        // Only reachable with a live pool if the sample callback panicked.
        if self.pool.is_allocated() {
            self.pool.free(&mut self.transport);
        }
    }
}

/// Submit `descriptor` for `length` bytes and mark it pending.
fn submit_transfer<T: Transport>(
    transport: &mut T,
    descriptor: &mut TransferDescriptor<T::Transfer>,
    length: usize,
) -> rusb::Result<()> {
    // SAFETY: pool buffers are boxed slices that stay allocated and unmoved
    // while pending; the pool leaks rather than frees a pending descriptor.
    unsafe { transport.submit(&mut descriptor.transfer, &mut descriptor.buffer, length)? };
    descriptor.status = TransferStatus::Pending;
    Ok(())
}

struct Decoded {
    bytes: usize,
    loss_events: u32,
}

/// Decode the filled part of a transfer buffer into `scratch`.
///
/// Isochronous transfers are decoded packet by packet at their fixed
/// offsets; empty packets are skipped.
fn decode_transfer(
    format: SampleFormat,
    kind: TransferKind,
    buffer: &[u8],
    completion: &Completion,
    tracker: &mut AddressTracker,
    scratch: &mut [u8],
    stats: &mut StreamStats,
) -> Decoded {
    let mut decoded = Decoded {
        bytes: 0,
        loss_events: 0,
    };

    let mut decode = |raw: &[u8], decoded: &mut Decoded| {
        let conversion = convert(format, tracker, raw, &mut scratch[decoded.bytes..]);
        decoded.bytes += conversion.bytes;
        if let Some(lost) = conversion.lost {
            decoded.loss_events += 1;
            stats.loss_events += 1;
            stats.lost_samples += u64::from(lost);
        }
    };

    match kind {
        TransferKind::Bulk => {
            let len = completion.actual_length.min(buffer.len());
            decode(&buffer[..len], &mut decoded);
        }
        TransferKind::Isochronous => {
            for (index, packet) in completion.packets.iter().enumerate() {
                if packet.actual_length == 0 {
                    continue;
                }
                let start = index * ISO_PACKET_SIZE;
                let end = start + packet.actual_length.min(ISO_PACKET_SIZE);
                if end > buffer.len() {
                    break;
                }
                decode(&buffer[start..end], &mut decoded);
            }
        }
    }

    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Transport that records control requests and never completes anything.
    #[derive(Default)]
    struct IdleTransport {
        requests: Vec<u8>,
        submitted: usize,
        reject_submit: bool,
    }

    impl Transport for IdleTransport {
        type Transfer = ();

        fn set_alt_setting(&mut self, _: u8, _: u8) -> rusb::Result<()> {
            Ok(())
        }

        fn control_out(&mut self, _: u8, request: u8, _: u16, _: u16, _: &[u8]) -> rusb::Result<usize> {
            self.requests.push(request);
            Ok(0)
        }

        fn alloc_transfer(&mut self, _: usize, _: TransferKind) -> rusb::Result<()> {
            Ok(())
        }

        fn free_transfer(&mut self, _: ()) {}

        unsafe fn submit(&mut self, _: &mut (), _: &mut [u8], _: usize) -> rusb::Result<()> {
            if self.reject_submit {
                return Err(rusb::Error::Io);
            }
            self.submitted += 1;
            Ok(())
        }

        fn cancel(&mut self, _: &mut ()) -> rusb::Result<()> {
            Ok(())
        }

        fn handle_events(&mut self, _: Duration, _: &mut Vec<Completion>) -> rusb::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_start_while_running_has_no_side_effects() {
        let mut sdr = MiriSdr::new(IdleTransport::default());
        assert!(sdr.handle.transition(AsyncStatus::Inactive, AsyncStatus::Running));

        let result = sdr.start_session(SampleFormat::S8_504, 4, 0, |_| {});

        assert!(matches!(result, Err(Error::InvalidState(AsyncStatus::Running))));
        assert_eq!(sdr.status(), AsyncStatus::Running);
        assert!(!sdr.pool.is_allocated());
        assert_eq!(sdr.transport().submitted, 0);
        assert!(sdr.transport().requests.is_empty());
    }

    #[test]
    fn test_scratch_never_shrinks() {
        let mut sdr = MiriSdr::new(IdleTransport {
            reject_submit: true,
            ..Default::default()
        });

        // Scratch is sized before submission, so a rejected submit still grows it.
        assert!(sdr.start_session(SampleFormat::S16_504, 1, 0, |_| {}).is_err());
        let large = sdr.scratch.len();
        assert_eq!(large, SampleFormat::S16_504.decoded_len(16384));

        assert!(sdr.start_session(SampleFormat::S8_504, 1, 0, |_| {}).is_err());
        assert_eq!(sdr.scratch.len(), large);
    }

    #[test]
    fn test_set_transfer_kind_requires_inactive() {
        let mut sdr = MiriSdr::new(IdleTransport::default());
        sdr.set_transfer_kind(TransferKind::Isochronous).unwrap();
        assert_eq!(sdr.transfer_kind(), TransferKind::Isochronous);

        sdr.handle.transition(AsyncStatus::Inactive, AsyncStatus::Paused);
        assert!(matches!(
            sdr.set_transfer_kind(TransferKind::Bulk),
            Err(Error::InvalidState(AsyncStatus::Paused))
        ));
    }

    #[test]
    fn test_decode_iso_skips_empty_packets() {
        use crate::transport::IsoPacket;

        let mut buffer = vec![0u8; TransferKind::Isochronous.buffer_len()];
        // Packet 1 carries one block at address 0.
        buffer[ISO_PACKET_SIZE + 16] = 0x7f;

        let packets = (0..8)
            .map(|i| IsoPacket {
                actual_length: if i == 1 { 1024 } else { 0 },
                status: TransferStatus::Completed,
            })
            .collect();
        let completion = Completion {
            slot: 0,
            status: TransferStatus::Completed,
            actual_length: 1024,
            packets,
        };

        let mut tracker = AddressTracker::new();
        let mut scratch = vec![0u8; SampleFormat::S8_504.decoded_len(buffer.len())];
        let mut stats = StreamStats::default();

        let decoded = decode_transfer(
            SampleFormat::S8_504,
            TransferKind::Isochronous,
            &buffer,
            &completion,
            &mut tracker,
            &mut scratch,
            &mut stats,
        );

        assert_eq!(decoded.bytes, 1008);
        assert_eq!(decoded.loss_events, 0);
        assert_eq!(scratch[0], 0x7f);
        assert_eq!(tracker.expected(), 504);
    }
}
