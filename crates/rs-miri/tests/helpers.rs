//! Test helper utilities: wire block generators and a scripted transport
#![allow(dead_code)]

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use rs_miri::format::{TransferKind, BLOCK_HEADER_SIZE, BLOCK_SIZE, ISO_PACKET_SIZE};
use rs_miri::transport::{Completion, IsoPacket, TransferStatus, Transport};
use rs_miri::{MiriSdr, StreamConfig};

/// Build one wire block with the given sample address and payload byte pattern.
pub fn block(address: u32, fill: impl Fn(usize) -> u8) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    block[..4].copy_from_slice(&address.to_le_bytes());
    for (i, byte) in block[BLOCK_HEADER_SIZE..].iter_mut().enumerate() {
        *byte = fill(i);
    }
    block
}

/// `count` consecutive blocks starting at `address`, advancing by `step`.
pub fn blocks(address: u32, count: usize, step: u32) -> Vec<u8> {
    (0..count)
        .flat_map(|n| {
            let seed = n as u8;
            block(address + n as u32 * step, move |i| (i as u8).wrapping_add(seed))
        })
        .collect()
}

/// What the device returns for one submission.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Bulk transfer filled with these bytes.
    Bulk(Vec<u8>),
    /// Isochronous transfer, one payload per packet (may be empty).
    Iso(Vec<Vec<u8>>),
    /// Transfer finishes with this status and no data.
    Status(TransferStatus),
}

/// In-memory transport that completes submissions from a script.
///
/// Submissions beyond the end of the script stay in flight until cancelled.
#[derive(Debug, Default)]
pub struct MockTransport {
    pub script: VecDeque<Scripted>,
    pub ready: VecDeque<Completion>,
    pub in_flight: Vec<usize>,
    pub control_requests: Vec<u8>,
    pub alt_settings: Vec<u8>,
    pub submitted_lengths: Vec<usize>,
    pub allocated: usize,
    pub freed: usize,
    pub cancels: usize,
    /// Zero-based index of a submission that fails.
    pub fail_submission: Option<usize>,
    /// Errors returned by successive event pumps before normal operation.
    pub event_errors: VecDeque<rusb::Error>,
}

impl MockTransport {
    pub fn with_script(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: script.into_iter().collect(),
            ..Default::default()
        }
    }
}

impl Transport for MockTransport {
    type Transfer = usize;

    fn set_alt_setting(&mut self, _interface: u8, setting: u8) -> rusb::Result<()> {
        self.alt_settings.push(setting);
        Ok(())
    }

    fn control_out(&mut self, _: u8, request: u8, _: u16, _: u16, _: &[u8]) -> rusb::Result<usize> {
        self.control_requests.push(request);
        Ok(0)
    }

    fn alloc_transfer(&mut self, slot: usize, _kind: TransferKind) -> rusb::Result<usize> {
        self.allocated += 1;
        Ok(slot)
    }

    fn free_transfer(&mut self, _transfer: usize) {
        self.freed += 1;
    }

    unsafe fn submit(&mut self, transfer: &mut usize, buffer: &mut [u8], length: usize) -> rusb::Result<()> {
        let index = self.submitted_lengths.len();
        self.submitted_lengths.push(length);
        if self.fail_submission == Some(index) {
            return Err(rusb::Error::Io);
        }

        let slot = *transfer;
        self.in_flight.push(slot);

        let completion = match self.script.pop_front() {
            None => return Ok(()),
            Some(Scripted::Bulk(data)) => {
                let len = data.len().min(length);
                buffer[..len].copy_from_slice(&data[..len]);
                Completion {
                    slot,
                    status: TransferStatus::Completed,
                    actual_length: len,
                    packets: Vec::new(),
                }
            }
            Some(Scripted::Iso(payloads)) => {
                let mut packets = Vec::new();
                let mut total = 0;
                for (i, payload) in payloads.iter().enumerate() {
                    let start = i * ISO_PACKET_SIZE;
                    buffer[start..start + payload.len()].copy_from_slice(payload);
                    total += payload.len();
                    packets.push(IsoPacket {
                        actual_length: payload.len(),
                        status: TransferStatus::Completed,
                    });
                }
                Completion {
                    slot,
                    status: TransferStatus::Completed,
                    actual_length: total,
                    packets,
                }
            }
            Some(Scripted::Status(status)) => Completion {
                slot,
                status,
                actual_length: 0,
                packets: Vec::new(),
            },
        };

        self.ready.push_back(completion);
        Ok(())
    }

    fn cancel(&mut self, transfer: &mut usize) -> rusb::Result<()> {
        let slot = *transfer;
        if !self.in_flight.contains(&slot) {
            return Err(rusb::Error::NotFound);
        }
        self.cancels += 1;

        if !self.ready.iter().any(|c| c.slot == slot) {
            self.ready.push_back(Completion {
                slot,
                status: TransferStatus::Cancelled,
                actual_length: 0,
                packets: Vec::new(),
            });
        }
        Ok(())
    }

    fn handle_events(&mut self, _timeout: Duration, completed: &mut Vec<Completion>) -> rusb::Result<()> {
        if let Some(err) = self.event_errors.pop_front() {
            return Err(err);
        }

        if self.ready.is_empty() {
            thread::sleep(Duration::from_millis(1));
            return Ok(());
        }

        for completion in self.ready.drain(..) {
            self.in_flight.retain(|&slot| slot != completion.slot);
            completed.push(completion);
        }
        Ok(())
    }
}

/// A device over `transport` with every delay shortened.
pub fn mock_sdr(transport: MockTransport) -> MiriSdr<MockTransport> {
    let mut sdr = MiriSdr::new(transport);
    sdr.set_stream_config(StreamConfig::fast());
    sdr
}
