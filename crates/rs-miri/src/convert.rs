//! Sample codec: unpacks raw wire blocks into host-order signed samples.
//!
//! Each decoder consumes complete 1024-byte blocks and writes into a
//! caller-provided scratch slice, which must hold at least
//! [`SampleFormat::decoded_len`] bytes for the input length.
//!
//! The meaningful bits of every 16-bit format are placed at the top of the
//! `i16` container so that sign and full-scale range are preserved.
//!
//! ## Sample loss
//!
//! Blocks carry a running sample address. The first block of every call is
//! compared against the address the previous call predicted; a mismatch is
//! reported in [`Conversion::lost`], logged, and decoding continues from the
//! observed address.

use crate::format::{SampleFormat, BLOCK_HEADER_SIZE, BLOCK_SIZE, BLOCK_PAYLOAD_SIZE};

/// Micro-groups (8 samples in 10 bytes) per 384-format sub-block.
const GROUPS_PER_SUBBLOCK: usize = 16;

/// Packed bytes per 384-format sub-block, excluding the shift word.
const SUBBLOCK_DATA_SIZE: usize = GROUPS_PER_SUBBLOCK * 10;

/// Sub-blocks per 384-format wire block.
const SUBBLOCKS_PER_BLOCK: usize = 6;

/// Expected running sample address of the next wire block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressTracker {
    expected: u32,
}

impl AddressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the next call is expected to start with.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn reset(&mut self) {
        self.expected = 0;
    }

    /// Compare a block header with the prediction, resynchronizing on mismatch.
    ///
    /// Returns the number of samples skipped by the device, if any.
    fn check(&mut self, observed: u32, raw_len: usize) -> Option<u32> {
        if observed == self.expected {
            return None;
        }

        let lost = observed.wrapping_sub(self.expected);
        tracing::warn!(
            "{} samples lost, {} bytes, {:08x}:{:08x}",
            lost,
            raw_len,
            self.expected,
            observed
        );
        self.expected = observed;
        Some(lost)
    }
}

/// Result of decoding one raw buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conversion {
    /// Decoded bytes written to the destination.
    pub bytes: usize,
    /// Samples lost before this buffer, if a discontinuity was detected.
    pub lost: Option<u32>,
}

/// Decode `src` in the given format into `dst`.
pub fn convert(
    format: SampleFormat,
    tracker: &mut AddressTracker,
    src: &[u8],
    dst: &mut [u8],
) -> Conversion {
    match format {
        SampleFormat::S16_252 => convert_252_s16(tracker, src, dst),
        SampleFormat::S16_336 => convert_336_s16(tracker, src, dst),
        SampleFormat::S16_384 => convert_384_s16(tracker, src, dst),
        SampleFormat::S16_504 => convert_504_s16(tracker, src, dst),
        SampleFormat::S8_504 => convert_504_s8(tracker, src, dst),
    }
}

/// 14-bit samples: 4 bytes hold 2 values.
pub fn convert_252_s16(tracker: &mut AddressTracker, src: &[u8], dst: &mut [u8]) -> Conversion {
    convert_blocks(tracker, src, dst, SampleFormat::S16_252, unpack_252)
}

/// 12-bit samples: 3 bytes hold 2 nibble-interleaved values.
pub fn convert_336_s16(tracker: &mut AddressTracker, src: &[u8], dst: &mut [u8]) -> Conversion {
    convert_blocks(tracker, src, dst, SampleFormat::S16_336, unpack_336)
}

/// 10-bit samples with a per-group 2-bit scale selector.
pub fn convert_384_s16(tracker: &mut AddressTracker, src: &[u8], dst: &mut [u8]) -> Conversion {
    convert_blocks(tracker, src, dst, SampleFormat::S16_384, unpack_384)
}

/// 8-bit samples widened into the high byte of an `i16`.
pub fn convert_504_s16(tracker: &mut AddressTracker, src: &[u8], dst: &mut [u8]) -> Conversion {
    convert_blocks(tracker, src, dst, SampleFormat::S16_504, unpack_504)
}

/// 8-bit samples copied verbatim.
///
/// Unlike the 16-bit formats, only the leading header of the buffer is
/// checked; the address then advances by 504 for every block copied.
pub fn convert_504_s8(tracker: &mut AddressTracker, src: &[u8], dst: &mut [u8]) -> Conversion {
    if src.len() < BLOCK_SIZE {
        return Conversion::default();
    }

    let lost = tracker.check(read_address(src), src.len());
    let step = SampleFormat::S8_504.samples_per_block();

    let mut bytes = 0;
    for block in src.chunks_exact(BLOCK_SIZE) {
        dst[bytes..bytes + BLOCK_PAYLOAD_SIZE].copy_from_slice(&block[BLOCK_HEADER_SIZE..]);
        bytes += BLOCK_PAYLOAD_SIZE;
        tracker.expected = tracker.expected.wrapping_add(step);
    }

    Conversion { bytes, lost }
}

/// Shared block walk of the 16-bit formats.
fn convert_blocks(
    tracker: &mut AddressTracker,
    src: &[u8],
    dst: &mut [u8],
    format: SampleFormat,
    unpack: fn(&[u8], &mut [u8]),
) -> Conversion {
    let out_len = format.decoded_block_len();
    let mut lost = None;
    let mut last_address = None;
    let mut bytes = 0;

    for (i, block) in src.chunks_exact(BLOCK_SIZE).enumerate() {
        let address = read_address(block);
        if i == 0 {
            lost = tracker.check(address, src.len());
        }

        unpack(&block[BLOCK_HEADER_SIZE..], &mut dst[bytes..bytes + out_len]);
        bytes += out_len;
        last_address = Some(address);
    }

    if let Some(address) = last_address {
        tracker.expected = address.wrapping_add(format.samples_per_block());
    }

    Conversion { bytes, lost }
}

fn read_address(block: &[u8]) -> u32 {
    u32::from_le_bytes([block[0], block[1], block[2], block[3]])
}

#[inline]
fn put(dst: &mut [u8], index: usize, value: i16) {
    dst[2 * index..2 * index + 2].copy_from_slice(&value.to_ne_bytes());
}

fn unpack_252(payload: &[u8], dst: &mut [u8]) {
    for (n, quad) in payload.chunks_exact(4).enumerate() {
        put(dst, 2 * n, ((quad[0] as u16) << 2 | (quad[1] as u16) << 10) as i16);
        put(dst, 2 * n + 1, ((quad[2] as u16) << 2 | (quad[3] as u16) << 10) as i16);
    }
}

fn unpack_336(payload: &[u8], dst: &mut [u8]) {
    for (n, triple) in payload.chunks_exact(3).enumerate() {
        let a = (triple[0] as u16) << 4 | ((triple[1] & 0x0f) as u16) << 12;
        let b = (triple[1] & 0xf0) as u16 | (triple[2] as u16) << 8;
        put(dst, 2 * n, a as i16);
        put(dst, 2 * n + 1, b as i16);
    }
}

fn unpack_384(payload: &[u8], dst: &mut [u8]) {
    let subblocks = payload
        .chunks_exact(SUBBLOCK_DATA_SIZE + 4)
        .take(SUBBLOCKS_PER_BLOCK);

    let mut index = 0;
    for subblock in subblocks {
        let (data, shift) = subblock.split_at(SUBBLOCK_DATA_SIZE);
        let shift = u32::from_le_bytes([shift[0], shift[1], shift[2], shift[3]]);

        for (k, s) in data.chunks_exact(10).enumerate() {
            let group = [
                (s[0] as u16) << 6 | ((s[1] & 0x03) as u16) << 14,
                ((s[1] & 0xfc) as u16) << 4 | ((s[2] & 0x0f) as u16) << 12,
                ((s[2] & 0xf0) as u16) << 2 | ((s[3] & 0x3f) as u16) << 10,
                (s[3] & 0xc0) as u16 | (s[4] as u16) << 8,
                (s[5] as u16) << 6 | ((s[6] & 0x03) as u16) << 14,
                ((s[6] & 0xfc) as u16) << 4 | ((s[7] & 0x0f) as u16) << 12,
                ((s[7] & 0xf0) as u16) << 2 | ((s[8] & 0x3f) as u16) << 10,
                (s[8] & 0xc0) as u16 | (s[9] as u16) << 8,
            ];

            // selector 2 and 3 both keep the full-range value
            let scale = match (shift >> (2 * k)) & 0x3 {
                0 => 2,
                1 => 1,
                _ => 0,
            };

            for value in group {
                put(dst, index, (value as i16) >> scale);
                index += 1;
            }
        }
    }
}

fn unpack_504(payload: &[u8], dst: &mut [u8]) {
    for (n, &byte) in payload.iter().enumerate() {
        put(dst, n, ((byte as u16) << 8) as i16);
    }
}
