//! Wire sample formats and USB transfer geometry.
//!
//! The MSi2500 bridge streams fixed 1024-byte blocks. Every block starts with a
//! 4-byte little-endian running sample address followed by 12 reserved bytes;
//! the remaining 1008 bytes carry packed samples whose layout depends on the
//! selected [`SampleFormat`].

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Size of one wire block in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Bytes preceding the payload of a block (address + reserved).
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Payload bytes per block for the 252, 336, 504 and 504/8-bit formats.
pub const BLOCK_PAYLOAD_SIZE: usize = 1008;

/// Size of one bulk transfer buffer.
pub const BULK_BUFFER_SIZE: usize = 16384;

/// Bytes per isochronous packet (three wire blocks).
pub const ISO_PACKET_SIZE: usize = 3 * BLOCK_SIZE;

/// Packets per isochronous transfer.
pub const ISO_PACKETS: usize = 8;

/// Default number of transfers kept in flight.
pub const DEFAULT_BUFFER_COUNT: usize = 32;

/// Sample layout on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// 14-bit samples, 504 values (252 I/Q pairs) per block.
    S16_252,
    /// 12-bit samples, 672 values (336 I/Q pairs) per block.
    S16_336,
    /// 10-bit samples with a 2-bit block shift, 768 values (384 I/Q pairs) per block.
    S16_384,
    /// 8-bit samples widened to 16 bits, 1008 values (504 I/Q pairs) per block.
    S16_504,
    /// 8-bit samples passed through, 1008 values (504 I/Q pairs) per block.
    S8_504,
}

impl SampleFormat {
    /// All formats, in wire order of increasing sample rate.
    pub const ALL: [SampleFormat; 5] = [
        SampleFormat::S16_252,
        SampleFormat::S16_336,
        SampleFormat::S16_384,
        SampleFormat::S16_504,
        SampleFormat::S8_504,
    ];

    /// I/Q pairs carried by one wire block; the running address advances by this much.
    pub fn samples_per_block(self) -> u32 {
        match self {
            SampleFormat::S16_252 => 252,
            SampleFormat::S16_336 => 336,
            SampleFormat::S16_384 => 384,
            SampleFormat::S16_504 | SampleFormat::S8_504 => 504,
        }
    }

    /// Bytes produced by decoding one wire block.
    pub fn decoded_block_len(self) -> usize {
        match self {
            SampleFormat::S8_504 => 2 * self.samples_per_block() as usize,
            _ => 2 * 2 * self.samples_per_block() as usize,
        }
    }

    /// Bytes produced by decoding `raw_len` wire bytes (complete blocks only).
    pub fn decoded_len(self, raw_len: usize) -> usize {
        (raw_len / BLOCK_SIZE) * self.decoded_block_len()
    }

    /// Bytes per decoded sample value.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S8_504 => 1,
            _ => 2,
        }
    }

    /// Effective ADC resolution.
    pub fn bits(self) -> u32 {
        match self {
            SampleFormat::S16_252 => 14,
            SampleFormat::S16_336 => 12,
            SampleFormat::S16_384 => 10,
            SampleFormat::S16_504 | SampleFormat::S8_504 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::S16_252 => "252",
            SampleFormat::S16_336 => "336",
            SampleFormat::S16_384 => "384",
            SampleFormat::S16_504 => "504",
            SampleFormat::S8_504 => "504_s8",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "252" | "252_s16" => Ok(SampleFormat::S16_252),
            "336" | "336_s16" => Ok(SampleFormat::S16_336),
            "384" | "384_s16" => Ok(SampleFormat::S16_384),
            "504" | "504_s16" => Ok(SampleFormat::S16_504),
            "504_s8" => Ok(SampleFormat::S8_504),
            other => Err(Error::UnsupportedConfiguration(format!(
                "unknown sample format '{}'",
                other
            ))),
        }
    }
}

/// USB transfer type used to pull samples off endpoint 0x81.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferKind {
    /// Bulk transfers, one flat 16 KiB buffer each.
    #[default]
    Bulk,
    /// Isochronous transfers, 8 packets of 3 KiB each.
    Isochronous,
}

impl TransferKind {
    /// Total buffer length of one transfer.
    pub fn buffer_len(self) -> usize {
        match self {
            TransferKind::Bulk => BULK_BUFFER_SIZE,
            TransferKind::Isochronous => ISO_PACKET_SIZE * ISO_PACKETS,
        }
    }

    /// Number of isochronous packets per transfer (zero for bulk).
    pub fn iso_packets(self) -> usize {
        match self {
            TransferKind::Bulk => 0,
            TransferKind::Isochronous => ISO_PACKETS,
        }
    }

    /// Interface 0 alternate setting that routes data to this transfer type.
    pub fn alt_setting(self) -> u8 {
        match self {
            TransferKind::Bulk => 3,
            TransferKind::Isochronous => 1,
        }
    }
}

impl FromStr for TransferKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bulk" | "2" => Ok(TransferKind::Bulk),
            "iso" | "isoc" | "isochronous" | "1" => Ok(TransferKind::Isochronous),
            other => Err(Error::UnsupportedConfiguration(format!(
                "unknown transfer kind '{}'",
                other
            ))),
        }
    }
}
