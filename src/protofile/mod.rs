//! Length-delimited framed record files.
//!
//! Every durable file in the store — the record log and the indexed store
//! files — is a sequence of framed protobuf records:
//!
//! ```text
//! magic:u16 = 0xDEAD | length:u32 | payload[length] | crc:u16
//! ```
//!
//! All integers are little-endian. The CRC is CRC-16/ARC of the payload.
//! Readers tolerate moderate corruption by scanning forward past bad frames;
//! a checksum mismatch is recorded and logged but the payload is still
//! delivered.

use crc::{Crc, CRC_16_ARC};

mod reader;
mod writer;

pub use reader::{ReadError, RecordReader};
pub use writer::{RecordWriter, WriteError};

/// Leading magic word of every framed record.
pub const RECORD_MAGIC: u16 = 0xDEAD;

/// Bytes of framing around each payload: magic + length up front, CRC after.
pub const FRAME_OVERHEAD: u64 = 2 + 4 + 2;

/// How many bad frames a reader will scan past before giving up.
pub const MAX_BAD_FRAMES: u32 = 30;

pub(crate) const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);
