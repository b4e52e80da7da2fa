//! Wire format for PMU frames.
//!
//! Every frame starts with a fixed 16-byte little-endian header, followed by
//! the file path and serial number (each zero-padded to a 4-byte boundary)
//! and finally the unpadded data payload:
//!
//! ```text
//! offset 0   u32  send_id
//! offset 4   u32  raw_file_path_len   (<= 512)
//! offset 8   u32  raw_serial_len      (<= 32)
//! offset 12  u32  raw_data_len        (<= 75 744 000)
//! offset 16  file path, padded to round_up4(raw_file_path_len)
//!            serial number, padded to round_up4(raw_serial_len)
//!            data, raw_data_len bytes
//! ```
//!
//! The receiver answers each frame with exactly 4 bytes: the echoed
//! `send_id` on success, or [`FAILURE_ACK`] when the frame could not be
//! persisted.

use byteorder::{ByteOrder, LittleEndian};
use serde::Deserialize;
use thiserror::Error;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 16;
/// Size of the acknowledgment written back for every frame.
pub const ACK_LEN: usize = 4;

pub const MAX_FILE_PATH_LEN: u32 = 512;
pub const MAX_SERIAL_LEN: u32 = 32;
/// Payload size of a nominal 120-second PMU file.
pub const EXPECTED_DATA_LEN: u32 = 757_440;
/// Hard ceiling on the payload (100x the expected size).
pub const MAX_DATA_LEN: u32 = 75_744_000;

/// Acknowledgment sent when persisting a frame fails.
///
/// Four zero bytes, kept for compatibility with deployed devices. It is
/// indistinguishable from a successful ack of `send_id == 0`.
pub const FAILURE_ACK: [u8; ACK_LEN] = [0; ACK_LEN];

/// Round `x` up to the next multiple of 4.
pub const fn round_up4(x: u32) -> u32 {
    x.wrapping_add(3) & !3
}

/// Per-field size limits enforced when a header is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FrameLimits {
    #[serde(default = "default_max_file_path_len")]
    pub max_file_path_len: u32,
    #[serde(default = "default_max_serial_len")]
    pub max_serial_len: u32,
    /// Size of the per-connection data buffer reused for ordinary frames.
    #[serde(default = "default_expected_data_len")]
    pub expected_data_len: u32,
    #[serde(default = "default_max_data_len")]
    pub max_data_len: u32,
}

fn default_max_file_path_len() -> u32 {
    MAX_FILE_PATH_LEN
}
fn default_max_serial_len() -> u32 {
    MAX_SERIAL_LEN
}
fn default_expected_data_len() -> u32 {
    EXPECTED_DATA_LEN
}
fn default_max_data_len() -> u32 {
    MAX_DATA_LEN
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_file_path_len: MAX_FILE_PATH_LEN,
            max_serial_len: MAX_SERIAL_LEN,
            expected_data_len: EXPECTED_DATA_LEN,
            max_data_len: MAX_DATA_LEN,
        }
    }
}

/// A header field that failed its sanity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    FilePath,
    SerialNumber,
    Data,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FilePath => "filepath",
            Self::SerialNumber => "serial number",
            Self::Data => "data",
        }
    }
}

/// Fatal protocol violations. The connection is dropped without a reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{} length fails sanity check: {len} (max {max})", .field.as_str())]
    LengthOutOfBounds { field: Field, len: u32, max: u32 },
}

/// The decoded fixed-size header of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// Opaque token echoed back on success.
    pub send_id: [u8; 4],
    pub file_path_len: u32,
    pub serial_len: u32,
    pub data_len: u32,
}

impl FrameHeader {
    /// Parse and validate a header against `limits`.
    pub fn parse(buf: &[u8; HEADER_LEN], limits: &FrameLimits) -> Result<Self, DecodeError> {
        let header = Self {
            send_id: [buf[0], buf[1], buf[2], buf[3]],
            file_path_len: LittleEndian::read_u32(&buf[4..8]),
            serial_len: LittleEndian::read_u32(&buf[8..12]),
            data_len: LittleEndian::read_u32(&buf[12..16]),
        };
        header.validate(limits)?;
        Ok(header)
    }

    fn validate(&self, limits: &FrameLimits) -> Result<(), DecodeError> {
        let checks = [
            (Field::FilePath, self.file_path_len, limits.max_file_path_len),
            (Field::SerialNumber, self.serial_len, limits.max_serial_len),
            (Field::Data, self.data_len, limits.max_data_len),
        ];
        for (field, len, max) in checks {
            if len > max {
                return Err(DecodeError::LengthOutOfBounds { field, len, max });
            }
        }
        Ok(())
    }

    pub fn padded_file_path_len(&self) -> u32 {
        round_up4(self.file_path_len)
    }

    pub fn padded_serial_len(&self) -> u32 {
        round_up4(self.serial_len)
    }
}

/// Serialize a frame the way a PMU sends it.
///
/// Used by the simulator and by tests acting as a device.
pub fn encode_frame(send_id: u32, file_path: &str, serial_number: &str, data: &[u8]) -> Vec<u8> {
    let fp_len = file_path.len() as u32;
    let sn_len = serial_number.len() as u32;
    let padded_fp = round_up4(fp_len) as usize;
    let padded_sn = round_up4(sn_len) as usize;

    let mut buf = vec![0u8; HEADER_LEN + padded_fp + padded_sn + data.len()];
    LittleEndian::write_u32(&mut buf[0..4], send_id);
    LittleEndian::write_u32(&mut buf[4..8], fp_len);
    LittleEndian::write_u32(&mut buf[8..12], sn_len);
    LittleEndian::write_u32(&mut buf[12..16], data.len() as u32);

    let mut pos = HEADER_LEN;
    buf[pos..pos + file_path.len()].copy_from_slice(file_path.as_bytes());
    pos += padded_fp;
    buf[pos..pos + serial_number.len()].copy_from_slice(serial_number.as_bytes());
    pos += padded_sn;
    buf[pos..].copy_from_slice(data);
    buf
}

/// Interpret an acknowledgment as the `send_id` it echoes.
pub fn ack_send_id(ack: &[u8; ACK_LEN]) -> u32 {
    LittleEndian::read_u32(ack)
}
