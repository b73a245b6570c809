// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! Contains the 4-byte PNIOStatus error code returned by devices.

use std::{
    fmt,
    io::{Read, Write},
};

use crate::encoding::*;

/// Error code byte for connect-phase faults.
pub const ERROR_CODE_CONNECT: u8 = 0xDB;
/// Error code byte for record read faults.
pub const ERROR_CODE_READ: u8 = 0xDE;
/// Error code byte for record write faults.
pub const ERROR_CODE_WRITE: u8 = 0xDF;
/// Error decode byte for record read/write faults.
pub const ERROR_DECODE_PNIORW: u8 = 0x80;
/// Error decode byte for connection management faults.
pub const ERROR_DECODE_PNIO: u8 = 0x81;

/// The 4-byte PNIO status {ErrorCode, ErrorDecode, ErrorCode1, ErrorCode2}.
///
/// All four bytes zero means success; anything else is a fault whose meaning narrows from the
/// first byte to the last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PnioStatus {
    /// Broad fault family, e.g. 0xDB for connect faults.
    pub error_code: u8,
    /// Decode discriminator, e.g. 0x81 for PNIO CM faults.
    pub error_decode: u8,
    /// Fault group within the family.
    pub error_code_1: u8,
    /// Specific fault within the group.
    pub error_code_2: u8,
}

impl PnioStatus {
    /// The all-zero success status.
    pub const OK: PnioStatus = PnioStatus {
        error_code: 0,
        error_decode: 0,
        error_code_1: 0,
        error_code_2: 0,
    };

    /// `true` if this status signals success.
    pub fn is_ok(&self) -> bool {
        *self == Self::OK
    }

    /// Build a status from its big-endian u32 representation.
    pub fn from_u32(value: u32) -> Self {
        let b = value.to_be_bytes();
        PnioStatus {
            error_code: b[0],
            error_decode: b[1],
            error_code_1: b[2],
            error_code_2: b[3],
        }
    }

    /// The big-endian u32 representation of this status.
    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes([
            self.error_code,
            self.error_decode,
            self.error_code_1,
            self.error_code_2,
        ])
    }
}

impl fmt::Display for PnioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "OK")
        } else {
            write!(
                f,
                "{:#04X}/{:#04X}/{:#04X}/{:#04X}",
                self.error_code, self.error_decode, self.error_code_1, self.error_code_2
            )
        }
    }
}

impl BinaryEncodable for PnioStatus {
    fn byte_len(&self) -> usize {
        4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u32(stream, self.as_u32())
    }
}

impl BinaryDecodable for PnioStatus {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        Ok(PnioStatus::from_u32(read_u32(stream)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        let status = PnioStatus {
            error_code: 0xDB,
            error_decode: 0x81,
            error_code_1: 0x3D,
            error_code_2: 0x04,
        };
        let bytes = status.encode_to_vec();
        assert_eq!(bytes, vec![0xDB, 0x81, 0x3D, 0x04]);
        let decoded = PnioStatus::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, status);
        assert!(!decoded.is_ok());
    }

    #[test]
    fn ok_is_all_zero() {
        assert!(PnioStatus::from_u32(0).is_ok());
        assert_eq!(PnioStatus::OK.as_u32(), 0);
    }
}
