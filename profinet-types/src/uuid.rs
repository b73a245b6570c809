// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! Contains the implementation of `PnUuid` and the DREP byte-order swap.

use std::{
    fmt,
    io::{Read, Write},
    str::FromStr,
};

use uuid::Uuid;

use crate::encoding::*;

/// The constant PNIO Device interface UUID, `DEA00001-6C97-11D1-8271-00A02442DF7D`.
///
/// Specified in canonical (big-endian sub-field) form; the RPC header codec swaps it at
/// encode time.
pub const PNIO_DEVICE_INTERFACE_UUID: PnUuid = PnUuid(Uuid::from_bytes([
    0xDE, 0xA0, 0x00, 0x01, 0x6C, 0x97, 0x11, 0xD1, 0x82, 0x71, 0x00, 0xA0, 0x24, 0x42, 0xDF,
    0x7D,
]));

/// A 16 byte universally unique identifier in canonical byte order.
///
/// UUIDs embedded in PNIO block payloads are written verbatim in this order. UUID fields in the
/// DCE/RPC header are little-endian in their first three sub-fields when DREP is 0x10; use
/// [`PnUuid::swap_drep`] at that boundary only.
#[derive(Eq, PartialEq, Clone, Copy, Hash)]
pub struct PnUuid(Uuid);

impl fmt::Display for PnUuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PnUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl BinaryEncodable for PnUuid {
    fn byte_len(&self) -> usize {
        16
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        process_encode_io_result(stream.write_all(self.0.as_bytes()))
    }
}

impl BinaryDecodable for PnUuid {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        let mut bytes = [0u8; 16];
        process_decode_io_result(stream.read_exact(&mut bytes))?;
        Ok(PnUuid(Uuid::from_bytes(bytes)))
    }
}

impl FromStr for PnUuid {
    type Err = <Uuid as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(PnUuid)
    }
}

impl From<Uuid> for PnUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for PnUuid {
    fn default() -> Self {
        PnUuid::null()
    }
}

impl PnUuid {
    /// Return the null UUID, i.e. 00000000-0000-0000-0000-000000000000.
    pub fn null() -> PnUuid {
        PnUuid(Uuid::nil())
    }

    /// Creates a random UUID.
    pub fn new() -> PnUuid {
        PnUuid(Uuid::new_v4())
    }

    /// Returns the bytes of the UUID in canonical order.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Creates a UUID from a byte array in canonical order.
    pub const fn from_bytes(bytes: [u8; 16]) -> PnUuid {
        PnUuid(Uuid::from_bytes(bytes))
    }

    /// `true` if this is the null UUID.
    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    /// Apply the DREP=0x10 byte-order swap: the time-low, time-mid and time-high sub-fields
    /// (bytes [0..4), [4..6) and [6..8)) are reversed, the node bytes are untouched.
    ///
    /// The swap is an involution, so the same call converts in either direction.
    pub fn swap_drep(&self) -> PnUuid {
        let src = self.0.as_bytes();
        let mut b = *src;
        b[0..4].reverse();
        b[4..6].reverse();
        b[6..8].reverse();
        PnUuid(Uuid::from_bytes(b))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn swap_drep_is_involution() {
        let uuids = [
            PnUuid::new(),
            PnUuid::null(),
            PNIO_DEVICE_INTERFACE_UUID,
            PnUuid::from_bytes([
                0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C,
                0x0D, 0x0E, 0x0F,
            ]),
        ];
        for uuid in uuids {
            assert_eq!(uuid.swap_drep().swap_drep(), uuid);
        }
    }

    #[test]
    fn swap_drep_wire_order() {
        // The AR UUID 0123abcd-4567-89ab-cdef-0123456789ab must appear on the wire as
        // cd ab 23 01 67 45 ab 89 cd ef 01 23 45 67 89 ab.
        let uuid = PnUuid::from_str("0123abcd-4567-89ab-cdef-0123456789ab").unwrap();
        let swapped = uuid.swap_drep();
        assert_eq!(
            swapped.as_bytes(),
            &[
                0xCD, 0xAB, 0x23, 0x01, 0x67, 0x45, 0xAB, 0x89, 0xCD, 0xEF, 0x01, 0x23, 0x45,
                0x67, 0x89, 0xAB
            ]
        );
    }

    #[test]
    fn block_encoding_is_not_swapped() {
        let uuid = PnUuid::from_str("0123abcd-4567-89ab-cdef-0123456789ab").unwrap();
        let bytes = uuid.encode_to_vec();
        assert_eq!(
            bytes,
            vec![
                0x01, 0x23, 0xAB, 0xCD, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x45,
                0x67, 0x89, 0xAB
            ]
        );
        let decoded = PnUuid::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, uuid);
    }
}
