// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! The 20-byte NDR argument prelude between RPC header and block payload.
//!
//! Devices silently drop calls missing this prelude, so the client inserts it on every request
//! and insists on it in every response.

use std::io::{Read, Write};

use profinet_types::{
    read_u32_le, write_u32_le, BinaryDecodable, BinaryEncodable, EncodingResult, Error,
};

/// Exact wire size of the NDR prelude.
pub const NDR_HEADER_LEN: usize = 20;

/// The NDR argument prelude: five little-endian u32 fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdrHeader {
    /// Largest argument buffer the peer may return. In responses the same wire position
    /// carries the PNIO status instead, zero for success.
    pub args_maximum: u32,
    /// Length of the argument bytes that follow.
    pub args_length: u32,
    /// Conformant array maximum, equal to `args_maximum` for a single call.
    pub maximum_count: u32,
    /// Conformant array offset, 0.
    pub offset: u32,
    /// Conformant array actual count, equal to `args_length`.
    pub actual_count: u32,
}

impl NdrHeader {
    /// Prelude for a request carrying `payload_len` argument bytes and accepting up to
    /// `args_maximum` bytes back.
    pub fn for_request(payload_len: usize, args_maximum: u32) -> NdrHeader {
        NdrHeader {
            args_maximum,
            args_length: payload_len as u32,
            maximum_count: args_maximum,
            offset: 0,
            actual_count: payload_len as u32,
        }
    }

    /// Prelude for a successful response carrying `payload_len` argument bytes; the first
    /// field doubles as the PNIO status and is zero here.
    pub fn for_response(payload_len: usize) -> NdrHeader {
        NdrHeader {
            args_maximum: 0,
            args_length: payload_len as u32,
            maximum_count: payload_len as u32,
            offset: 0,
            actual_count: payload_len as u32,
        }
    }
}

impl BinaryEncodable for NdrHeader {
    fn byte_len(&self) -> usize {
        NDR_HEADER_LEN
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u32_le(stream, self.args_maximum)?;
        write_u32_le(stream, self.args_length)?;
        write_u32_le(stream, self.maximum_count)?;
        write_u32_le(stream, self.offset)?;
        write_u32_le(stream, self.actual_count)
    }
}

impl BinaryDecodable for NdrHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        let header = NdrHeader {
            args_maximum: read_u32_le(stream)?,
            args_length: read_u32_le(stream)?,
            maximum_count: read_u32_le(stream)?,
            offset: read_u32_le(stream)?,
            actual_count: read_u32_le(stream)?,
        };
        if header.args_length != header.actual_count {
            return Err(Error::invalid_length(format!(
                "NDR args_length {} disagrees with actual_count {}",
                header.args_length, header.actual_count
            )));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_is_exactly_20_bytes() {
        let ndr = NdrHeader::for_request(100, 4096);
        let bytes = ndr.encode_to_vec();
        assert_eq!(bytes.len(), NDR_HEADER_LEN);
    }

    #[test]
    fn args_length_equals_payload_length() {
        let ndr = NdrHeader::for_request(77, 4096);
        assert_eq!(ndr.args_length, 77);
        assert_eq!(ndr.actual_count, 77);
        assert_eq!(ndr.args_maximum, 4096);
        assert_eq!(ndr.maximum_count, 4096);
        let decoded = NdrHeader::decode(&mut ndr.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, ndr);
    }

    #[test]
    fn disagreeing_counts_rejected() {
        let mut bytes = NdrHeader::for_request(8, 8).encode_to_vec();
        bytes[16] = 9;
        assert!(NdrHeader::decode(&mut bytes.as_slice()).is_err());
    }
}
