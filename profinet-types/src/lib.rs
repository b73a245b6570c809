// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! PROFINET IO wire types and block codec.
//!
//! This crate contains the value types shared by the whole stack and the codec for the PNIO
//! block families carried inside DCE/RPC payloads: AR, IOCR, AlarmCR, ExpectedSubmodule,
//! IODControl and the IODRead/IODWrite headers. It performs no I/O and knows nothing about
//! sessions; framing and transport live in `profinet-core`, orchestration in
//! `profinet-controller`.
//!
//! All multi-byte integers in block payloads are big-endian and UUIDs inside blocks are stored
//! in network byte order. The little-endian helpers and the DREP UUID swap exist solely for the
//! RPC header, which `profinet-core` encodes.

#![warn(missing_docs)]

mod encoding;
mod io;
mod status;
#[cfg(test)]
mod tests;
mod uuid;

pub mod blocks;
pub mod constants;

pub use crate::uuid::{PnUuid, PNIO_DEVICE_INTERFACE_UUID};
pub use encoding::{
    process_decode_io_result, process_encode_io_result, read_bytes, read_f32, read_u16,
    read_u16_le, read_u32, read_u32_le, read_u8, skip_bytes, write_bytes, write_f32, write_u16,
    write_u16_le, write_u32, write_u32_le, write_u8, BinaryDecodable, BinaryEncodable,
    EncodingResult, Error, ErrorKind,
};
pub use io::{ActuatorCommand, ActuatorOutput, Iops, Quality, SensorReading};
pub use status::{
    PnioStatus, ERROR_CODE_CONNECT, ERROR_CODE_READ, ERROR_CODE_WRITE, ERROR_DECODE_PNIO,
    ERROR_DECODE_PNIORW,
};
