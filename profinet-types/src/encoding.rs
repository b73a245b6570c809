// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! Contains the `BinaryEncodable`/`BinaryDecodable` traits and helpers for reading and writing
//! scalar values and other primitives.
//!
//! PROFINET block payloads and cyclic frames are big-endian; the `_le` helper variants exist for
//! the DCE/RPC header fields, which are little-endian when DREP is 0x10.

use std::{
    error::Error as StdError,
    fmt::{Debug, Display},
    io::{Cursor, Read, Result, Write},
};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error as ThisError;

/// Result of an encoding or decoding operation.
pub type EncodingResult<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
/// Classification of a codec error.
pub enum ErrorKind {
    /// A block type discriminant was not one the decoder knows, or not the one the caller
    /// expected at this position.
    #[error("invalid block type")]
    InvalidBlockType,
    /// A length field disagrees with the bytes actually present.
    #[error("invalid length")]
    InvalidLength,
    /// A block version other than 1.0 was encountered.
    #[error("unsupported version")]
    UnsupportedVersion,
    /// A field value is outside its permitted range.
    #[error("field out of range")]
    FieldOutOfRange,
    /// The underlying stream failed, usually a short read.
    #[error("stream error")]
    Io,
}

#[derive(Debug)]
/// General codec error.
///
/// Carries the error classification, the byte offset where decoding failed when the caller
/// tracked one, and details about the error that caused this.
pub struct Error {
    kind: ErrorKind,
    offset: Option<usize>,
    context: Box<dyn StdError + Send + Sync>,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{} at offset {}: {}", self.kind, offset, self.context),
            None => write!(f, "{}: {}", self.kind, self.context),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.context)
    }
}

impl Error {
    /// Create a new error with the specified `kind` and `context` as a dynamic error source.
    pub fn new(kind: ErrorKind, context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            kind,
            offset: None,
            context: context.into(),
        }
    }

    /// Create a new `InvalidBlockType` error.
    pub fn invalid_block_type(context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(ErrorKind::InvalidBlockType, context)
    }

    /// Create a new `InvalidLength` error.
    pub fn invalid_length(context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(ErrorKind::InvalidLength, context)
    }

    /// Create a new `UnsupportedVersion` error.
    pub fn unsupported_version(context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(ErrorKind::UnsupportedVersion, context)
    }

    /// Create a new `FieldOutOfRange` error.
    pub fn field_out_of_range(context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(ErrorKind::FieldOutOfRange, context)
    }

    /// Attach the byte offset at which decoding failed.
    pub fn at_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Get the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the byte offset at which decoding failed, if the caller tracked one.
    pub fn offset(&self) -> Option<usize> {
        self.offset
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, value)
    }
}

/// PROFINET binary encoding interface. Anything that encodes to a block payload or frame must
/// implement this. It provides functions to calculate the size in bytes of the struct (for
/// allocating memory) and encoding to a stream.
///
/// # Implementing
///
/// The following _must_ be satisfied:
///
///  - `byte_len` must return a length exactly equal to what `encode` will write, or `encode`
///    must be guaranteed to fail.
///  - `encode` must use `write_all` on the stream, not just `write`, to ensure that all the data
///    is written, even if the stream is interrupted. Prefer calling `encode` on inner types
///    instead.
pub trait BinaryEncodable {
    /// Returns the exact byte length of the structure as it would be if `encode` were called.
    fn byte_len(&self) -> usize;

    /// Encodes the instance to the write stream.
    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()>;

    /// Convenience method for encoding straight into an array of bytes. It is preferable to
    /// reuse buffers than to call this so it should be reserved for tests and trivial code.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::with_capacity(self.byte_len()));
        let _ = self.encode(&mut buffer);
        buffer.into_inner()
    }
}

/// Trait for decoding a type from PROFINET binary.
///
/// Decoders are total: malformed input yields an [`Error`], never a panic.
pub trait BinaryDecodable: Sized {
    /// Decodes an instance from the read stream.
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self>;
}

/// Converts an IO encoding error into an EncodingResult
pub fn process_encode_io_result(result: Result<()>) -> EncodingResult<()> {
    result.map_err(Error::from)
}

/// Converts an IO decoding error into an EncodingResult
pub fn process_decode_io_result<T>(result: Result<T>) -> EncodingResult<T>
where
    T: Debug,
{
    result.map_err(Error::from)
}

/// Writes a series of identical bytes to the stream
pub fn write_bytes<W: Write + ?Sized>(
    stream: &mut W,
    value: u8,
    count: usize,
) -> EncodingResult<usize> {
    for _ in 0..count {
        let buf: [u8; 1] = [value];
        process_encode_io_result(stream.write_all(&buf))?;
    }
    Ok(count)
}

/// Writes an unsigned byte to the stream
pub fn write_u8<W: Write + ?Sized>(stream: &mut W, value: u8) -> EncodingResult<()> {
    let buf: [u8; 1] = [value];
    process_encode_io_result(stream.write_all(&buf))
}

/// Writes an unsigned 16-bit value to the stream, big-endian
pub fn write_u16<W: Write + ?Sized>(stream: &mut W, value: u16) -> EncodingResult<()> {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, value);
    process_encode_io_result(stream.write_all(&buf))
}

/// Writes an unsigned 32-bit value to the stream, big-endian
pub fn write_u32<W: Write + ?Sized>(stream: &mut W, value: u32) -> EncodingResult<()> {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    process_encode_io_result(stream.write_all(&buf))
}

/// Writes a 32-bit precision value to the stream, big-endian
pub fn write_f32<W: Write + ?Sized>(stream: &mut W, value: f32) -> EncodingResult<()> {
    let mut buf = [0u8; 4];
    BigEndian::write_f32(&mut buf, value);
    process_encode_io_result(stream.write_all(&buf))
}

/// Writes an unsigned 16-bit value to the stream, little-endian
pub fn write_u16_le<W: Write + ?Sized>(stream: &mut W, value: u16) -> EncodingResult<()> {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, value);
    process_encode_io_result(stream.write_all(&buf))
}

/// Writes an unsigned 32-bit value to the stream, little-endian
pub fn write_u32_le<W: Write + ?Sized>(stream: &mut W, value: u32) -> EncodingResult<()> {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    process_encode_io_result(stream.write_all(&buf))
}

/// Reads an array of bytes from the stream
pub fn read_bytes<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> EncodingResult<usize> {
    let result = stream.read_exact(buf);
    process_decode_io_result(result)?;
    Ok(buf.len())
}

/// Read an unsigned byte from the stream
pub fn read_u8<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u8> {
    let mut buf = [0u8];
    let result = stream.read_exact(&mut buf);
    process_decode_io_result(result)?;
    Ok(buf[0])
}

/// Read an unsigned 16-bit value from the stream, big-endian
pub fn read_u16<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u16> {
    let mut buf = [0u8; 2];
    let result = stream.read_exact(&mut buf);
    process_decode_io_result(result)?;
    Ok(BigEndian::read_u16(&buf))
}

/// Read an unsigned 32-bit value from the stream, big-endian
pub fn read_u32<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u32> {
    let mut buf = [0u8; 4];
    let result = stream.read_exact(&mut buf);
    process_decode_io_result(result)?;
    Ok(BigEndian::read_u32(&buf))
}

/// Read a 32-bit precision value from the stream, big-endian
pub fn read_f32<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<f32> {
    let mut buf = [0u8; 4];
    let result = stream.read_exact(&mut buf);
    process_decode_io_result(result)?;
    Ok(BigEndian::read_f32(&buf))
}

/// Read an unsigned 16-bit value from the stream, little-endian
pub fn read_u16_le<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u16> {
    let mut buf = [0u8; 2];
    let result = stream.read_exact(&mut buf);
    process_decode_io_result(result)?;
    Ok(LittleEndian::read_u16(&buf))
}

/// Read an unsigned 32-bit value from the stream, little-endian
pub fn read_u32_le<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u32> {
    let mut buf = [0u8; 4];
    let result = stream.read_exact(&mut buf);
    process_decode_io_result(result)?;
    Ok(LittleEndian::read_u32(&buf))
}

/// Skip `bytes` bytes in the stream.
pub fn skip_bytes<R: Read + ?Sized>(stream: &mut R, bytes: u64) -> EncodingResult<()> {
    std::io::copy(&mut stream.take(bytes), &mut std::io::sink())?;
    Ok(())
}
