//! Variable-length integer encoding utilities.
//!
//! LEB128-style unsigned varints plus zigzag-mapped signed values. Used by
//! the FTGS stream codec for terms, group deltas and stat values.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{FtgsError, Result};

/// Encode a u64 value using variable-length encoding.
///
/// Uses 7 bits per byte with a continuation bit, allowing efficient
/// encoding of small numbers.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Decode a u64 value from variable-length encoding.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;
    let mut bytes_read = 0;

    for &byte in bytes {
        bytes_read += 1;

        if shift >= 64 {
            return Err(FtgsError::codec("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, bytes_read));
        }

        shift += 7;
    }

    Err(FtgsError::codec("Incomplete VarInt"))
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 64 {
            return Err(FtgsError::codec("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

/// Map a signed value onto the unsigned range so small magnitudes stay short.
#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Write a zigzag varint encoded i64 to a writer.
pub fn write_i64<W: Write>(writer: &mut W, value: i64) -> Result<usize> {
    write_u64(writer, zigzag_encode(value))
}

/// Read a zigzag varint encoded i64 from a reader.
pub fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    Ok(zigzag_decode(read_u64(reader)?))
}
