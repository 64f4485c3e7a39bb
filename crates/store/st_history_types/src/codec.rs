//! The wire-level primitives shared by everything that touches a history
//! file: the varint encoding and the codec error taxonomy.
//!
//! All multi-byte integers in history files are little-endian; varints are
//! LEB128-style unsigned.

use std::io::{Read, Write};

// ----------------------------------------------------------------------------

/// On failure to encode or decode part of a history file.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Not a statetrace history file")]
    BadMagic,

    #[error("Unsupported history file version {0}")]
    UnsupportedVersion(u32),

    #[error("History file was written by provider version {got}, expected {expected}")]
    ProviderVersionMismatch { expected: u32, got: u32 },

    #[error("Unknown state value type 0x{0:02X}")]
    UnknownValueType(u8),

    #[error("String value is missing its trailing NUL byte")]
    MissingStringTerminator,

    #[error("String value is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Value of {got} bytes exceeds the {max} byte limit")]
    ValueTooLong { got: usize, max: usize },

    #[error("Varint runs past its maximum length")]
    VarintOverflow,

    #[error("Truncated tile payload")]
    TruncatedTile,

    #[error("Failed to read: {0}")]
    Read(#[from] std::io::Error),
}

pub type CodecResult<T> = ::std::result::Result<T, CodecError>;

// ----------------------------------------------------------------------------

/// Writes an LEB128-style unsigned varint: 7 bits per byte, high bit set on
/// every byte but the last.
pub fn write_varint_u64(write: &mut impl Write, mut value: u64) -> CodecResult<()> {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            write.write_all(&[byte])?;
            return Ok(());
        }
        write.write_all(&[byte | 0x80])?;
    }
}

/// Reads an LEB128-style unsigned varint.
///
/// A `u64` needs at most 10 bytes; an eleventh continuation byte means the
/// stream is corrupt.
pub fn read_varint_u64(read: &mut impl Read) -> CodecResult<u64> {
    let mut value = 0_u64;
    for shift in (0..64).step_by(7) {
        let mut byte = [0_u8; 1];
        read.read_exact(&mut byte)?;
        value |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::VarintOverflow)
}

/// The encoded length of `value` as a varint, in bytes.
#[inline]
pub fn varint_len(value: u64) -> usize {
    if value == 0 {
        1
    } else {
        (64 - value.leading_zeros() as usize).div_ceil(7)
    }
}

// ----------------------------------------------------------------------------
