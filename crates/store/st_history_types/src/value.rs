use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};

use crate::codec::{CodecError, CodecResult};

// ---

/// The maximum encoded length of a [`StateValue::String`] or
/// [`StateValue::Custom`] payload, in bytes.
pub const MAX_VALUE_LEN: usize = 32_767;

const TYPE_INT32: u8 = 0x00;
const TYPE_STRING: u8 = 0x01;
const TYPE_INT64: u8 = 0x02;
const TYPE_FLOAT64: u8 = 0x03;
const TYPE_CUSTOM: u8 = 0x14;
const TYPE_NULL: u8 = 0xFF;

/// The value an attribute holds over one interval.
///
/// `Null` is a real value: it means the attribute was explicitly unset, as
/// opposed to "no information", which is the absence of an interval.
#[derive(Clone, Debug, PartialEq)]
pub enum StateValue {
    Null,
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Custom(Vec<u8>),
}

impl StateValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The encoded size of this value, including its type byte.
    pub fn encoded_size(&self) -> usize {
        1 + match self {
            Self::Null => 0,
            Self::Int32(_) => 4,
            Self::Int64(_) | Self::Float64(_) => 8,
            Self::String(s) => 2 + s.len() + 1, // u16 length, bytes, trailing NUL
            Self::Custom(bytes) => 2 + bytes.len(),
        }
    }

    pub fn encode(&self, write: &mut impl Write) -> CodecResult<()> {
        match self {
            Self::Null => write.write_u8(TYPE_NULL)?,
            Self::Int32(v) => {
                write.write_u8(TYPE_INT32)?;
                write.write_i32::<LittleEndian>(*v)?;
            }
            Self::Int64(v) => {
                write.write_u8(TYPE_INT64)?;
                write.write_i64::<LittleEndian>(*v)?;
            }
            Self::Float64(v) => {
                write.write_u8(TYPE_FLOAT64)?;
                write.write_f64::<LittleEndian>(*v)?;
            }
            Self::String(s) => {
                check_len(s.len())?;
                write.write_u8(TYPE_STRING)?;
                write.write_u16::<LittleEndian>(s.len() as u16)?;
                write.write_all(s.as_bytes())?;
                write.write_u8(0x00)?;
            }
            Self::Custom(bytes) => {
                check_len(bytes.len())?;
                write.write_u8(TYPE_CUSTOM)?;
                write.write_u16::<LittleEndian>(bytes.len() as u16)?;
                write.write_all(bytes)?;
            }
        }
        Ok(())
    }

    pub fn decode(read: &mut impl Read) -> CodecResult<Self> {
        let typ = read.read_u8()?;
        match typ {
            TYPE_NULL => Ok(Self::Null),
            TYPE_INT32 => Ok(Self::Int32(read.read_i32::<LittleEndian>()?)),
            TYPE_INT64 => Ok(Self::Int64(read.read_i64::<LittleEndian>()?)),
            TYPE_FLOAT64 => Ok(Self::Float64(read.read_f64::<LittleEndian>()?)),
            TYPE_STRING => {
                let len = read.read_u16::<LittleEndian>()? as usize;
                let mut bytes = vec![0_u8; len];
                read.read_exact(&mut bytes)?;
                if read.read_u8()? != 0x00 {
                    return Err(CodecError::MissingStringTerminator);
                }
                Ok(Self::String(String::from_utf8(bytes)?))
            }
            TYPE_CUSTOM => {
                let len = read.read_u16::<LittleEndian>()? as usize;
                let mut bytes = vec![0_u8; len];
                read.read_exact(&mut bytes)?;
                Ok(Self::Custom(bytes))
            }
            unknown => Err(CodecError::UnknownValueType(unknown)),
        }
    }
}

fn check_len(len: usize) -> CodecResult<()> {
    if len > MAX_VALUE_LEN {
        Err(CodecError::ValueTooLong {
            got: len,
            max: MAX_VALUE_LEN,
        })
    } else {
        Ok(())
    }
}

impl From<i32> for StateValue {
    #[inline]
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for StateValue {
    #[inline]
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for StateValue {
    #[inline]
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for StateValue {
    #[inline]
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Custom(bytes) => write!(f, "<{} custom bytes>", bytes.len()),
        }
    }
}

// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &StateValue) -> StateValue {
        let mut bytes = vec![];
        value.encode(&mut bytes).unwrap();
        assert_eq!(bytes.len(), value.encoded_size());
        StateValue::decode(&mut bytes.as_slice()).unwrap()
    }

    #[test]
    fn value_roundtrips() {
        let values = [
            StateValue::Null,
            StateValue::Int32(-1),
            StateValue::Int32(i32::MAX),
            StateValue::Int64(i64::MIN),
            StateValue::Float64(std::f64::consts::PI),
            StateValue::String(String::new()),
            StateValue::String("running".to_owned()),
            StateValue::String("héllo wörld".to_owned()),
            StateValue::Custom(vec![]),
            StateValue::Custom(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        ];

        for value in &values {
            similar_asserts::assert_eq!(&roundtrip(value), value);
        }
    }

    #[test]
    fn value_too_long() {
        let long = StateValue::String("x".repeat(MAX_VALUE_LEN + 1));
        let mut bytes = vec![];
        assert!(matches!(
            long.encode(&mut bytes),
            Err(CodecError::ValueTooLong { .. })
        ));

        // The cap itself is fine.
        let just_fits = StateValue::Custom(vec![0_u8; MAX_VALUE_LEN]);
        assert_eq!(roundtrip(&just_fits), just_fits);
    }

    #[test]
    fn unknown_type_byte() {
        let bytes = [0x42_u8];
        assert!(matches!(
            StateValue::decode(&mut bytes.as_slice()),
            Err(CodecError::UnknownValueType(0x42))
        ));
    }

    #[test]
    fn missing_string_terminator() {
        let mut bytes = vec![];
        StateValue::String("ok".to_owned())
            .encode(&mut bytes)
            .unwrap();
        *bytes.last_mut().unwrap() = 0x01; // clobber the NUL
        assert!(matches!(
            StateValue::decode(&mut bytes.as_slice()),
            Err(CodecError::MissingStringTerminator)
        ));
    }
}
