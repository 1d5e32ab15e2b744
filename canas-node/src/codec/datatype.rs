//! CANaerospace data types and typed parameter values
//!
//! Every normal-operation frame declares one of these data types in byte 1 of
//! its payload. The data type fixes the payload size, so a frame whose DLC
//! disagrees with its declared type is malformed.

use super::DecodeError;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Data type codes as defined by the CANaerospace standard (v1.7)
///
/// Codes 0..=31 come from the standard. `Timespan` lives in the
/// user-defined range and carries a duration in milliseconds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    NoData = 0,
    Error = 1,
    Float = 2,
    Long = 3,
    ULong = 4,
    BLong = 5,
    Short = 6,
    UShort = 7,
    BShort = 8,
    Char = 9,
    UChar = 10,
    BChar = 11,
    Short2 = 12,
    UShort2 = 13,
    BShort2 = 14,
    Char4 = 15,
    UChar4 = 16,
    BChar4 = 17,
    Char2 = 18,
    UChar2 = 19,
    BChar2 = 20,
    MemId = 21,
    Chksum = 22,
    AChar = 23,
    AChar2 = 24,
    AChar4 = 25,
    Char3 = 26,
    UChar3 = 27,
    BChar3 = 28,
    AChar3 = 29,
    DoubleH = 30,
    DoubleL = 31,
    Timespan = 100,
}

impl DataType {
    /// Look up a data type from its wire code
    pub fn from_code(code: u8) -> Option<Self> {
        use DataType::*;
        let dt = match code {
            0 => NoData,
            1 => Error,
            2 => Float,
            3 => Long,
            4 => ULong,
            5 => BLong,
            6 => Short,
            7 => UShort,
            8 => BShort,
            9 => Char,
            10 => UChar,
            11 => BChar,
            12 => Short2,
            13 => UShort2,
            14 => BShort2,
            15 => Char4,
            16 => UChar4,
            17 => BChar4,
            18 => Char2,
            19 => UChar2,
            20 => BChar2,
            21 => MemId,
            22 => Chksum,
            23 => AChar,
            24 => AChar2,
            25 => AChar4,
            26 => Char3,
            27 => UChar3,
            28 => BChar3,
            29 => AChar3,
            30 => DoubleH,
            31 => DoubleL,
            100 => Timespan,
            _ => return None,
        };
        Some(dt)
    }

    /// Wire code of this data type
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Payload size in bytes (excluding the 4-byte CANaerospace header)
    pub fn size(self) -> usize {
        use DataType::*;
        match self {
            NoData => 0,
            Char | UChar | BChar | AChar => 1,
            Short | UShort | BShort | Char2 | UChar2 | BChar2 | AChar2 => 2,
            Char3 | UChar3 | BChar3 | AChar3 => 3,
            Error | Float | Long | ULong | BLong | Short2 | UShort2 | BShort2 | Char4
            | UChar4 | BChar4 | MemId | Chksum | AChar4 | DoubleH | DoubleL | Timespan => 4,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A decoded parameter value, one variant per data type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterValue {
    NoData,
    Error(u32),
    Float(f32),
    Long(i32),
    ULong(u32),
    BLong(u32),
    Short(i16),
    UShort(u16),
    BShort(u16),
    Char(i8),
    UChar(u8),
    BChar(u8),
    Short2([i16; 2]),
    UShort2([u16; 2]),
    BShort2([u16; 2]),
    Char4([i8; 4]),
    UChar4([u8; 4]),
    BChar4([u8; 4]),
    Char2([i8; 2]),
    UChar2([u8; 2]),
    BChar2([u8; 2]),
    MemId(u32),
    Chksum(u32),
    AChar(u8),
    AChar2([u8; 2]),
    AChar4([u8; 4]),
    Char3([i8; 3]),
    UChar3([u8; 3]),
    BChar3([u8; 3]),
    AChar3([u8; 3]),
    DoubleH(u32),
    DoubleL(u32),
    /// Duration in milliseconds
    Timespan(u32),
}

impl ParameterValue {
    /// The data type this value is transmitted as
    pub fn datatype(&self) -> DataType {
        use ParameterValue as V;
        match self {
            V::NoData => DataType::NoData,
            V::Error(_) => DataType::Error,
            V::Float(_) => DataType::Float,
            V::Long(_) => DataType::Long,
            V::ULong(_) => DataType::ULong,
            V::BLong(_) => DataType::BLong,
            V::Short(_) => DataType::Short,
            V::UShort(_) => DataType::UShort,
            V::BShort(_) => DataType::BShort,
            V::Char(_) => DataType::Char,
            V::UChar(_) => DataType::UChar,
            V::BChar(_) => DataType::BChar,
            V::Short2(_) => DataType::Short2,
            V::UShort2(_) => DataType::UShort2,
            V::BShort2(_) => DataType::BShort2,
            V::Char4(_) => DataType::Char4,
            V::UChar4(_) => DataType::UChar4,
            V::BChar4(_) => DataType::BChar4,
            V::Char2(_) => DataType::Char2,
            V::UChar2(_) => DataType::UChar2,
            V::BChar2(_) => DataType::BChar2,
            V::MemId(_) => DataType::MemId,
            V::Chksum(_) => DataType::Chksum,
            V::AChar(_) => DataType::AChar,
            V::AChar2(_) => DataType::AChar2,
            V::AChar4(_) => DataType::AChar4,
            V::Char3(_) => DataType::Char3,
            V::UChar3(_) => DataType::UChar3,
            V::BChar3(_) => DataType::BChar3,
            V::AChar3(_) => DataType::AChar3,
            V::DoubleH(_) => DataType::DoubleH,
            V::DoubleL(_) => DataType::DoubleL,
            V::Timespan(_) => DataType::Timespan,
        }
    }

    /// Decode a big-endian payload of exactly `datatype.size()` bytes
    pub fn decode(datatype: DataType, bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != datatype.size() {
            return Err(DecodeError::LengthMismatch {
                datatype,
                expected: datatype.size(),
                actual: bytes.len(),
            });
        }

        use ParameterValue as V;
        let b = bytes;
        let value = match datatype {
            DataType::NoData => V::NoData,
            DataType::Error => V::Error(BigEndian::read_u32(b)),
            DataType::Float => V::Float(BigEndian::read_f32(b)),
            DataType::Long => V::Long(BigEndian::read_i32(b)),
            DataType::ULong => V::ULong(BigEndian::read_u32(b)),
            DataType::BLong => V::BLong(BigEndian::read_u32(b)),
            DataType::Short => V::Short(BigEndian::read_i16(b)),
            DataType::UShort => V::UShort(BigEndian::read_u16(b)),
            DataType::BShort => V::BShort(BigEndian::read_u16(b)),
            DataType::Char => V::Char(b[0] as i8),
            DataType::UChar => V::UChar(b[0]),
            DataType::BChar => V::BChar(b[0]),
            DataType::Short2 => V::Short2([BigEndian::read_i16(b), BigEndian::read_i16(&b[2..])]),
            DataType::UShort2 => {
                V::UShort2([BigEndian::read_u16(b), BigEndian::read_u16(&b[2..])])
            }
            DataType::BShort2 => {
                V::BShort2([BigEndian::read_u16(b), BigEndian::read_u16(&b[2..])])
            }
            DataType::Char4 => V::Char4([b[0] as i8, b[1] as i8, b[2] as i8, b[3] as i8]),
            DataType::UChar4 => V::UChar4([b[0], b[1], b[2], b[3]]),
            DataType::BChar4 => V::BChar4([b[0], b[1], b[2], b[3]]),
            DataType::Char2 => V::Char2([b[0] as i8, b[1] as i8]),
            DataType::UChar2 => V::UChar2([b[0], b[1]]),
            DataType::BChar2 => V::BChar2([b[0], b[1]]),
            DataType::MemId => V::MemId(BigEndian::read_u32(b)),
            DataType::Chksum => V::Chksum(BigEndian::read_u32(b)),
            DataType::AChar => V::AChar(b[0]),
            DataType::AChar2 => V::AChar2([b[0], b[1]]),
            DataType::AChar4 => V::AChar4([b[0], b[1], b[2], b[3]]),
            DataType::Char3 => V::Char3([b[0] as i8, b[1] as i8, b[2] as i8]),
            DataType::UChar3 => V::UChar3([b[0], b[1], b[2]]),
            DataType::BChar3 => V::BChar3([b[0], b[1], b[2]]),
            DataType::AChar3 => V::AChar3([b[0], b[1], b[2]]),
            DataType::DoubleH => V::DoubleH(BigEndian::read_u32(b)),
            DataType::DoubleL => V::DoubleL(BigEndian::read_u32(b)),
            DataType::Timespan => V::Timespan(BigEndian::read_u32(b)),
        };
        Ok(value)
    }

    /// Encode the value big-endian into `out`, returning the number of bytes written
    ///
    /// `out` must hold at least `self.datatype().size()` bytes.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        use ParameterValue as V;
        match *self {
            V::NoData => {}
            V::Error(v) | V::ULong(v) | V::BLong(v) | V::MemId(v) | V::Chksum(v)
            | V::DoubleH(v) | V::DoubleL(v) | V::Timespan(v) => BigEndian::write_u32(out, v),
            V::Float(v) => BigEndian::write_f32(out, v),
            V::Long(v) => BigEndian::write_i32(out, v),
            V::Short(v) => BigEndian::write_i16(out, v),
            V::UShort(v) | V::BShort(v) => BigEndian::write_u16(out, v),
            V::Char(v) => out[0] = v as u8,
            V::UChar(v) | V::BChar(v) | V::AChar(v) => out[0] = v,
            V::Short2([a, b]) => {
                BigEndian::write_i16(out, a);
                BigEndian::write_i16(&mut out[2..], b);
            }
            V::UShort2([a, b]) | V::BShort2([a, b]) => {
                BigEndian::write_u16(out, a);
                BigEndian::write_u16(&mut out[2..], b);
            }
            V::Char4(v) => {
                for (dst, src) in out.iter_mut().zip(v) {
                    *dst = src as u8;
                }
            }
            V::Char3(v) => {
                for (dst, src) in out.iter_mut().zip(v) {
                    *dst = src as u8;
                }
            }
            V::Char2(v) => {
                for (dst, src) in out.iter_mut().zip(v) {
                    *dst = src as u8;
                }
            }
            V::UChar4(v) | V::BChar4(v) | V::AChar4(v) => out[..4].copy_from_slice(&v),
            V::UChar3(v) | V::BChar3(v) | V::AChar3(v) => out[..3].copy_from_slice(&v),
            V::UChar2(v) | V::BChar2(v) | V::AChar2(v) => out[..2].copy_from_slice(&v),
        }
        self.datatype().size()
    }

    /// Build a scalar value of the given type from a number
    ///
    /// Used when values come from configuration files or the command line.
    /// Returns `None` for vector types or when the number does not fit.
    pub fn from_number(datatype: DataType, number: f64) -> Option<Self> {
        use ParameterValue as V;

        fn int<T: TryFrom<i64>>(n: f64) -> Option<T> {
            if n.fract() != 0.0 {
                return None;
            }
            T::try_from(n as i64).ok()
        }

        let value = match datatype {
            DataType::Float => V::Float(number as f32),
            DataType::Long => V::Long(int(number)?),
            DataType::ULong => V::ULong(int(number)?),
            DataType::BLong => V::BLong(int(number)?),
            DataType::Short => V::Short(int(number)?),
            DataType::UShort => V::UShort(int(number)?),
            DataType::BShort => V::BShort(int(number)?),
            DataType::Char => V::Char(int(number)?),
            DataType::UChar => V::UChar(int(number)?),
            DataType::BChar => V::BChar(int(number)?),
            DataType::MemId => V::MemId(int(number)?),
            DataType::Chksum => V::Chksum(int(number)?),
            DataType::Error => V::Error(int(number)?),
            DataType::Timespan => V::Timespan(int(number)?),
            _ => return None,
        };
        Some(value)
    }

    /// Convert a scalar value to f64 (None for vector and text types)
    pub fn as_f64(&self) -> Option<f64> {
        use ParameterValue as V;
        match *self {
            V::Float(v) => Some(v as f64),
            V::Long(v) => Some(v as f64),
            V::ULong(v) | V::BLong(v) | V::MemId(v) | V::Chksum(v) | V::Error(v)
            | V::Timespan(v) => Some(v as f64),
            V::Short(v) => Some(v as f64),
            V::UShort(v) | V::BShort(v) => Some(v as f64),
            V::Char(v) => Some(v as f64),
            V::UChar(v) | V::BChar(v) => Some(v as f64),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ParameterValue as V;
        match self {
            V::NoData => write!(f, "-"),
            V::Float(v) => write!(f, "{:.3}", v),
            V::Timespan(v) => write!(f, "{}ms", v),
            V::AChar(c) => write!(f, "{}", *c as char),
            V::AChar2(s) => write!(f, "{}", String::from_utf8_lossy(s)),
            V::AChar3(s) => write!(f, "{}", String::from_utf8_lossy(s)),
            V::AChar4(s) => write!(f, "{}", String::from_utf8_lossy(s)),
            other => match other.as_f64() {
                Some(n) => write!(f, "{}", n),
                None => write!(f, "{:?}", other),
            },
        }
    }
}
