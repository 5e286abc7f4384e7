//! Represent CA DBR representations, for data interchange.
//!
//! CA defines thirty-five [DBR] kinds as special structures used to transfer data back
//! and forth. These can be broken down into seven basic array types, which define the
//! data, and five categories of attached metadata. This module models this, and
//! provides tools for handling generic data, converting between data types, and
//! serialization/deserialization for communication over CA.
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`] - all numeric data types in CA are signed, most can represent arrays.
//! The options, and the native type used to represent, are:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`] by encoding) which is a special case - it represents an
//!   index into up to sixteen 26-byte string labels, carried by the graphics and
//!   control categories as [`DbrGraphics::Enum`].
//! - [`DbrValue::String`] - natively in CA this is a `[u8; 40]`, but for interchange
//!   here is represented by [`Vec<String>`], and is converted back and forth to
//!   fixed-length as required for communication.
//!
//! The protocol also defines `SHORT` as an alias for `INT` - this is ignored here to
//! avoid excessive confusion.
//!
//! In CA, these seven data types can be sent with five kinds of metadata attached.
//! These are enumerated by [`DbrCategory`] and represented by [`Dbr`]. The five
//! categories are:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Carries information about alarm status and severity in addition
//!   to the data.
//! - [`Dbr::Time`] - All of the information from [`Dbr::Status`], but with associated
//!   timestamp information.
//! - [`Dbr::Graphics`] - Units, display precision and display/alarm/warning limits, or
//!   the state labels for enums.
//! - [`Dbr::Control`] - Everything in [`Dbr::Graphics`], plus the control limits.
//!
//! In addition, [`Dbr::ClassName`] returns the EPICS record type for the PV.
//!
//! Both [`DbrCategory`] and [`DbrBasicType`] are combined in the [`DbrType`] struct,
//! which provides interfaces to convert to/from the integer representation of types
//! used by the CA protocol, and knows the byte layout of each of them.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
//!
use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::NumCast;
use std::{
    cmp,
    convert::TryFrom,
    fmt::Debug,
    io::{self, Cursor},
    num::NonZeroUsize,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

use crate::messages::ErrorCondition;

// Constants from EPICS
const MAX_STRING_SIZE: usize = 40;
const MAX_UNITS_SIZE: usize = 8;
const MAX_ENUM_STRING_SIZE: usize = 26;
const MAX_ENUM_STATES: usize = 16;
/// Seconds between the UNIX epoch and the EPICS epoch of 1990-01-01
pub const EPICS_EPOCH_OFFSET: u64 = 631152000;
/// Enum values in the graphics and control categories always sit here, however
/// many labels are actually in use
pub const ENUM_VALUE_OFFSET: usize = 4 + 2 + MAX_ENUM_STATES * MAX_ENUM_STRING_SIZE;

/// Encode a String to a fixed-maximum-length byte array
///
/// Problem: We want to convert a string to a byte sequence but never a length >
/// 40 (the fixed length of EPICS CA Strings). But we can't convert and truncate
/// because although we don't _expect_ to ever handle non-ASCII it technically
/// isn't guaranteed. So, convert one-character-at-a-time until the length would
/// go over.
fn string_to_fixed_length_bytes(value: &str, max_length: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(max_length);
    for c in value.chars() {
        if buffer.len() + c.len_utf8() < max_length {
            let mut char_buffer = [0u8; 4];
            buffer.extend_from_slice(c.encode_utf8(&mut char_buffer).as_bytes());
        } else {
            break;
        }
    }
    buffer
}

/// Null-terminated, fixed width string slot
fn fixed_string(width: usize) -> impl Fn(&[u8]) -> IResult<&[u8], String> {
    move |input| {
        let (input, raw) = take(width).parse(input)?;
        let strlen = raw.iter().position(|&c| c == 0x00).unwrap_or(width);
        Ok((input, String::from_utf8_lossy(&raw[..strlen]).into_owned()))
    }
}

fn write_fixed_string<W: io::Write>(writer: &mut W, value: &str, width: usize) -> io::Result<()> {
    let mut buf = string_to_fixed_length_bytes(value, width);
    buf.resize(width, 0u8);
    writer.write_all(&buf)
}

/// Errors decoding a DBR payload
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload of {available} bytes is too short for {count} elements of {data_type:?} (needs {needed})")]
    PayloadTooShort {
        data_type: DbrType,
        count: usize,
        needed: usize,
        available: usize,
    },
    #[error("Unknown DBR type code {0}")]
    UnknownType(u16),
    #[error("Malformed DBR payload")]
    Malformed,
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for DecodeError {
    fn from(_: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        DecodeError::Malformed
    }
}

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}
/// Error returned when trying to resize a DBR but it's a data type that can't
#[derive(Debug)]
pub struct DbrValueIsEnumError;

/// Types of errors that can be returned from [`DbrValue::parse_into`]
#[derive(Debug)]
pub enum DbrParseError {
    SelfIsNotString,
    CannotParse(String),
}

impl DbrValue {
    pub fn get_default_record_type(&self) -> String {
        match self {
            DbrValue::Enum(_) => "mbbi".to_string(),
            DbrValue::String(_) => "stringin".to_string(),
            DbrValue::Char(_) => "waveform".to_string(),
            DbrValue::Int(_) => "longin".to_string(),
            DbrValue::Long(_) => "longin".to_string(),
            DbrValue::Float(_) => "ai".to_string(),
            DbrValue::Double(_) => "ai".to_string(),
        }
    }
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the DbrValue is not String or if the value cannot be parsed. Asking
    /// for a convertion from String->String just copies without doing any extra parsing.
    pub fn parse_into(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrParseError> {
        fn _parse_all<T: FromStr>(val: &[String]) -> Result<Vec<T>, DbrParseError> {
            val.iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(s.clone()))
                })
                .collect()
        }
        let DbrValue::String(val) = self else {
            return Err(DbrParseError::SelfIsNotString);
        };
        Ok(match basic_type {
            DbrBasicType::Enum => match val.as_slice() {
                [single] => DbrValue::Enum(
                    single
                        .trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(single.clone()))?,
                ),
                _ => return Err(DbrParseError::CannotParse(val.join(" "))),
            },
            DbrBasicType::String => self.clone(),
            DbrBasicType::Char => DbrValue::Char(_parse_all(val)?),
            DbrBasicType::Int => DbrValue::Int(_parse_all(val)?),
            DbrBasicType::Long => DbrValue::Long(_parse_all(val)?),
            DbrBasicType::Float => DbrValue::Float(_parse_all(val)?),
            DbrBasicType::Double => DbrValue::Double(_parse_all(val)?),
        })
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array
        fn _encode_string<T>(from: &[String]) -> Result<Vec<T>, ErrorCondition>
        where
            T: Copy + NumCast,
        {
            match from {
                [] => Ok(Vec::new()),
                [val] => val
                    .as_bytes()
                    .iter()
                    .map(|c| NumCast::from(*c).ok_or(ErrorCondition::NoConvert))
                    .collect(),
                _ => Err(ErrorCondition::NoConvert),
            }
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Char(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Int(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Long(vec![*val as i32]),
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Float(vec![*val as f32]),
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Double(vec![*val as f64]),
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => {
                    let bytes: Vec<u8> = val
                        .iter()
                        .map(|c| *c as u8)
                        .take_while(|c| *c != 0)
                        .collect();
                    DbrValue::String(vec![
                        String::from_utf8(bytes).map_err(|_| ErrorCondition::NoConvert)?,
                    ])
                }
                DbrValue::Int(val) => DbrValue::String(val.iter().map(|v| v.to_string()).collect()),
                DbrValue::Long(val) => {
                    DbrValue::String(val.iter().map(|v| v.to_string()).collect())
                }
                DbrValue::Float(val) => {
                    DbrValue::String(val.iter().map(|v| v.to_string()).collect())
                }
                DbrValue::Double(val) => {
                    DbrValue::String(val.iter().map(|v| v.to_string()).collect())
                }
                DbrValue::Enum(val) => DbrValue::String(vec![val.to_string()]),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                DbrValue::Char(_) | DbrValue::Int(_) | DbrValue::Long(_) => {
                    match self.convert_to(DbrBasicType::Long)? {
                        DbrValue::Long(v) if v.len() == 1 => DbrValue::Enum(
                            NumCast::from(v[0]).ok_or(ErrorCondition::NoConvert)?,
                        ),
                        _ => return Err(ErrorCondition::NoConvert),
                    }
                }
                _ => return Err(ErrorCondition::NoConvert),
            },
        })
    }

    /// Encode the value contents of a DBR into a byte vector
    ///
    /// If max_elems is `None`, then all elements available will be returned.
    ///
    /// Returns the number of elements along with the bytes
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let elements = if let Some(max_elem) = max_elems {
            cmp::min(max_elem.into(), self.get_count())
        } else {
            self.get_count()
        };

        (
            elements,
            match self {
                DbrValue::Enum(val) => val.to_be_bytes().to_vec(),
                DbrValue::String(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| {
                        let mut buf = string_to_fixed_length_bytes(v, MAX_STRING_SIZE);
                        buf.resize(MAX_STRING_SIZE, 0u8);
                        buf
                    })
                    .collect(),
                DbrValue::Char(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Int(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Long(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Float(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Double(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
            },
        )
    }

    /// Read `item_count` elements of `data_type` from the start of `data`
    pub fn decode_value(
        data_type: DbrBasicType,
        item_count: usize,
        data: &[u8],
    ) -> Result<DbrValue, nom::Err<nom::error::Error<&[u8]>>> {
        match data_type {
            // Enum arrays are not a thing in practice; only the first is meaningful
            DbrBasicType::Enum => Ok(DbrValue::Enum(be_u16.parse(data)?.1)),
            DbrBasicType::String => Ok(DbrValue::String(
                count(fixed_string(MAX_STRING_SIZE), item_count)
                    .parse(data)?
                    .1,
            )),
            DbrBasicType::Char => Ok(DbrValue::Char(count(be_i8, item_count).parse(data)?.1)),
            DbrBasicType::Int => Ok(DbrValue::Int(count(be_i16, item_count).parse(data)?.1)),
            DbrBasicType::Long => Ok(DbrValue::Long(count(be_i32, item_count).parse(data)?.1)),
            DbrBasicType::Float => Ok(DbrValue::Float(count(be_f32, item_count).parse(data)?.1)),
            DbrBasicType::Double => Ok(DbrValue::Double(count(be_f64, item_count).parse(data)?.1)),
        }
    }

    pub fn resize(&mut self, to_size: usize) -> Result<(), DbrValueIsEnumError> {
        match self {
            DbrValue::Enum(_) => Err(DbrValueIsEnumError)?,
            DbrValue::String(items) => items.resize(to_size, String::new()),
            DbrValue::Char(items) => items.resize(to_size, 0),
            DbrValue::Int(items) => items.resize(to_size, 0),
            DbrValue::Long(items) => items.resize(to_size, 0),
            DbrValue::Float(items) => items.resize(to_size, 0.0),
            DbrValue::Double(items) => items.resize(to_size, 0.0),
        };
        Ok(())
    }

    /// First element, widened to a double. Strings and empty arrays have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DbrValue::Enum(v) => Some(*v as f64),
            DbrValue::String(_) => None,
            DbrValue::Char(v) => v.first().map(|x| *x as f64),
            DbrValue::Int(v) => v.first().map(|x| *x as f64),
            DbrValue::Long(v) => v.first().map(|x| *x as f64),
            DbrValue::Float(v) => v.first().map(|x| *x as f64),
            DbrValue::Double(v) => v.first().copied(),
        }
    }
}

/// Implement a From<datatype> for a specific dbrvalue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<&$typ> for DbrValue {
            fn from(value: &$typ) -> Self {
                DbrValue::$variant(vec![value.clone()])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => Err(ErrorCondition::NoConvert),
                }
            }
        }
        impl TryFrom<&DbrValue> for $typ {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Vec::<$typ>::try_from(value)?
                    .into_iter()
                    .next()
                    .ok_or(ErrorCondition::NoConvert)
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

macro_rules! impl_dbrvalue_copy_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
    };
}
impl_dbrvalue_copy_conversions_between!(Char, i8);
impl_dbrvalue_copy_conversions_between!(Int, i16);
impl_dbrvalue_copy_conversions_between!(Long, i32);
impl_dbrvalue_copy_conversions_between!(Float, f32);
impl_dbrvalue_copy_conversions_between!(Double, f64);
impl_dbrvalue_copy_conversions_between!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_owned()])
    }
}

impl From<&DbrValue> for DbrValue {
    fn from(value: &DbrValue) -> Self {
        value.clone()
    }
}

/// Display, alarm and warning ranges, each as `(lower, upper)`
///
/// Limits travel in the native width of the channel type; they are widened to
/// [`f64`] here so that every numeric type shares one representation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Limits {
    pub display: (f64, f64),
    pub alarm: (f64, f64),
    pub warning: (f64, f64),
}

impl Limits {
    /// Wire order: upper_disp, lower_disp, upper_alarm, upper_warning, lower_warning, lower_alarm
    fn wire_order(&self) -> [f64; 6] {
        [
            self.display.1,
            self.display.0,
            self.alarm.1,
            self.warning.1,
            self.warning.0,
            self.alarm.0,
        ]
    }
    fn from_wire_order(v: &[f64]) -> Self {
        Limits {
            display: (v[1], v[0]),
            alarm: (v[5], v[2]),
            warning: (v[4], v[3]),
        }
    }
}

/// Metadata attached by the graphics and control categories
#[derive(Clone, Debug, PartialEq)]
pub enum DbrGraphics {
    /// Strings carry no display metadata
    String,
    Enum {
        labels: Vec<String>,
    },
    Numeric {
        units: String,
        /// Only present on the wire for float and double types
        precision: Option<i16>,
        limits: Limits,
    },
}

impl DbrGraphics {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum { labels: Vec::new() },
            DbrBasicType::Float | DbrBasicType::Double => DbrGraphics::Numeric {
                units: String::new(),
                precision: Some(0),
                limits: Limits::default(),
            },
            DbrBasicType::Char | DbrBasicType::Int | DbrBasicType::Long => DbrGraphics::Numeric {
                units: String::new(),
                precision: None,
                limits: Limits::default(),
            },
        }
    }

    /// Reshape this metadata to suit a different basic type, keeping what still applies
    fn adapt_to(&self, kind: DbrBasicType) -> Self {
        match (self, DbrGraphics::default_for(kind)) {
            (DbrGraphics::Enum { labels }, DbrGraphics::Enum { .. }) => DbrGraphics::Enum {
                labels: labels.clone(),
            },
            (
                DbrGraphics::Numeric {
                    units,
                    precision,
                    limits,
                },
                DbrGraphics::Numeric {
                    precision: default_precision,
                    ..
                },
            ) => DbrGraphics::Numeric {
                units: units.clone(),
                precision: default_precision.map(|d| precision.unwrap_or(d)),
                limits: limits.clone(),
            },
            (_, default) => default,
        }
    }
}

/// Upper and lower control limits, `(lower, upper)`
pub type ControlLimits = (f64, f64);

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}
impl TryFrom<u16> for DbrBasicType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::String as u16 => Ok(Self::String),
            x if x == Self::Int as u16 => Ok(Self::Int),
            x if x == Self::Float as u16 => Ok(Self::Float),
            x if x == Self::Enum as u16 => Ok(Self::Enum),
            x if x == Self::Char as u16 => Ok(Self::Char),
            x if x == Self::Long as u16 => Ok(Self::Long),
            x if x == Self::Double as u16 => Ok(Self::Double),
            _ => Err(()),
        }
    }
}

impl DbrBasicType {
    /// Size on the wire of a single element
    pub fn element_size(&self) -> usize {
        match self {
            DbrBasicType::String => MAX_STRING_SIZE,
            DbrBasicType::Int => 2,
            DbrBasicType::Float => 4,
            DbrBasicType::Enum => 2,
            DbrBasicType::Char => 1,
            DbrBasicType::Long => 4,
            DbrBasicType::Double => 8,
        }
    }
}

/// Marks a type as being convertible to a DBRValue representation
pub trait IntoDbrBasicType {
    fn get_dbr_basic_type() -> DbrBasicType;
}

macro_rules! impl_into_dbr_basic_type {
    ($t:ty, $variant:ident) => {
        impl IntoDbrBasicType for $t {
            fn get_dbr_basic_type() -> DbrBasicType {
                DbrBasicType::$variant
            }
        }
    };
}

impl_into_dbr_basic_type!(i8, Char);
impl_into_dbr_basic_type!(i16, Int);
impl_into_dbr_basic_type!(i32, Long);
impl_into_dbr_basic_type!(f32, Float);
impl_into_dbr_basic_type!(f64, Double);
impl_into_dbr_basic_type!(String, String);

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
    /// The special single-valued DBR_CLASS_NAME
    ClassName = 8,
}
impl TryFrom<u16> for DbrCategory {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Basic as u16 => Ok(Self::Basic),
            x if x == Self::Status as u16 => Ok(Self::Status),
            x if x == Self::Time as u16 => Ok(Self::Time),
            x if x == Self::Graphics as u16 => Ok(Self::Graphics),
            x if x == Self::Control as u16 => Ok(Self::Control),
            _ => Err(()),
        }
    }
}

/// Represent and translate from ID every possible combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

pub const DBR_BASIC_STRING: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::Basic,
};

pub const DBR_CLASS_NAME: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::ClassName,
};

impl TryFrom<u16> for DbrType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            38 => Ok(DBR_CLASS_NAME),
            value if value < 35 => Ok(Self {
                basic_type: (value % 7).try_into()?,
                category: (value / 7).try_into()?,
            }),
            _ => Err(()),
        }
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        match value {
            DBR_CLASS_NAME => 38,
            value => value.category as u16 * 7 + value.basic_type as u16,
        }
    }
}

impl DbrType {
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }

    /// Give the lookup for the padding for each DBR type
    ///
    /// When encoding a return packet, there is a datatype-specific
    /// padding to be inserted between the metadata about the value and
    /// the actual value itself. This is given as a lookup table rather
    /// than a calculations.
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn get_metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Char) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Int) => 2,
            (DbrCategory::Time, DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Char) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            (DbrCategory::Graphics, DbrBasicType::Char) => 1,
            (DbrCategory::Control, DbrBasicType::Char) => 1,
            _ => 0,
        }
    }

    /// Number of limit fields carried by this type
    fn limit_count(&self) -> usize {
        match self.category {
            DbrCategory::Graphics => 6,
            DbrCategory::Control => 8,
            _ => 0,
        }
    }

    /// Byte offset of the first value element, from the start of the payload
    pub fn value_offset(&self) -> usize {
        let metadata = match self.category {
            DbrCategory::Basic | DbrCategory::ClassName => 0,
            DbrCategory::Status => 4,
            DbrCategory::Time => 12,
            DbrCategory::Graphics | DbrCategory::Control => match self.basic_type {
                DbrBasicType::String => 4,
                DbrBasicType::Enum => return ENUM_VALUE_OFFSET,
                basic => {
                    let precision = match basic {
                        DbrBasicType::Float | DbrBasicType::Double => 4,
                        _ => 0,
                    };
                    4 + precision + MAX_UNITS_SIZE + self.limit_count() * basic.element_size()
                }
            },
        };
        metadata + self.get_metadata_padding()
    }

    /// Minimum payload size needed to hold `count` elements of this type
    pub fn payload_size(&self, count: usize) -> usize {
        self.value_offset() + count.max(1) * self.basic_type.element_size()
    }
}

impl FromStr for DbrType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let mut s: &str = &upper;
        if let Some(stripped) = s.strip_prefix("DBR_") {
            s = stripped;
        };
        let category = if let Some((cats, rest)) = s.split_once('_') {
            s = rest;
            match cats {
                "BASIC" => DbrCategory::Basic,
                "STS" => DbrCategory::Status,
                "TIME" => DbrCategory::Time,
                "GR" => DbrCategory::Graphics,
                "CTRL" => DbrCategory::Control,
                "CLASS" => DbrCategory::ClassName,
                _ => return Err(()),
            }
        } else {
            DbrCategory::Basic
        };
        let kind = match s {
            "STRING" => DbrBasicType::String,
            "INT" => DbrBasicType::Int,
            "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            "NAME" if category == DbrCategory::ClassName => DbrBasicType::String,
            _ => return Err(()),
        };
        if matches!(category, DbrCategory::ClassName) && !matches!(kind, DbrBasicType::String) {
            // Class name is _only_ CLASS_NAME
            return Err(());
        }
        Ok(DbrType {
            basic_type: kind,
            category,
        })
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    Graphics {
        status: Status,
        graphics: DbrGraphics,
        value: DbrValue,
    },
    Control {
        status: Status,
        graphics: DbrGraphics,
        control: ControlLimits,
        value: DbrValue,
    },
    ClassName(DbrValue),
}

fn read_limits(
    basic_type: DbrBasicType,
    n: usize,
    input: &[u8],
) -> IResult<&[u8], Vec<f64>> {
    match basic_type {
        DbrBasicType::Char => count(be_i8.map(|v| v as f64), n).parse(input),
        DbrBasicType::Int => count(be_i16.map(|v| v as f64), n).parse(input),
        DbrBasicType::Long => count(be_i32.map(|v| v as f64), n).parse(input),
        DbrBasicType::Float => count(be_f32.map(|v| v as f64), n).parse(input),
        DbrBasicType::Double => count(be_f64, n).parse(input),
        DbrBasicType::String | DbrBasicType::Enum => Ok((input, Vec::new())),
    }
}

fn write_limit<W: io::Write>(
    writer: &mut W,
    basic_type: DbrBasicType,
    value: f64,
) -> io::Result<()> {
    // `as` saturates, which is what we want when narrowing limits
    match basic_type {
        DbrBasicType::Char => writer.write_all(&(value as i8).to_be_bytes()),
        DbrBasicType::Int => writer.write_all(&(value as i16).to_be_bytes()),
        DbrBasicType::Long => writer.write_all(&(value as i32).to_be_bytes()),
        DbrBasicType::Float => writer.write_all(&(value as f32).to_be_bytes()),
        DbrBasicType::Double => writer.write_all(&value.to_be_bytes()),
        DbrBasicType::String | DbrBasicType::Enum => Ok(()),
    }
}

/// Read the graphics metadata block that follows status/severity
fn read_graphics(
    data_type: DbrType,
    input: &[u8],
) -> IResult<&[u8], (DbrGraphics, ControlLimits)> {
    match data_type.basic_type {
        DbrBasicType::String => Ok((input, (DbrGraphics::String, (0.0, 0.0)))),
        DbrBasicType::Enum => {
            let (input, no_str) = be_u16(input)?;
            let (input, labels) =
                count(fixed_string(MAX_ENUM_STRING_SIZE), MAX_ENUM_STATES).parse(input)?;
            let labels = labels
                .into_iter()
                .take((no_str as usize).min(MAX_ENUM_STATES))
                .collect();
            Ok((input, (DbrGraphics::Enum { labels }, (0.0, 0.0))))
        }
        basic => {
            let (input, precision) = match basic {
                DbrBasicType::Float | DbrBasicType::Double => {
                    let (input, (precision, _pad)) = (be_i16, be_i16).parse(input)?;
                    (input, Some(precision))
                }
                _ => (input, None),
            };
            let (input, units) = fixed_string(MAX_UNITS_SIZE)(input)?;
            let (input, limits) = read_limits(basic, data_type.limit_count(), input)?;
            let control = if limits.len() == 8 {
                (limits[7], limits[6])
            } else {
                (0.0, 0.0)
            };
            Ok((
                input,
                (
                    DbrGraphics::Numeric {
                        units,
                        precision,
                        limits: Limits::from_wire_order(&limits[..6]),
                    },
                    control,
                ),
            ))
        }
    }
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
            Dbr::ClassName(value) => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
            Dbr::ClassName(value) => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
            Dbr::ClassName(_) => None,
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn graphics(&self) -> Option<&DbrGraphics> {
        match self {
            Dbr::Graphics { graphics, .. } => Some(graphics),
            Dbr::Control { graphics, .. } => Some(graphics),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let basic_type = self.value().get_type();
        match self {
            Dbr::Basic(_) => DbrType::new(basic_type, DbrCategory::Basic),
            Dbr::Status { .. } => DbrType::new(basic_type, DbrCategory::Status),
            Dbr::Time { .. } => DbrType::new(basic_type, DbrCategory::Time),
            Dbr::Graphics { .. } => DbrType::new(basic_type, DbrCategory::Graphics),
            Dbr::Control { .. } => DbrType::new(basic_type, DbrCategory::Control),
            Dbr::ClassName(_) => DBR_CLASS_NAME,
        }
    }

    /// Decode a payload of `data_count` elements laid out as `data_type`
    ///
    /// The payload length is checked against the layout before anything is
    /// read, so a short payload is reported rather than partially decoded.
    pub fn from_bytes(
        data_type: DbrType,
        data_count: usize,
        data: &[u8],
    ) -> Result<Dbr, DecodeError> {
        let needed = data_type.value_offset() + data_count * data_type.basic_type.element_size();
        if data.len() < needed {
            return Err(DecodeError::PayloadTooShort {
                data_type,
                count: data_count,
                needed,
                available: data.len(),
            });
        }

        let (rest, status) = match data_type.category {
            DbrCategory::Basic | DbrCategory::ClassName => (data, None),
            _ => {
                let (d, (status, severity)) = (be_i16, be_i16).parse(data)?;
                (d, Some(Status { status, severity }))
            }
        };
        let status = status.unwrap_or_default();
        let value_bytes = &data[data_type.value_offset()..];
        let value = DbrValue::decode_value(data_type.basic_type, data_count, value_bytes)?;

        Ok(match data_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::ClassName => Dbr::ClassName(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => {
                let (_, (time_s, time_ns)) = (be_u32, be_u32).parse(rest)?;
                let timestamp = UNIX_EPOCH
                    .checked_add(Duration::new(time_s as u64 + EPICS_EPOCH_OFFSET, time_ns))
                    .ok_or(DecodeError::Malformed)?;
                Dbr::Time {
                    status,
                    timestamp,
                    value,
                }
            }
            DbrCategory::Graphics => {
                let (_, (graphics, _)) = read_graphics(data_type, rest)?;
                Dbr::Graphics {
                    status,
                    graphics,
                    value,
                }
            }
            DbrCategory::Control => {
                let (_, (graphics, control)) = read_graphics(data_type, rest)?;
                Dbr::Control {
                    status,
                    graphics,
                    control,
                    value,
                }
            }
        })
    }

    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let mut buffer = Cursor::new(Vec::new());
        // Writing into a Vec cannot fail
        let real_count = self.write_be(&mut buffer, max_elems).unwrap_or_default();
        (real_count, buffer.into_inner())
    }

    fn write_graphics<W: io::Write>(
        writer: &mut W,
        data_type: DbrType,
        graphics: &DbrGraphics,
        control: Option<ControlLimits>,
    ) -> io::Result<()> {
        let graphics = graphics.adapt_to(data_type.basic_type);
        match graphics {
            DbrGraphics::String => Ok(()),
            DbrGraphics::Enum { labels } => {
                writer.write_all(&(labels.len().min(MAX_ENUM_STATES) as u16).to_be_bytes())?;
                for i in 0..MAX_ENUM_STATES {
                    let label = labels.get(i).map(String::as_str).unwrap_or("");
                    write_fixed_string(writer, label, MAX_ENUM_STRING_SIZE)?;
                }
                Ok(())
            }
            DbrGraphics::Numeric {
                units,
                precision,
                limits,
            } => {
                if let Some(precision) = precision {
                    writer.write_all(&precision.to_be_bytes())?;
                    writer.write_all(&[0u8; 2])?;
                }
                write_fixed_string(writer, &units, MAX_UNITS_SIZE)?;
                for limit in limits.wire_order() {
                    write_limit(writer, data_type.basic_type, limit)?;
                }
                if let Some((lower, upper)) = control {
                    write_limit(writer, data_type.basic_type, upper)?;
                    write_limit(writer, data_type.basic_type, lower)?;
                }
                Ok(())
            }
        }
    }

    /// Write a requested number of elements to a stream
    ///
    /// Return the actual number of elements written
    pub fn write_be<W: io::Write>(
        &self,
        writer: &mut W,
        max_elems: Option<NonZeroUsize>,
    ) -> io::Result<usize> {
        let (real_elems, data) = self.value().to_bytes(max_elems);
        let data_type = self.data_type();
        // All except Basic write status/severity
        if let Some(status) = self.status() {
            writer.write_all(&status.status.to_be_bytes())?;
            writer.write_all(&status.severity.to_be_bytes())?;
        }
        match self {
            Dbr::Time { timestamp, .. } => {
                let unix_time = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
                let time_s = unix_time.as_secs().saturating_sub(EPICS_EPOCH_OFFSET) as u32;
                let time_ns = unix_time.subsec_nanos();
                writer.write_all(&time_s.to_be_bytes())?;
                writer.write_all(&time_ns.to_be_bytes())?;
            }
            Dbr::Graphics { graphics, .. } => {
                Self::write_graphics(writer, data_type, graphics, None)?;
            }
            Dbr::Control {
                graphics, control, ..
            } => {
                Self::write_graphics(writer, data_type, graphics, Some(*control))?;
            }
            _ => (),
        }

        writer.write_all(&vec![0u8; data_type.get_metadata_padding()])?;
        writer.write_all(&data)?;
        Ok(real_elems)
    }

    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, ErrorCondition> {
        let value = self.value().convert_to(dbr_type.basic_type)?;
        if matches!(self, Dbr::ClassName(_)) || dbr_type.category == DbrCategory::ClassName {
            // ClassName cannot be converted as it isn't a normal form of data
            return match (self, dbr_type.category) {
                (Dbr::ClassName(_), DbrCategory::ClassName) => Ok(Dbr::ClassName(value)),
                _ => Err(ErrorCondition::NoConvert),
            };
        }
        let status = self.status().unwrap_or_default();
        let graphics = self
            .graphics()
            .map(|g| g.adapt_to(dbr_type.basic_type))
            .unwrap_or_else(|| DbrGraphics::default_for(dbr_type.basic_type));
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: self.timestamp().unwrap_or_else(SystemTime::now),
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics,
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics,
                control: match self {
                    Dbr::Control { control, .. } => *control,
                    _ => (0.0, 0.0),
                },
                value,
            },
            DbrCategory::ClassName => return Err(ErrorCondition::NoConvert),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::vec;

    use super::*;

    #[test]
    fn single_or_vec() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert!(v.convert_to(DbrBasicType::Char).is_err());
        assert_eq!(v.to_bytes(None).1, vec![0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap().to_bytes(None).1,
            vec![0x01, 0xF4]
        );

        let data = vec![500.23f32, 12.7f32];
        let v: DbrValue = data.clone().into();
        assert_eq!(v.get_count(), 2);
        assert_eq!(
            v.to_bytes(NonZeroUsize::new(1)).1,
            data.iter()
                .take(1)
                .flat_map(|v| v.to_be_bytes())
                .collect::<Vec<u8>>()
        );
        // Try converting this to an int with truncation
        let v = v.convert_to(DbrBasicType::Int).unwrap();
        assert_eq!(v.to_bytes(None).1, vec![0x01, 0xf4, 0x00, 0x0c]);
    }

    #[test]
    fn scalar_extraction() {
        let v = DbrValue::Double(vec![2.5, 7.0]);
        assert_eq!(f64::try_from(&v).unwrap(), 2.5);
        assert_eq!(i32::try_from(&v).unwrap(), 2);
        assert_eq!(Vec::<f32>::try_from(&v).unwrap(), vec![2.5f32, 7.0]);
        assert!(i16::try_from(&DbrValue::Long(vec![])).is_err());
        let s: DbrValue = "hello".into();
        assert_eq!(String::try_from(&s).unwrap(), "hello");
        assert_eq!(
            String::try_from(&DbrValue::Long(vec![42])).unwrap(),
            "42".to_string()
        );
    }

    #[test]
    fn encode_dbr() {
        let example_packet = [
            0x0, 0x0, 0x0, 0x0, 0x42, 0x32, 0x19, 0x99, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x2a,
        ];
        let dbr = Dbr::Time {
            status: Status::default(),
            timestamp: SystemTime::UNIX_EPOCH
                .checked_add(Duration::from_secs(1741731609))
                .unwrap(),
            value: vec![42i32].into(),
        };

        let (_size, out_data) = dbr
            .convert_to(DbrType::new(DbrBasicType::Long, DbrCategory::Time))
            .unwrap()
            .to_bytes(None);
        assert_eq!(out_data, example_packet);

        let decoded = Dbr::from_bytes(
            DbrType::new(DbrBasicType::Long, DbrCategory::Time),
            1,
            &example_packet,
        )
        .unwrap();
        assert_eq!(decoded, dbr);
    }

    #[test]
    fn time_padding_alignment() {
        // Same status, severity and stamp prefix for both
        let mut prefix = vec![0x00, 0x03, 0x00, 0x02];
        prefix.extend(1000u32.to_be_bytes());
        prefix.extend(5u32.to_be_bytes());

        let time_short = DbrType::new(DbrBasicType::Int, DbrCategory::Time);
        let time_char = DbrType::new(DbrBasicType::Char, DbrCategory::Time);
        assert_eq!(time_char.value_offset(), time_short.value_offset() + 1);

        // Put a marker byte 0x11 at offset 14 and 0x22 at offset 15
        let mut payload = prefix.clone();
        payload.extend([0x00, 0x00, 0x11, 0x22]);
        let Dbr::Time { value, status, .. } = Dbr::from_bytes(time_short, 1, &payload).unwrap()
        else {
            panic!("Expected time category");
        };
        assert_eq!(value, DbrValue::Int(vec![0x1122]));
        assert_eq!(
            status,
            Status {
                status: 3,
                severity: 2
            }
        );
        let Dbr::Time { value, .. } = Dbr::from_bytes(time_char, 1, &payload).unwrap() else {
            panic!("Expected time category");
        };
        assert_eq!(value, DbrValue::Char(vec![0x22]));
    }

    #[test]
    fn status_double_padding() {
        let dbr = Dbr::Status {
            status: Status {
                status: 1,
                severity: 1,
            },
            value: DbrValue::Double(vec![1.5]),
        };
        let (_, bytes) = dbr.to_bytes(None);
        assert_eq!(bytes.len(), 4 + 4 + 8);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(
            Dbr::from_bytes(dbr.data_type(), 1, &bytes).unwrap(),
            dbr
        );
    }

    #[test]
    fn graphics_double_layout() {
        let dbr = Dbr::Graphics {
            status: Status::default(),
            graphics: DbrGraphics::Numeric {
                units: "mm".to_string(),
                precision: Some(3),
                limits: Limits {
                    display: (-10.0, 10.0),
                    alarm: (-8.0, 8.0),
                    warning: (-5.0, 5.0),
                },
            },
            value: DbrValue::Double(vec![4.25]),
        };
        let (_, bytes) = dbr.to_bytes(None);
        let data_type = DbrType::new(DbrBasicType::Double, DbrCategory::Graphics);
        assert_eq!(data_type.value_offset(), 64);
        assert_eq!(bytes.len(), 72);
        // precision right after status/severity
        assert_eq!(&bytes[4..6], &[0, 3]);
        assert_eq!(&bytes[8..10], b"mm");
        // upper display limit is the first limit
        assert_eq!(&bytes[16..24], &10.0f64.to_be_bytes());
        assert_eq!(Dbr::from_bytes(data_type, 1, &bytes).unwrap(), dbr);
    }

    #[test]
    fn control_limits_are_widened() {
        let dbr = Dbr::Control {
            status: Status::default(),
            graphics: DbrGraphics::Numeric {
                units: "V".to_string(),
                precision: None,
                limits: Limits {
                    display: (-100.0, 100.0),
                    alarm: (-90.0, 90.0),
                    warning: (-50.0, 50.0),
                },
            },
            control: (-20.0, 20.0),
            value: DbrValue::Int(vec![12]),
        };
        let data_type = DbrType::new(DbrBasicType::Int, DbrCategory::Control);
        let (_, bytes) = dbr.to_bytes(None);
        assert_eq!(bytes.len(), data_type.value_offset() + 2);
        assert_eq!(Dbr::from_bytes(data_type, 1, &bytes).unwrap(), dbr);

        let char_type = DbrType::new(DbrBasicType::Char, DbrCategory::Control);
        assert_eq!(char_type.value_offset(), 21);
    }

    #[test]
    fn enum_value_at_fixed_offset() {
        let dbr = Dbr::Graphics {
            status: Status::default(),
            graphics: DbrGraphics::Enum {
                labels: vec!["Off".to_string(), "On".to_string()],
            },
            value: DbrValue::Enum(1),
        };
        let (_, bytes) = dbr.to_bytes(None);
        assert_eq!(bytes.len(), 424);
        assert_eq!(&bytes[422..424], &[0, 1]);
        let data_type = DbrType::new(DbrBasicType::Enum, DbrCategory::Graphics);
        assert_eq!(data_type.value_offset(), ENUM_VALUE_OFFSET);
        assert_eq!(Dbr::from_bytes(data_type, 1, &bytes).unwrap(), dbr);

        // The value offset does not move with the label count
        let mut single = bytes.clone();
        single[4..6].copy_from_slice(&1u16.to_be_bytes());
        let Dbr::Graphics {
            graphics, value, ..
        } = Dbr::from_bytes(data_type, 1, &single).unwrap()
        else {
            panic!("Expected graphics");
        };
        assert_eq!(value, DbrValue::Enum(1));
        assert_eq!(
            graphics,
            DbrGraphics::Enum {
                labels: vec!["Off".to_string()]
            }
        );
    }

    #[test]
    fn short_payload_is_reported() {
        let data_type = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        let result = Dbr::from_bytes(data_type, 4, &[0u8; 20]);
        assert!(matches!(
            result,
            Err(DecodeError::PayloadTooShort {
                needed: 48,
                available: 20,
                ..
            })
        ));
    }

    #[test]
    fn test_string_to_char() {
        let test_string = "a test string".to_string();
        let s = DbrValue::String(vec![test_string.clone()]);
        let as_char = s.convert_to(DbrBasicType::Char).unwrap();
        let re_s = as_char.convert_to(DbrBasicType::String).unwrap();

        assert_eq!(s, re_s);
    }

    #[test]
    fn strings_are_null_terminated() {
        let v = DbrValue::String(vec!["abc".to_string(), "de".to_string()]);
        let (count, bytes) = v.to_bytes(None);
        assert_eq!(count, 2);
        assert_eq!(bytes.len(), 80);
        assert_eq!(
            DbrValue::decode_value(DbrBasicType::String, 2, &bytes).unwrap(),
            v
        );
    }

    #[test]
    fn test_dbr_string_conversions() {
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Status),
            "DBR_STS_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Time),
            "TIME_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Graphics),
            "DBR_GR_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Control),
            "DBR_CTRL_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::String, DbrCategory::Graphics),
            "GR_STRING".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "SHORT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Double, DbrCategory::Basic),
            "DOUBLE".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::String, DbrCategory::ClassName),
            "DBR_CLASS_NAME".parse().unwrap()
        );
        assert!("DBR_CLASS_INT".parse::<DbrType>().is_err());
    }

    #[test]
    fn type_codes() {
        assert_eq!(
            DbrType::try_from(24u16),
            Ok(DbrType::new(DbrBasicType::Enum, DbrCategory::Graphics))
        );
        let code: u16 = DbrType::new(DbrBasicType::Double, DbrCategory::Control).into();
        assert_eq!(code, 34);
        assert_eq!(DbrType::try_from(38u16), Ok(DBR_CLASS_NAME));
        assert!(DbrType::try_from(35u16).is_err());
    }
}
