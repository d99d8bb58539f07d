//! Property value codec.
//!
//! Values travel as raw little-endian byte buffers; the data type is known
//! from the property descriptor, never from the buffer itself. Decoding
//! returns the raw device value: scaling to physical units is left to the
//! caller.

use crate::error::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Data type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertyType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
    Int64,
    String,
    Time,
    Version,
}

impl PropertyType {
    /// Returns the wire code used in RPDO requests.
    pub fn code(&self) -> u8 {
        match self {
            PropertyType::Bool => 0,
            PropertyType::Uint8 => 1,
            PropertyType::Uint16 => 2,
            PropertyType::Uint32 => 3,
            PropertyType::Int8 => 5,
            PropertyType::Int16 => 6,
            PropertyType::Int32 => 7,
            PropertyType::Int64 => 8,
            PropertyType::String => 9,
            PropertyType::Time => 10,
            PropertyType::Version => 11,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        Ok(match code {
            0 => PropertyType::Bool,
            1 => PropertyType::Uint8,
            2 => PropertyType::Uint16,
            3 => PropertyType::Uint32,
            5 => PropertyType::Int8,
            6 => PropertyType::Int16,
            7 => PropertyType::Int32,
            8 => PropertyType::Int64,
            9 => PropertyType::String,
            10 => PropertyType::Time,
            11 => PropertyType::Version,
            other => return Err(ProtocolError::UnknownPropertyType(other)),
        })
    }

    /// Fixed wire width in bytes, `None` for variable-length types.
    pub fn width(&self) -> Option<usize> {
        match self {
            PropertyType::Bool | PropertyType::Uint8 | PropertyType::Int8 => Some(1),
            PropertyType::Uint16 | PropertyType::Int16 => Some(2),
            PropertyType::Uint32 | PropertyType::Int32 | PropertyType::Time => Some(4),
            PropertyType::Int64 => Some(8),
            PropertyType::String | PropertyType::Version => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PropertyType::Bool => "BOOL",
            PropertyType::Uint8 => "UINT8",
            PropertyType::Uint16 => "UINT16",
            PropertyType::Uint32 => "UINT32",
            PropertyType::Int8 => "INT8",
            PropertyType::Int16 => "INT16",
            PropertyType::Int32 => "INT32",
            PropertyType::Int64 => "INT64",
            PropertyType::String => "STRING",
            PropertyType::Time => "TIME",
            PropertyType::Version => "VERSION",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Uint(u64),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PropertyValue {
    /// Returns the value as a float, if numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PropertyValue::Uint(v) => Some(*v as f64),
            PropertyValue::Int(v) => Some(*v as f64),
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            PropertyValue::Bool(b) => Some(i128::from(*b)),
            PropertyValue::Uint(v) => Some(i128::from(*v)),
            PropertyValue::Int(v) => Some(i128::from(*v)),
            PropertyValue::Float(_) | PropertyValue::Text(_) => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Uint(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<u8> for PropertyValue {
    fn from(value: u8) -> Self {
        PropertyValue::Uint(value.into())
    }
}

impl From<u16> for PropertyValue {
    fn from(value: u16) -> Self {
        PropertyValue::Uint(value.into())
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Uint(value.into())
    }
}

impl From<i8> for PropertyValue {
    fn from(value: i8) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<i16> for PropertyValue {
    fn from(value: i16) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

/// Decodes a raw buffer as `data_type`.
///
/// Fixed-width types read from the start of the buffer; trailing bytes are
/// ignored.
pub fn decode(data_type: PropertyType, buf: &[u8]) -> Result<PropertyValue, ProtocolError> {
    if let Some(width) = data_type.width() {
        if buf.len() < width {
            return Err(ProtocolError::ValueTooShort {
                data_type: data_type.name(),
                expected: width,
                actual: buf.len(),
            });
        }
    }

    let value = match data_type {
        PropertyType::Bool => PropertyValue::Bool(buf[0] == 1),
        PropertyType::Uint8 => PropertyValue::Uint(buf[0].into()),
        PropertyType::Int8 => PropertyValue::Int((buf[0] as i8).into()),
        PropertyType::Uint16 => PropertyValue::Uint(u16::from_le_bytes([buf[0], buf[1]]).into()),
        PropertyType::Int16 => PropertyValue::Int(i16::from_le_bytes([buf[0], buf[1]]).into()),
        PropertyType::Uint32 | PropertyType::Time => {
            PropertyValue::Uint(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]).into())
        }
        PropertyType::Int32 => {
            PropertyValue::Int(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]).into())
        }
        PropertyType::Int64 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[..8]);
            PropertyValue::Int(i64::from_le_bytes(bytes))
        }
        PropertyType::String | PropertyType::Version => PropertyValue::Text(
            std::str::from_utf8(buf)
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .to_string(),
        ),
    };
    Ok(value)
}

/// Encodes `value` as `data_type`.
///
/// Integer values must fit the target width; strings are written as UTF-8
/// without a terminator.
pub fn encode(data_type: PropertyType, value: &PropertyValue) -> Result<Bytes, ProtocolError> {
    let mismatch = || ProtocolError::ValueTypeMismatch {
        data_type: data_type.name(),
        value: value.to_string(),
    };

    let bytes = match data_type {
        PropertyType::String | PropertyType::Version => {
            let text = value.as_str().ok_or_else(mismatch)?;
            return Ok(Bytes::copy_from_slice(text.as_bytes()));
        }
        PropertyType::Bool => match value {
            PropertyValue::Bool(b) => vec![u8::from(*b)],
            _ => return Err(mismatch()),
        },
        _ => {
            let n = value.as_i128().ok_or_else(mismatch)?;
            match data_type {
                PropertyType::Uint8 => u8::try_from(n).map_err(|_| mismatch())?.to_le_bytes().to_vec(),
                PropertyType::Int8 => i8::try_from(n).map_err(|_| mismatch())?.to_le_bytes().to_vec(),
                PropertyType::Uint16 => u16::try_from(n).map_err(|_| mismatch())?.to_le_bytes().to_vec(),
                PropertyType::Int16 => i16::try_from(n).map_err(|_| mismatch())?.to_le_bytes().to_vec(),
                PropertyType::Uint32 | PropertyType::Time => {
                    u32::try_from(n).map_err(|_| mismatch())?.to_le_bytes().to_vec()
                }
                PropertyType::Int32 => i32::try_from(n).map_err(|_| mismatch())?.to_le_bytes().to_vec(),
                PropertyType::Int64 => i64::try_from(n).map_err(|_| mismatch())?.to_le_bytes().to_vec(),
                _ => return Err(mismatch()),
            }
        }
    };
    Ok(Bytes::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_type_codes() {
        for code in [0u8, 1, 2, 3, 5, 6, 7, 8, 9, 10, 11] {
            assert_eq!(PropertyType::from_code(code).unwrap().code(), code);
        }
        assert!(matches!(
            PropertyType::from_code(4),
            Err(ProtocolError::UnknownPropertyType(4))
        ));
    }

    #[test]
    fn test_decode_little_endian() {
        assert_eq!(
            decode(PropertyType::Uint16, &[0x34, 0x12]).unwrap(),
            PropertyValue::Uint(0x1234)
        );
        assert_eq!(
            decode(PropertyType::Int16, &[0xdc, 0x00]).unwrap(),
            PropertyValue::Int(220)
        );
        assert_eq!(
            decode(PropertyType::Int16, &[0xff, 0xff]).unwrap(),
            PropertyValue::Int(-1)
        );
        assert_eq!(
            decode(PropertyType::Int8, &[0x80]).unwrap(),
            PropertyValue::Int(-128)
        );
        assert_eq!(
            decode(PropertyType::Time, &[0x01, 0x00, 0x00, 0x00]).unwrap(),
            PropertyValue::Uint(1)
        );
    }

    #[test]
    fn test_decode_bool() {
        assert_eq!(decode(PropertyType::Bool, &[1]).unwrap(), PropertyValue::Bool(true));
        assert_eq!(decode(PropertyType::Bool, &[0]).unwrap(), PropertyValue::Bool(false));
        assert_eq!(decode(PropertyType::Bool, &[2]).unwrap(), PropertyValue::Bool(false));
    }

    #[test]
    fn test_decode_too_short() {
        let result = decode(PropertyType::Uint32, &[1, 2]);
        assert!(matches!(
            result,
            Err(ProtocolError::ValueTooShort {
                expected: 4,
                actual: 2,
                ..
            })
        ));
        assert!(decode(PropertyType::Bool, &[]).is_err());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(
            decode(PropertyType::Uint8, &[7, 99, 99]).unwrap(),
            PropertyValue::Uint(7)
        );
    }

    #[test]
    fn test_decode_string() {
        assert_eq!(
            decode(PropertyType::String, b"ComfoAir Q450").unwrap(),
            PropertyValue::Text("ComfoAir Q450".to_string())
        );
        assert_eq!(
            decode(PropertyType::Version, b"").unwrap(),
            PropertyValue::Text(String::new())
        );
        assert!(matches!(
            decode(PropertyType::String, &[0xff, 0xfe]),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_encode_wire_bytes() {
        assert_eq!(
            encode(PropertyType::Uint16, &PropertyValue::Uint(0x1234)).unwrap().as_ref(),
            &[0x34, 0x12]
        );
        assert_eq!(
            encode(PropertyType::Bool, &true.into()).unwrap().as_ref(),
            &[0x01]
        );
        assert_eq!(
            encode(PropertyType::String, &"abc".into()).unwrap().as_ref(),
            b"abc"
        );
    }

    #[test]
    fn test_encode_out_of_range() {
        assert!(matches!(
            encode(PropertyType::Uint8, &PropertyValue::Uint(256)),
            Err(ProtocolError::ValueTypeMismatch { .. })
        ));
        assert!(encode(PropertyType::Uint16, &PropertyValue::Int(-1)).is_err());
        assert!(encode(PropertyType::Int8, &PropertyValue::Int(128)).is_err());
    }

    #[test]
    fn test_encode_type_mismatch() {
        assert!(encode(PropertyType::String, &PropertyValue::Uint(1)).is_err());
        assert!(encode(PropertyType::Uint32, &"1".into()).is_err());
        assert!(encode(PropertyType::Bool, &PropertyValue::Uint(1)).is_err());
        assert!(encode(PropertyType::Int16, &PropertyValue::Float(1.5)).is_err());
    }

    #[test]
    fn test_no_unit_conversion() {
        // 21.5 degrees arrives as 215 tenths and stays that way
        assert_eq!(
            decode(PropertyType::Int16, &[0xd7, 0x00]).unwrap(),
            PropertyValue::Int(215)
        );
    }

    proptest! {
        #[test]
        fn prop_uint_roundtrip(v in any::<u32>(), ty in prop_oneof![
            Just(PropertyType::Uint8),
            Just(PropertyType::Uint16),
            Just(PropertyType::Uint32),
            Just(PropertyType::Time),
        ]) {
            let max = match ty {
                PropertyType::Uint8 => u64::from(u8::MAX),
                PropertyType::Uint16 => u64::from(u16::MAX),
                _ => u64::from(u32::MAX),
            };
            let value = PropertyValue::Uint(u64::from(v) % (max + 1));
            let encoded = encode(ty, &value).unwrap();
            prop_assert_eq!(Some(encoded.len()), ty.width());
            prop_assert_eq!(decode(ty, &encoded).unwrap(), value);
        }

        #[test]
        fn prop_int_roundtrip(v in any::<i64>()) {
            for (ty, lo, hi) in [
                (PropertyType::Int8, i64::from(i8::MIN), i64::from(i8::MAX)),
                (PropertyType::Int16, i64::from(i16::MIN), i64::from(i16::MAX)),
                (PropertyType::Int32, i64::from(i32::MIN), i64::from(i32::MAX)),
                (PropertyType::Int64, i64::MIN, i64::MAX),
            ] {
                let value = PropertyValue::Int(v.clamp(lo, hi));
                let encoded = encode(ty, &value).unwrap();
                prop_assert_eq!(decode(ty, &encoded).unwrap(), value);
            }
        }

        #[test]
        fn prop_bool_roundtrip(b in any::<bool>()) {
            let value = PropertyValue::Bool(b);
            prop_assert_eq!(decode(PropertyType::Bool, &encode(PropertyType::Bool, &value).unwrap()).unwrap(), value);
        }

        #[test]
        fn prop_string_roundtrip(s in "\\PC*") {
            let value = PropertyValue::Text(s);
            for ty in [PropertyType::String, PropertyType::Version] {
                let encoded = encode(ty, &value).unwrap();
                prop_assert_eq!(decode(ty, &encoded).unwrap(), value.clone());
            }
        }
    }
}
