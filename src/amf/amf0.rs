//! AMF0 encoder and decoder
//!
//! Type markers:
//! ```text
//! 0x00 Number      0x01 Boolean     0x02 String       0x03 Object
//! 0x05 Null        0x06 Undefined   0x07 Reference    0x08 ECMA Array
//! 0x09 Object End  0x0A Strict Arr  0x0B Date         0x0C Long String
//! 0x0F XML Doc     0x10 Typed Obj   0x11 AVM+ (AMF3)
//! ```
//!
//! Object properties are emitted in key-sorted order so the serialized form
//! of equal values is byte-identical.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use super::amf3;
use super::reader::AmfReader;
use super::value::Amf0Value;
use crate::error::AmfError;

pub const MARKER_NUMBER: u8 = 0x00;
pub const MARKER_BOOL: u8 = 0x01;
pub const MARKER_STRING: u8 = 0x02;
pub const MARKER_OBJECT: u8 = 0x03;
pub const MARKER_NULL: u8 = 0x05;
pub const MARKER_UNDEFINED: u8 = 0x06;
pub const MARKER_REFERENCE: u8 = 0x07;
pub const MARKER_ECMA_ARRAY: u8 = 0x08;
pub const MARKER_OBJECT_END: u8 = 0x09;
pub const MARKER_STRICT_ARRAY: u8 = 0x0A;
pub const MARKER_DATE: u8 = 0x0B;
pub const MARKER_LONG_STRING: u8 = 0x0C;
pub const MARKER_XML_DOC: u8 = 0x0F;
pub const MARKER_TYPED_OBJECT: u8 = 0x10;
pub const MARKER_AVMPLUS: u8 = 0x11;

/// Maximum nesting depth for objects/arrays
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 encoder accumulating into a byte buffer
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Take the encoded bytes and reset the encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Encode a single AMF0 value
    pub fn encode(&mut self, value: &Amf0Value) {
        match value {
            Amf0Value::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            Amf0Value::Bool(b) => {
                self.buf.put_u8(MARKER_BOOL);
                self.buf.put_u8(if *b { 1 } else { 0 });
            }
            Amf0Value::Str(s) => {
                self.buf.put_u8(MARKER_STRING);
                self.write_utf8(s);
            }
            Amf0Value::LongStr(s) => {
                self.buf.put_u8(MARKER_LONG_STRING);
                self.buf.put_u32(s.len() as u32);
                self.buf.put_slice(s.as_bytes());
            }
            Amf0Value::XmlDoc(s) => {
                self.buf.put_u8(MARKER_XML_DOC);
                self.buf.put_u32(s.len() as u32);
                self.buf.put_slice(s.as_bytes());
            }
            Amf0Value::Date(ms) => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_u16(0); // reserved
                self.buf.put_f64(*ms);
            }
            Amf0Value::Null => {
                self.buf.put_u8(MARKER_NULL);
            }
            Amf0Value::Undefined => {
                self.buf.put_u8(MARKER_UNDEFINED);
            }
            Amf0Value::Reference(idx) => {
                self.buf.put_u8(MARKER_REFERENCE);
                self.buf.put_u16(*idx);
            }
            Amf0Value::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.write_properties(props);
            }
            Amf0Value::TypedObject {
                class_name,
                properties,
            } => {
                self.buf.put_u8(MARKER_TYPED_OBJECT);
                self.write_utf8(class_name);
                self.write_properties(properties);
            }
            Amf0Value::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.write_properties(props);
            }
            Amf0Value::StrictArray(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode(elem);
                }
            }
            Amf0Value::Amf3(v) => {
                self.buf.put_u8(MARKER_AVMPLUS);
                amf3::encode(v, &mut self.buf);
            }
        }
    }

    /// Encode multiple values back to back
    pub fn encode_all(&mut self, values: &[Amf0Value]) {
        for value in values {
            self.encode(value);
        }
    }

    /// Key-sorted `(key, value)` pairs plus the empty-key / type-9 sentinel.
    /// BTreeMap iteration order is the sorted order.
    fn write_properties(&mut self, props: &BTreeMap<String, Amf0Value>) {
        for (key, val) in props {
            self.write_utf8(key);
            self.encode(val);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    fn write_utf8(&mut self, s: &str) {
        self.buf.put_u16(s.len() as u16);
        self.buf.put_slice(s.as_bytes());
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a single AMF0 value from the reader
pub fn decode_value(r: &mut AmfReader<'_>) -> Result<Amf0Value, AmfError> {
    decode_at_depth(r, 0)
}

fn decode_at_depth(r: &mut AmfReader<'_>, depth: usize) -> Result<Amf0Value, AmfError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(AmfError::NestingTooDeep);
    }

    let marker = r.read_u8()?;
    match marker {
        MARKER_NUMBER => Ok(Amf0Value::Number(r.read_f64()?)),
        MARKER_BOOL => Ok(Amf0Value::Bool(r.read_u8()? != 0)),
        MARKER_STRING => {
            let len = r.read_u16()? as usize;
            Ok(Amf0Value::Str(r.read_utf8(len)?))
        }
        MARKER_OBJECT => Ok(Amf0Value::Object(read_properties(r, depth)?)),
        MARKER_NULL => Ok(Amf0Value::Null),
        MARKER_UNDEFINED => Ok(Amf0Value::Undefined),
        MARKER_REFERENCE => Ok(Amf0Value::Reference(r.read_u16()?)),
        MARKER_ECMA_ARRAY => {
            // Leading length is a hint only; the property list is
            // sentinel-terminated like a plain object.
            r.skip(4)?;
            Ok(Amf0Value::EcmaArray(read_properties(r, depth)?))
        }
        MARKER_STRICT_ARRAY => {
            let count = r.read_u32()? as usize;
            let mut elements = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                elements.push(decode_at_depth(r, depth + 1)?);
            }
            Ok(Amf0Value::StrictArray(elements))
        }
        MARKER_DATE => {
            r.skip(2)?;
            Ok(Amf0Value::Date(r.read_f64()?))
        }
        MARKER_LONG_STRING => {
            let len = r.read_u32()? as usize;
            Ok(Amf0Value::LongStr(r.read_utf8(len)?))
        }
        MARKER_XML_DOC => {
            let len = r.read_u32()? as usize;
            Ok(Amf0Value::XmlDoc(r.read_utf8(len)?))
        }
        MARKER_TYPED_OBJECT => {
            let name_len = r.read_u16()? as usize;
            let class_name = r.read_utf8(name_len)?;
            Ok(Amf0Value::TypedObject {
                class_name,
                properties: read_properties(r, depth)?,
            })
        }
        MARKER_AVMPLUS => Ok(Amf0Value::Amf3(amf3::decode_value(r)?)),
        _ => Err(AmfError::UnknownMarker(marker)),
    }
}

/// Read `(key, value)` pairs until the empty-key / type-9 sentinel
fn read_properties(
    r: &mut AmfReader<'_>,
    depth: usize,
) -> Result<BTreeMap<String, Amf0Value>, AmfError> {
    let mut props = BTreeMap::new();

    loop {
        let key_len = r.read_u16()? as usize;
        let key = r.read_utf8(key_len)?;

        if key.is_empty() {
            let end = r.read_u8()?;
            if end == MARKER_OBJECT_END {
                return Ok(props);
            }
            return Err(AmfError::UnknownMarker(end));
        }

        let value = decode_at_depth(r, depth + 1)?;
        props.insert(key, value);
    }
}

/// Decode every value in the slice
pub fn decode_all(data: &[u8]) -> Result<Vec<Amf0Value>, AmfError> {
    let mut r = AmfReader::new(data);
    let mut values = Vec::new();
    while !r.is_ended() {
        values.push(decode_value(&mut r)?);
    }
    Ok(values)
}

/// Encode a single value to bytes
pub fn encode(value: &Amf0Value) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(value);
    encoder.finish()
}

/// Encode multiple values to bytes
pub fn encode_all(values: &[Amf0Value]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::value::{object, Amf3Value};

    fn roundtrip(value: Amf0Value) {
        let encoded = encode(&value);
        let mut r = AmfReader::new(&encoded);
        let decoded = decode_value(&mut r).unwrap();
        assert!(r.is_ended(), "trailing bytes after {:?}", value);
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_scalar_roundtrips() {
        roundtrip(Amf0Value::Number(42.5));
        roundtrip(Amf0Value::Number(-0.5));
        roundtrip(Amf0Value::Bool(true));
        roundtrip(Amf0Value::Bool(false));
        roundtrip(Amf0Value::Str("hello world".into()));
        roundtrip(Amf0Value::LongStr("x".repeat(70000)));
        roundtrip(Amf0Value::XmlDoc("<a/>".into()));
        roundtrip(Amf0Value::Date(1_600_000_000_000.0));
        roundtrip(Amf0Value::Null);
        roundtrip(Amf0Value::Undefined);
        roundtrip(Amf0Value::Reference(7));
    }

    #[test]
    fn test_object_roundtrip() {
        roundtrip(object([
            ("name", Amf0Value::Str("test".into())),
            ("value", Amf0Value::Number(123.0)),
            ("flag", Amf0Value::Bool(true)),
        ]));
    }

    #[test]
    fn test_nested_object_roundtrip() {
        roundtrip(object([
            ("outer", object([("inner", Amf0Value::Number(1.0))])),
            ("after", Amf0Value::Str("still here".into())),
        ]));
    }

    #[test]
    fn test_typed_object_roundtrip() {
        let mut props = std::collections::BTreeMap::new();
        props.insert("x".to_string(), Amf0Value::Number(1.0));
        roundtrip(Amf0Value::TypedObject {
            class_name: "flash.SomeClass".into(),
            properties: props,
        });
    }

    #[test]
    fn test_array_roundtrips() {
        roundtrip(Amf0Value::StrictArray(vec![
            Amf0Value::Number(1.0),
            Amf0Value::Str("two".into()),
            Amf0Value::Bool(true),
        ]));

        let mut props = std::collections::BTreeMap::new();
        props.insert("0".to_string(), Amf0Value::Number(1.0));
        props.insert("label".to_string(), Amf0Value::Str("ecma".into()));
        roundtrip(Amf0Value::EcmaArray(props));
    }

    #[test]
    fn test_amf3_switch_roundtrip() {
        roundtrip(Amf0Value::Amf3(Amf3Value::Integer(300)));
        roundtrip(Amf0Value::Amf3(Amf3Value::Str("mixed".into())));
    }

    #[test]
    fn test_encode_is_key_sorted() {
        // The same logical object encodes to identical bytes regardless of
        // insertion order.
        let a = object([("b", 2.0), ("a", 1.0), ("c", 3.0)]);
        let b = object([("c", 3.0), ("a", 1.0), ("b", 2.0)]);
        assert_eq!(encode(&a), encode(&b));
    }

    #[test]
    fn test_multiple_values() {
        let values = vec![
            Amf0Value::Str("connect".into()),
            Amf0Value::Number(1.0),
            Amf0Value::Null,
        ];
        let encoded = encode_all(&values);
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_truncated_fails_short() {
        let encoded = encode(&Amf0Value::Str("truncate me".into()));
        let cut = &encoded[..encoded.len() - 3];
        let mut r = AmfReader::new(cut);
        assert_eq!(decode_value(&mut r).unwrap_err(), AmfError::Short);
    }

    #[test]
    fn test_unknown_marker() {
        let mut r = AmfReader::new(&[0x42]);
        assert_eq!(
            decode_value(&mut r).unwrap_err(),
            AmfError::UnknownMarker(0x42)
        );
    }
}
