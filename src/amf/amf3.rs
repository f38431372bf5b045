//! AMF3 encoder and decoder
//!
//! Only the subset reachable through the AMF0 switch marker is implemented:
//! scalars, strings, XML, dates and byte arrays. Strings, XML and byte
//! arrays share the `(length << 1) | 1` inline form; a reference index (even
//! low bit) is accepted on decode and yields an empty value, since no
//! supported client produces reference tables.

use bytes::{BufMut, BytesMut};

use super::reader::AmfReader;
use super::value::Amf3Value;
use crate::error::AmfError;

pub const MARKER_UNDEFINED: u8 = 0x00;
pub const MARKER_NULL: u8 = 0x01;
pub const MARKER_FALSE: u8 = 0x02;
pub const MARKER_TRUE: u8 = 0x03;
pub const MARKER_INTEGER: u8 = 0x04;
pub const MARKER_DOUBLE: u8 = 0x05;
pub const MARKER_STRING: u8 = 0x06;
pub const MARKER_XML_DOC: u8 = 0x07;
pub const MARKER_DATE: u8 = 0x08;
pub const MARKER_XML: u8 = 0x0B;
pub const MARKER_BYTE_ARRAY: u8 = 0x0C;

/// Encode a UI29 variable-length integer.
///
/// 1-3 byte forms carry 7 value bits per byte, the 4-byte form carries 8 in
/// the final byte; every non-terminal byte has the continuation high bit set.
pub fn encode_ui29(num: u32, buf: &mut BytesMut) {
    if num < 0x80 {
        buf.put_u8(num as u8);
    } else if num < 0x4000 {
        buf.put_u8(0x80 | (num >> 7) as u8);
        buf.put_u8((num & 0x7F) as u8);
    } else if num < 0x20_0000 {
        buf.put_u8(0x80 | (num >> 14) as u8);
        buf.put_u8(0x80 | ((num >> 7) & 0x7F) as u8);
        buf.put_u8((num & 0x7F) as u8);
    } else {
        buf.put_u8(0x80 | (num >> 22) as u8);
        buf.put_u8(0x80 | ((num >> 15) & 0x7F) as u8);
        buf.put_u8(0x80 | ((num >> 8) & 0x7F) as u8);
        buf.put_u8((num & 0xFF) as u8);
    }
}

/// Decode a UI29 variable-length integer
pub fn decode_ui29(r: &mut AmfReader<'_>) -> Result<u32, AmfError> {
    let mut value: u32 = 0;

    for i in 0..4 {
        let b = r.read_u8()?;
        if i == 3 {
            // Final byte of the 4-byte form contributes all 8 bits
            return Ok((value << 8) | b as u32);
        }
        value = (value << 7) | (b & 0x7F) as u32;
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }

    unreachable!()
}

/// Encode a single AMF3 value (marker + body)
pub fn encode(value: &Amf3Value, buf: &mut BytesMut) {
    match value {
        Amf3Value::Undefined => buf.put_u8(MARKER_UNDEFINED),
        Amf3Value::Null => buf.put_u8(MARKER_NULL),
        Amf3Value::Bool(false) => buf.put_u8(MARKER_FALSE),
        Amf3Value::Bool(true) => buf.put_u8(MARKER_TRUE),
        Amf3Value::Integer(i) => {
            buf.put_u8(MARKER_INTEGER);
            encode_ui29((*i as u32) & 0x1FFF_FFFF, buf);
        }
        Amf3Value::Double(d) => {
            buf.put_u8(MARKER_DOUBLE);
            buf.put_f64(*d);
        }
        Amf3Value::Str(s) => {
            buf.put_u8(MARKER_STRING);
            encode_inline_bytes(s.as_bytes(), buf);
        }
        Amf3Value::XmlDoc(s) => {
            buf.put_u8(MARKER_XML_DOC);
            encode_inline_bytes(s.as_bytes(), buf);
        }
        Amf3Value::Date(ms) => {
            buf.put_u8(MARKER_DATE);
            encode_ui29(1, buf);
            buf.put_f64(*ms);
        }
        Amf3Value::Xml(s) => {
            buf.put_u8(MARKER_XML);
            encode_inline_bytes(s.as_bytes(), buf);
        }
        Amf3Value::ByteArray(b) => {
            buf.put_u8(MARKER_BYTE_ARRAY);
            encode_inline_bytes(b, buf);
        }
    }
}

fn encode_inline_bytes(bytes: &[u8], buf: &mut BytesMut) {
    encode_ui29(((bytes.len() as u32) << 1) | 1, buf);
    buf.put_slice(bytes);
}

/// Decode a single AMF3 value
pub fn decode_value(r: &mut AmfReader<'_>) -> Result<Amf3Value, AmfError> {
    let marker = r.read_u8()?;
    match marker {
        MARKER_UNDEFINED => Ok(Amf3Value::Undefined),
        MARKER_NULL => Ok(Amf3Value::Null),
        MARKER_FALSE => Ok(Amf3Value::Bool(false)),
        MARKER_TRUE => Ok(Amf3Value::Bool(true)),
        MARKER_INTEGER => {
            let v = decode_ui29(r)?;
            // Sign-extend the 29-bit two's complement value
            let i = if v & 0x1000_0000 != 0 {
                (v | 0xE000_0000) as i32
            } else {
                v as i32
            };
            Ok(Amf3Value::Integer(i))
        }
        MARKER_DOUBLE => Ok(Amf3Value::Double(r.read_f64()?)),
        MARKER_STRING => Ok(Amf3Value::Str(decode_inline_utf8(r)?)),
        MARKER_XML_DOC => Ok(Amf3Value::XmlDoc(decode_inline_utf8(r)?)),
        MARKER_DATE => {
            decode_ui29(r)?;
            Ok(Amf3Value::Date(r.read_f64()?))
        }
        MARKER_XML => Ok(Amf3Value::Xml(decode_inline_utf8(r)?)),
        MARKER_BYTE_ARRAY => {
            let header = decode_ui29(r)?;
            if header & 1 == 0 {
                return Ok(Amf3Value::ByteArray(Vec::new()));
            }
            let len = (header >> 1) as usize;
            Ok(Amf3Value::ByteArray(r.read(len)?.to_vec()))
        }
        _ => Err(AmfError::UnknownMarker(marker)),
    }
}

fn decode_inline_utf8(r: &mut AmfReader<'_>) -> Result<String, AmfError> {
    let header = decode_ui29(r)?;
    if header & 1 == 0 {
        // Reference index; the reference table is not kept
        return Ok(String::new());
    }
    r.read_utf8((header >> 1) as usize)
}
