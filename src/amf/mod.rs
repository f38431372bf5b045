//! AMF (Action Message Format) implementation
//!
//! AMF is Adobe's binary serialization format used in RTMP for encoding
//! command parameters and metadata. This module implements AMF0 plus the
//! AMF3 subset reachable through the avmplus-object marker (0x11).

pub mod amf0;
pub mod amf3;
pub mod reader;
pub mod value;

pub use amf0::Amf0Encoder;
pub use reader::AmfReader;
pub use value::{object, Amf0Value, Amf3Value};
