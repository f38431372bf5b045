//! RTMP message layer
//!
//! Commands (connect, createStream, publish, play, ...) and data messages
//! (@setDataFrame, onMetaData) are AMF0 value sequences carried in INVOKE /
//! DATA packets. This module decodes those sequences into positional
//! structures and builds the protocol-control payloads the server sends.

use bytes::{BufMut, Bytes, BytesMut};

use crate::amf::{amf0, object, Amf0Value, AmfReader};
use crate::error::{ProtocolError, Result};
use crate::protocol::chunk::Packet;
use crate::protocol::constants::*;

/// An RTMP command: name, transaction id, command object, then arguments
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub object: Amf0Value,
    pub args: Vec<Amf0Value>,
}

impl Command {
    /// Decode a command from an INVOKE payload
    pub fn decode(payload: &[u8]) -> Result<Command> {
        let mut r = AmfReader::new(payload);

        let name = match amf0::decode_value(&mut r)?.as_str() {
            Some(s) => s.to_string(),
            None => return Err(ProtocolError::InvalidCommand("non-string command name".into()).into()),
        };

        let transaction_id = if r.is_ended() {
            0.0
        } else {
            amf0::decode_value(&mut r)?.as_number().unwrap_or(0.0)
        };

        let object = if r.is_ended() {
            Amf0Value::Null
        } else {
            amf0::decode_value(&mut r)?
        };

        let mut args = Vec::new();
        while !r.is_ended() {
            args.push(amf0::decode_value(&mut r)?);
        }

        Ok(Command {
            name,
            transaction_id,
            object,
            args,
        })
    }

    /// Encode to an INVOKE payload
    pub fn encode(&self) -> Bytes {
        let mut enc = amf0::Amf0Encoder::new();
        enc.encode(&Amf0Value::Str(self.name.clone()));
        enc.encode(&Amf0Value::Number(self.transaction_id));
        enc.encode(&self.object);
        enc.encode_all(&self.args);
        enc.finish()
    }

    /// `_result` response
    pub fn result(transaction_id: f64, object: Amf0Value, args: Vec<Amf0Value>) -> Self {
        Command {
            name: CMD_RESULT.to_string(),
            transaction_id,
            object,
            args,
        }
    }

    /// `onStatus` notification with a level/code/description info object
    pub fn on_status(level: &str, code: &str, description: &str) -> Self {
        let info = if description.is_empty() {
            object([("level", level), ("code", code)])
        } else {
            object([
                ("level", level),
                ("code", code),
                ("description", description),
            ])
        };

        Command {
            name: CMD_ON_STATUS.to_string(),
            transaction_id: 0.0,
            object: Amf0Value::Null,
            args: vec![info],
        }
    }
}

/// A data message: handler name plus value list
#[derive(Debug, Clone)]
pub struct DataMessage {
    pub name: String,
    pub values: Vec<Amf0Value>,
}

impl DataMessage {
    /// Decode from a DATA payload
    pub fn decode(payload: &[u8]) -> Result<DataMessage> {
        let mut r = AmfReader::new(payload);

        let name = match amf0::decode_value(&mut r)? {
            Amf0Value::Str(s) => s,
            other => other.as_str().map(|s| s.to_string()).unwrap_or_default(),
        };

        let mut values = Vec::new();
        while !r.is_ended() {
            values.push(amf0::decode_value(&mut r)?);
        }

        Ok(DataMessage { name, values })
    }

    /// Encode to a DATA payload
    pub fn encode(&self) -> Bytes {
        let mut enc = amf0::Amf0Encoder::new();
        enc.encode(&Amf0Value::Str(self.name.clone()));
        enc.encode_all(&self.values);
        enc.finish()
    }

    /// The last object-valued argument, where @setDataFrame carries the
    /// metadata payload
    pub fn data_object(&self) -> Option<&Amf0Value> {
        self.values.iter().rev().find(|v| v.as_object().is_some())
    }
}

// ============================================================================
// Protocol control and user control payloads
// ============================================================================

fn control_packet(message_type: u8, payload: Bytes) -> Packet {
    Packet::new(CSID_PROTOCOL, message_type, 0, 0, payload)
}

/// Set-Chunk-Size (type 1)
pub fn set_chunk_size(size: u32) -> Packet {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(size);
    control_packet(MSG_SET_CHUNK_SIZE, buf.freeze())
}

/// Acknowledgement (type 3)
pub fn acknowledgement(sequence: u32) -> Packet {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(sequence);
    control_packet(MSG_ACK, buf.freeze())
}

/// Window-Ack-Size (type 5)
pub fn window_ack_size(size: u32) -> Packet {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(size);
    control_packet(MSG_WINDOW_ACK_SIZE, buf.freeze())
}

/// Set-Peer-Bandwidth (type 6)
pub fn set_peer_bandwidth(size: u32, limit_type: u8) -> Packet {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u32(size);
    buf.put_u8(limit_type);
    control_packet(MSG_SET_PEER_BANDWIDTH, buf.freeze())
}

/// Stream-Begin / Stream-EOF / Stream-Dry user control event (type 4)
pub fn stream_status(event: u16, stream_id: u32) -> Packet {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u16(event);
    buf.put_u32(stream_id);
    control_packet(MSG_USER_CONTROL, buf.freeze())
}

/// Ping request (type 4, event 6) carrying ms since session connect
pub fn ping_request(elapsed_ms: i64) -> Packet {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u16(UC_PING_REQUEST);
    buf.put_u32(elapsed_ms as u32);
    Packet::new(CSID_PROTOCOL, MSG_USER_CONTROL, elapsed_ms, 0, buf.freeze())
}

/// Big-endian u32 from the first four payload bytes of a protocol control
/// message; `None` when the payload is shorter
pub fn control_value(payload: &[u8]) -> Option<u32> {
    if payload.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}
