//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk has a
//! basic header naming `(format, chunk stream id)`, an optional message
//! header whose size depends on the format, and a payload fragment.
//!
//! ```text
//! Basic header:
//! - 1 byte:  fmt(2) + csid(6)            for csid 2-63
//! - 2 bytes: fmt(2) + 0 + (csid-64)      for csid 64-319
//! - 3 bytes: fmt(2) + 1 + (csid-64) LE   for csid 64-65599
//!
//! Message header (by format):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4 LE)
//! - Type 1 (7 bytes):  delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  delta(3)
//! - Type 3 (0 bytes):  everything inherited from the previous chunk
//!
//! A 24-bit timestamp field of 0xFFFFFF means a 4-byte extended timestamp
//! follows. Type 3 chunks re-read the extended timestamp when the carrier
//! message used one.
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// Header of a fully assembled RTMP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// Absolute timestamp (publisher clock); deltas already applied
    pub timestamp: i64,
    /// Chunk format the first fragment arrived with
    pub chunk_format: u8,
    /// Chunk stream id
    pub cid: u32,
    /// Message type code
    pub message_type: u8,
    /// Message stream id
    pub stream_id: u32,
    /// Declared payload length
    pub length: u32,
}

/// A fully assembled RTMP message
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Build an outbound message
    pub fn new(cid: u32, message_type: u8, timestamp: i64, stream_id: u32, payload: Bytes) -> Self {
        Self {
            header: MessageHeader {
                timestamp,
                chunk_format: 0,
                cid,
                message_type,
                stream_id,
                length: payload.len() as u32,
            },
            payload,
        }
    }
}

/// Per-chunk-stream receive state
///
/// Type 1/2/3 chunks inherit fields from the last fully observed header on
/// the same chunk stream, so the slot outlives individual messages. After a
/// message is dispatched the payload buffer is cleared but the slot is kept
/// for reuse under the same cid.
#[derive(Debug, Default)]
struct ChunkState {
    /// Last 24-bit timestamp field (absolute for Type 0, delta otherwise)
    timestamp_field: u32,
    length: u32,
    message_type: u8,
    stream_id: u32,
    /// Accumulated absolute timestamp
    clock: i64,
    /// Carrier message used the extended timestamp field
    extended: bool,
    /// Partial payload
    payload: BytesMut,
    bytes: u32,
}

enum Step {
    Message(Packet),
    /// A chunk was consumed but no message completed (mid-reassembly or an
    /// assembled message with an out-of-range clock was discarded)
    Consumed,
    NeedMore,
}

/// Chunk stream decoder: demultiplexes chunks and reassembles messages
pub struct ChunkDecoder {
    chunk_size: u32,
    streams: HashMap<u32, ChunkState>,
    max_message_size: u32,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Update the inbound chunk size (on Set-Chunk-Size from the peer)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.max(1);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Drop the partial message on a chunk stream (on Abort from the peer)
    pub fn abort(&mut self, cid: u32) {
        if let Some(state) = self.streams.get_mut(&cid) {
            state.payload.clear();
            state.bytes = 0;
        }
    }

    /// Try to decode one complete message from the buffer.
    ///
    /// Returns `Ok(Some(packet))` when a message finished reassembly,
    /// `Ok(None)` when more bytes are needed, `Err` on protocol violation.
    /// Consumed bytes are removed from `buf`; nothing is consumed until a
    /// whole chunk (headers plus payload fragment) is available.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>> {
        loop {
            match self.decode_chunk(buf)? {
                Step::Message(p) => return Ok(Some(p)),
                Step::Consumed => continue,
                Step::NeedMore => return Ok(None),
            }
        }
    }

    fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<Step> {
        if buf.is_empty() {
            return Ok(Step::NeedMore);
        }

        let first = buf[0];
        let fmt = first >> 6;
        let (cid, basic_len) = match first & 0x3F {
            0 => {
                if buf.len() < 2 {
                    return Ok(Step::NeedMore);
                }
                (64 + buf[1] as u32, 2)
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(Step::NeedMore);
                }
                (64 + buf[1] as u32 + ((buf[2] as u32) << 8), 3)
            }
            cid => (cid as u32, 1),
        };

        let msg_header_len: usize = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };

        let mut need = basic_len + msg_header_len;
        if buf.len() < need {
            return Ok(Step::NeedMore);
        }

        let state = self.streams.entry(cid).or_default();
        let header = &buf[basic_len..basic_len + msg_header_len];

        let timestamp_field = if fmt <= 2 {
            ((header[0] as u32) << 16) | ((header[1] as u32) << 8) | header[2] as u32
        } else {
            state.timestamp_field
        };

        let (length, message_type) = if fmt <= 1 {
            (
                ((header[3] as u32) << 16) | ((header[4] as u32) << 8) | header[5] as u32,
                header[6],
            )
        } else {
            (state.length, state.message_type)
        };

        let stream_id = if fmt == 0 {
            u32::from_le_bytes([header[7], header[8], header[9], header[10]])
        } else {
            state.stream_id
        };

        if message_type > MSG_METADATA {
            return Err(ProtocolError::UnknownMessageType(message_type).into());
        }

        if length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: self.max_message_size,
            }
            .into());
        }

        // Extended timestamp: present when the 24-bit field saturates, and
        // re-read on Type 3 continuations of a carrier that used it.
        let extended = if fmt <= 2 {
            timestamp_field >= EXTENDED_TIMESTAMP
        } else {
            state.extended
        };

        let ts_value = if extended {
            need += 4;
            if buf.len() < need {
                return Ok(Step::NeedMore);
            }
            let at = need - 4;
            u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
        } else {
            timestamp_field
        };

        let fragment_len = length.saturating_sub(state.bytes).min(self.chunk_size) as usize;
        if buf.len() < need + fragment_len {
            return Ok(Step::NeedMore);
        }

        // Whole chunk available: commit.
        buf.advance(need);

        state.timestamp_field = timestamp_field;
        state.length = length;
        state.message_type = message_type;
        state.stream_id = stream_id;
        if fmt <= 2 {
            state.extended = extended;
        }

        if state.bytes == 0 {
            if fmt == 0 {
                state.clock = ts_value as i64;
            } else {
                state.clock += ts_value as i64;
            }
            state.payload.reserve(length as usize);
        }

        state.payload.put_slice(&buf[..fragment_len]);
        buf.advance(fragment_len);
        state.bytes += fragment_len as u32;

        if state.bytes < state.length {
            return Ok(Step::Consumed);
        }

        // Message complete; the slot stays for reuse under this cid.
        let payload = state.payload.split().freeze();
        state.bytes = 0;

        // A clock past the 32-bit range cannot be represented on the wire
        // again; the assembled message is discarded.
        if state.clock > u32::MAX as i64 {
            return Ok(Step::Consumed);
        }

        Ok(Step::Message(Packet {
            header: MessageHeader {
                timestamp: state.clock,
                chunk_format: fmt,
                cid,
                message_type: state.message_type,
                stream_id: state.stream_id,
                length: state.length,
            },
            payload,
        }))
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn basic_header_len(cid: u32) -> usize {
    if cid >= 64 + 256 {
        3
    } else if cid >= 64 {
        2
    } else {
        1
    }
}

fn put_basic_header(fmt: u8, cid: u32, buf: &mut BytesMut) {
    if cid >= 64 + 256 {
        buf.put_u8((fmt << 6) | 1);
        buf.put_u8(((cid - 64) & 0xFF) as u8);
        buf.put_u8(((cid - 64) >> 8) as u8);
    } else if cid >= 64 {
        buf.put_u8(fmt << 6);
        buf.put_u8((cid - 64) as u8);
    } else {
        buf.put_u8((fmt << 6) | cid as u8);
    }
}

fn put_u24(value: u32, buf: &mut BytesMut) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

/// Serialize a message into a chunk stream.
///
/// The first fragment carries a full Type 0 header; continuations carry a
/// Type 3 basic header and, when the message uses an extended timestamp,
/// repeat the 4-byte extended timestamp. The output vector is allocated at
/// its exact final size so no intermediate copy happens.
pub fn create_chunks(packet: &Packet, out_chunk_size: u32) -> Bytes {
    let payload = &packet.payload;
    let chunk_size = out_chunk_size.max(1) as usize;
    let basic_len = basic_header_len(packet.header.cid);

    let extended = packet.header.timestamp >= EXTENDED_TIMESTAMP as i64;
    let ext_len = if extended { 4 } else { 0 };

    let continuations = if payload.is_empty() {
        0
    } else {
        (payload.len() - 1) / chunk_size
    };

    let total = basic_len + 11 + ext_len + payload.len() + continuations * (basic_len + ext_len);
    let mut out = BytesMut::with_capacity(total);

    put_basic_header(0, packet.header.cid, &mut out);
    if extended {
        put_u24(EXTENDED_TIMESTAMP, &mut out);
    } else {
        put_u24(packet.header.timestamp as u32, &mut out);
    }
    put_u24(payload.len() as u32, &mut out);
    out.put_u8(packet.header.message_type);
    out.put_u32_le(packet.header.stream_id);
    if extended {
        out.put_u32(packet.header.timestamp as u32);
    }

    let mut offset = 0;
    loop {
        let fragment = (payload.len() - offset).min(chunk_size);
        out.put_slice(&payload[offset..offset + fragment]);
        offset += fragment;
        if offset >= payload.len() {
            break;
        }
        put_basic_header(3, packet.header.cid, &mut out);
        if extended {
            out.put_u32(packet.header.timestamp as u32);
        }
    }

    debug_assert_eq!(out.len(), total);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(cid: u32, message_type: u8, timestamp: i64, stream_id: u32, len: usize) -> Packet {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Packet::new(cid, message_type, timestamp, stream_id, Bytes::from(payload))
    }

    fn roundtrip(packet: &Packet, chunk_size: u32) {
        let wire = create_chunks(packet, chunk_size);
        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(chunk_size);
        let mut buf = BytesMut::from(&wire[..]);

        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded.header.cid, packet.header.cid);
        assert_eq!(decoded.header.timestamp, packet.header.timestamp);
        assert_eq!(decoded.header.message_type, packet.header.message_type);
        assert_eq!(decoded.header.stream_id, packet.header.stream_id);
        assert_eq!(decoded.header.length, packet.header.length);
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn test_roundtrip_all_chunk_sizes() {
        for chunk_size in [128u32, 1024, 65536] {
            for len in [1usize, 127, 128, 129, 5000, 70000] {
                roundtrip(&make_packet(CSID_VIDEO, MSG_VIDEO, 4000, 1, len), chunk_size);
            }
        }
    }

    #[test]
    fn test_roundtrip_cid_escapes() {
        for cid in [2u32, 3, 63, 64, 319, 320, 65599] {
            roundtrip(&make_packet(cid, MSG_AUDIO, 10, 1, 200), 128);
        }
    }

    #[test]
    fn test_roundtrip_extended_timestamp() {
        // At and above 0xFFFFFF the 4-byte extended field carries the clock
        for ts in [0xFFFFFFi64, 0x1000000, 0x7FFFFFFF] {
            roundtrip(&make_packet(CSID_VIDEO, MSG_VIDEO, ts, 1, 500), 128);
        }
    }

    #[test]
    fn test_extended_timestamp_repeats_on_continuations() {
        let packet = make_packet(CSID_VIDEO, MSG_VIDEO, 0x1000000, 1, 300);
        let wire = create_chunks(&packet, 128);
        // basic(1) + header(11) + ext(4) + 300 payload + 2 * (basic(1) + ext(4))
        assert_eq!(wire.len(), 1 + 11 + 4 + 300 + 2 * 5);
        roundtrip(&packet, 128);
    }

    #[test]
    fn test_exact_output_size_no_trailing_continuation() {
        // Payload an exact multiple of the chunk size must not emit an
        // empty trailing Type 3 header.
        let packet = make_packet(CSID_AUDIO, MSG_AUDIO, 5, 1, 256);
        let wire = create_chunks(&packet, 128);
        assert_eq!(wire.len(), 1 + 11 + 256 + 1);
    }

    #[test]
    fn test_incremental_feeding() {
        let packet = make_packet(CSID_INVOKE, MSG_INVOKE, 77, 0, 1000);
        let wire = create_chunks(&packet, 128);

        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::new();
        let mut result = None;
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(p) = decoder.decode(&mut buf).unwrap() {
                result = Some(p);
            }
        }
        let decoded = result.expect("message should complete on final byte");
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn test_type1_delta_inheritance() {
        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::new();

        // Type 0: cid 4, ts 100, len 2, type audio, stream 1
        buf.put_u8(0x04);
        put_u24(100, &mut buf);
        put_u24(2, &mut buf);
        buf.put_u8(MSG_AUDIO);
        buf.put_u32_le(1);
        buf.put_slice(&[0xAF, 0x01]);

        // Type 1: delta 25, same length and type
        buf.put_u8(0x44);
        put_u24(25, &mut buf);
        put_u24(2, &mut buf);
        buf.put_u8(MSG_AUDIO);
        buf.put_slice(&[0xAF, 0x02]);

        // Type 2: delta only
        buf.put_u8(0x84);
        put_u24(25, &mut buf);
        buf.put_slice(&[0xAF, 0x03]);

        // Type 3: everything inherited (delta 25 reapplied)
        buf.put_u8(0xC4);
        buf.put_slice(&[0xAF, 0x04]);

        let p0 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(p0.header.timestamp, 100);
        let p1 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(p1.header.timestamp, 125);
        assert_eq!(p1.header.stream_id, 1);
        let p2 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(p2.header.timestamp, 150);
        let p3 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(p3.header.timestamp, 175);
        assert_eq!(p3.payload[1], 0x04);
    }

    #[test]
    fn test_interleaved_channels() {
        let a = make_packet(CSID_AUDIO, MSG_AUDIO, 10, 1, 300);
        let v = make_packet(CSID_VIDEO, MSG_VIDEO, 10, 1, 300);
        let wire_a = create_chunks(&a, 128);
        let wire_v = create_chunks(&v, 128);

        // Interleave: first chunk of each, then the continuations
        let mut buf = BytesMut::new();
        buf.put_slice(&wire_a[..12 + 128]);
        buf.put_slice(&wire_v[..12 + 128]);
        buf.put_slice(&wire_a[12 + 128..]);
        buf.put_slice(&wire_v[12 + 128..]);

        let mut decoder = ChunkDecoder::new();
        let p1 = decoder.decode(&mut buf).unwrap().unwrap();
        let p2 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(p1.header.cid, CSID_AUDIO);
        assert_eq!(p1.payload, a.payload);
        assert_eq!(p2.header.cid, CSID_VIDEO);
        assert_eq!(p2.payload, v.payload);
    }

    #[test]
    fn test_rejects_message_type_above_cap() {
        let packet = make_packet(CSID_INVOKE, 23, 0, 0, 4);
        let wire = create_chunks(&packet, 128);
        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::from(&wire[..]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_slot_reuse_same_cid() {
        let mut decoder = ChunkDecoder::new();
        let first = make_packet(CSID_VIDEO, MSG_VIDEO, 40, 1, 700);
        let second = make_packet(CSID_VIDEO, MSG_VIDEO, 80, 1, 700);

        let mut buf = BytesMut::from(&create_chunks(&first, 128)[..]);
        buf.put_slice(&create_chunks(&second, 128));

        let p1 = decoder.decode(&mut buf).unwrap().unwrap();
        let p2 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(p1.payload, first.payload);
        assert_eq!(p2.payload, second.payload);
        assert_eq!(p2.header.timestamp, 80);
    }

    #[test]
    fn test_abort_clears_partial() {
        let packet = make_packet(CSID_VIDEO, MSG_VIDEO, 0, 1, 700);
        let wire = create_chunks(&packet, 128);

        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::from(&wire[..12 + 128]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        decoder.abort(CSID_VIDEO);

        // A fresh message on the same cid decodes cleanly
        let fresh = make_packet(CSID_VIDEO, MSG_VIDEO, 10, 1, 64);
        let mut buf = BytesMut::from(&create_chunks(&fresh, 128)[..]);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload, fresh.payload);
    }
}
