//! GOP (group of pictures) cache
//!
//! A publisher keeps its recent media messages in arrival order so late
//! joiners can start decoding mid-stream: codec headers first, then the
//! cached packets beginning at the last video sequence-header boundary.
//!
//! The cache is a bounded FIFO. Every entry accounts for its payload length
//! plus a fixed per-entry overhead, and the oldest entries are evicted until
//! the byte budget holds.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::protocol::constants::PACKET_BASE_SIZE;

/// A fully assembled audio or video message held for replay
#[derive(Debug, Clone)]
pub struct CachedPacket {
    /// Chunk stream id the message arrived on (audio or video)
    pub cid: u32,
    /// Message type code (8 audio, 9 video)
    pub message_type: u8,
    /// Publisher clock at the time the message was received
    pub timestamp: i64,
    pub payload: Bytes,
}

impl CachedPacket {
    fn accounted_size(&self) -> u64 {
        self.payload.len() as u64 + PACKET_BASE_SIZE
    }
}

/// Bounded FIFO of recent media packets for one publisher
#[derive(Debug)]
pub struct GopCache {
    packets: VecDeque<CachedPacket>,
    /// Current accounted size in bytes
    size: u64,
    /// Byte budget; zero disables caching entirely
    limit: u64,
    /// Set when a player requested `cache=clear`; stays disabled until the
    /// publisher finishes
    disabled: bool,
}

impl GopCache {
    pub fn new(limit: u64) -> Self {
        Self {
            packets: VecDeque::new(),
            size: 0,
            limit,
            disabled: limit == 0,
        }
    }

    /// Append a media packet, evicting from the front until the budget holds
    pub fn push(&mut self, packet: CachedPacket) {
        if self.disabled {
            return;
        }

        self.size += packet.accounted_size();
        self.packets.push_back(packet);

        while self.size > self.limit {
            match self.packets.pop_front() {
                Some(old) => self.size -= old.accounted_size(),
                None => break,
            }
        }
    }

    /// Drop every cached packet, keeping the cache usable
    pub fn clear(&mut self) {
        self.packets.clear();
        self.size = 0;
    }

    /// Drop everything and refuse all further caching
    pub fn disable(&mut self) {
        self.clear();
        self.disabled = true;
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Accounted size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Cached packets in arrival order
    pub fn iter(&self) -> impl Iterator<Item = &CachedPacket> {
        self.packets.iter()
    }
}
