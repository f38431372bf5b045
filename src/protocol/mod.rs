//! RTMP wire protocol implementation
//!
//! This module handles the low-level protocol details:
//! - Handshake (C0C1C2/S0S1S2 exchange, digest variants)
//! - Chunk stream multiplexing and demultiplexing
//! - Message framing and the command/data layer

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{create_chunks, ChunkDecoder, MessageHeader, Packet};
pub use message::{Command, DataMessage};
