//! Shared per-session handle
//!
//! One `SessionShared` exists per connection, owned by the session table.
//! It carries everything other tasks are allowed to touch: the socket write
//! half behind the per-session send lock, the player-side flags, the
//! publish-side state (codec headers, metadata, clock, GOP cache), and the
//! kill signal that makes the read loop exit.
//!
//! Lock order across the crate is registry -> publish state -> send lock;
//! the flags mutex is a leaf and is never held across an await.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

use crate::gop::{CachedPacket, GopCache};
use crate::media;
use crate::protocol::chunk::{create_chunks, Packet};
use crate::protocol::constants::*;
use crate::protocol::message::{self, Command, DataMessage};

/// Player-side state read by publishers during fan-out.
///
/// Guarded by a plain mutex; held only for field reads and writes.
#[derive(Debug, Default)]
pub struct SessionFlags {
    pub playing: bool,
    pub idling: bool,
    pub paused: bool,
    pub receive_audio: bool,
    pub receive_video: bool,
    pub play_stream_id: u32,
    /// Player asked for `cache=no`: skip GOP replay on join
    pub gop_play_no: bool,
    /// Player asked for `cache=clear`: empty and disable the publisher cache
    pub gop_play_clear: bool,
    pub channel: String,
    pub key: String,
}

/// Publisher-side state guarded by the publish-state lock
#[derive(Debug)]
pub struct PublishState {
    pub publishing: bool,
    pub channel: String,
    pub key: String,
    /// Token issued by the policy gate on accept
    pub stream_id: String,
    pub publish_stream_id: u32,
    /// Encoded onMetaData message re-sent to new joiners
    pub metadata: Bytes,
    pub audio_codec: u32,
    pub video_codec: u32,
    pub aac_sequence_header: Bytes,
    pub avc_sequence_header: Bytes,
    /// Most recently received message timestamp
    pub clock: i64,
    pub cache: GopCache,
}

impl PublishState {
    fn new(gop_cache_limit: u64) -> Self {
        Self {
            publishing: false,
            channel: String::new(),
            key: String::new(),
            stream_id: String::new(),
            publish_stream_id: 0,
            metadata: Bytes::new(),
            audio_codec: 0,
            video_codec: 0,
            aac_sequence_header: Bytes::new(),
            avc_sequence_header: Bytes::new(),
            clock: 0,
            cache: GopCache::new(gop_cache_limit),
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cross-task handle for one connection
pub struct SessionShared {
    pub id: u64,
    pub ip: IpAddr,

    connected: AtomicBool,
    connect_time_ms: AtomicI64,
    out_chunk_size: AtomicU32,

    /// Per-session send lock: all socket writes serialize here
    writer: Mutex<BoxedWriter>,

    pub flags: StdMutex<SessionFlags>,
    pub publish: Mutex<PublishState>,

    kill: Notify,
    killed: AtomicBool,
}

impl SessionShared {
    pub fn new(
        id: u64,
        ip: IpAddr,
        writer: BoxedWriter,
        out_chunk_size: u32,
        gop_cache_limit: u64,
    ) -> Self {
        Self {
            id,
            ip,
            connected: AtomicBool::new(false),
            connect_time_ms: AtomicI64::new(0),
            out_chunk_size: AtomicU32::new(out_chunk_size),
            writer: Mutex::new(writer),
            flags: StdMutex::new(SessionFlags {
                receive_audio: true,
                receive_video: true,
                ..Default::default()
            }),
            publish: Mutex::new(PublishState::new(gop_cache_limit)),
            kill: Notify::new(),
            killed: AtomicBool::new(false),
        }
    }

    /// Mark the session connected and record the connect time
    pub fn set_connected(&self, now_ms: i64) {
        self.connected.store(true, Ordering::SeqCst);
        self.connect_time_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn connect_time_ms(&self) -> i64 {
        self.connect_time_ms.load(Ordering::SeqCst)
    }

    pub fn out_chunk_size(&self) -> u32 {
        self.out_chunk_size.load(Ordering::SeqCst)
    }

    /// Ask the session's read loop to exit; the socket closes on drop
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.kill.notify_waiters();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Resolves when the session has been killed
    pub async fn killed(&self) {
        // Register before checking the flag so a concurrent kill() between
        // the check and the await cannot be missed
        let mut notified = std::pin::pin!(self.kill.notified());
        notified.as_mut().enable();
        if self.is_killed() {
            return;
        }
        notified.await;
    }

    /// Write raw bytes under the send lock.
    ///
    /// Failures are logged, not propagated: a broken player surfaces in its
    /// own read loop and must not take the sender down with it.
    pub async fn send_bytes(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(bytes).await {
            tracing::trace!(session_id = self.id, error = %e, "write failed");
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::trace!(session_id = self.id, error = %e, "flush failed");
        }
    }

    /// Chunk-encode and send a message with this session's chunk size
    pub async fn send_packet(&self, packet: &Packet) {
        let bytes = create_chunks(packet, self.out_chunk_size());
        self.send_bytes(&bytes).await;
    }

    /// Send an invoke (command) message on the given stream
    pub async fn send_command(&self, stream_id: u32, command: &Command) {
        let packet = Packet::new(CSID_INVOKE, MSG_INVOKE, 0, stream_id, command.encode());
        self.send_packet(&packet).await;
    }

    /// Send an onStatus notification
    pub async fn send_status(&self, stream_id: u32, level: &str, code: &str, description: &str) {
        let command = Command::on_status(level, code, description);
        self.send_command(stream_id, &command).await;
    }

    /// Send a Stream-Begin / Stream-EOF user control event
    pub async fn send_stream_status(&self, event: u16, stream_id: u32) {
        self.send_packet(&message::stream_status(event, stream_id)).await;
    }

    /// Send an AMF0 data message on the given stream
    pub async fn send_data_message(&self, stream_id: u32, data: &DataMessage) {
        let packet = Packet::new(CSID_DATA, MSG_DATA, 0, stream_id, data.encode());
        self.send_packet(&packet).await;
    }

    /// Send the channel's encoded metadata to this player
    pub async fn send_metadata(&self, metadata: &Bytes, timestamp: i64) {
        if metadata.is_empty() {
            return;
        }
        let stream_id = self.play_stream_id();
        let packet = Packet::new(CSID_DATA, MSG_DATA, timestamp, stream_id, metadata.clone());
        self.send_packet(&packet).await;
    }

    /// Send the cached audio sequence header to this player
    pub async fn send_audio_codec_header(&self, codec: u32, header: &Bytes, timestamp: i64) {
        if codec != media::AUDIO_CODEC_AAC && codec != media::AUDIO_CODEC_OPUS {
            return;
        }
        if header.is_empty() {
            return;
        }
        let stream_id = self.play_stream_id();
        let packet = Packet::new(CSID_AUDIO, MSG_AUDIO, timestamp, stream_id, header.clone());
        self.send_packet(&packet).await;
    }

    /// Send the cached video sequence header to this player
    pub async fn send_video_codec_header(&self, codec: u32, header: &Bytes, timestamp: i64) {
        if codec != media::VIDEO_CODEC_AVC && codec != media::VIDEO_CODEC_HEVC {
            return;
        }
        if header.is_empty() {
            return;
        }
        let stream_id = self.play_stream_id();
        let packet = Packet::new(CSID_VIDEO, MSG_VIDEO, timestamp, stream_id, header.clone());
        self.send_packet(&packet).await;
    }

    /// Re-chunk a cached media packet onto this player's play stream
    pub async fn send_cache_packet(&self, cached: &CachedPacket) {
        let stream_id = self.play_stream_id();
        let packet = Packet::new(
            cached.cid,
            cached.message_type,
            cached.timestamp,
            stream_id,
            cached.payload.clone(),
        );
        self.send_packet(&packet).await;
    }

    /// Ping request carrying ms since this session connected
    pub async fn send_ping_request(&self, now_ms: i64) {
        if !self.is_connected() {
            return;
        }
        let elapsed = now_ms - self.connect_time_ms();
        self.send_packet(&message::ping_request(elapsed)).await;
    }

    pub fn play_stream_id(&self) -> u32 {
        self.flags.lock().unwrap().play_stream_id
    }

    /// Snapshot of the fan-out-relevant player flags
    pub fn player_snapshot(&self) -> (bool, bool, bool, bool) {
        let flags = self.flags.lock().unwrap();
        (
            flags.playing,
            flags.paused,
            flags.receive_audio,
            flags.receive_video,
        )
    }
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn make_shared(writer: BoxedWriter) -> SessionShared {
        SessionShared::new(1, "127.0.0.1".parse().unwrap(), writer, 128, 1024)
    }

    #[tokio::test]
    async fn test_send_packet_chunks_with_session_chunk_size() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let shared = make_shared(Box::new(server));

        let payload = Bytes::from(vec![7u8; 300]);
        let packet = Packet::new(CSID_VIDEO, MSG_VIDEO, 10, 1, payload.clone());
        shared.send_packet(&packet).await;
        drop(shared);

        let mut wire = Vec::new();
        let (mut read_half, _write_half) = tokio::io::split(client);
        read_half.read_to_end(&mut wire).await.unwrap();

        let mut decoder = crate::protocol::ChunkDecoder::new();
        let mut buf = bytes::BytesMut::from(&wire[..]);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[tokio::test]
    async fn test_kill_resolves_waiters() {
        let (_client, server) = tokio::io::duplex(1024);
        let shared = std::sync::Arc::new(make_shared(Box::new(server)));

        let waiter = std::sync::Arc::clone(&shared);
        let task = tokio::spawn(async move { waiter.killed().await });
        tokio::task::yield_now().await;

        shared.kill();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("kill must wake the waiter")
            .unwrap();
        assert!(shared.is_killed());

        // A second waiter resolves immediately
        shared.killed().await;
    }

    #[tokio::test]
    async fn test_codec_header_gating() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let shared = make_shared(Box::new(server));

        // Unknown codec ids and empty headers send nothing
        shared.send_audio_codec_header(2, &Bytes::from_static(&[1, 2]), 0).await;
        shared.send_video_codec_header(3, &Bytes::from_static(&[1, 2]), 0).await;
        shared
            .send_audio_codec_header(media::AUDIO_CODEC_AAC, &Bytes::new(), 0)
            .await;
        drop(shared);

        let mut wire = Vec::new();
        let (mut read_half, _write_half) = tokio::io::split(client);
        read_half.read_to_end(&mut wire).await.unwrap();
        assert!(wire.is_empty());
    }
}
