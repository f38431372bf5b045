//! Per-connection RTMP session
//!
//! Each accepted socket is driven by one task that owns the read half for
//! its lifetime: handshake, then a chunk read loop that dispatches command,
//! media, data and protocol-control messages. State the rest of the process
//! needs (player flags, publish state, the send half) lives in the shared
//! handle; everything else is private to the task.
//!
//! Role transitions:
//!
//! ```text
//! Handshaking -> Connecting -> Ready -> Publishing -> Ready/closed
//!                                    -> Playing  <-> Idling (publisher comes
//!                                                    and goes) -> Ready
//! ```

pub mod bitrate;
pub mod publisher;
pub mod shared;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::timeout;

use crate::amf::{object, Amf0Value};
use crate::config::validate_stream_id;
use crate::error::{Error, HandshakeError, Result};
use crate::gop::CachedPacket;
use crate::media;
use crate::protocol::chunk::{ChunkDecoder, Packet};
use crate::protocol::constants::*;
use crate::protocol::handshake;
use crate::protocol::message::{self, Command, DataMessage};
use crate::server::ServerContext;

pub use bitrate::BitrateMeter;
pub use shared::{PublishState, SessionFlags, SessionShared};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Parse `a=b&c=d` stream-name parameters
fn parse_stream_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            params.insert(key.to_string(), value.to_string());
        }
    }
    params
}

/// Entry point used by the listeners: build the session, run it, and tear it
/// down no matter how it exits. Panics are caught here, logged, and turned
/// into clean teardown; they never take the process down.
pub async fn run_session<S>(ctx: Arc<ServerContext>, id: u64, ip: IpAddr, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let shared = Arc::new(SessionShared::new(
        id,
        ip,
        Box::new(write_half),
        ctx.config.chunk_size,
        ctx.config.gop_cache_limit,
    ));
    ctx.registry.insert_session(Arc::clone(&shared));

    let mut session = Session::new(Arc::clone(&shared), Arc::clone(&ctx), read_half);

    match std::panic::AssertUnwindSafe(session.run()).catch_unwind().await {
        Ok(Ok(())) => tracing::debug!(session_id = id, ip = %ip, "connection closed"),
        Ok(Err(e)) => tracing::debug!(session_id = id, ip = %ip, error = %e, "connection error"),
        Err(_) => tracing::error!(session_id = id, ip = %ip, "session panicked"),
    }

    session.on_close().await;
    shared.set_disconnected();
    ctx.registry.remove_session(id);
}

/// One RTMP connection's state machine
pub struct Session<R> {
    shared: Arc<SessionShared>,
    ctx: Arc<ServerContext>,
    reader: R,
    read_buf: BytesMut,
    decoder: ChunkDecoder,

    /// Channel id taken from the connect `app` field
    channel: String,
    /// Stream key taken from publish/play
    key: String,
    connected: bool,
    publishing: bool,
    object_encoding: u32,
    has_object_encoding: bool,
    /// Monotonic allocator backing createStream
    stream_counter: u32,
    play_stream_id: u32,
    publish_stream_id: u32,

    /// Window advertised by the peer via Window-Ack-Size
    ack_window: u32,
    in_ack_bytes: u32,
    last_ack: u32,
    bitrate: BitrateMeter,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(shared: Arc<SessionShared>, ctx: Arc<ServerContext>, reader: R) -> Self {
        Self {
            shared,
            ctx,
            reader,
            read_buf: BytesMut::with_capacity(16 * 1024),
            decoder: ChunkDecoder::new(),
            channel: String::new(),
            key: String::new(),
            connected: false,
            publishing: false,
            object_encoding: 0,
            has_object_encoding: false,
            stream_counter: 0,
            play_stream_id: 0,
            publish_stream_id: 0,
            ack_window: 0,
            in_ack_bytes: 0,
            last_ack: 0,
            bitrate: BitrateMeter::new(),
        }
    }

    /// Handshake, then the chunk read loop until the peer goes away, a
    /// protocol violation occurs, the read deadline expires, or the session
    /// is killed
    pub async fn run(&mut self) -> Result<()> {
        self.do_handshake().await?;

        loop {
            while let Some(packet) = self.decoder.decode(&mut self.read_buf)? {
                self.handle_packet(packet).await?;
            }

            let shared = Arc::clone(&self.shared);
            let deadline = Duration::from_millis(PING_TIMEOUT_MS);
            let n = tokio::select! {
                _ = shared.killed() => return Ok(()),
                result = timeout(deadline, self.reader.read_buf(&mut self.read_buf)) => {
                    match result {
                        Err(_) => return Err(Error::Timeout),
                        Ok(Err(e)) => return Err(e.into()),
                        Ok(Ok(0)) => return Ok(()),
                        Ok(Ok(n)) => n,
                    }
                }
            };

            self.account_read(n as u32).await;
        }
    }

    async fn do_handshake(&mut self) -> Result<()> {
        let deadline = Duration::from_millis(PING_TIMEOUT_MS);

        let mut version = [0u8; 1];
        timeout(deadline, self.reader.read_exact(&mut version))
            .await
            .map_err(|_| Error::Timeout)??;
        if version[0] != RTMP_VERSION {
            tracing::debug!(session_id = self.shared.id, version = version[0], "invalid protocol version");
            return Err(HandshakeError::InvalidVersion(version[0]).into());
        }

        let mut c1 = vec![0u8; HANDSHAKE_SIZE];
        timeout(deadline, self.reader.read_exact(&mut c1))
            .await
            .map_err(|_| Error::Timeout)??;

        let response = handshake::generate_s0s1s2(&c1);
        self.shared.send_bytes(&response).await;

        let mut c2 = vec![0u8; HANDSHAKE_SIZE];
        timeout(deadline, self.reader.read_exact(&mut c2))
            .await
            .map_err(|_| Error::Timeout)??;

        tracing::debug!(session_id = self.shared.id, "handshake complete");
        Ok(())
    }

    /// Ack bookkeeping and bitrate metering after a socket read
    async fn account_read(&mut self, n: u32) {
        self.in_ack_bytes = self.in_ack_bytes.wrapping_add(n);
        if self.in_ack_bytes >= 0xF000_0000 {
            self.in_ack_bytes = 0;
            self.last_ack = 0;
        }
        if self.ack_window > 0 && self.in_ack_bytes.wrapping_sub(self.last_ack) >= self.ack_window {
            self.last_ack = self.in_ack_bytes;
            self.shared
                .send_packet(&message::acknowledgement(self.in_ack_bytes))
                .await;
        }

        if let Some(rate) = self.bitrate.add(n as u64, now_ms()) {
            tracing::debug!(session_id = self.shared.id, bitrate = rate, "bitrate updated");
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        match packet.header.message_type {
            MSG_SET_CHUNK_SIZE => {
                if let Some(size) = message::control_value(&packet.payload) {
                    tracing::debug!(session_id = self.shared.id, size, "peer set chunk size");
                    self.decoder.set_chunk_size(size);
                }
            }
            MSG_WINDOW_ACK_SIZE => {
                if let Some(size) = message::control_value(&packet.payload) {
                    tracing::debug!(session_id = self.shared.id, size, "ack window updated");
                    self.ack_window = size;
                }
            }
            MSG_ABORT => {
                if let Some(cid) = message::control_value(&packet.payload) {
                    self.decoder.abort(cid);
                }
            }
            MSG_AUDIO => self.handle_audio(packet).await?,
            MSG_VIDEO => self.handle_video(packet).await?,
            MSG_INVOKE => self.handle_invoke(&packet, false).await?,
            MSG_FLEX_MESSAGE => self.handle_invoke(&packet, true).await?,
            MSG_DATA => self.handle_data(&packet, false).await?,
            MSG_FLEX_STREAM => self.handle_data(&packet, true).await?,
            other => {
                tracing::debug!(session_id = self.shared.id, message_type = other, "ignored message");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_invoke(&mut self, packet: &Packet, flex: bool) -> Result<()> {
        // FLEX_MESSAGE wraps the AMF0 body behind one leading byte
        let payload = if flex {
            if packet.payload.is_empty() {
                return Ok(());
            }
            &packet.payload[1..]
        } else {
            &packet.payload[..]
        };

        let cmd = Command::decode(payload)?;
        tracing::debug!(session_id = self.shared.id, command = %cmd.name, "received invoke");

        match cmd.name.as_str() {
            CMD_CONNECT => self.handle_connect(cmd).await,
            CMD_CREATE_STREAM => self.handle_create_stream(cmd).await,
            CMD_PUBLISH => self.handle_publish(cmd, packet.header.stream_id).await,
            CMD_PLAY => self.handle_play(cmd, packet.header.stream_id).await,
            CMD_PAUSE => self.handle_pause(cmd).await,
            CMD_DELETE_STREAM => {
                let stream_id = cmd.args.first().and_then(|v| v.as_number()).unwrap_or(0.0) as u32;
                self.close_stream_id(stream_id).await
            }
            CMD_CLOSE_STREAM => self.close_stream_id(packet.header.stream_id).await,
            CMD_RECEIVE_AUDIO => {
                let enable = cmd.args.first().and_then(|v| v.as_bool()).unwrap_or(false);
                self.shared.flags.lock().unwrap().receive_audio = enable;
                Ok(())
            }
            CMD_RECEIVE_VIDEO => {
                let enable = cmd.args.first().and_then(|v| v.as_bool()).unwrap_or(false);
                self.shared.flags.lock().unwrap().receive_video = enable;
                Ok(())
            }
            other => {
                tracing::debug!(session_id = self.shared.id, command = other, "unknown command");
                Ok(())
            }
        }
    }

    async fn handle_connect(&mut self, cmd: Command) -> Result<()> {
        self.channel = cmd.object.get_str("app").unwrap_or("").to_string();

        if !validate_stream_id(&self.channel, self.ctx.config.id_max_length) {
            self.log_request(&format!("INVALID CHANNEL '{}'", self.channel));
            return Err(Error::Rejected("invalid channel id".into()));
        }

        self.has_object_encoding = cmd
            .object
            .get("objectEncoding")
            .map(|v| !v.is_undefined())
            .unwrap_or(false);
        self.object_encoding = cmd.object.get_number("objectEncoding").unwrap_or(0.0) as u32;

        let now = now_ms();
        self.connected = true;
        self.shared.set_connected(now);
        self.bitrate.reset(now);

        self.log_request(&format!("CONNECT '{}'", self.channel));

        self.shared
            .send_packet(&message::window_ack_size(WINDOW_ACK_SIZE))
            .await;
        self.shared
            .send_packet(&message::set_peer_bandwidth(
                PEER_BANDWIDTH,
                BANDWIDTH_LIMIT_DYNAMIC,
            ))
            .await;
        self.shared
            .send_packet(&message::set_chunk_size(self.shared.out_chunk_size()))
            .await;

        let properties = object([
            ("fmsVer", Amf0Value::Str("FMS/3,0,1,123".into())),
            ("capabilities", Amf0Value::Number(31.0)),
        ]);
        let info = object([
            ("level", Amf0Value::Str("status".into())),
            ("code", Amf0Value::Str(NC_CONNECT_SUCCESS.into())),
            ("description", Amf0Value::Str("Connection succeeded.".into())),
            (
                "objectEncoding",
                if self.has_object_encoding {
                    Amf0Value::Number(self.object_encoding as f64)
                } else {
                    Amf0Value::Undefined
                },
            ),
        ]);
        let result = Command::result(cmd.transaction_id, properties, vec![info]);
        self.shared.send_command(0, &result).await;

        Ok(())
    }

    async fn handle_create_stream(&mut self, cmd: Command) -> Result<()> {
        self.stream_counter += 1;
        let result = Command::result(
            cmd.transaction_id,
            Amf0Value::Null,
            vec![Amf0Value::Number(self.stream_counter as f64)],
        );
        self.shared.send_command(0, &result).await;
        tracing::debug!(session_id = self.shared.id, stream_id = self.stream_counter, "stream created");
        Ok(())
    }

    async fn handle_publish(&mut self, cmd: Command, packet_stream_id: u32) -> Result<()> {
        let stream_name = cmd.args.first().and_then(|v| v.as_str()).unwrap_or("");
        let key = stream_name.split('?').next().unwrap_or("").to_string();

        if key.is_empty() || !self.connected {
            return Ok(());
        }

        if !validate_stream_id(&key, self.ctx.config.id_max_length) {
            self.shared
                .send_status(
                    self.publish_stream_id,
                    "error",
                    NS_PUBLISH_BAD_NAME,
                    "Invalid stream key provided",
                )
                .await;
            return Err(Error::Rejected("invalid stream key".into()));
        }

        self.key = key;
        self.publish_stream_id = packet_stream_id;

        if self.publishing {
            self.shared
                .send_status(
                    self.publish_stream_id,
                    "error",
                    NS_PUBLISH_BAD_CONNECTION,
                    "Connection already publishing",
                )
                .await;
            return Ok(());
        }

        if self.ctx.registry.is_publishing(&self.channel) {
            self.shared
                .send_status(
                    self.publish_stream_id,
                    "error",
                    NS_PUBLISH_BAD_NAME,
                    "Stream already publishing",
                )
                .await;
            return Err(Error::Rejected("stream already publishing".into()));
        }

        self.log_request(&format!(
            "PUBLISH ({}) '{}'",
            self.publish_stream_id, self.channel
        ));

        // Policy round-trip with no lock held
        let decision = self
            .ctx
            .gate
            .authorize(&self.channel, &self.key, self.shared.ip)
            .await;

        let stream_id = match decision {
            crate::auth::PublishDecision::Accepted { stream_id } => stream_id,
            crate::auth::PublishDecision::Denied => {
                self.log_request("Error: Invalid streaming key provided");
                self.shared
                    .send_status(
                        self.publish_stream_id,
                        "error",
                        NS_PUBLISH_BAD_NAME,
                        "Invalid stream key provided",
                    )
                    .await;
                return Err(Error::Rejected("publish denied".into()));
            }
        };

        // The gate wait is long enough for another publisher to have won
        // the channel in the meantime
        if !self
            .ctx
            .registry
            .set_publisher(&self.channel, &self.key, &stream_id, self.shared.id)
        {
            self.shared
                .send_status(
                    self.publish_stream_id,
                    "error",
                    NS_PUBLISH_BAD_NAME,
                    "Stream already publishing",
                )
                .await;
            return Err(Error::Rejected("stream already publishing".into()));
        }

        {
            let mut state = self.shared.publish.lock().await;
            state.publishing = true;
            state.channel = self.channel.clone();
            state.key = self.key.clone();
            state.stream_id = stream_id;
            state.publish_stream_id = self.publish_stream_id;
        }
        self.publishing = true;

        self.shared
            .send_status(
                self.publish_stream_id,
                "status",
                NS_PUBLISH_START,
                &format!("/{}/{} is now published.", self.channel, self.key),
            )
            .await;

        self.shared.start_idle_players(&self.ctx.registry).await;

        Ok(())
    }

    async fn handle_play(&mut self, cmd: Command, packet_stream_id: u32) -> Result<()> {
        let stream_name = cmd.args.first().and_then(|v| v.as_str()).unwrap_or("");
        let mut parts = stream_name.splitn(2, '?');
        let key = parts.next().unwrap_or("").to_string();

        if let Some(query) = parts.next() {
            let params = parse_stream_query(query);
            let mut flags = self.shared.flags.lock().unwrap();
            flags.gop_play_no = params.get("cache").map(String::as_str) == Some("no");
            flags.gop_play_clear = params.get("cache").map(String::as_str) == Some("clear");
        }

        if key.is_empty() || !self.connected {
            return Ok(());
        }

        self.key = key;
        self.play_stream_id = packet_stream_id;

        let (already_playing, already_idling) = {
            let flags = self.shared.flags.lock().unwrap();
            (flags.playing, flags.idling)
        };
        if already_playing || already_idling {
            self.shared
                .send_status(
                    self.play_stream_id,
                    "error",
                    NS_PLAY_BAD_CONNECTION,
                    "Connection already playing",
                )
                .await;
            return Ok(());
        }

        if !self.ctx.config.can_play(self.shared.ip) {
            self.shared
                .send_status(
                    self.play_stream_id,
                    "error",
                    NS_PLAY_BAD_NAME,
                    "Your net address is not whitelisted for playing",
                )
                .await;
            return Err(Error::Rejected("address not whitelisted".into()));
        }

        self.log_request(&format!("PLAY ({}) '{}'", self.play_stream_id, self.channel));

        // Stream-Begin, Play.Reset, Play.Start, then sample access
        self.shared
            .send_stream_status(UC_STREAM_BEGIN, self.play_stream_id)
            .await;
        self.shared
            .send_status(
                self.play_stream_id,
                "status",
                NS_PLAY_RESET,
                "Playing and resetting stream.",
            )
            .await;
        self.shared
            .send_status(
                self.play_stream_id,
                "status",
                NS_PLAY_START,
                "Started playing stream.",
            )
            .await;
        let sample_access = DataMessage {
            name: CMD_SAMPLE_ACCESS.to_string(),
            values: vec![Amf0Value::Bool(false), Amf0Value::Bool(false)],
        };
        self.shared.send_data_message(0, &sample_access).await;

        {
            let mut flags = self.shared.flags.lock().unwrap();
            flags.channel = self.channel.clone();
            flags.key = self.key.clone();
            flags.play_stream_id = self.play_stream_id;
        }

        match self
            .ctx
            .registry
            .add_player(&self.channel, &self.key, &self.shared)
        {
            crate::registry::AddPlayerOutcome::InvalidKey => {
                self.log_request("Error: Invalid streaming key provided");
                self.shared
                    .send_status(
                        self.play_stream_id,
                        "error",
                        NS_PLAY_BAD_NAME,
                        "Invalid stream key provided",
                    )
                    .await;
                Err(Error::Rejected("invalid stream key".into()))
            }
            crate::registry::AddPlayerOutcome::Active => {
                if let Some(publisher) = self.ctx.registry.get_publisher(&self.channel) {
                    publisher.start_player(&self.shared).await;
                }
                Ok(())
            }
            crate::registry::AddPlayerOutcome::Idle => {
                self.log_request(&format!("PLAY IDLE '{}'", self.channel));
                Ok(())
            }
        }
    }

    async fn handle_pause(&mut self, cmd: Command) -> Result<()> {
        let is_playing = self.shared.flags.lock().unwrap().playing;
        if !is_playing {
            return Ok(());
        }

        let pause = cmd.args.first().and_then(|v| v.as_bool()).unwrap_or(false);
        self.shared.flags.lock().unwrap().paused = pause;

        if pause {
            self.shared
                .send_stream_status(UC_STREAM_EOF, self.play_stream_id)
                .await;
            self.shared
                .send_status(self.play_stream_id, "status", NS_PAUSE_NOTIFY, "Paused live")
                .await;
            self.log_request(&format!("PAUSE '{}'", self.channel));
        } else {
            self.shared
                .send_stream_status(UC_STREAM_BEGIN, self.play_stream_id)
                .await;

            if let Some(publisher) = self.ctx.registry.get_publisher(&self.channel) {
                self.log_request(&format!("RESUME '{}'", self.channel));
                publisher.resume_player(&self.shared).await;
            } else {
                self.log_request(&format!("PLAY IDLE '{}'", self.channel));
            }

            self.shared
                .send_status(
                    self.play_stream_id,
                    "status",
                    NS_UNPAUSE_NOTIFY,
                    "Unpaused live",
                )
                .await;
        }

        Ok(())
    }

    /// Tear down whichever role matches the stream id (deleteStream, or
    /// closeStream with the id taken from the carrying packet)
    async fn close_stream_id(&mut self, stream_id: u32) -> Result<()> {
        if stream_id != 0 && stream_id == self.play_stream_id {
            self.log_request(&format!("PLAY STOP '{}'", self.channel));
            self.ctx.registry.remove_player(&self.channel, &self.shared);
            self.shared
                .send_status(
                    self.play_stream_id,
                    "status",
                    NS_PLAY_STOP,
                    "Stopped playing stream.",
                )
                .await;
            self.play_stream_id = 0;
        }

        if stream_id != 0 && stream_id == self.publish_stream_id {
            if self.publishing {
                self.shared
                    .end_publish(&self.ctx.registry, self.ctx.gate.as_ref(), false)
                    .await;
                self.publishing = false;
            }
            self.publish_stream_id = 0;
        }

        Ok(())
    }

    // ========================================================================
    // Media
    // ========================================================================

    async fn handle_audio(&mut self, packet: Packet) -> Result<()> {
        if packet.payload.is_empty() {
            return Ok(());
        }

        // Snapshot before the publish lock; lock order is registry first
        let players = self.ctx.registry.get_players(&self.channel);
        let mut state = self.shared.publish.lock().await;
        if !state.publishing {
            return Ok(());
        }

        let sound_format = media::audio_sound_format(&packet.payload);
        if state.audio_codec == 0 {
            state.audio_codec = sound_format;
            tracing::debug!(
                session_id = self.shared.id,
                codec = media::audio_codec_name(sound_format),
                "audio codec latched"
            );
        }

        let is_header = media::is_audio_sequence_header(&packet.payload);
        if is_header {
            state.aac_sequence_header = packet.payload.clone();
        }

        state.clock = packet.header.timestamp;
        let cached = CachedPacket {
            cid: CSID_AUDIO,
            message_type: MSG_AUDIO,
            timestamp: state.clock,
            payload: packet.payload,
        };

        if !is_header {
            state.cache.push(cached.clone());
        }

        for player in players {
            let (playing, paused, receive_audio, _) = player.player_snapshot();
            if playing && !paused && receive_audio {
                player.send_cache_packet(&cached).await;
            }
        }

        Ok(())
    }

    async fn handle_video(&mut self, packet: Packet) -> Result<()> {
        if packet.payload.is_empty() {
            return Ok(());
        }

        let players = self.ctx.registry.get_players(&self.channel);
        let mut state = self.shared.publish.lock().await;
        if !state.publishing {
            return Ok(());
        }

        let codec_id = media::video_codec_id(&packet.payload);
        let is_header = media::is_video_sequence_header(&packet.payload);

        if is_header {
            // A new decoder configuration starts a new GOP
            state.avc_sequence_header = packet.payload.clone();
            state.cache.clear();
        }

        if state.video_codec == 0 {
            state.video_codec = codec_id;
            tracing::debug!(
                session_id = self.shared.id,
                codec = media::video_codec_name(codec_id),
                "video codec latched"
            );
        }

        state.clock = packet.header.timestamp;
        let cached = CachedPacket {
            cid: CSID_VIDEO,
            message_type: MSG_VIDEO,
            timestamp: state.clock,
            payload: packet.payload,
        };

        if !is_header {
            state.cache.push(cached.clone());
        }

        for player in players {
            let (playing, paused, _, receive_video) = player.player_snapshot();
            if playing && !paused && receive_video {
                player.send_cache_packet(&cached).await;
            }
        }

        Ok(())
    }

    // ========================================================================
    // Data messages
    // ========================================================================

    async fn handle_data(&mut self, packet: &Packet, flex: bool) -> Result<()> {
        // FLEX_STREAM wraps the AMF0 body behind one leading byte
        let payload = if flex {
            if packet.payload.is_empty() {
                return Ok(());
            }
            &packet.payload[1..]
        } else {
            &packet.payload[..]
        };

        let data = DataMessage::decode(payload)?;
        tracing::debug!(session_id = self.shared.id, name = %data.name, "received data message");

        if data.name == CMD_SET_DATA_FRAME {
            let data_obj = data
                .data_object()
                .cloned()
                .unwrap_or(Amf0Value::Undefined);
            let metadata = DataMessage {
                name: CMD_ON_METADATA.to_string(),
                values: vec![data_obj],
            }
            .encode();

            self.shared.set_metadata(&self.ctx.registry, metadata).await;
        }

        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Idempotent teardown after the read loop exits for any reason
    pub async fn on_close(&mut self) {
        if self.play_stream_id > 0 {
            self.ctx.registry.remove_player(&self.channel, &self.shared);
            self.play_stream_id = 0;
        }

        if self.publish_stream_id > 0 {
            if self.publishing {
                self.shared
                    .end_publish(&self.ctx.registry, self.ctx.gate.as_ref(), true)
                    .await;
                self.publishing = false;
            }
            self.publish_stream_id = 0;
        }

        self.connected = false;
    }

    fn log_request(&self, line: &str) {
        if self.ctx.config.log_requests {
            tracing::info!(session_id = self.shared.id, ip = %self.shared.ip, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::config::Config;
    use crate::registry::ChannelRegistry;
    use bytes::Bytes;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    fn test_context(pairs: &[(&str, &str)]) -> Arc<ServerContext> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::from_lookup(|name| map.get(name).cloned());
        Arc::new(ServerContext {
            config,
            registry: Arc::new(ChannelRegistry::new()),
            gate: Arc::new(AllowAll),
        })
    }

    /// Drives one side of a duplex pipe like an RTMP client would
    struct TestClient {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        decoder: ChunkDecoder,
        buf: BytesMut,
    }

    impl TestClient {
        fn spawn(ctx: &Arc<ServerContext>, id: u64) -> Self {
            let (client, server) = tokio::io::duplex(1024 * 1024);
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                run_session(ctx, id, "127.0.0.1".parse().unwrap(), server).await;
            });

            let (reader, writer) = tokio::io::split(client);
            Self {
                reader,
                writer,
                decoder: ChunkDecoder::new(),
                buf: BytesMut::new(),
            }
        }

        async fn handshake(&mut self) {
            let mut c0c1 = vec![RTMP_VERSION];
            c0c1.extend_from_slice(&[7u8; HANDSHAKE_SIZE]);
            self.writer.write_all(&c0c1).await.unwrap();

            let mut response = vec![0u8; 1 + 2 * HANDSHAKE_SIZE];
            self.reader.read_exact(&mut response).await.unwrap();
            assert_eq!(response[0], RTMP_VERSION);

            // C2 echoes S1
            self.writer
                .write_all(&response[1..1 + HANDSHAKE_SIZE])
                .await
                .unwrap();
        }

        async fn send_packet(&mut self, packet: &Packet) {
            let wire = crate::protocol::create_chunks(packet, 128);
            self.writer.write_all(&wire).await.unwrap();
        }

        async fn send_command(&mut self, stream_id: u32, cmd: &Command) {
            self.send_packet(&Packet::new(CSID_INVOKE, MSG_INVOKE, 0, stream_id, cmd.encode()))
                .await;
        }

        /// Read the next message, applying Set-Chunk-Size transparently
        async fn recv_packet(&mut self) -> Packet {
            loop {
                if let Some(packet) = self.decoder.decode(&mut self.buf).unwrap() {
                    if packet.header.message_type == MSG_SET_CHUNK_SIZE {
                        let size = message::control_value(&packet.payload).unwrap();
                        self.decoder.set_chunk_size(size);
                        continue;
                    }
                    return packet;
                }
                let n = timeout(Duration::from_secs(5), self.reader.read_buf(&mut self.buf))
                    .await
                    .expect("timed out waiting for a packet")
                    .unwrap();
                assert!(n > 0, "server closed the connection");
            }
        }

        /// Read messages until one satisfies the predicate
        async fn recv_until<F>(&mut self, mut want: F) -> Packet
        where
            F: FnMut(&Packet) -> bool,
        {
            loop {
                let packet = self.recv_packet().await;
                if want(&packet) {
                    return packet;
                }
            }
        }

        /// Wait for an onStatus message and return its code
        async fn recv_status_code(&mut self) -> String {
            loop {
                let packet = self.recv_packet().await;
                if packet.header.message_type != MSG_INVOKE {
                    continue;
                }
                let cmd = Command::decode(&packet.payload).unwrap();
                if cmd.name == CMD_ON_STATUS {
                    return cmd.args[0].get_str("code").unwrap_or("").to_string();
                }
            }
        }

        async fn connect(&mut self, app: &str) {
            let cmd = Command {
                name: CMD_CONNECT.into(),
                transaction_id: 1.0,
                object: object([
                    ("app", Amf0Value::Str(app.into())),
                    ("objectEncoding", Amf0Value::Number(0.0)),
                ]),
                args: vec![],
            };
            self.send_command(0, &cmd).await;

            let result = self
                .recv_until(|p| p.header.message_type == MSG_INVOKE)
                .await;
            let response = Command::decode(&result.payload).unwrap();
            assert_eq!(response.name, CMD_RESULT);
            assert_eq!(
                response.args[0].get_str("code"),
                Some(NC_CONNECT_SUCCESS)
            );
        }

        async fn create_stream(&mut self) -> u32 {
            let cmd = Command {
                name: CMD_CREATE_STREAM.into(),
                transaction_id: 2.0,
                object: Amf0Value::Null,
                args: vec![],
            };
            self.send_command(0, &cmd).await;

            let result = self
                .recv_until(|p| p.header.message_type == MSG_INVOKE)
                .await;
            let response = Command::decode(&result.payload).unwrap();
            assert_eq!(response.name, CMD_RESULT);
            response.args[0].as_number().unwrap() as u32
        }

        async fn publish(&mut self, stream_id: u32, stream_name: &str) {
            let cmd = Command {
                name: CMD_PUBLISH.into(),
                transaction_id: 3.0,
                object: Amf0Value::Null,
                args: vec![
                    Amf0Value::Str(stream_name.into()),
                    Amf0Value::Str("live".into()),
                ],
            };
            self.send_command(stream_id, &cmd).await;
        }

        async fn play(&mut self, stream_id: u32, stream_name: &str) {
            let cmd = Command {
                name: CMD_PLAY.into(),
                transaction_id: 4.0,
                object: Amf0Value::Null,
                args: vec![Amf0Value::Str(stream_name.into())],
            };
            self.send_command(stream_id, &cmd).await;
        }

        async fn send_media(&mut self, message_type: u8, stream_id: u32, timestamp: i64, payload: &[u8]) {
            let cid = if message_type == MSG_AUDIO { CSID_AUDIO } else { CSID_VIDEO };
            self.send_packet(&Packet::new(
                cid,
                message_type,
                timestamp,
                stream_id,
                Bytes::copy_from_slice(payload),
            ))
            .await;
        }

        /// Round-trip a createStream as a barrier: its response proves all
        /// previously sent messages were processed
        async fn barrier(&mut self) {
            self.create_stream().await;
        }
    }

    #[tokio::test]
    async fn test_connect_and_create_stream() {
        let ctx = test_context(&[]);
        let mut client = TestClient::spawn(&ctx, 1);

        client.handshake().await;
        client.connect("live").await;
        assert_eq!(client.create_stream().await, 1);
        assert_eq!(client.create_stream().await, 2);
    }

    #[tokio::test]
    async fn test_publish_then_play_delivers_headers_and_media() {
        let ctx = test_context(&[]);

        let mut publisher = TestClient::spawn(&ctx, 1);
        publisher.handshake().await;
        publisher.connect("live").await;
        let pub_stream = publisher.create_stream().await;
        publisher.publish(pub_stream, "key1").await;
        assert_eq!(publisher.recv_status_code().await, NS_PUBLISH_START);

        // AAC sequence header, AVC sequence header, then a keyframe
        publisher
            .send_media(MSG_AUDIO, pub_stream, 0, &[0xAF, 0x00, 0x12, 0x10])
            .await;
        publisher
            .send_media(MSG_VIDEO, pub_stream, 0, &[0x17, 0x00, 0x01, 0x02, 0x03])
            .await;
        publisher
            .send_media(MSG_VIDEO, pub_stream, 40, &[0x17, 0x01, 0xAA, 0xBB])
            .await;
        publisher.barrier().await;

        let mut player = TestClient::spawn(&ctx, 2);
        player.handshake().await;
        player.connect("live").await;
        let play_stream = player.create_stream().await;
        player.play(play_stream, "key1").await;

        // Codec headers first, then the cached keyframe
        let audio = player
            .recv_until(|p| p.header.message_type == MSG_AUDIO)
            .await;
        assert_eq!(&audio.payload[..2], &[0xAF, 0x00]);

        let video_header = player
            .recv_until(|p| p.header.message_type == MSG_VIDEO)
            .await;
        assert_eq!(&video_header.payload[..2], &[0x17, 0x00]);

        let keyframe = player
            .recv_until(|p| p.header.message_type == MSG_VIDEO)
            .await;
        assert_eq!(&keyframe.payload[..], &[0x17, 0x01, 0xAA, 0xBB]);
        assert_eq!(keyframe.header.timestamp, 40);
        assert_eq!(keyframe.header.stream_id, play_stream);

        // Live media keeps flowing after the catch-up
        publisher
            .send_media(MSG_VIDEO, pub_stream, 80, &[0x27, 0x01, 0xCC])
            .await;
        let live = player
            .recv_until(|p| p.header.message_type == MSG_VIDEO)
            .await;
        assert_eq!(&live.payload[..], &[0x27, 0x01, 0xCC]);
        assert_eq!(live.header.timestamp, 80);
    }

    #[tokio::test]
    async fn test_play_key_mismatch_rejected() {
        let ctx = test_context(&[]);

        let mut publisher = TestClient::spawn(&ctx, 1);
        publisher.handshake().await;
        publisher.connect("chanX").await;
        let pub_stream = publisher.create_stream().await;
        publisher.publish(pub_stream, "goodkey").await;
        assert_eq!(publisher.recv_status_code().await, NS_PUBLISH_START);

        let mut player = TestClient::spawn(&ctx, 2);
        player.handshake().await;
        player.connect("chanX").await;
        let play_stream = player.create_stream().await;
        player.play(play_stream, "badkey").await;

        // Play.Reset / Play.Start come first, then the rejection
        loop {
            let code = player.recv_status_code().await;
            if code == NS_PLAY_BAD_NAME {
                break;
            }
            assert!(code == NS_PLAY_RESET || code == NS_PLAY_START, "got {}", code);
        }

        // Publisher is unaffected
        publisher.barrier().await;
    }

    #[tokio::test]
    async fn test_duplicate_publisher_rejected() {
        let ctx = test_context(&[]);

        let mut first = TestClient::spawn(&ctx, 1);
        first.handshake().await;
        first.connect("chanY").await;
        let s1 = first.create_stream().await;
        first.publish(s1, "key").await;
        assert_eq!(first.recv_status_code().await, NS_PUBLISH_START);

        let mut second = TestClient::spawn(&ctx, 2);
        second.handshake().await;
        second.connect("chanY").await;
        let s2 = second.create_stream().await;
        second.publish(s2, "key").await;
        assert_eq!(second.recv_status_code().await, NS_PUBLISH_BAD_NAME);

        // First publisher keeps going
        first.barrier().await;
    }

    #[tokio::test]
    async fn test_pause_and_resume_notifications() {
        let ctx = test_context(&[]);

        let mut publisher = TestClient::spawn(&ctx, 1);
        publisher.handshake().await;
        publisher.connect("live").await;
        let pub_stream = publisher.create_stream().await;
        publisher.publish(pub_stream, "k").await;
        assert_eq!(publisher.recv_status_code().await, NS_PUBLISH_START);
        publisher
            .send_media(MSG_AUDIO, pub_stream, 0, &[0xAF, 0x00, 0x12, 0x10])
            .await;
        publisher.barrier().await;

        let mut player = TestClient::spawn(&ctx, 2);
        player.handshake().await;
        player.connect("live").await;
        let play_stream = player.create_stream().await;
        player.play(play_stream, "k").await;
        player
            .recv_until(|p| p.header.message_type == MSG_AUDIO)
            .await;

        let pause = Command {
            name: CMD_PAUSE.into(),
            transaction_id: 5.0,
            object: Amf0Value::Null,
            args: vec![Amf0Value::Bool(true), Amf0Value::Number(0.0)],
        };
        player.send_command(play_stream, &pause).await;
        assert_eq!(player.recv_status_code().await, NS_PAUSE_NOTIFY);

        let resume = Command {
            name: CMD_PAUSE.into(),
            transaction_id: 6.0,
            object: Amf0Value::Null,
            args: vec![Amf0Value::Bool(false), Amf0Value::Number(0.0)],
        };
        player.send_command(play_stream, &resume).await;

        // Codec headers are re-sent before the unpause notification
        let audio = player
            .recv_until(|p| p.header.message_type == MSG_AUDIO)
            .await;
        assert_eq!(&audio.payload[..2], &[0xAF, 0x00]);
        assert_eq!(player.recv_status_code().await, NS_UNPAUSE_NOTIFY);
    }

    #[tokio::test]
    async fn test_cache_no_skips_replay() {
        let ctx = test_context(&[]);

        let mut publisher = TestClient::spawn(&ctx, 1);
        publisher.handshake().await;
        publisher.connect("live").await;
        let pub_stream = publisher.create_stream().await;
        publisher.publish(pub_stream, "k").await;
        assert_eq!(publisher.recv_status_code().await, NS_PUBLISH_START);
        publisher
            .send_media(MSG_VIDEO, pub_stream, 10, &[0x17, 0x01, 0x01])
            .await;
        publisher.barrier().await;

        let mut player = TestClient::spawn(&ctx, 2);
        player.handshake().await;
        player.connect("live").await;
        let play_stream = player.create_stream().await;
        player.play(play_stream, "k?cache=no").await;

        // Wait until the join is fully processed, then send live media; the
        // first video the player sees must be the live frame, not the
        // cached one
        loop {
            if !ctx.registry.get_players("live").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        publisher
            .send_media(MSG_VIDEO, pub_stream, 50, &[0x27, 0x01, 0x02])
            .await;

        let video = player
            .recv_until(|p| p.header.message_type == MSG_VIDEO)
            .await;
        assert_eq!(&video.payload[..], &[0x27, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_operator_kill_idles_players() {
        let ctx = test_context(&[]);

        let mut publisher = TestClient::spawn(&ctx, 1);
        publisher.handshake().await;
        publisher.connect("chanZ").await;
        let pub_stream = publisher.create_stream().await;
        publisher.publish(pub_stream, "k").await;
        assert_eq!(publisher.recv_status_code().await, NS_PUBLISH_START);

        let mut player = TestClient::spawn(&ctx, 2);
        player.handshake().await;
        player.connect("chanZ").await;
        let play_stream = player.create_stream().await;
        player.play(play_stream, "k").await;
        // Wait until the join is fully processed
        player.recv_status_code().await;
        loop {
            if !ctx.registry.get_players("chanZ").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        crate::auth::bus::apply_command(
            &ctx.registry,
            crate::auth::bus::parse_command("kill-session>chanZ").unwrap(),
        );

        // The player falls back to idle with an UnpublishNotify
        loop {
            let code = player.recv_status_code().await;
            if code == NS_PLAY_UNPUBLISH_NOTIFY {
                break;
            }
        }
        loop {
            if ctx.registry.get_players("chanZ").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ctx.registry.get_idle_players("chanZ").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_channel_closes_session() {
        let ctx = test_context(&[]);
        let mut client = TestClient::spawn(&ctx, 1);
        client.handshake().await;

        let cmd = Command {
            name: CMD_CONNECT.into(),
            transaction_id: 1.0,
            object: object([("app", Amf0Value::Str("bad channel!".into()))]),
            args: vec![],
        };
        client.send_command(0, &cmd).await;

        // The server closes without a status message
        let mut scratch = [0u8; 64];
        loop {
            match timeout(Duration::from_secs(5), client.reader.read(&mut scratch))
                .await
                .expect("expected the server to close")
            {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}
