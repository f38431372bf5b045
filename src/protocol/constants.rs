//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)

/// RTMP version number (always 3 for standard RTMP)
pub const RTMP_VERSION: u8 = 3;

/// C1/S1/C2/S2 handshake packet size
pub const HANDSHAKE_SIZE: usize = 1536;

/// Default chunk size (per RTMP spec); also the floor for configured values
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Maximum message size accepted from a peer (sanity limit)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Timestamps at or above this value use the 4-byte extended timestamp field
pub const EXTENDED_TIMESTAMP: u32 = 0xFFFFFF;

/// Interval between server ping requests (milliseconds)
pub const PING_TIME_MS: u64 = 30_000;

/// Socket read deadline; expiry is fatal to the session (milliseconds)
pub const PING_TIMEOUT_MS: u64 = 60_000;

/// Fixed per-entry overhead accounted for each GOP cache packet
pub const PACKET_BASE_SIZE: u64 = 65;

/// Window-Ack size advertised to clients during connect
pub const WINDOW_ACK_SIZE: u32 = 5_000_000;

/// Peer bandwidth advertised to clients during connect
pub const PEER_BANDWIDTH: u32 = 5_000_000;

// ============================================================================
// Chunk stream IDs (the per-direction multiplexing key, 2-65599)
// ============================================================================

/// Protocol control messages (Set Chunk Size, Ack, ping events)
pub const CSID_PROTOCOL: u32 = 2;

/// Command messages (connect, createStream, publish, play, onStatus)
pub const CSID_INVOKE: u32 = 3;

/// Audio data
pub const CSID_AUDIO: u32 = 4;

/// Video data
pub const CSID_VIDEO: u32 = 5;

/// Data messages (onMetaData, |RtmpSampleAccess)
pub const CSID_DATA: u32 = 6;

// ============================================================================
// Message type IDs
// ============================================================================

/// Set Chunk Size (1) - protocol control
pub const MSG_SET_CHUNK_SIZE: u8 = 1;

/// Abort Message (2) - protocol control
pub const MSG_ABORT: u8 = 2;

/// Acknowledgement (3) - protocol control
pub const MSG_ACK: u8 = 3;

/// User Control Message (4)
pub const MSG_USER_CONTROL: u8 = 4;

/// Window Acknowledgement Size (5) - protocol control
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;

/// Set Peer Bandwidth (6) - protocol control
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;

/// Audio Message (8)
pub const MSG_AUDIO: u8 = 8;

/// Video Message (9)
pub const MSG_VIDEO: u8 = 9;

/// AMF3 Data Message (15)
pub const MSG_FLEX_STREAM: u8 = 15;

/// AMF3 Command Message (17)
pub const MSG_FLEX_MESSAGE: u8 = 17;

/// AMF0 Data Message (18) - @setDataFrame, onMetaData
pub const MSG_DATA: u8 = 18;

/// AMF0 Command Message (20) - connect, play, publish, etc.
pub const MSG_INVOKE: u8 = 20;

/// Aggregate Message (22). Anything above this code is a protocol violation.
pub const MSG_METADATA: u8 = 22;

// ============================================================================
// User control event types
// ============================================================================

/// Stream Begin - server sends when a stream becomes functional
pub const UC_STREAM_BEGIN: u16 = 0;

/// Stream EOF - server sends when playback ends
pub const UC_STREAM_EOF: u16 = 1;

/// Stream Dry - no more data available
pub const UC_STREAM_DRY: u16 = 2;

/// Set Buffer Length - client tells server its buffer size
pub const UC_SET_BUFFER_LENGTH: u16 = 3;

/// Ping Request - server pings client
pub const UC_PING_REQUEST: u16 = 6;

/// Ping Response - client responds to ping
pub const UC_PING_RESPONSE: u16 = 7;

// ============================================================================
// Peer bandwidth limit types
// ============================================================================

/// Dynamic - can be hard or soft depending on prior state
pub const BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;

// ============================================================================
// Command names
// ============================================================================

pub const CMD_CONNECT: &str = "connect";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_CLOSE_STREAM: &str = "closeStream";
pub const CMD_PLAY: &str = "play";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_PAUSE: &str = "pause";
pub const CMD_RECEIVE_AUDIO: &str = "receiveAudio";
pub const CMD_RECEIVE_VIDEO: &str = "receiveVideo";

pub const CMD_RESULT: &str = "_result";
pub const CMD_ON_STATUS: &str = "onStatus";

pub const CMD_SET_DATA_FRAME: &str = "@setDataFrame";
pub const CMD_ON_METADATA: &str = "onMetaData";
pub const CMD_SAMPLE_ACCESS: &str = "|RtmpSampleAccess";

// ============================================================================
// NetStream status codes
// ============================================================================

pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NS_PUBLISH_BAD_NAME: &str = "NetStream.Publish.BadName";
pub const NS_PUBLISH_BAD_CONNECTION: &str = "NetStream.Publish.BadConnection";
pub const NS_UNPUBLISH_SUCCESS: &str = "NetStream.Unpublish.Success";
pub const NS_PLAY_START: &str = "NetStream.Play.Start";
pub const NS_PLAY_RESET: &str = "NetStream.Play.Reset";
pub const NS_PLAY_STOP: &str = "NetStream.Play.Stop";
pub const NS_PLAY_BAD_NAME: &str = "NetStream.Play.BadName";
pub const NS_PLAY_BAD_CONNECTION: &str = "NetStream.Play.BadConnection";
pub const NS_PLAY_UNPUBLISH_NOTIFY: &str = "NetStream.Play.UnpublishNotify";
pub const NS_PAUSE_NOTIFY: &str = "NetStream.Pause.Notify";
pub const NS_UNPAUSE_NOTIFY: &str = "NetStream.Unpause.Notify";

pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";
