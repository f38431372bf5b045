//! FLV tag-byte helpers for audio and video messages
//!
//! The first payload byte of an RTMP audio message carries the sound format
//! in its high nibble; the first byte of a video message carries the frame
//! type in the high nibble and the codec id in the low nibble. Sequence
//! headers (the decoder configuration packets) are flagged by a zero in the
//! second byte for the codecs that use them.

/// AAC sound format id
pub const AUDIO_CODEC_AAC: u32 = 10;
/// Opus sound format id
pub const AUDIO_CODEC_OPUS: u32 = 13;

/// H.264/AVC codec id
pub const VIDEO_CODEC_AVC: u32 = 7;
/// HEVC codec id
pub const VIDEO_CODEC_HEVC: u32 = 12;

/// Keyframe / seekable frame type
pub const FRAME_TYPE_KEY: u8 = 1;

const AUDIO_CODEC_NAMES: [&str; 17] = [
    "",
    "ADPCM",
    "MP3",
    "LinearLE",
    "Nellymoser16",
    "Nellymoser8",
    "Nellymoser",
    "G711A",
    "G711U",
    "",
    "AAC",
    "Speex",
    "",
    "OPUS",
    "MP3-8K",
    "DeviceSpecific",
    "Uncompressed",
];

const VIDEO_CODEC_NAMES: [&str; 13] = [
    "",
    "Jpeg",
    "Sorenson-H263",
    "ScreenVideo",
    "On2-VP6",
    "On2-VP6-Alpha",
    "ScreenVideo2",
    "H264",
    "",
    "",
    "",
    "",
    "H265",
];

/// Sound format from the first byte of an audio payload
pub fn audio_sound_format(payload: &[u8]) -> u32 {
    ((payload[0] >> 4) & 0x0F) as u32
}

/// An AAC or Opus sequence header: configuration packet flagged by byte 1
pub fn is_audio_sequence_header(payload: &[u8]) -> bool {
    if payload.len() < 2 {
        return false;
    }
    let format = audio_sound_format(payload);
    (format == AUDIO_CODEC_AAC || format == AUDIO_CODEC_OPUS) && payload[1] == 0
}

/// Frame type from the high nibble of the first video byte
pub fn video_frame_type(payload: &[u8]) -> u8 {
    (payload[0] >> 4) & 0x0F
}

/// Codec id from the low nibble of the first video byte
pub fn video_codec_id(payload: &[u8]) -> u32 {
    (payload[0] & 0x0F) as u32
}

/// An AVC or HEVC sequence header: keyframe-flagged configuration packet
pub fn is_video_sequence_header(payload: &[u8]) -> bool {
    if payload.len() < 2 {
        return false;
    }
    let codec = video_codec_id(payload);
    (codec == VIDEO_CODEC_AVC || codec == VIDEO_CODEC_HEVC)
        && video_frame_type(payload) == FRAME_TYPE_KEY
        && payload[1] == 0
}

/// Printable audio codec name for logs
pub fn audio_codec_name(codec: u32) -> &'static str {
    AUDIO_CODEC_NAMES.get(codec as usize).copied().unwrap_or("")
}

/// Printable video codec name for logs
pub fn video_codec_name(codec: u32) -> &'static str {
    VIDEO_CODEC_NAMES.get(codec as usize).copied().unwrap_or("")
}
