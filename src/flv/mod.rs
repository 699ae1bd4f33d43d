//! FLV tag bodies as they ride inside RTMP media messages.
//!
//! RTMP never carries the FLV file header; only the per-frame tag body
//! format survives: a one-byte video/audio descriptor, a packet-type byte
//! for AVC/AAC, then the codec payload. `avc` covers H.264
//! (AVCDecoderConfigurationRecord + length-prefixed NALUs), `aac` covers
//! AAC (AudioSpecificConfig + raw access units), `script` covers the
//! onMetaData script-data payload.

pub mod aac;
pub mod avc;
pub mod script;

// Video descriptor nibbles.
pub const FRAME_TYPE_KEY: u8 = 1;
pub const FRAME_TYPE_INTER: u8 = 2;
pub const CODEC_ID_AVC: u8 = 7;

// AVC packet types.
pub const AVC_PACKET_SEQUENCE_HEADER: u8 = 0;
pub const AVC_PACKET_NALU: u8 = 1;
pub const AVC_PACKET_END_OF_SEQUENCE: u8 = 2;

// Audio descriptor fields.
pub const SOUND_FORMAT_AAC: u8 = 10;

// AAC packet types.
pub const AAC_PACKET_SEQUENCE_HEADER: u8 = 0;
pub const AAC_PACKET_RAW: u8 = 1;
