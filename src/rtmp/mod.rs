//! RTMP transport: handshake, chunk codec, and the client session FSM.
//!
//! Layering (Adobe RTMP spec):
//! - a TCP byte stream carries *chunks*;
//! - chunks from interleaved chunk streams (csids) reassemble into
//!   *messages* `(type_id, stream_id, timestamp, payload)`;
//! - command messages carry AMF0 payloads, media messages carry FLV tag
//!   bodies.
//!
//! `chunk` is sans-io (feed bytes in, take messages out) so the framing is
//! testable without sockets; `session` owns the TCP endpoint and drives the
//! publish/play dialogs over it.

pub mod chunk;
pub mod handshake;
pub mod session;
#[cfg(test)]
pub(crate) mod testserver;

use bytes::Bytes;

// Message type ids (RTMP spec §5.4, §6.2, §7).
pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_AMF0_DATA: u8 = 18;
pub const MSG_AMF0_COMMAND: u8 = 20;

// User-control event types (RTMP spec §7.1.7).
pub const EVENT_STREAM_BEGIN: u16 = 0;
pub const EVENT_SET_BUFFER_LENGTH: u16 = 3;
pub const EVENT_PING_REQUEST: u16 = 6;
pub const EVENT_PING_RESPONSE: u16 = 7;

// Chunk stream ids this client writes on.
pub const CSID_CONTROL: u32 = 2;
pub const CSID_COMMAND: u32 = 3;
pub const CSID_PUBLISH: u32 = 4;
pub const CSID_PLAY: u32 = 8;
pub const CSID_AUDIO: u32 = 4;
pub const CSID_VIDEO: u32 = 6;

/// One reassembled RTMP message.
#[derive(Debug, Clone, PartialEq)]
pub struct RtmpMessage {
    pub type_id: u8,
    pub stream_id: u32,
    /// Milliseconds, absolute within the chunk stream epoch.
    pub timestamp: u32,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(type_id: u8, stream_id: u32, timestamp: u32, payload: Vec<u8>) -> Self {
        Self {
            type_id,
            stream_id,
            timestamp,
            payload: Bytes::from(payload),
        }
    }
}
