//! RTMP chunk framing: sans-io decoder and encoder.
//!
//! Chunk layout:
//! ```text
//! +--------------+----------------+--------------------+--------------+
//! | basic header | message header | extended timestamp | chunk data   |
//! | 1..3 bytes   | 0/3/7/11 bytes | 0 or 4 bytes       | <=chunk size |
//! +--------------+----------------+--------------------+--------------+
//! ```
//!
//! The basic header carries the format (2 bits) and the chunk stream id.
//! Format 0 headers carry every message field; formats 1/2/3 inherit the
//! missing fields from the previous chunk on the *same* csid, so the decoder
//! keeps one state record per csid and chunks from different csids may
//! interleave freely.
//!
//! The decoder is fed raw bytes (`push_bytes`) and yields whole messages
//! (`next_message`); it never consumes a partial chunk, so it can be driven
//! directly from arbitrary-sized socket reads.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};

use super::RtmpMessage;
use crate::error::RtmpError;

/// Chunk size every RTMP endpoint starts with until SetChunkSize.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// Desync guard: no message in this protocol legitimately approaches 1 MB.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Timestamp field value that signals a 4-byte extended timestamp.
const EXTENDED_TS_SENTINEL: u32 = 0xFF_FF_FF;

/// Per-csid reassembly state inherited by format 1/2/3 chunks.
#[derive(Debug, Default)]
struct CsidState {
    timestamp: u32,
    timestamp_delta: u32,
    message_length: u32,
    message_type: u8,
    stream_id: u32,
    /// Whether the last header on this csid used the extended timestamp
    /// field; format-3 chunks must then re-read it.
    used_extended_ts: bool,
    /// Payload accumulated for the message under reassembly. Empty iff no
    /// message is in flight on this csid.
    partial: Vec<u8>,
}

/// Sans-io chunk stream decoder.
pub struct ChunkDecoder {
    buf: BytesMut,
    chunk_size: usize,
    streams: HashMap<u32, CsidState>,
    /// Total wire bytes consumed, framing included (window-ack accounting).
    bytes_received: u64,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            bytes_received: 0,
        }
    }

    /// Apply a peer SetChunkSize. Takes effect for the next chunk parsed.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total bytes consumed from the wire so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Parse chunks until a message completes. `Ok(None)` means more bytes
    /// are needed; no input is consumed in that case.
    pub fn next_message(&mut self) -> Result<Option<RtmpMessage>, RtmpError> {
        loop {
            match self.parse_one_chunk()? {
                ChunkOutcome::NeedMore => return Ok(None),
                ChunkOutcome::MessageComplete(msg) => return Ok(Some(msg)),
                ChunkOutcome::Continue => {}
            }
        }
    }

    /// Attempt to parse exactly one chunk from the buffer head.
    fn parse_one_chunk(&mut self) -> Result<ChunkOutcome, RtmpError> {
        let avail = self.buf.len();
        if avail == 0 {
            return Ok(ChunkOutcome::NeedMore);
        }

        // Basic header: fmt + csid, 1 to 3 bytes.
        let b0 = self.buf[0];
        let fmt = b0 >> 6;
        let (csid, basic_len) = match b0 & 0x3F {
            0 => {
                if avail < 2 {
                    return Ok(ChunkOutcome::NeedMore);
                }
                (64 + u32::from(self.buf[1]), 2)
            }
            1 => {
                if avail < 3 {
                    return Ok(ChunkOutcome::NeedMore);
                }
                // Two-byte csid is little-endian.
                (
                    64 + u32::from(self.buf[1]) + 256 * u32::from(self.buf[2]),
                    3,
                )
            }
            n => (u32::from(n), 1),
        };

        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if avail < basic_len + header_len {
            return Ok(ChunkOutcome::NeedMore);
        }
        let header = &self.buf[basic_len..basic_len + header_len];

        // Formats 1-3 inherit from prior state; a chunk with nothing to
        // inherit from is a framing violation.
        if fmt != 0 && !self.streams.contains_key(&csid) {
            return Err(RtmpError::Protocol(format!(
                "format {} chunk on csid {} with no prior format-0 chunk",
                fmt, csid
            )));
        }

        // Raw timestamp field (absolute for fmt 0, delta for fmt 1/2).
        let raw_ts = if fmt <= 2 {
            read_u24(&header[0..3])
        } else {
            0
        };

        // Extended timestamp: present when the 3-byte field saturates, and
        // re-read by format-3 chunks whose predecessor used it.
        let ext_present = if fmt <= 2 {
            raw_ts == EXTENDED_TS_SENTINEL
        } else {
            self.streams
                .get(&csid)
                .map(|s| s.used_extended_ts)
                .unwrap_or(false)
        };
        let ext_len = if ext_present { 4 } else { 0 };
        if avail < basic_len + header_len + ext_len {
            return Ok(ChunkOutcome::NeedMore);
        }
        let ext_ts = if ext_present {
            let raw = &self.buf[basic_len + header_len..basic_len + header_len + 4];
            u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
        } else {
            0
        };

        // Resolve the full message header against stored state (without
        // mutating anything until the whole chunk is buffered).
        let state = self.streams.get(&csid);
        let message_length = match fmt {
            0 | 1 => read_u24(&header[3..6]),
            _ => state.map(|s| s.message_length).unwrap_or(0),
        };
        if message_length as usize > MAX_MESSAGE_SIZE {
            return Err(RtmpError::MessageTooLarge(message_length as usize));
        }
        let message_type = match fmt {
            0 | 1 => header[6],
            _ => state.map(|s| s.message_type).unwrap_or(0),
        };
        let stream_id = match fmt {
            // message_stream_id is the one little-endian field in the header.
            0 => u32::from_le_bytes([header[7], header[8], header[9], header[10]]),
            _ => state.map(|s| s.stream_id).unwrap_or(0),
        };

        let already = state.map(|s| s.partial.len()).unwrap_or(0);
        let continuing = already > 0;
        let remaining = (message_length as usize).saturating_sub(already);
        let take = remaining.min(self.chunk_size);

        let total = basic_len + header_len + ext_len + take;
        if avail < total {
            return Ok(ChunkOutcome::NeedMore);
        }

        // Whole chunk buffered: consume it and commit state.
        self.buf.advance(basic_len + header_len + ext_len);
        let payload = self.buf.split_to(take);
        self.bytes_received += total as u64;

        let state = self.streams.entry(csid).or_default();
        match fmt {
            0 => {
                state.timestamp = if ext_present { ext_ts } else { raw_ts };
                state.timestamp_delta = 0;
                state.message_length = message_length;
                state.message_type = message_type;
                state.stream_id = stream_id;
                state.used_extended_ts = ext_present;
            }
            1 | 2 => {
                let delta = if ext_present { ext_ts } else { raw_ts };
                state.timestamp = state.timestamp.wrapping_add(delta);
                state.timestamp_delta = delta;
                state.message_length = message_length;
                state.message_type = message_type;
                state.used_extended_ts = ext_present;
            }
            _ => {
                // A format-3 chunk either continues the in-flight message
                // (timestamp unchanged) or starts a new message repeating the
                // previous delta.
                if !continuing {
                    state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
                }
            }
        }

        state.partial.extend_from_slice(&payload);
        if state.partial.len() >= state.message_length as usize {
            let msg = RtmpMessage::new(
                state.message_type,
                state.stream_id,
                state.timestamp,
                std::mem::take(&mut state.partial),
            );
            return Ok(ChunkOutcome::MessageComplete(msg));
        }
        Ok(ChunkOutcome::Continue)
    }
}

enum ChunkOutcome {
    /// Not enough buffered bytes for the chunk at the buffer head.
    NeedMore,
    /// A chunk was consumed; its message is still incomplete.
    Continue,
    MessageComplete(RtmpMessage),
}

fn read_u24(b: &[u8]) -> u32 {
    (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2])
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Chunk stream encoder. Emits every message as one format-0 chunk followed
/// by format-3 continuations, which every decoder accepts.
pub struct ChunkEncoder {
    chunk_size: usize,
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Apply our own SetChunkSize (announce it to the peer separately).
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Serialize `msg` onto `csid` as wire chunks.
    pub fn encode(&self, csid: u32, msg: &RtmpMessage) -> Vec<u8> {
        let extended = msg.timestamp >= EXTENDED_TS_SENTINEL;
        let mut out = Vec::with_capacity(msg.payload.len() + 18);

        // Format-0 header.
        push_basic_header(&mut out, 0, csid);
        if extended {
            push_u24(&mut out, EXTENDED_TS_SENTINEL);
        } else {
            push_u24(&mut out, msg.timestamp);
        }
        push_u24(&mut out, msg.payload.len() as u32);
        out.push(msg.type_id);
        out.extend_from_slice(&msg.stream_id.to_le_bytes());
        if extended {
            out.extend_from_slice(&msg.timestamp.to_be_bytes());
        }

        let mut offset = 0;
        let mut first = true;
        while offset < msg.payload.len() || first {
            if !first {
                // Continuation: format-3 basic header, and the extended
                // timestamp again when the message uses one.
                push_basic_header(&mut out, 3, csid);
                if extended {
                    out.extend_from_slice(&msg.timestamp.to_be_bytes());
                }
            }
            let take = (msg.payload.len() - offset).min(self.chunk_size);
            out.extend_from_slice(&msg.payload[offset..offset + take]);
            offset += take;
            first = false;
        }

        out
    }
}

fn push_basic_header(out: &mut Vec<u8>, fmt: u8, csid: u32) {
    match csid {
        2..=63 => out.push((fmt << 6) | csid as u8),
        64..=319 => {
            out.push(fmt << 6);
            out.push((csid - 64) as u8);
        }
        _ => {
            out.push((fmt << 6) | 1);
            let v = (csid - 64) as u16;
            // Three-byte form stores csid-64 little-endian.
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

fn push_u24(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}
