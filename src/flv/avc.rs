//! H.264/AVC FLV tag bodies: decoder configuration record and NALU frames.
//!
//! Video tag body layout:
//! ```text
//! byte 0    (frame_type << 4) | codec_id      0x17 key / 0x27 inter for AVC
//! byte 1    avc_packet_type                   0 seq header, 1 NALU, 2 EOS
//! bytes 2-4 composition time offset           signed 24-bit, big-endian, ms
//! bytes 5+  payload
//! ```
//! A sequence-header payload is the AVCDecoderConfigurationRecord; a NALU
//! payload is a concatenation of `(length_prefix, nal_unit)` with the prefix
//! width fixed by the record's `nalu_length_size`.

use crate::error::FlvError;

use super::{AVC_PACKET_NALU, AVC_PACKET_SEQUENCE_HEADER, CODEC_ID_AVC, FRAME_TYPE_INTER, FRAME_TYPE_KEY};

/// NAL unit type for an IDR slice: a true keyframe regardless of what the
/// FLV frame-type nibble claims.
pub const NAL_TYPE_IDR: u8 = 5;

/// The length-prefix width we emit. 1 and 2 are legal but 4 is universal.
pub const DEFAULT_NALU_LENGTH_SIZE: u8 = 4;

/// AVCDecoderConfigurationRecord (ISO 14496-15 §5.2.4.1).
#[derive(Debug, Clone, PartialEq)]
pub struct AvcDecoderConfig {
    pub profile: u8,
    pub profile_compat: u8,
    pub level: u8,
    /// 1, 2, or 4.
    pub nalu_length_size: u8,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

impl AvcDecoderConfig {
    /// Build a record from one SPS/PPS pair, profile and level taken from
    /// the SPS itself.
    pub fn from_parameter_sets(sps: Vec<u8>, pps: Vec<u8>) -> Result<Self, FlvError> {
        if sps.len() < 4 {
            return Err(FlvError::BadSequenceHeader("SPS shorter than 4 bytes".into()));
        }
        Ok(Self {
            profile: sps[1],
            profile_compat: sps[2],
            level: sps[3],
            nalu_length_size: DEFAULT_NALU_LENGTH_SIZE,
            sps: vec![sps],
            pps: vec![pps],
        })
    }

    /// Serialize the configuration record.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.push(1); // configuration_version
        out.push(self.profile);
        out.push(self.profile_compat);
        out.push(self.level);
        out.push(0xFC | (self.nalu_length_size - 1)); // reserved | size-1
        out.push(0xE0 | (self.sps.len() as u8 & 0x1F)); // reserved | num_sps
        for sps in &self.sps {
            out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
            out.extend_from_slice(sps);
        }
        out.push(self.pps.len() as u8);
        for pps in &self.pps {
            out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
            out.extend_from_slice(pps);
        }
        out
    }

    /// Parse a configuration record.
    pub fn parse(data: &[u8]) -> Result<Self, FlvError> {
        if data.len() < 7 {
            return Err(FlvError::BadSequenceHeader("record shorter than 7 bytes".into()));
        }
        if data[0] != 1 {
            return Err(FlvError::BadSequenceHeader(format!(
                "configuration version {}",
                data[0]
            )));
        }
        let nalu_length_size = (data[4] & 0x03) + 1;
        if !matches!(nalu_length_size, 1 | 2 | 4) {
            return Err(FlvError::BadSequenceHeader(format!(
                "nalu length size {}",
                nalu_length_size
            )));
        }

        let mut pos = 5;
        let num_sps = (data[pos] & 0x1F) as usize;
        pos += 1;
        let mut sps = Vec::with_capacity(num_sps);
        for _ in 0..num_sps {
            sps.push(read_prefixed(data, &mut pos)?);
        }

        if pos >= data.len() {
            return Err(FlvError::BadSequenceHeader("missing PPS count".into()));
        }
        let num_pps = data[pos] as usize;
        pos += 1;
        let mut pps = Vec::with_capacity(num_pps);
        for _ in 0..num_pps {
            pps.push(read_prefixed(data, &mut pos)?);
        }

        Ok(Self {
            profile: data[1],
            profile_compat: data[2],
            level: data[3],
            nalu_length_size,
            sps,
            pps,
        })
    }
}

fn read_prefixed(data: &[u8], pos: &mut usize) -> Result<Vec<u8>, FlvError> {
    if data.len() < *pos + 2 {
        return Err(FlvError::Truncated);
    }
    let len = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
    *pos += 2;
    if data.len() < *pos + len {
        return Err(FlvError::Truncated);
    }
    let out = data[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Video tag bodies
// ---------------------------------------------------------------------------

/// The fixed prefix of an AVC video tag body.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTagHeader {
    pub frame_type: u8,
    pub codec_id: u8,
    pub avc_packet_type: u8,
    /// Composition time offset (pts - dts), milliseconds.
    pub composition_time: i32,
}

/// Byte length of the AVC video tag prefix.
pub const VIDEO_TAG_HEADER_LEN: usize = 5;

/// Split an AVC video tag body into its header and payload.
pub fn parse_video_tag(body: &[u8]) -> Result<(VideoTagHeader, &[u8]), FlvError> {
    if body.is_empty() {
        return Err(FlvError::Truncated);
    }
    let codec_id = body[0] & 0x0F;
    if codec_id != CODEC_ID_AVC {
        return Err(FlvError::UnsupportedCodec(codec_id));
    }
    if body.len() < VIDEO_TAG_HEADER_LEN {
        return Err(FlvError::Truncated);
    }
    let header = VideoTagHeader {
        frame_type: body[0] >> 4,
        codec_id,
        avc_packet_type: body[1],
        composition_time: sign_extend_24(&body[2..5]),
    };
    Ok((header, &body[VIDEO_TAG_HEADER_LEN..]))
}

/// Build an AVC video tag body around an arbitrary payload.
pub fn build_video_tag(keyframe: bool, avc_packet_type: u8, composition_time: i32, payload: &[u8]) -> Vec<u8> {
    let frame_type = if keyframe { FRAME_TYPE_KEY } else { FRAME_TYPE_INTER };
    let mut out = Vec::with_capacity(VIDEO_TAG_HEADER_LEN + payload.len());
    out.push((frame_type << 4) | CODEC_ID_AVC);
    out.push(avc_packet_type);
    let cts = composition_time.to_be_bytes();
    out.extend_from_slice(&cts[1..4]);
    out.extend_from_slice(payload);
    out
}

/// Sequence-header tag body: `17 00 00 00 00` + configuration record.
pub fn build_sequence_header_tag(config: &AvcDecoderConfig) -> Vec<u8> {
    build_video_tag(true, AVC_PACKET_SEQUENCE_HEADER, 0, &config.encode())
}

/// Signed 24-bit big-endian with sign extension to i32.
fn sign_extend_24(b: &[u8]) -> i32 {
    let raw = (i32::from(b[0]) << 16) | (i32::from(b[1]) << 8) | i32::from(b[2]);
    (raw << 8) >> 8
}

// ---------------------------------------------------------------------------
// NALU framing
// ---------------------------------------------------------------------------

/// Concatenate NAL units with `length_size`-byte big-endian prefixes.
pub fn encode_nalus(nalus: &[Vec<u8>], length_size: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(nalus.iter().map(|n| n.len() + length_size as usize).sum());
    for nal in nalus {
        match length_size {
            1 => out.push(nal.len() as u8),
            2 => out.extend_from_slice(&(nal.len() as u16).to_be_bytes()),
            _ => out.extend_from_slice(&(nal.len() as u32).to_be_bytes()),
        }
        out.extend_from_slice(nal);
    }
    out
}

/// Split a length-prefixed NALU concatenation back into NAL units.
pub fn decode_nalus(data: &[u8], length_size: u8) -> Result<Vec<Vec<u8>>, FlvError> {
    let ls = length_size as usize;
    let mut pos = 0;
    let mut nalus = Vec::new();
    while pos < data.len() {
        if data.len() < pos + ls {
            return Err(FlvError::Truncated);
        }
        let mut len = 0usize;
        for &b in &data[pos..pos + ls] {
            len = (len << 8) | b as usize;
        }
        pos += ls;
        if data.len() < pos + len {
            return Err(FlvError::Truncated);
        }
        nalus.push(data[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(nalus)
}

/// Keyframe iff the FLV frame type says so OR any NAL is an IDR slice. Both
/// checks are required: real encoders disagree with their own muxers.
pub fn is_keyframe(header: &VideoTagHeader, nalus: &[Vec<u8>]) -> bool {
    header.frame_type == FRAME_TYPE_KEY
        || nalus
            .iter()
            .any(|n| !n.is_empty() && (n[0] & 0x1F) == NAL_TYPE_IDR)
}

/// Demuxed AVC frame: NAL units plus the resolved keyframe flag.
#[derive(Debug, Clone)]
pub struct AvcFrame {
    pub nalus: Vec<Vec<u8>>,
    pub is_keyframe: bool,
    pub composition_time: i32,
}

/// Demux a NALU-type video tag body into an `AvcFrame`.
pub fn parse_nalu_tag(body: &[u8], length_size: u8) -> Result<AvcFrame, FlvError> {
    let (header, payload) = parse_video_tag(body)?;
    if header.avc_packet_type != AVC_PACKET_NALU {
        return Err(FlvError::BadSequenceHeader(format!(
            "expected NALU packet, got type {}",
            header.avc_packet_type
        )));
    }
    let nalus = decode_nalus(payload, length_size)?;
    let keyframe = is_keyframe(&header, &nalus);
    Ok(AvcFrame {
        nalus,
        is_keyframe: keyframe,
        composition_time: header.composition_time,
    })
}
