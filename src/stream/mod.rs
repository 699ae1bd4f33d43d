//! Encrypted stream orchestrators: the policy layer that composes the RTMP
//! session, the FLV tag codecs, the collection engine, and the KAS client.
//!
//! The publisher rotates the collection before every video keyframe and
//! announces each rotation twice: in onMetaData (`ntdf_header`) and with an
//! in-band header frame that survives intermediaries which strip script
//! data. The subscriber accepts either path.

pub mod publisher;
pub mod subscriber;

use crate::error::FlvError;
use crate::flv::avc::{self, NAL_TYPE_IDR};
use crate::flv::{AVC_PACKET_END_OF_SEQUENCE, AVC_PACKET_SEQUENCE_HEADER, CODEC_ID_AVC};

/// Magic at offset 5 of the in-band header frame.
pub const NTDF_FRAME_MAGIC: [u8; 4] = *b"NTDF";

/// Orchestrator lifecycle, observable through a `tokio::sync::watch`
/// channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamState {
    Idle,
    Initializing,
    Ready,
    /// Subscriber only: connected, no collection header seen yet.
    WaitingForHeader,
    Streaming,
    Playing,
    Error(String),
}

/// A media timestamp as (value, timescale). Kept rational end to end and
/// reduced to milliseconds only where RTMP headers are composed, so long
/// sessions do not accumulate float drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaTimestamp {
    pub value: u64,
    pub timescale: u32,
}

impl MediaTimestamp {
    pub fn new(value: u64, timescale: u32) -> Self {
        debug_assert!(timescale > 0);
        Self { value, timescale }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self {
            value: ms,
            timescale: 1_000,
        }
    }

    pub fn as_millis(&self) -> u64 {
        if self.timescale == 0 {
            return 0;
        }
        self.value * 1_000 / u64::from(self.timescale)
    }
}

/// One encoded video frame handed to the publisher: length-prefixed NALU
/// data plus its keyframe flag and presentation time.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub payload: Vec<u8>,
    pub is_keyframe: bool,
    pub pts: MediaTimestamp,
}

impl VideoFrame {
    /// Build a frame from raw NAL units. The keyframe flag is derived from
    /// the NAL types (IDR present).
    pub fn from_nalus(nalus: &[Vec<u8>], pts: MediaTimestamp) -> Self {
        let is_keyframe = nalus
            .iter()
            .any(|n| !n.is_empty() && (n[0] & 0x1F) == NAL_TYPE_IDR);
        Self {
            payload: avc::encode_nalus(nalus, avc::DEFAULT_NALU_LENGTH_SIZE),
            is_keyframe,
            pts,
        }
    }
}

/// One encoded AAC access unit handed to the publisher.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub payload: Vec<u8>,
    pub pts: MediaTimestamp,
}

// ---------------------------------------------------------------------------
// In-band NTDF header frame
// ---------------------------------------------------------------------------

/// Build the in-band header frame: a fake AVC tag the ingest relays
/// untouched. `avc_packet_type` 0x02 normally means end-of-sequence; the
/// magic at offset 5 is what actually identifies the frame.
pub fn build_header_frame(header_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + 4 + 2 + header_bytes.len());
    out.push(0x17);
    out.push(AVC_PACKET_END_OF_SEQUENCE);
    out.extend_from_slice(&[0x00, 0x00, 0x00]);
    out.extend_from_slice(&NTDF_FRAME_MAGIC);
    out.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(header_bytes);
    out
}

/// Probe a video tag body for the in-band header frame. Any AVC packet type
/// is accepted; only the magic decides. Returns the header bytes.
pub fn parse_header_frame(body: &[u8]) -> Option<&[u8]> {
    if body.len() < 11 || body[0] & 0x0F != CODEC_ID_AVC {
        return None;
    }
    if body[5..9] != NTDF_FRAME_MAGIC {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([body[9], body[10]]));
    body.get(11..11 + len)
}

/// Whether a video tag body is an AVC sequence header (which travels in the
/// clear and must not reach the decryptor).
pub fn is_avc_sequence_header(body: &[u8]) -> Result<bool, FlvError> {
    if body.is_empty() {
        return Err(FlvError::Truncated);
    }
    if body[0] & 0x0F != CODEC_ID_AVC {
        return Err(FlvError::UnsupportedCodec(body[0] & 0x0F));
    }
    Ok(body.len() >= 2 && body[1] == AVC_PACKET_SEQUENCE_HEADER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_frame_layout() {
        let header = vec![0x4C, 0x31, 0x4C, 1, 2, 3, 4, 5];
        let frame = build_header_frame(&header);
        assert_eq!(&frame[..5], &[0x17, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&frame[5..9], b"NTDF");
        assert_eq!(&frame[9..11], &[0x00, 0x08]);
        assert_eq!(&frame[11..], &header[..]);
    }

    #[test]
    fn test_header_frame_roundtrip() {
        let header = vec![0xAB; 300];
        let frame = build_header_frame(&header);
        assert_eq!(parse_header_frame(&frame).unwrap(), &header[..]);
    }

    #[test]
    fn test_header_frame_any_packet_type_accepted() {
        // The magic decides, not the packet type byte.
        let header = vec![1, 2, 3];
        let mut frame = build_header_frame(&header);
        frame[1] = 0x01;
        assert_eq!(parse_header_frame(&frame).unwrap(), &header[..]);
    }

    #[test]
    fn test_ordinary_nalu_frame_not_matched() {
        // A NALU frame whose first NAL happens to be 4 bytes: offset 5..9
        // holds the length prefix, not the magic.
        let body = crate::flv::avc::build_video_tag(
            false,
            crate::flv::AVC_PACKET_NALU,
            0,
            &crate::flv::avc::encode_nalus(&[vec![0x41, 1, 2, 3]], 4),
        );
        assert!(parse_header_frame(&body).is_none());
    }

    #[test]
    fn test_truncated_header_frame_rejected() {
        let frame = build_header_frame(&[9u8; 50]);
        assert!(parse_header_frame(&frame[..frame.len() - 1]).is_none());
    }

    #[test]
    fn test_sequence_header_probe() {
        let config = crate::flv::avc::AvcDecoderConfig::from_parameter_sets(
            vec![0x67, 0x64, 0x00, 0x1F],
            vec![0x68, 0xEB],
        )
        .unwrap();
        let tag = crate::flv::avc::build_sequence_header_tag(&config);
        assert!(is_avc_sequence_header(&tag).unwrap());

        let nalu = crate::flv::avc::build_video_tag(true, crate::flv::AVC_PACKET_NALU, 0, &[]);
        assert!(!is_avc_sequence_header(&nalu).unwrap());
    }

    #[test]
    fn test_media_timestamp_rational() {
        // 90 kHz video clock: 3003 ticks per frame at 29.97 fps.
        let ts = MediaTimestamp::new(3_003 * 100, 90_000);
        assert_eq!(ts.as_millis(), 3_336);
        assert_eq!(MediaTimestamp::from_millis(1_234).as_millis(), 1_234);
    }

    #[test]
    fn test_video_frame_keyframe_detection() {
        let pts = MediaTimestamp::from_millis(0);
        let key = VideoFrame::from_nalus(&[vec![0x65, 0xAA]], pts);
        assert!(key.is_keyframe);
        let inter = VideoFrame::from_nalus(&[vec![0x41, 0xAA]], pts);
        assert!(!inter.is_keyframe);
    }
}
