//! AAC FLV tag bodies: AudioSpecificConfig and raw access units.
//!
//! Audio tag body layout:
//! ```text
//! byte 0  (sound_format << 4) | (rate << 2) | (size << 1) | type
//! byte 1  aac_packet_type        0 = AudioSpecificConfig, 1 = raw frame
//! bytes 2+ payload
//! ```
//! For AAC the descriptor fields beyond sound_format are fixed by
//! convention (16-bit, and the FLV rate nibble saturates at 44 kHz), so the
//! byte is 0xAF for the common stereo case.

use crate::error::FlvError;

use super::{AAC_PACKET_RAW, AAC_PACKET_SEQUENCE_HEADER, SOUND_FORMAT_AAC};

/// The 13-entry sampling-frequency table (ISO 14496-3 §1.6.3.4).
pub const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// AudioSpecificConfig: the two(+) bytes that configure an AAC decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSpecificConfig {
    /// 2 = AAC-LC in practice.
    pub audio_object_type: u8,
    pub sampling_frequency_index: u8,
    pub sample_rate: u32,
    pub channel_configuration: u8,
}

impl AudioSpecificConfig {
    pub fn new(audio_object_type: u8, sample_rate: u32, channels: u8) -> Result<Self, FlvError> {
        let index = SAMPLE_RATES
            .iter()
            .position(|&r| r == sample_rate)
            .ok_or_else(|| {
                FlvError::BadSequenceHeader(format!("no AAC frequency index for {} Hz", sample_rate))
            })? as u8;
        Ok(Self {
            audio_object_type,
            sampling_frequency_index: index,
            sample_rate,
            channel_configuration: channels,
        })
    }

    /// Serialize: 5 bits object type, 4 bits frequency index, 4 bits
    /// channel configuration, 3 padding bits.
    pub fn encode(&self) -> Vec<u8> {
        let b0 = (self.audio_object_type << 3) | (self.sampling_frequency_index >> 1);
        let b1 = ((self.sampling_frequency_index & 1) << 7) | (self.channel_configuration << 3);
        vec![b0, b1]
    }

    pub fn parse(data: &[u8]) -> Result<Self, FlvError> {
        if data.len() < 2 {
            return Err(FlvError::BadSequenceHeader(
                "AudioSpecificConfig shorter than 2 bytes".into(),
            ));
        }
        let audio_object_type = data[0] >> 3;
        let sampling_frequency_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let sample_rate = SAMPLE_RATES
            .get(sampling_frequency_index as usize)
            .copied()
            .ok_or_else(|| {
                FlvError::BadSequenceHeader(format!(
                    "sampling frequency index {} out of table",
                    sampling_frequency_index
                ))
            })?;
        let channel_configuration = (data[1] >> 3) & 0x0F;
        Ok(Self {
            audio_object_type,
            sampling_frequency_index,
            sample_rate,
            channel_configuration,
        })
    }
}

/// The FLV audio descriptor byte for an AAC stream.
///
/// The rate bits map the real rate onto FLV's four categories; size is
/// always 16-bit for AAC; type is stereo unless mono.
pub fn sound_format_byte(sample_rate: u32, channels: u8) -> u8 {
    let rate_bits = match sample_rate {
        0..=7_999 => 0,
        8_000..=12_000 => 1,
        12_001..=24_000 => 2,
        _ => 3,
    };
    let sound_type = u8::from(channels > 1);
    (SOUND_FORMAT_AAC << 4) | (rate_bits << 2) | (1 << 1) | sound_type
}

/// Sequence-header tag body: descriptor, packet type 0, AudioSpecificConfig.
pub fn build_sequence_header_tag(config: &AudioSpecificConfig) -> Vec<u8> {
    let mut out = vec![
        sound_format_byte(config.sample_rate, config.channel_configuration),
        AAC_PACKET_SEQUENCE_HEADER,
    ];
    out.extend_from_slice(&config.encode());
    out
}

/// Raw-frame tag body: descriptor, packet type 1, payload.
pub fn build_raw_tag(payload: &[u8], sample_rate: u32, channels: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(sound_format_byte(sample_rate, channels));
    out.push(AAC_PACKET_RAW);
    out.extend_from_slice(payload);
    out
}

/// The fixed prefix of an AAC audio tag body.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTagHeader {
    pub sound_format: u8,
    pub aac_packet_type: u8,
}

/// Byte length of the AAC audio tag prefix.
pub const AUDIO_TAG_HEADER_LEN: usize = 2;

/// Split an AAC audio tag body into its header and payload.
pub fn parse_audio_tag(body: &[u8]) -> Result<(AudioTagHeader, &[u8]), FlvError> {
    if body.is_empty() {
        return Err(FlvError::Truncated);
    }
    let sound_format = body[0] >> 4;
    if sound_format != SOUND_FORMAT_AAC {
        return Err(FlvError::UnsupportedCodec(sound_format));
    }
    if body.len() < AUDIO_TAG_HEADER_LEN {
        return Err(FlvError::Truncated);
    }
    Ok((
        AudioTagHeader {
            sound_format,
            aac_packet_type: body[1],
        },
        &body[AUDIO_TAG_HEADER_LEN..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asc_roundtrip() {
        let config = AudioSpecificConfig::new(2, 48_000, 2).unwrap();
        assert_eq!(config.sampling_frequency_index, 3);
        let parsed = AudioSpecificConfig::parse(&config.encode()).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.sample_rate, 48_000);
    }

    #[test]
    fn test_asc_known_bytes() {
        // AAC-LC, 44.1 kHz (index 4), stereo: 0x12 0x10.
        let config = AudioSpecificConfig::new(2, 44_100, 2).unwrap();
        assert_eq!(config.encode(), vec![0x12, 0x10]);
    }

    #[test]
    fn test_asc_all_table_rates() {
        for (i, &rate) in SAMPLE_RATES.iter().enumerate() {
            let config = AudioSpecificConfig::new(2, rate, 1).unwrap();
            assert_eq!(config.sampling_frequency_index, i as u8);
            let parsed = AudioSpecificConfig::parse(&config.encode()).unwrap();
            assert_eq!(parsed.sample_rate, rate);
        }
    }

    #[test]
    fn test_asc_rejects_unknown_rate() {
        assert!(AudioSpecificConfig::new(2, 44_000, 2).is_err());
    }

    #[test]
    fn test_sequence_header_tag() {
        let config = AudioSpecificConfig::new(2, 48_000, 2).unwrap();
        let tag = build_sequence_header_tag(&config);
        assert_eq!(tag[0], 0xAF);
        assert_eq!(tag[1], AAC_PACKET_SEQUENCE_HEADER);
        let (header, payload) = parse_audio_tag(&tag).unwrap();
        assert_eq!(header.aac_packet_type, AAC_PACKET_SEQUENCE_HEADER);
        assert_eq!(AudioSpecificConfig::parse(payload).unwrap(), config);
    }

    #[test]
    fn test_raw_tag() {
        let tag = build_raw_tag(&[0xDE, 0xAD, 0xBE], 48_000, 2);
        assert_eq!(tag[0], 0xAF);
        assert_eq!(tag[1], AAC_PACKET_RAW);
        let (header, payload) = parse_audio_tag(&tag).unwrap();
        assert_eq!(header.aac_packet_type, AAC_PACKET_RAW);
        assert_eq!(payload, &[0xDE, 0xAD, 0xBE]);
    }

    #[test]
    fn test_sound_byte_mono_low_rate() {
        // 8 kHz mono: rate bits 01, type 0.
        assert_eq!(sound_format_byte(8_000, 1), 0xA6);
    }

    #[test]
    fn test_non_aac_rejected() {
        // Sound format 0 (linear PCM) in the top nibble.
        assert!(matches!(
            parse_audio_tag(&[0x06, 0x01, 0x00]),
            Err(FlvError::UnsupportedCodec(0))
        ));
    }
}
