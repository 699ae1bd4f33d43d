//! onMetaData script data (RTMP message type 18).
//!
//! Publishers send `"@setDataFrame"`, `"onMetaData"`, then an ECMA array of
//! stream properties. The transport rides one custom string field in that
//! array: `ntdf_header`, the base64 of the current collection header, so a
//! subscriber that joins at any point can bootstrap its decryptor from
//! metadata alone.

use base64::Engine;

use crate::amf0::{self, Amf0Value};

/// Stream properties advertised in onMetaData.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadata {
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    /// kbps, as onMetaData convention has it.
    pub videodatarate: f64,
    pub audiodatarate: f64,
    pub videocodecid: f64,
    pub audiocodecid: f64,
    pub encoder: String,
    /// base64 of the current NanoTDF collection header.
    pub ntdf_header: Option<Vec<u8>>,
}

impl StreamMetadata {
    /// Encode the full script-data payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut entries = vec![
            ("width".to_string(), Amf0Value::Number(f64::from(self.width))),
            ("height".to_string(), Amf0Value::Number(f64::from(self.height))),
            ("framerate".to_string(), Amf0Value::Number(self.framerate)),
            ("videodatarate".to_string(), Amf0Value::Number(self.videodatarate)),
            ("audiodatarate".to_string(), Amf0Value::Number(self.audiodatarate)),
            ("videocodecid".to_string(), Amf0Value::Number(self.videocodecid)),
            ("audiocodecid".to_string(), Amf0Value::Number(self.audiocodecid)),
            ("encoder".to_string(), Amf0Value::String(self.encoder.clone())),
        ];
        if let Some(header) = &self.ntdf_header {
            let b64 = base64::engine::general_purpose::STANDARD.encode(header);
            entries.push(("ntdf_header".to_string(), Amf0Value::String(b64)));
        }
        amf0::encode_values(&[
            Amf0Value::String("@setDataFrame".into()),
            Amf0Value::String("onMetaData".into()),
            Amf0Value::EcmaArray(entries),
        ])
    }

    /// Parse a script-data payload. Returns `None` when it is not an
    /// onMetaData frame (other script data passes through untouched).
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let values = amf0::decode_values(payload).ok()?;

        // "@setDataFrame" is present on the publisher→server leg and often
        // stripped on the way out; accept both shapes.
        let mut iter = values.iter();
        let mut current = iter.next()?;
        if current.as_str() == Some("@setDataFrame") {
            current = iter.next()?;
        }
        if current.as_str() != Some("onMetaData") {
            return None;
        }
        let body = iter.next()?;

        let number = |key: &str| body.get(key).and_then(Amf0Value::as_number);
        let ntdf_header = body
            .get("ntdf_header")
            .and_then(Amf0Value::as_str)
            .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok());

        Some(Self {
            width: number("width").unwrap_or(0.0) as u32,
            height: number("height").unwrap_or(0.0) as u32,
            framerate: number("framerate").unwrap_or(0.0),
            videodatarate: number("videodatarate").unwrap_or(0.0),
            audiodatarate: number("audiodatarate").unwrap_or(0.0),
            videocodecid: number("videocodecid").unwrap_or(0.0),
            audiocodecid: number("audiocodecid").unwrap_or(0.0),
            encoder: body
                .get("encoder")
                .and_then(Amf0Value::as_str)
                .unwrap_or("")
                .to_string(),
            ntdf_header,
        })
    }
}
