//! AMF0 value codec and RTMP command payload builders.
//!
//! AMF0 is a tagged binary serialization: a 1-byte type marker followed by
//! the value. RTMP command messages (type 20) and script data (type 18) are
//! plain concatenations of encoded values.
//!
//! Wire notes:
//! - Numbers are IEEE-754 doubles, big-endian.
//! - Strings carry a 2-byte big-endian length; anything longer than 65535
//!   bytes must use the LongString marker (4-byte length). The encoder
//!   upgrades automatically.
//! - Object bodies are (2-byte-length key, value) pairs terminated by the
//!   3-byte sentinel `00 00 09`.
//! - The 4-byte ECMA-array count is informational; the parser trusts only
//!   the sentinel.

use crate::error::Amf0Error;

// Type markers.
const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_LONG_STRING: u8 = 0x0C;

/// One AMF0 value. Object and ECMA-array entries keep insertion order so
/// command payloads are byte-deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    LongString(String),
    Object(Vec<(String, Amf0Value)>),
    EcmaArray(Vec<(String, Amf0Value)>),
    StrictArray(Vec<Amf0Value>),
    Null,
    Undefined,
}

impl Amf0Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) | Amf0Value::LongString(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a key in an Object or ECMA-array value.
    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Amf0Value::Object(entries) | Amf0Value::EcmaArray(entries) => entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Append one encoded value to `buf`.
pub fn encode_value(buf: &mut Vec<u8>, value: &Amf0Value) {
    match value {
        Amf0Value::Number(n) => {
            buf.push(MARKER_NUMBER);
            buf.extend_from_slice(&n.to_be_bytes());
        }
        Amf0Value::Boolean(b) => {
            buf.push(MARKER_BOOLEAN);
            buf.push(u8::from(*b));
        }
        Amf0Value::String(s) | Amf0Value::LongString(s) => encode_string(buf, s),
        Amf0Value::Object(entries) => {
            buf.push(MARKER_OBJECT);
            encode_entries(buf, entries);
        }
        Amf0Value::EcmaArray(entries) => {
            buf.push(MARKER_ECMA_ARRAY);
            // Count is informational; emit the real entry count.
            buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
            encode_entries(buf, entries);
        }
        Amf0Value::StrictArray(items) => {
            buf.push(MARKER_STRICT_ARRAY);
            buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_value(buf, item);
            }
        }
        Amf0Value::Null => buf.push(MARKER_NULL),
        Amf0Value::Undefined => buf.push(MARKER_UNDEFINED),
    }
}

/// Encode a string value, upgrading to LongString when the payload does not
/// fit a 2-byte length.
fn encode_string(buf: &mut Vec<u8>, s: &str) {
    if s.len() > u16::MAX as usize {
        buf.push(MARKER_LONG_STRING);
        buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    } else {
        buf.push(MARKER_STRING);
        buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    }
    buf.extend_from_slice(s.as_bytes());
}

/// Object/ECMA body: (key, value) pairs then the `00 00 09` sentinel.
fn encode_entries(buf: &mut Vec<u8>, entries: &[(String, Amf0Value)]) {
    for (key, value) in entries {
        buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
        buf.extend_from_slice(key.as_bytes());
        encode_value(buf, value);
    }
    buf.extend_from_slice(&[0x00, 0x00, MARKER_OBJECT_END]);
}

/// Encode a sequence of values back to back (command payload form).
pub fn encode_values(values: &[Amf0Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    for v in values {
        encode_value(&mut buf, v);
    }
    buf
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one value starting at `*pos`, advancing the cursor past it.
pub fn decode_value(data: &[u8], pos: &mut usize) -> Result<Amf0Value, Amf0Error> {
    let marker = *take(data, pos, 1)?.first().ok_or(Amf0Error::Truncated)?;
    match marker {
        MARKER_NUMBER => {
            let raw = take(data, pos, 8)?;
            let mut be = [0u8; 8];
            be.copy_from_slice(raw);
            Ok(Amf0Value::Number(f64::from_be_bytes(be)))
        }
        MARKER_BOOLEAN => {
            let raw = take(data, pos, 1)?;
            Ok(Amf0Value::Boolean(raw[0] != 0))
        }
        MARKER_STRING => {
            let len = read_u16(data, pos)? as usize;
            let raw = take(data, pos, len)?;
            let s = std::str::from_utf8(raw).map_err(|_| Amf0Error::InvalidUtf8)?;
            Ok(Amf0Value::String(s.to_string()))
        }
        MARKER_LONG_STRING => {
            let len = read_u32(data, pos)? as usize;
            let raw = take(data, pos, len)?;
            let s = std::str::from_utf8(raw).map_err(|_| Amf0Error::InvalidUtf8)?;
            Ok(Amf0Value::LongString(s.to_string()))
        }
        MARKER_OBJECT => Ok(Amf0Value::Object(decode_entries(data, pos)?)),
        MARKER_ECMA_ARRAY => {
            // Skip the count; the sentinel is authoritative.
            let _count = read_u32(data, pos)?;
            Ok(Amf0Value::EcmaArray(decode_entries(data, pos)?))
        }
        MARKER_STRICT_ARRAY => {
            let count = read_u32(data, pos)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_value(data, pos)?);
            }
            Ok(Amf0Value::StrictArray(items))
        }
        MARKER_NULL => Ok(Amf0Value::Null),
        MARKER_UNDEFINED => Ok(Amf0Value::Undefined),
        other => Err(Amf0Error::UnknownMarker(other)),
    }
}

/// Decode every value in `data` (a command or script-data payload).
pub fn decode_values(data: &[u8]) -> Result<Vec<Amf0Value>, Amf0Error> {
    let mut pos = 0;
    let mut values = Vec::new();
    while pos < data.len() {
        values.push(decode_value(data, &mut pos)?);
    }
    Ok(values)
}

/// Object/ECMA body reader: pairs until the empty-key + object-end sentinel.
fn decode_entries(data: &[u8], pos: &mut usize) -> Result<Vec<(String, Amf0Value)>, Amf0Error> {
    let mut entries = Vec::new();
    loop {
        let key_len = read_u16(data, pos)? as usize;
        if key_len == 0 {
            let marker = take(data, pos, 1)?[0];
            if marker == MARKER_OBJECT_END {
                return Ok(entries);
            }
            return Err(Amf0Error::UnknownMarker(marker));
        }
        let raw = take(data, pos, key_len)?;
        let key = std::str::from_utf8(raw)
            .map_err(|_| Amf0Error::InvalidUtf8)?
            .to_string();
        let value = decode_value(data, pos)?;
        entries.push((key, value));
    }
}

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], Amf0Error> {
    if data.len() < *pos + n {
        return Err(Amf0Error::Truncated);
    }
    let slice = &data[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

fn read_u16(data: &[u8], pos: &mut usize) -> Result<u16, Amf0Error> {
    let raw = take(data, pos, 2)?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]))
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32, Amf0Error> {
    let raw = take(data, pos, 4)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

// ---------------------------------------------------------------------------
// Command payload builders
// ---------------------------------------------------------------------------

/// Flash encoder identification the de-facto ingests expect from publishers.
pub const FLASH_VERSION: &str = "FMLE/3.0 (compatible; FMSc/1.0)";

/// `connect` command payload (transaction id 1, the first invoke).
///
/// The command object keys are emitted in a fixed order so the payload is
/// byte-deterministic.
pub fn connect(app: &str, tc_url: &str, flash_ver: &str, object_encoding: f64) -> Vec<u8> {
    let object = Amf0Value::Object(vec![
        ("app".into(), Amf0Value::String(app.into())),
        ("type".into(), Amf0Value::String("nonprivate".into())),
        ("flashVer".into(), Amf0Value::String(flash_ver.into())),
        ("tcUrl".into(), Amf0Value::String(tc_url.into())),
        ("objectEncoding".into(), Amf0Value::Number(object_encoding)),
    ]);
    encode_values(&[
        Amf0Value::String("connect".into()),
        Amf0Value::Number(1.0),
        object,
    ])
}

pub fn create_stream(txn_id: f64) -> Vec<u8> {
    encode_values(&[
        Amf0Value::String("createStream".into()),
        Amf0Value::Number(txn_id),
        Amf0Value::Null,
    ])
}

pub fn release_stream(name: &str, txn_id: f64) -> Vec<u8> {
    encode_values(&[
        Amf0Value::String("releaseStream".into()),
        Amf0Value::Number(txn_id),
        Amf0Value::Null,
        Amf0Value::String(name.into()),
    ])
}

pub fn fc_publish(name: &str, txn_id: f64) -> Vec<u8> {
    encode_values(&[
        Amf0Value::String("FCPublish".into()),
        Amf0Value::Number(txn_id),
        Amf0Value::Null,
        Amf0Value::String(name.into()),
    ])
}

pub fn fc_unpublish(name: &str, txn_id: f64) -> Vec<u8> {
    encode_values(&[
        Amf0Value::String("FCUnpublish".into()),
        Amf0Value::Number(txn_id),
        Amf0Value::Null,
        Amf0Value::String(name.into()),
    ])
}

pub fn delete_stream(stream_id: u32, txn_id: f64) -> Vec<u8> {
    encode_values(&[
        Amf0Value::String("deleteStream".into()),
        Amf0Value::Number(txn_id),
        Amf0Value::Null,
        Amf0Value::Number(f64::from(stream_id)),
    ])
}

pub fn publish(name: &str, stream_type: &str, txn_id: f64) -> Vec<u8> {
    encode_values(&[
        Amf0Value::String("publish".into()),
        Amf0Value::Number(txn_id),
        Amf0Value::Null,
        Amf0Value::String(name.into()),
        Amf0Value::String(stream_type.into()),
    ])
}

pub fn play(name: &str, start: f64, txn_id: f64) -> Vec<u8> {
    encode_values(&[
        Amf0Value::String("play".into()),
        Amf0Value::Number(txn_id),
        Amf0Value::Null,
        Amf0Value::String(name.into()),
        Amf0Value::Number(start),
    ])
}
