//! Typed errors, one enum per subsystem.
//!
//! Every error is fatal to the session that raised it unless noted on the
//! variant. The session FSM converts codec errors into a terminal `error`
//! state; the orchestrators surface them through their state observers.

use thiserror::Error;

/// AMF0 codec errors.
#[derive(Debug, Error)]
pub enum Amf0Error {
    /// Input ended inside a value.
    #[error("AMF0 value truncated")]
    Truncated,

    /// A string field did not hold valid UTF-8.
    #[error("AMF0 string is not valid UTF-8")]
    InvalidUtf8,

    /// Unrecognized type marker byte.
    #[error("unknown AMF0 type marker 0x{0:02X}")]
    UnknownMarker(u8),
}

/// RTMP handshake, chunk codec, and session errors.
#[derive(Debug, Error)]
pub enum RtmpError {
    /// S0 carried a version other than 3.
    #[error("RTMP handshake: server offered version {0}, expected 3")]
    HandshakeBadVersion(u8),

    #[error("RTMP handshake failed: {0}")]
    HandshakeFailed(String),

    /// A chunk header ended mid-field.
    #[error("truncated chunk header")]
    TruncatedHeader,

    /// The stream ended inside a chunk payload.
    #[error("truncated chunk payload")]
    TruncatedPayload,

    /// Desync guard: no legitimate message in this protocol approaches 1 MB.
    #[error("message of {0} bytes exceeds the 1 MB sanity limit")]
    MessageTooLarge(usize),

    /// Peer violated the protocol (bad response shape, rejected command, ...).
    #[error("RTMP protocol error: {0}")]
    Protocol(String),

    /// A response arrived that the current dialog state cannot accept.
    #[error("unexpected RTMP message: {0}")]
    UnexpectedMessage(String),
}

/// FLV tag mux/demux errors.
#[derive(Debug, Error)]
pub enum FlvError {
    #[error("bad sequence header: {0}")]
    BadSequenceHeader(String),

    #[error("unsupported codec id {0}")]
    UnsupportedCodec(u8),

    #[error("FLV tag truncated")]
    Truncated,
}

/// NanoTDF header and collection engine errors.
#[derive(Debug, Error)]
pub enum NtdfError {
    #[error("NanoTDF header parse failed: {0}")]
    HeaderParse(String),

    /// Counter space exhausted. Recoverable on the publisher (forces a
    /// rotation); fail-closed on the subscriber.
    #[error("collection IV counter exhausted")]
    IvExhausted,

    /// GCM tag mismatch: desync or wrong collection key.
    #[error("collection item failed authentication")]
    DecryptAuthFailed,

    /// An IV counter was presented twice within one collection.
    #[error("IV counter {0} reused within collection")]
    CounterReuse(u32),
}

/// KAS public-key fetch and rewrap errors.
#[derive(Debug, Error)]
pub enum KasError {
    #[error("KAS returned HTTP {0}")]
    Http(u16),

    #[error("KAS response not understood: {0}")]
    BadResponse(String),

    /// The wrapped key failed to open under the derived KEK.
    #[error("rewrapped key failed authentication")]
    UnwrapAuthFailed,
}

/// Crate-level error: the union the orchestrators and sessions surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Amf0(#[from] Amf0Error),

    #[error(transparent)]
    Rtmp(#[from] RtmpError),

    #[error(transparent)]
    Flv(#[from] FlvError),

    #[error(transparent)]
    Ntdf(#[from] NtdfError),

    #[error(transparent)]
    Kas(#[from] KasError),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
