//! Encrypted RTMP live-streaming transport.
//!
//! A publisher ingests already-encoded H.264 and AAC frames, encrypts each
//! payload under a NanoTDF collection key, wraps the ciphertext in FLV tag
//! bodies, and speaks plain RTMP to an unmodified ingest. A subscriber
//! plays the stream back, recovers each collection key from a Key Access
//! Service via an ephemeral ECDH rewrap, and hands decrypted frames to the
//! caller. Collections rotate on every video keyframe.
//!
//! Layering, leaves first: [`amf0`] (command codec) → [`rtmp`] (chunk codec
//! and session FSM); [`flv`] (tag mux/demux); [`ntdf`] (header codec,
//! collection engine, KAS client); [`stream`] composes them all.

pub mod amf0;
pub mod config;
pub mod error;
pub mod flv;
pub mod ntdf;
pub mod rtmp;
pub mod stream;

pub use config::StreamConfig;
pub use error::{Error, Result};
pub use stream::publisher::EncryptedPublisher;
pub use stream::subscriber::{EncryptedSubscriber, SubscriberEvent};
pub use stream::{AudioFrame, MediaTimestamp, StreamState, VideoFrame};
