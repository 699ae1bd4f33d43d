//! Encrypted subscriber orchestrator.
//!
//! Classification of inbound media, in order:
//! 1. AVC sequence header: cleartext, feeds the decoder configuration.
//! 2. In-band NTDF header frame: magic probe at bytes 5..9, before any
//!    NALU interpretation.
//! 3. Everything else: strip the FLV prefix, decrypt, then demux.
//!
//! The collection header may also arrive in onMetaData; whichever path
//! delivers a header first wins, and a header identical to the current one
//! is ignored. Each new header costs one KAS rewrap.

use tokio::sync::watch;

use crate::config::StreamConfig;
use crate::error::Result;
use crate::flv::aac::{self, AudioSpecificConfig};
use crate::flv::avc::{self, AvcDecoderConfig};
use crate::flv::script::StreamMetadata;
use crate::flv::AAC_PACKET_SEQUENCE_HEADER;
use crate::ntdf::collection::CollectionDecryptor;
use crate::ntdf::kas::KasClient;
use crate::rtmp::session::RtmpSession;
use crate::rtmp::{MSG_AMF0_DATA, MSG_AUDIO, MSG_VIDEO};

use super::{is_avc_sequence_header, parse_header_frame, StreamState};

/// Deadline for a single blocking read while playing.
const PLAY_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// One decoded event from the stream.
#[derive(Debug)]
pub enum SubscriberEvent {
    /// AVC decoder configuration (SPS/PPS), cleartext.
    VideoConfig(AvcDecoderConfig),
    /// AAC decoder configuration, cleartext.
    AudioConfig(AudioSpecificConfig),
    /// A decrypted, demuxed video frame.
    Video {
        nalus: Vec<Vec<u8>>,
        is_keyframe: bool,
        timestamp_ms: u32,
        composition_time: i32,
    },
    /// A decrypted AAC access unit.
    Audio { payload: Vec<u8>, timestamp_ms: u32 },
    /// Parsed onMetaData (already applied to the decryptor when it carried
    /// a header).
    Metadata(StreamMetadata),
}

/// Encrypted RTMP subscriber.
pub struct EncryptedSubscriber {
    config: StreamConfig,
    kas: KasClient,
    session: RtmpSession,
    decryptor: Option<CollectionDecryptor>,
    nalu_length_size: u8,
    state_tx: watch::Sender<StreamState>,
}

impl EncryptedSubscriber {
    /// Open the play session. Returns in the waiting-for-header state; the
    /// first installed collection header moves it to `Playing`.
    pub async fn connect(config: StreamConfig) -> Result<Self> {
        let kas = KasClient::new(&config.kas_url);
        let session = RtmpSession::connect_play(&config.rtmp_url, &config.stream_key).await?;
        let (state_tx, _) = watch::channel(StreamState::WaitingForHeader);
        Ok(Self {
            config,
            kas,
            session,
            decryptor: None,
            nalu_length_size: avc::DEFAULT_NALU_LENGTH_SIZE,
            state_tx,
        })
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    /// Next decoded event. Encrypted media that arrives before any header
    /// is skipped with a warning; decryption failures after that are fatal.
    pub async fn next_event(&mut self) -> Result<SubscriberEvent> {
        loop {
            let msg = self.session.next_message(PLAY_READ_TIMEOUT).await?;
            match msg.type_id {
                MSG_VIDEO => {
                    if let Some(event) = self.handle_video(&msg.payload, msg.timestamp).await? {
                        return Ok(event);
                    }
                }
                MSG_AUDIO => {
                    if let Some(event) = self.handle_audio(&msg.payload, msg.timestamp).await? {
                        return Ok(event);
                    }
                }
                MSG_AMF0_DATA => {
                    if let Some(meta) = StreamMetadata::parse(&msg.payload) {
                        if let Some(header) = meta.ntdf_header.clone() {
                            self.install_header(header).await?;
                        }
                        return Ok(SubscriberEvent::Metadata(meta));
                    }
                }
                other => {
                    tracing::debug!(type_id = other, "ignoring message");
                }
            }
        }
    }

    async fn handle_video(
        &mut self,
        body: &[u8],
        timestamp_ms: u32,
    ) -> Result<Option<SubscriberEvent>> {
        // Sequence headers travel in the clear.
        if is_avc_sequence_header(body)? {
            let config = AvcDecoderConfig::parse(&body[avc::VIDEO_TAG_HEADER_LEN..])?;
            self.nalu_length_size = config.nalu_length_size;
            return Ok(Some(SubscriberEvent::VideoConfig(config)));
        }

        // In-band header frame: magic probe before any NALU interpretation.
        if let Some(header) = parse_header_frame(body) {
            let header = header.to_vec();
            self.install_header(header).await?;
            return Ok(None);
        }

        let (tag, item) = avc::parse_video_tag(body)?;
        if item.is_empty() {
            // A bare end-of-sequence marker; nothing to decrypt.
            return Ok(None);
        }
        let Some(decryptor) = self.decryptor.as_mut() else {
            tracing::warn!("encrypted video before any collection header, skipping");
            return Ok(None);
        };
        let plaintext = decryptor.decrypt(item)?;
        let nalus = avc::decode_nalus(&plaintext, self.nalu_length_size)?;
        let is_keyframe = avc::is_keyframe(&tag, &nalus);
        Ok(Some(SubscriberEvent::Video {
            nalus,
            is_keyframe,
            timestamp_ms,
            composition_time: tag.composition_time,
        }))
    }

    async fn handle_audio(
        &mut self,
        body: &[u8],
        timestamp_ms: u32,
    ) -> Result<Option<SubscriberEvent>> {
        let (tag, payload) = aac::parse_audio_tag(body)?;
        if tag.aac_packet_type == AAC_PACKET_SEQUENCE_HEADER {
            let config = AudioSpecificConfig::parse(payload)?;
            return Ok(Some(SubscriberEvent::AudioConfig(config)));
        }
        let Some(decryptor) = self.decryptor.as_mut() else {
            tracing::warn!("encrypted audio before any collection header, skipping");
            return Ok(None);
        };
        let payload = decryptor.decrypt(payload)?;
        Ok(Some(SubscriberEvent::Audio {
            payload,
            timestamp_ms,
        }))
    }

    /// Install a collection header, replacing the current decryptor. A
    /// header identical to the current one is a no-op; anything new costs a
    /// KAS rewrap.
    async fn install_header(&mut self, header_bytes: Vec<u8>) -> Result<()> {
        if self
            .decryptor
            .as_ref()
            .map_or(false, |d| d.header_bytes() == header_bytes.as_slice())
        {
            return Ok(());
        }

        let header = crate::ntdf::header::NtdfHeader::parse(&header_bytes)?;
        let key = self
            .kas
            .rewrap(&header_bytes, &header.policy.body, &self.config.kas_token)
            .await?;
        self.decryptor = Some(CollectionDecryptor::new(header_bytes, key)?);

        if *self.state_tx.borrow() == StreamState::WaitingForHeader {
            tracing::info!("first collection header installed");
        } else {
            tracing::debug!("collection header replaced");
        }
        self.state_tx.send_replace(StreamState::Playing);
        Ok(())
    }

    /// Close the session and drop key material.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.decryptor = None;
        self.state_tx.send_replace(StreamState::Idle);
        self.session.disconnect().await
    }
}
