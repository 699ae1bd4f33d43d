//! Encrypted publisher orchestrator.
//!
//! Owns the KAS client, the active collection, and the RTMP session. Every
//! keyframe mints a fresh collection; the rotation is announced with an
//! onMetaData update and an in-band header frame before the keyframe goes
//! out, so both long-lived and late-joining subscribers converge on the new
//! key. A background task drains server control traffic between sends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::error::{Error, Result, RtmpError};
use crate::flv::{aac, avc, script::StreamMetadata, AVC_PACKET_NALU};
use crate::ntdf::collection::Collection;
use crate::ntdf::kas::KasClient;
use crate::rtmp::session::RtmpSession;

use super::{build_header_frame, AudioFrame, StreamState, VideoFrame};

/// Cadence of the background inbound drain.
const READER_INTERVAL: Duration = Duration::from_millis(100);

/// Encrypted RTMP publisher.
pub struct EncryptedPublisher {
    config: StreamConfig,
    kas: KasClient,
    kas_public_key: Option<[u8; 33]>,
    collection: Option<Collection>,
    session: Option<Arc<Mutex<RtmpSession>>>,
    reader_task: Option<JoinHandle<()>>,
    state_tx: watch::Sender<StreamState>,
}

impl EncryptedPublisher {
    pub fn new(config: StreamConfig) -> Self {
        let kas = KasClient::new(&config.kas_url);
        let (state_tx, _) = watch::channel(StreamState::Idle);
        Self {
            config,
            kas,
            kas_public_key: None,
            collection: None,
            session: None,
            reader_task: None,
            state_tx,
        }
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    /// Fetch the KAS public key and build the first collection.
    pub async fn initialize(&mut self) -> Result<()> {
        self.state_tx.send_replace(StreamState::Initializing);
        match self.initialize_inner().await {
            Ok(()) => {
                self.state_tx.send_replace(StreamState::Ready);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn initialize_inner(&mut self) -> Result<()> {
        let kas_public_key = self.kas.fetch_public_key().await?;
        tracing::info!("KAS public key acquired");
        self.kas_public_key = Some(kas_public_key);
        self.collection = Some(self.mint_collection()?);
        Ok(())
    }

    /// Open the RTMP session and announce the current collection.
    pub async fn connect(&mut self) -> Result<()> {
        match self.connect_inner().await {
            Ok(()) => {
                self.state_tx.send_replace(StreamState::Streaming);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn connect_inner(&mut self) -> Result<()> {
        if self.collection.is_none() {
            return Err(RtmpError::Protocol("connect before initialize".into()).into());
        }
        let session =
            RtmpSession::connect_publish(&self.config.rtmp_url, &self.config.stream_key).await?;
        let session = Arc::new(Mutex::new(session));
        self.session = Some(Arc::clone(&session));

        self.announce_collection().await?;
        self.spawn_reader(session);
        Ok(())
    }

    /// Encrypt and send one video frame. Keyframes rotate the collection
    /// first; the counter ceiling forces a rotation regardless of cadence.
    pub async fn send_video(&mut self, frame: &VideoFrame) -> Result<()> {
        let needs_rotation = frame.is_keyframe
            || self
                .collection
                .as_ref()
                .map_or(true, Collection::needs_forced_rotation);
        if needs_rotation {
            self.rotate().await?;
        }

        let result = self.send_video_inner(frame).await;
        result.map_err(|e| self.fail(e))
    }

    async fn send_video_inner(&mut self, frame: &VideoFrame) -> Result<()> {
        let collection = self
            .collection
            .as_mut()
            .ok_or_else(|| RtmpError::Protocol("send before initialize".into()))?;
        let item = collection.encrypt(&frame.payload)?;
        let body = avc::build_video_tag(frame.is_keyframe, AVC_PACKET_NALU, 0, &item);
        self.session()?
            .lock()
            .await
            .send_video(body, frame.pts.as_millis())
            .await
    }

    /// Encrypt and send one audio frame.
    pub async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        if self
            .collection
            .as_ref()
            .map_or(false, Collection::needs_forced_rotation)
        {
            self.rotate().await?;
        }
        let result = async {
            let collection = self
                .collection
                .as_mut()
                .ok_or_else(|| Error::from(RtmpError::Protocol("send before initialize".into())))?;
            let item = collection.encrypt(&frame.payload)?;
            let body = aac::build_raw_tag(&item, 48_000, 2);
            self.session()?
                .lock()
                .await
                .send_audio(body, frame.pts.as_millis())
                .await
        }
        .await;
        result.map_err(|e| self.fail(e))
    }

    /// Send the AVC sequence header, unencrypted at timestamp 0.
    pub async fn send_video_sequence_header(&mut self, sps: Vec<u8>, pps: Vec<u8>) -> Result<()> {
        let config = avc::AvcDecoderConfig::from_parameter_sets(sps, pps)?;
        let tag = avc::build_sequence_header_tag(&config);
        let result = async { self.session()?.lock().await.send_video_config(tag).await }.await;
        result.map_err(|e| self.fail(e))
    }

    /// Send the AAC sequence header, unencrypted at timestamp 0.
    pub async fn send_audio_sequence_header(
        &mut self,
        config: &aac::AudioSpecificConfig,
    ) -> Result<()> {
        let tag = aac::build_sequence_header_tag(config);
        let result = async { self.session()?.lock().await.send_audio_config(tag).await }.await;
        result.map_err(|e| self.fail(e))
    }

    /// Graceful shutdown: stop the background reader, close the session,
    /// and wipe the collection key.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(session) = self.session.take() {
            session.lock().await.disconnect().await?;
        }
        // Dropping the collection zeroizes its key material.
        self.collection = None;
        self.state_tx.send_replace(StreamState::Idle);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rotation
    // -----------------------------------------------------------------------

    /// Mint a fresh collection and announce it. The caller sends the
    /// keyframe only after this returns, preserving the
    /// metadata → header frame → keyframe order on the wire.
    async fn rotate(&mut self) -> Result<()> {
        let result = async {
            let collection = self.mint_collection()?;
            tracing::debug!("collection rotated");
            self.collection = Some(collection);
            self.announce_collection().await
        }
        .await;
        result.map_err(|e| self.fail(e))
    }

    fn mint_collection(&self) -> Result<Collection> {
        let kas_public_key = self
            .kas_public_key
            .as_ref()
            .ok_or_else(|| RtmpError::Protocol("no KAS public key yet".into()))?;
        let policy = self.config.policy_json.as_deref().map(str::as_bytes);
        Ok(Collection::create(
            &self.config.kas_url,
            kas_public_key,
            policy,
        )?)
    }

    /// Send updated onMetaData and the in-band header frame for the current
    /// collection, in that order.
    async fn announce_collection(&self) -> Result<()> {
        let collection = self
            .collection
            .as_ref()
            .ok_or_else(|| RtmpError::Protocol("no collection".into()))?;
        let header_bytes = collection.header_bytes().to_vec();

        let metadata = self.metadata(header_bytes.clone());
        let header_frame = build_header_frame(&header_bytes);

        let session = self.session()?;
        let mut session = session.lock().await;
        session.send_script_data(metadata.encode()).await?;
        session.send_video_config(header_frame).await?;
        Ok(())
    }

    fn metadata(&self, header_bytes: Vec<u8>) -> StreamMetadata {
        StreamMetadata {
            width: self.config.width,
            height: self.config.height,
            framerate: self.config.framerate,
            videodatarate: self.config.video_bitrate as f64 / 1_000.0,
            audiodatarate: self.config.audio_bitrate as f64 / 1_000.0,
            videocodecid: 7.0,
            audiocodecid: 10.0,
            encoder: format!("ntdf-stream/{}", env!("CARGO_PKG_VERSION")),
            ntdf_header: Some(header_bytes),
        }
    }

    fn session(&self) -> Result<Arc<Mutex<RtmpSession>>> {
        self.session
            .clone()
            .ok_or_else(|| RtmpError::Protocol("not connected".into()).into())
    }

    /// Poll server control traffic so pings and window accounting are
    /// serviced even when the producer stalls between frames.
    fn spawn_reader(&mut self, session: Arc<Mutex<RtmpSession>>) {
        let state_tx = self.state_tx.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(READER_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let mut session = session.lock().await;
                if let Err(e) = session.drain_inbound().await {
                    tracing::warn!("background drain failed: {}", e);
                    state_tx.send_replace(StreamState::Error(e.to_string()));
                    return;
                }
            }
        }));
    }

    fn fail(&self, e: Error) -> Error {
        self.state_tx.send_replace(StreamState::Error(e.to_string()));
        e
    }
}

impl Drop for EncryptedPublisher {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}
