//! RTMP client session FSM: publish and play dialogs over TCP.
//!
//! A session owns the TCP endpoint and both halves of the chunk codec. All
//! mutation goes through `&mut self`, so a session behaves as an actor when
//! placed behind `Arc<Mutex<_>>`; audio and video sends on one session are
//! thereby serialized and chunk writes stay atomic with respect to each
//! other.
//!
//! Dialog shape (publisher):
//! 1. TCP connect + handshake, then SetChunkSize and WindowAckSize.
//! 2. `connect` (txn 1) and await `_result`, handling interleaved control
//!    messages while waiting.
//! 3. `releaseStream` / `FCPublish` / `createStream` (txns 2-4); the
//!    createStream `_result` yields the message stream id.
//! 4. `publish` (txn 5) on csid 4, await `onStatus` with
//!    `NetStream.Publish.Start`.
//! 5. While publishing, drain inbound non-blockingly before every media
//!    send; ingests stall publishers whose pings go unanswered.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::chunk::{ChunkDecoder, ChunkEncoder};
use super::handshake::client_handshake;
use super::{
    RtmpMessage, CSID_COMMAND, CSID_CONTROL, CSID_PLAY, CSID_PUBLISH, EVENT_PING_REQUEST,
    EVENT_PING_RESPONSE, EVENT_SET_BUFFER_LENGTH, MSG_ACKNOWLEDGEMENT, MSG_AMF0_COMMAND,
    MSG_AMF0_DATA, MSG_AUDIO, MSG_SET_CHUNK_SIZE, MSG_SET_PEER_BANDWIDTH, MSG_USER_CONTROL,
    MSG_VIDEO, MSG_WINDOW_ACK_SIZE,
};
use crate::amf0::{self, Amf0Value};
use crate::error::{Error, Result, RtmpError};

/// Outbound chunk size announced right after the handshake.
const OUTBOUND_CHUNK_SIZE: u32 = 65_536;

/// Window acknowledgement size we advertise.
const OUTBOUND_WINDOW: u32 = 2_500_000;

/// Subscriber buffer length announced with SetBufferLength (milliseconds).
const PLAY_BUFFER_MS: u32 = 1_000;

/// Deadline for a single blocking read while a dialog response is pending.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound messages drained while waiting for one `_result`/`onStatus`.
const MAX_PENDING_DRAIN: usize = 10;

/// Session lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Connected,
    Publishing,
    Playing,
    Error(String),
}

/// An RTMP client session (publisher or subscriber role).
pub struct RtmpSession {
    stream: TcpStream,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    state: SessionState,
    stream_key: String,
    bytes_sent: u64,
    last_ack_sent: u64,
    /// Window the peer advertised; we acknowledge every tenth of it.
    peer_window: u32,
    next_transaction_id: u32,
    stream_id: u32,
    first_pts_video: Option<u64>,
    first_pts_audio: Option<u64>,
    read_buf: Vec<u8>,
}

/// `rtmp://host[:port]/app` split into its parts.
#[derive(Debug, Clone)]
struct RtmpTarget {
    host: String,
    port: u16,
    app: String,
    tc_url: String,
}

fn parse_rtmp_url(rtmp_url: &str) -> Result<RtmpTarget> {
    let parsed = url::Url::parse(rtmp_url)
        .map_err(|e| RtmpError::Protocol(format!("bad RTMP URL {}: {}", rtmp_url, e)))?;
    if parsed.scheme() != "rtmp" {
        return Err(RtmpError::Protocol(format!(
            "unsupported scheme {} (plain rtmp only)",
            parsed.scheme()
        ))
        .into());
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| RtmpError::Protocol("RTMP URL has no host".into()))?
        .to_string();
    let port = parsed.port().unwrap_or(1935);
    let app = parsed.path().trim_matches('/').to_string();
    if app.is_empty() {
        return Err(RtmpError::Protocol("RTMP URL has no app path".into()).into());
    }
    let tc_url = format!("rtmp://{}:{}/{}", host, port, app);
    Ok(RtmpTarget {
        host,
        port,
        app,
        tc_url,
    })
}

impl RtmpSession {
    /// Open a publishing session: TCP, handshake, connect/createStream/
    /// publish dialog. Returns in the `Publishing` state.
    pub async fn connect_publish(rtmp_url: &str, stream_key: &str) -> Result<Self> {
        let mut session = Self::open(rtmp_url, stream_key).await?;
        match session.publish_dialog().await {
            Ok(()) => Ok(session),
            Err(e) => Err(session.fail(e).await),
        }
    }

    /// Open a playing session: connect/createStream/play dialog. Returns in
    /// the `Playing` state.
    pub async fn connect_play(rtmp_url: &str, stream_name: &str) -> Result<Self> {
        let mut session = Self::open(rtmp_url, stream_name).await?;
        match session.play_dialog().await {
            Ok(()) => Ok(session),
            Err(e) => Err(session.fail(e).await),
        }
    }

    async fn open(rtmp_url: &str, stream_key: &str) -> Result<Self> {
        let target = parse_rtmp_url(rtmp_url)?;
        tracing::info!(host = %target.host, port = target.port, app = %target.app, "connecting");

        let mut stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        stream.set_nodelay(true)?;

        client_handshake(&mut stream).await?;

        let mut session = Self {
            stream,
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            state: SessionState::Connected,
            stream_key: stream_key.to_string(),
            bytes_sent: 0,
            last_ack_sent: 0,
            peer_window: OUTBOUND_WINDOW,
            next_transaction_id: 0,
            stream_id: 0,
            first_pts_video: None,
            first_pts_audio: None,
            read_buf: vec![0u8; 16 * 1024],
        };

        // Announce our chunk size and window before the first command.
        session
            .send_message(
                CSID_CONTROL,
                RtmpMessage::new(MSG_SET_CHUNK_SIZE, 0, 0, OUTBOUND_CHUNK_SIZE.to_be_bytes().to_vec()),
            )
            .await?;
        session.encoder.set_chunk_size(OUTBOUND_CHUNK_SIZE as usize);
        session
            .send_message(
                CSID_CONTROL,
                RtmpMessage::new(MSG_WINDOW_ACK_SIZE, 0, 0, OUTBOUND_WINDOW.to_be_bytes().to_vec()),
            )
            .await?;

        // connect, transaction 1.
        let txn = session.next_txn();
        let payload = amf0::connect(&target.app, &target.tc_url, amf0::FLASH_VERSION, 0.0);
        session
            .send_message(CSID_COMMAND, RtmpMessage::new(MSG_AMF0_COMMAND, 0, 0, payload))
            .await?;
        session.await_result(txn).await?;
        tracing::debug!("connect accepted");

        Ok(session)
    }

    async fn publish_dialog(&mut self) -> Result<()> {
        let name = self.stream_key.clone();

        let txn = self.next_txn();
        self.send_command(amf0::release_stream(&name, txn)).await?;
        let txn = self.next_txn();
        self.send_command(amf0::fc_publish(&name, txn)).await?;

        let txn = self.next_txn();
        self.send_command(amf0::create_stream(txn)).await?;
        let result = self.await_result(txn).await?;
        self.stream_id = result
            .get(3)
            .and_then(Amf0Value::as_number)
            .map(|n| n as u32)
            .ok_or_else(|| RtmpError::Protocol("createStream _result carried no stream id".into()))?;
        tracing::debug!(stream_id = self.stream_id, "stream created");

        let txn = self.next_txn();
        let publish = amf0::publish(&name, "live", txn);
        self.send_message(
            CSID_PUBLISH,
            RtmpMessage::new(MSG_AMF0_COMMAND, self.stream_id, 0, publish),
        )
        .await?;
        self.await_on_status("NetStream.Publish.Start").await?;

        self.state = SessionState::Publishing;
        tracing::info!(stream = %name, "publishing");
        Ok(())
    }

    async fn play_dialog(&mut self) -> Result<()> {
        let name = self.stream_key.clone();

        let txn = self.next_txn();
        self.send_command(amf0::create_stream(txn)).await?;
        let result = self.await_result(txn).await?;
        self.stream_id = result
            .get(3)
            .and_then(Amf0Value::as_number)
            .map(|n| n as u32)
            .ok_or_else(|| RtmpError::Protocol("createStream _result carried no stream id".into()))?;

        let txn = self.next_txn();
        let play = amf0::play(&name, -2.0, txn);
        self.send_message(
            CSID_PLAY,
            RtmpMessage::new(MSG_AMF0_COMMAND, self.stream_id, 0, play),
        )
        .await?;

        // SetBufferLength: stream id then buffer length in ms.
        let mut body = Vec::with_capacity(10);
        body.extend_from_slice(&EVENT_SET_BUFFER_LENGTH.to_be_bytes());
        body.extend_from_slice(&self.stream_id.to_be_bytes());
        body.extend_from_slice(&PLAY_BUFFER_MS.to_be_bytes());
        self.send_message(CSID_CONTROL, RtmpMessage::new(MSG_USER_CONTROL, 0, 0, body))
            .await?;

        self.await_on_status("NetStream.Play.Start").await?;

        self.state = SessionState::Playing;
        tracing::info!(stream = %name, "playing");
        Ok(())
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Transaction ids are incremented before use; the first invoke gets 1.
    fn next_txn(&mut self) -> f64 {
        self.next_transaction_id += 1;
        f64::from(self.next_transaction_id)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    async fn send_message(&mut self, csid: u32, msg: RtmpMessage) -> Result<()> {
        let bytes = self.encoder.encode(csid, &msg);
        self.stream.write_all(&bytes).await?;
        self.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    async fn send_command(&mut self, payload: Vec<u8>) -> Result<()> {
        self.send_message(CSID_COMMAND, RtmpMessage::new(MSG_AMF0_COMMAND, 0, 0, payload))
            .await
    }

    /// Send a video message. `pts_ms` is normalized against the first video
    /// timestamp of the session; audio is normalized independently.
    pub async fn send_video(&mut self, body: Vec<u8>, pts_ms: u64) -> Result<()> {
        self.drain_inbound().await?;
        let ts = normalize(&mut self.first_pts_video, pts_ms);
        let msg = RtmpMessage::new(MSG_VIDEO, self.stream_id, ts, body);
        self.send_message(super::CSID_VIDEO, msg).await
    }

    pub async fn send_audio(&mut self, body: Vec<u8>, pts_ms: u64) -> Result<()> {
        self.drain_inbound().await?;
        let ts = normalize(&mut self.first_pts_audio, pts_ms);
        let msg = RtmpMessage::new(MSG_AUDIO, self.stream_id, ts, body);
        self.send_message(super::CSID_AUDIO, msg).await
    }

    /// Send a sequence-header media message. Always timestamp 0 and does not
    /// move the normalization reference.
    pub async fn send_video_config(&mut self, body: Vec<u8>) -> Result<()> {
        self.drain_inbound().await?;
        let msg = RtmpMessage::new(MSG_VIDEO, self.stream_id, 0, body);
        self.send_message(super::CSID_VIDEO, msg).await
    }

    pub async fn send_audio_config(&mut self, body: Vec<u8>) -> Result<()> {
        self.drain_inbound().await?;
        let msg = RtmpMessage::new(MSG_AUDIO, self.stream_id, 0, body);
        self.send_message(super::CSID_AUDIO, msg).await
    }

    /// Send an AMF0 script-data message (onMetaData).
    pub async fn send_script_data(&mut self, payload: Vec<u8>) -> Result<()> {
        self.drain_inbound().await?;
        let msg = RtmpMessage::new(MSG_AMF0_DATA, self.stream_id, 0, payload);
        self.send_message(CSID_PUBLISH, msg).await
    }

    /// Graceful publisher shutdown: FCUnpublish, deleteStream, a short
    /// linger, then TCP close. No media may follow.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.state == SessionState::Publishing {
            let name = self.stream_key.clone();
            let txn = self.next_txn();
            self.send_command(amf0::fc_unpublish(&name, txn)).await?;
            let txn = self.next_txn();
            self.send_command(amf0::delete_stream(self.stream_id, txn))
                .await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.state = SessionState::Idle;
        let _ = self.stream.shutdown().await;
        tracing::info!("session closed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Drain whatever the peer has already sent, without blocking. Control
    /// messages are handled inline; anything else is returned.
    pub async fn drain_inbound(&mut self) -> Result<Vec<RtmpMessage>> {
        let mut out = Vec::new();
        loop {
            match self.stream.try_read(&mut self.read_buf) {
                Ok(0) => {
                    return Err(self.fail(Error::ConnectionClosed).await);
                }
                Ok(n) => {
                    let chunk = self.read_buf[..n].to_vec();
                    self.decoder.push_bytes(&chunk);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(self.fail(e.into()).await),
            }
        }
        loop {
            match self.decoder.next_message() {
                Ok(Some(msg)) => {
                    if !self.handle_control(&msg).await? {
                        out.push(msg);
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(self.fail(e.into()).await),
            }
        }
        self.maybe_send_ack().await?;
        Ok(out)
    }

    /// Read the next non-control message, blocking until one arrives.
    pub async fn next_message(&mut self, deadline: Duration) -> Result<RtmpMessage> {
        loop {
            match self.decoder.next_message() {
                Ok(Some(msg)) => {
                    self.maybe_send_ack().await?;
                    if !self.handle_control(&msg).await? {
                        return Ok(msg);
                    }
                }
                Ok(None) => {
                    let n = match timeout(deadline, self.stream.read(&mut self.read_buf)).await {
                        Ok(Ok(0)) => return Err(self.fail(Error::ConnectionClosed).await),
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => return Err(self.fail(e.into()).await),
                        Err(_) => return Err(Error::Timeout("RTMP read".into())),
                    };
                    let chunk = self.read_buf[..n].to_vec();
                    self.decoder.push_bytes(&chunk);
                }
                Err(e) => return Err(self.fail(e.into()).await),
            }
        }
    }

    /// Process a control-plane message. Returns true when consumed.
    async fn handle_control(&mut self, msg: &RtmpMessage) -> Result<bool> {
        match msg.type_id {
            MSG_SET_CHUNK_SIZE => {
                if msg.payload.len() >= 4 {
                    let size = u32::from_be_bytes([
                        msg.payload[0],
                        msg.payload[1],
                        msg.payload[2],
                        msg.payload[3],
                    ]) & 0x7FFF_FFFF;
                    // Applies immediately, even mid-dialog.
                    self.decoder.set_chunk_size(size as usize);
                    tracing::debug!(size, "peer set chunk size");
                }
                Ok(true)
            }
            MSG_WINDOW_ACK_SIZE => {
                if msg.payload.len() >= 4 {
                    self.peer_window = u32::from_be_bytes([
                        msg.payload[0],
                        msg.payload[1],
                        msg.payload[2],
                        msg.payload[3],
                    ]);
                    tracing::debug!(window = self.peer_window, "peer window ack size");
                }
                Ok(true)
            }
            MSG_SET_PEER_BANDWIDTH => {
                // SetPeerBandwidth is answered with our WindowAckSize.
                self.send_message(
                    CSID_CONTROL,
                    RtmpMessage::new(MSG_WINDOW_ACK_SIZE, 0, 0, OUTBOUND_WINDOW.to_be_bytes().to_vec()),
                )
                .await?;
                Ok(true)
            }
            MSG_ACKNOWLEDGEMENT => Ok(true),
            MSG_USER_CONTROL => {
                if msg.payload.len() >= 2 {
                    let event = u16::from_be_bytes([msg.payload[0], msg.payload[1]]);
                    if event == EVENT_PING_REQUEST && msg.payload.len() >= 6 {
                        let mut body = Vec::with_capacity(6);
                        body.extend_from_slice(&EVENT_PING_RESPONSE.to_be_bytes());
                        body.extend_from_slice(&msg.payload[2..6]);
                        self.send_message(
                            CSID_CONTROL,
                            RtmpMessage::new(MSG_USER_CONTROL, 0, 0, body),
                        )
                        .await?;
                        tracing::debug!("answered ping");
                    }
                    // Stream begin/EOF/dry/buffer events are informational.
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Acknowledge received bytes once a tenth of the peer window has
    /// accumulated (matches de-facto ingest behaviour).
    async fn maybe_send_ack(&mut self) -> Result<()> {
        let received = self.decoder.bytes_received();
        let threshold = u64::from(self.peer_window / 10).max(1);
        if received - self.last_ack_sent >= threshold {
            self.last_ack_sent = received;
            let count = received as u32;
            self.send_message(
                CSID_CONTROL,
                RtmpMessage::new(MSG_ACKNOWLEDGEMENT, 0, 0, count.to_be_bytes().to_vec()),
            )
            .await?;
            tracing::trace!(count, "sent acknowledgement");
        }
        Ok(())
    }

    /// Await `_result` for `txn`, handling interleaved control traffic.
    /// `_error` or too much unrelated traffic fails the dialog.
    async fn await_result(&mut self, txn: f64) -> Result<Vec<Amf0Value>> {
        for _ in 0..MAX_PENDING_DRAIN {
            let msg = self.next_message(READ_TIMEOUT).await?;
            if msg.type_id != MSG_AMF0_COMMAND {
                continue;
            }
            let values = amf0::decode_values(&msg.payload).map_err(Error::from)?;
            let name = values.first().and_then(Amf0Value::as_str).unwrap_or("");
            let got_txn = values.get(1).and_then(Amf0Value::as_number);
            match name {
                "_result" if got_txn == Some(txn) => return Ok(values),
                "_error" if got_txn == Some(txn) => {
                    return Err(RtmpError::Protocol(format!(
                        "command transaction {} rejected: {:?}",
                        txn,
                        values.get(3)
                    ))
                    .into());
                }
                // Results for fire-and-forget invokes (releaseStream,
                // FCPublish) and onBWDone chatter arrive here; skip them.
                _ => continue,
            }
        }
        Err(RtmpError::UnexpectedMessage(format!(
            "no _result for transaction {} within {} messages",
            txn, MAX_PENDING_DRAIN
        ))
        .into())
    }

    /// Await an `onStatus` carrying the given code.
    async fn await_on_status(&mut self, code: &str) -> Result<()> {
        for _ in 0..MAX_PENDING_DRAIN {
            let msg = self.next_message(READ_TIMEOUT).await?;
            if msg.type_id != MSG_AMF0_COMMAND {
                continue;
            }
            let values = amf0::decode_values(&msg.payload).map_err(Error::from)?;
            if values.first().and_then(Amf0Value::as_str) != Some("onStatus") {
                continue;
            }
            let status_code = values
                .get(3)
                .and_then(|info| info.get("code"))
                .and_then(Amf0Value::as_str)
                .unwrap_or("");
            if status_code == code {
                return Ok(());
            }
            if status_code.ends_with(".Failed") || status_code.ends_with(".BadName") {
                return Err(RtmpError::Protocol(format!("stream refused: {}", status_code)).into());
            }
        }
        Err(RtmpError::UnexpectedMessage(format!("no onStatus {}", code)).into())
    }

    /// Record the failure, close the socket, and hand the error back.
    async fn fail(&mut self, e: Error) -> Error {
        self.state = SessionState::Error(e.to_string());
        let _ = self.stream.shutdown().await;
        e
    }
}

/// First pts becomes the zero reference; later values clamp at zero.
fn normalize(first: &mut Option<u64>, pts_ms: u64) -> u32 {
    let reference = *first.get_or_insert(pts_ms);
    pts_ms.saturating_sub(reference) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtmp::testserver::TestServer;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_publish_dialog_and_media() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut srv = TestServer::accept(&listener).await;
            srv.run_publish_dialog().await;

            // Client sends one video message after publishing.
            let msg = srv.recv().await;
            assert_eq!(msg.type_id, MSG_VIDEO);
            assert_eq!(msg.stream_id, 1);
            assert_eq!(msg.timestamp, 0, "first video pts becomes zero");
            let msg = srv.recv().await;
            assert_eq!(msg.type_id, MSG_VIDEO);
            assert_eq!(msg.timestamp, 40, "normalized against the first pts");
        });

        let url = format!("rtmp://127.0.0.1:{}/live", addr.port());
        let mut session = RtmpSession::connect_publish(&url, "key").await.unwrap();
        assert_eq!(*session.state(), SessionState::Publishing);
        assert_eq!(session.stream_id(), 1);

        session.send_video(vec![1, 2, 3], 5_000).await.unwrap();
        session.send_video(vec![4, 5, 6], 5_040).await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_answered_during_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut srv = TestServer::accept(&listener).await;
            srv.run_publish_dialog().await;

            // Ping with a recognizable timestamp.
            let mut body = EVENT_PING_REQUEST.to_be_bytes().to_vec();
            body.extend_from_slice(&0x1234_5678u32.to_be_bytes());
            srv.send(2, RtmpMessage::new(MSG_USER_CONTROL, 0, 0, body))
                .await;

            // The pong must come back on csid 2, type 4, event 7, same ts.
            let msg = srv.recv().await;
            assert_eq!(msg.type_id, MSG_USER_CONTROL);
            assert_eq!(
                u16::from_be_bytes([msg.payload[0], msg.payload[1]]),
                EVENT_PING_RESPONSE
            );
            assert_eq!(&msg.payload[2..6], &0x1234_5678u32.to_be_bytes());
        });

        let url = format!("rtmp://127.0.0.1:{}/live", addr.port());
        let mut session = RtmpSession::connect_publish(&url, "key").await.unwrap();

        // Give the ping time to arrive, then drain; the pong is sent inline.
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.drain_inbound().await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut srv = TestServer::accept(&listener).await;
            srv.run_publish_dialog().await;

            // Shutdown must be FCUnpublish then deleteStream, nothing after.
            let (name, _, values) = srv.recv_command().await;
            assert_eq!(name, "FCUnpublish");
            assert_eq!(values[3].as_str(), Some("key"));
            let (name, _, values) = srv.recv_command().await;
            assert_eq!(name, "deleteStream");
            assert_eq!(values[3].as_number(), Some(1.0));

            // Then the TCP stream closes.
            let mut buf = [0u8; 64];
            let n = srv.stream.read(&mut buf).await.unwrap();
            assert_eq!(n, 0, "expected close after deleteStream");
        });

        let url = format!("rtmp://127.0.0.1:{}/live", addr.port());
        let mut session = RtmpSession::connect_publish(&url, "key").await.unwrap();
        session.disconnect().await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_play_dialog_receives_media_and_acks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut srv = TestServer::accept(&listener).await;

            let (name, txn, _) = srv.recv_command().await;
            assert_eq!(name, "connect");
            srv.send_result(txn, vec![Amf0Value::Object(vec![])]).await;

            // Advertise a small window so the client acks quickly.
            srv.send(
                2,
                RtmpMessage::new(MSG_WINDOW_ACK_SIZE, 0, 0, 5_000u32.to_be_bytes().to_vec()),
            )
            .await;

            let (name, txn, _) = srv.recv_command().await;
            assert_eq!(name, "createStream");
            srv.send_result(txn, vec![Amf0Value::Number(7.0)]).await;

            let (name, _, values) = srv.recv_command().await;
            assert_eq!(name, "play");
            assert_eq!(values[3].as_str(), Some("thestream"));
            assert_eq!(values[4].as_number(), Some(-2.0));

            // SetBufferLength user-control arrives next.
            let msg = srv.recv().await;
            assert_eq!(msg.type_id, MSG_USER_CONTROL);
            assert_eq!(
                u16::from_be_bytes([msg.payload[0], msg.payload[1]]),
                EVENT_SET_BUFFER_LENGTH
            );

            srv.send_on_status("NetStream.Play.Start").await;

            // Stream a video message big enough to cross window/10 = 500.
            srv.send(
                6,
                RtmpMessage::new(MSG_VIDEO, 7, 20, vec![0xEE; 2_000]),
            )
            .await;

            // The client must acknowledge the received byte count.
            let msg = srv.recv().await;
            assert_eq!(msg.type_id, MSG_ACKNOWLEDGEMENT);
            let acked = u32::from_be_bytes([
                msg.payload[0],
                msg.payload[1],
                msg.payload[2],
                msg.payload[3],
            ]);
            assert!(acked >= 2_000);
        });

        let url = format!("rtmp://127.0.0.1:{}/live", addr.port());
        let mut session = RtmpSession::connect_play(&url, "thestream").await.unwrap();
        assert_eq!(*session.state(), SessionState::Playing);
        assert_eq!(session.stream_id(), 7);

        let msg = session.next_message(READ_TIMEOUT).await.unwrap();
        assert_eq!(msg.type_id, MSG_VIDEO);
        assert_eq!(msg.payload.len(), 2_000);

        server.await.unwrap();
    }

    #[test]
    fn test_parse_rtmp_url() {
        let t = parse_rtmp_url("rtmp://ingest.example.com/live").unwrap();
        assert_eq!(t.host, "ingest.example.com");
        assert_eq!(t.port, 1935);
        assert_eq!(t.app, "live");
        assert_eq!(t.tc_url, "rtmp://ingest.example.com:1935/live");

        let t = parse_rtmp_url("rtmp://10.0.0.1:19350/app").unwrap();
        assert_eq!(t.port, 19_350);

        assert!(parse_rtmp_url("rtmps://host/live").is_err());
        assert!(parse_rtmp_url("rtmp://host").is_err());
    }

    #[test]
    fn test_normalize_clamps_at_zero() {
        let mut first = None;
        assert_eq!(normalize(&mut first, 1_000), 0);
        assert_eq!(normalize(&mut first, 1_040), 40);
        // A pts before the reference clamps instead of going negative.
        assert_eq!(normalize(&mut first, 900), 0);
    }
}
