//! Scripted RTMP ingest for tests: server-side handshake plus just enough
//! dialog handling to exercise client sessions end to end over localhost.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::chunk::{ChunkDecoder, ChunkEncoder};
use super::handshake::{HANDSHAKE_PACKET_LEN, RTMP_VERSION};
use super::{RtmpMessage, MSG_AMF0_COMMAND, MSG_SET_CHUNK_SIZE, MSG_WINDOW_ACK_SIZE};
use crate::amf0::{self, Amf0Value};

pub(crate) struct TestServer {
    pub stream: TcpStream,
    pub decoder: ChunkDecoder,
    pub encoder: ChunkEncoder,
}

impl TestServer {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (mut stream, _) = listener.accept().await.unwrap();

        // Server half of the handshake.
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_PACKET_LEN];
        stream.read_exact(&mut c0c1).await.unwrap();
        assert_eq!(c0c1[0], RTMP_VERSION);
        assert_eq!(&c0c1[5..9], &[0, 0, 0, 0], "C1 zero block");
        let mut s = vec![RTMP_VERSION];
        s.extend_from_slice(&[0x42; HANDSHAKE_PACKET_LEN]); // S1
        s.extend_from_slice(&c0c1[1..]); // S2 = echo of C1
        stream.write_all(&s).await.unwrap();
        let mut c2 = vec![0u8; HANDSHAKE_PACKET_LEN];
        stream.read_exact(&mut c2).await.unwrap();
        assert_eq!(&c2[..], &[0x42; HANDSHAKE_PACKET_LEN][..], "C2 echoes S1");

        Self {
            stream,
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
        }
    }

    /// Next inbound message. Chunk-size announcements are applied and
    /// window announcements skipped; everything else is returned.
    pub async fn recv(&mut self) -> RtmpMessage {
        loop {
            if let Some(msg) = self.decoder.next_message().unwrap() {
                if msg.type_id == MSG_SET_CHUNK_SIZE {
                    let n = u32::from_be_bytes([
                        msg.payload[0],
                        msg.payload[1],
                        msg.payload[2],
                        msg.payload[3],
                    ]);
                    self.decoder.set_chunk_size(n as usize);
                    continue;
                }
                if msg.type_id == MSG_WINDOW_ACK_SIZE {
                    continue;
                }
                return msg;
            }
            let mut buf = [0u8; 8192];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed unexpectedly");
            self.decoder.push_bytes(&buf[..n]);
        }
    }

    pub async fn recv_command(&mut self) -> (String, f64, Vec<Amf0Value>) {
        loop {
            let msg = self.recv().await;
            if msg.type_id == MSG_AMF0_COMMAND {
                let values = amf0::decode_values(&msg.payload).unwrap();
                let name = values[0].as_str().unwrap().to_string();
                let txn = values[1].as_number().unwrap_or(0.0);
                return (name, txn, values);
            }
        }
    }

    pub async fn send(&mut self, csid: u32, msg: RtmpMessage) {
        let bytes = self.encoder.encode(csid, &msg);
        self.stream.write_all(&bytes).await.unwrap();
    }

    pub async fn send_result(&mut self, txn: f64, extra: Vec<Amf0Value>) {
        let mut values = vec![
            Amf0Value::String("_result".into()),
            Amf0Value::Number(txn),
            Amf0Value::Null,
        ];
        values.extend(extra);
        let payload = amf0::encode_values(&values);
        self.send(3, RtmpMessage::new(MSG_AMF0_COMMAND, 0, 0, payload))
            .await;
    }

    pub async fn send_on_status(&mut self, code: &str) {
        let info = Amf0Value::Object(vec![
            ("level".into(), Amf0Value::String("status".into())),
            ("code".into(), Amf0Value::String(code.into())),
        ]);
        let payload = amf0::encode_values(&[
            Amf0Value::String("onStatus".into()),
            Amf0Value::Number(0.0),
            Amf0Value::Null,
            info,
        ]);
        self.send(5, RtmpMessage::new(MSG_AMF0_COMMAND, 1, 0, payload))
            .await;
    }

    /// Answer the publisher dialog up through `NetStream.Publish.Start`,
    /// assigning message stream id 1.
    pub async fn run_publish_dialog(&mut self) {
        let (name, txn, _) = self.recv_command().await;
        assert_eq!(name, "connect");
        assert_eq!(txn, 1.0);
        self.send_result(txn, vec![Amf0Value::Object(vec![])]).await;

        loop {
            let (name, txn, _) = self.recv_command().await;
            match name.as_str() {
                "releaseStream" | "FCPublish" => {}
                "createStream" => {
                    self.send_result(txn, vec![Amf0Value::Number(1.0)]).await;
                }
                "publish" => {
                    self.send_on_status("NetStream.Publish.Start").await;
                    return;
                }
                other => panic!("unexpected command {}", other),
            }
        }
    }

    /// Answer the subscriber dialog up through `NetStream.Play.Start`,
    /// assigning the given message stream id.
    pub async fn run_play_dialog(&mut self, stream_id: u32) {
        let (name, txn, _) = self.recv_command().await;
        assert_eq!(name, "connect");
        self.send_result(txn, vec![Amf0Value::Object(vec![])]).await;

        let (name, txn, _) = self.recv_command().await;
        assert_eq!(name, "createStream");
        self.send_result(txn, vec![Amf0Value::Number(f64::from(stream_id))])
            .await;

        let (name, _, _) = self.recv_command().await;
        assert_eq!(name, "play");

        // SetBufferLength user-control follows the play command.
        let msg = self.recv().await;
        assert_eq!(msg.type_id, super::MSG_USER_CONTROL);

        self.send_on_status("NetStream.Play.Start").await;
    }
}
