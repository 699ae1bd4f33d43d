//! RTMP client handshake (C0/C1/C2 against S0/S1/S2).
//!
//! ```text
//! client                     server
//!   | C0 (1 byte, version 3)   |
//!   | C1 (1536 bytes)          |
//!   |------------------------->|
//!   |        S0 + S1 + S2      |
//!   |<-------------------------|
//!   | C2 (echo of S1)          |
//!   |------------------------->|
//! ```
//!
//! C1 is a 4-byte timestamp, 4 zero bytes, then 1528 bytes of randomness.
//! There is no need for cryptographic randomness here, but the OS CSPRNG is
//! the cheapest source of bytes that will not collide between endpoints.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, Result, RtmpError};

/// RTMP protocol version carried in C0/S0.
pub const RTMP_VERSION: u8 = 3;

/// C1/S1/C2/S2 packet length.
pub const HANDSHAKE_PACKET_LEN: usize = 1536;

/// Deadline for every read during the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the client side of the handshake over `stream`.
///
/// Rejects the session if S0 carries any version other than 3. Returns once
/// C2 is on the wire; chunk traffic may follow immediately.
pub async fn client_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // C0 + C1 in one write.
    let mut c0c1 = Vec::with_capacity(1 + HANDSHAKE_PACKET_LEN);
    c0c1.push(RTMP_VERSION);
    c0c1.extend_from_slice(&build_c1());
    stream.write_all(&c0c1).await?;
    stream.flush().await?;
    tracing::debug!("sent C0+C1 ({} bytes)", c0c1.len());

    // S0 + S1 + S2 arrive as 3073 bytes total.
    let mut s0s1s2 = [0u8; 1 + 2 * HANDSHAKE_PACKET_LEN];
    read_exact_deadline(stream, &mut s0s1s2).await?;

    if s0s1s2[0] != RTMP_VERSION {
        return Err(RtmpError::HandshakeBadVersion(s0s1s2[0]).into());
    }

    // C2 echoes S1 byte for byte.
    let s1 = &s0s1s2[1..1 + HANDSHAKE_PACKET_LEN];
    stream.write_all(s1).await?;
    stream.flush().await?;
    tracing::debug!("handshake complete");

    Ok(())
}

/// C1: 4-byte timestamp (zero is legal and what we send), 4 zero bytes,
/// 1528 random bytes.
fn build_c1() -> [u8; HANDSHAKE_PACKET_LEN] {
    let mut c1 = [0u8; HANDSHAKE_PACKET_LEN];
    getrandom::getrandom(&mut c1[8..]).expect("OS CSPRNG failed");
    c1
}

async fn read_exact_deadline<S>(stream: &mut S, buf: &mut [u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match timeout(HANDSHAKE_TIMEOUT, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::ConnectionClosed)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::Timeout("RTMP handshake".into())),
    }
}
