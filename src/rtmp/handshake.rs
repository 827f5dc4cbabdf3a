use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

pub const HANDSHAKE_SIZE: usize = 1536;
const RTMP_VERSION: u8 = 3;

/// Perform the client side of the plain RTMP handshake:
/// send C0+C1, read S0+S1+S2, send C2 (echo of S1).
///
/// C1 is epoch milliseconds, four zero bytes, then random padding.
pub async fn client_handshake(stream: &mut TcpStream, timeout: Duration) -> Result<()> {
    let mut c1 = [0u8; HANDSHAKE_SIZE];
    let epoch_ms = chrono::Utc::now().timestamp_millis() as u32;
    c1[..4].copy_from_slice(&epoch_ms.to_be_bytes());
    // c1[4..8] stays zero
    rand::thread_rng().fill_bytes(&mut c1[8..]);

    let mut c0c1 = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    c0c1.push(RTMP_VERSION);
    c0c1.extend_from_slice(&c1);
    stream
        .write_all(&c0c1)
        .await
        .context("handshake write C0/C1")?;

    let mut s0s1 = [0u8; 1 + HANDSHAKE_SIZE];
    tokio::time::timeout(timeout, stream.read_exact(&mut s0s1))
        .await
        .map_err(|_| anyhow!("handshake timed out waiting for S0/S1"))?
        .context("handshake read S0/S1")?;
    if s0s1[0] != RTMP_VERSION {
        return Err(anyhow!("unexpected RTMP version {}", s0s1[0]));
    }

    // C2 echoes S1 with our read time in the second word.
    let mut c2 = [0u8; HANDSHAKE_SIZE];
    c2.copy_from_slice(&s0s1[1..]);
    c2[4..8].copy_from_slice(&epoch_ms.to_be_bytes());
    stream.write_all(&c2).await.context("handshake write C2")?;

    let mut s2 = [0u8; HANDSHAKE_SIZE];
    tokio::time::timeout(timeout, stream.read_exact(&mut s2))
        .await
        .map_err(|_| anyhow!("handshake timed out waiting for S2"))?
        .context("handshake read S2")?;

    trace!("rtmp handshake complete");
    Ok(())
}
