use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest UDP payload carried over a tunnel stream.
pub const MAX_UDP_PACKET: usize = 65535;

#[derive(Debug, Error)]
pub enum DatagramError {
    #[error("udp frame payload out of range: {0}")]
    PayloadOutOfRange(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one UDP payload as a `u16be length` + `payload` frame.
pub async fn write_udp_packet<W: AsyncWrite + Unpin>(
    w: &mut W,
    payload: &[u8],
) -> Result<(), DatagramError> {
    if payload.is_empty() || payload.len() > MAX_UDP_PACKET {
        return Err(DatagramError::PayloadOutOfRange(payload.len()));
    }
    w.write_u16(payload.len() as u16).await?;
    w.write_all(payload).await?;
    Ok(())
}

/// Read one UDP frame. Zero-length frames and short reads are fatal to the
/// stream.
pub async fn read_udp_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, DatagramError> {
    let n = r.read_u16().await? as usize;
    if n == 0 {
        return Err(DatagramError::PayloadOutOfRange(0));
    }
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}
