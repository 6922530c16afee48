use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Practical cap on a single preface line.
pub const MAX_PREFACE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PrefaceError {
    #[error("preface line exceeds {MAX_PREFACE_BYTES} bytes")]
    TooLong,
    #[error("stream ended before preface line")]
    UnexpectedEof,
    #[error("preface is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// First bytes of every data-plane stream: one JSON object on a single
/// `\n`-terminated line. Unknown keys are ignored by the peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preface {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proto: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tunnel_id: String,
}

impl Preface {
    pub fn tcp(dst: &str) -> Self {
        Self {
            dst: dst.to_string(),
            proto: "tcp".into(),
            ..Self::default()
        }
    }

    pub fn udp(dst: &str, tunnel_id: &str) -> Self {
        Self {
            dst: dst.to_string(),
            proto: "udp".into(),
            tunnel_id: tunnel_id.to_string(),
            ..Self::default()
        }
    }
}

/// Encode a preface as a single JSON line terminated by `\n`.
pub fn encode_preface(preface: &Preface) -> Result<Vec<u8>, PrefaceError> {
    let mut b = serde_json::to_vec(preface)?;
    b.push(b'\n');
    Ok(b)
}

pub async fn write_preface<W: AsyncWrite + Unpin>(
    w: &mut W,
    preface: &Preface,
) -> Result<(), PrefaceError> {
    let b = encode_preface(preface)?;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

/// Read the preface line from an inbound stream and return its `dst` field
/// (empty if absent). Empty interior lines are skipped; end-of-input before
/// any newline and oversized lines are errors.
pub async fn read_stream_destination<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> Result<String, PrefaceError> {
    Ok(read_preface(r).await?.dst)
}

pub async fn read_preface<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Preface, PrefaceError> {
    loop {
        let mut line = Vec::new();
        let mut limited = (&mut *r).take((MAX_PREFACE_BYTES + 1) as u64);
        let n = limited.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(PrefaceError::UnexpectedEof);
        }
        if line.len() > MAX_PREFACE_BYTES {
            return Err(PrefaceError::TooLong);
        }
        if line.last() != Some(&b'\n') {
            return Err(PrefaceError::UnexpectedEof);
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        return Ok(serde_json::from_str(text)?);
    }
}
