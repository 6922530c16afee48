use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::fortunnels::config::EncryptionSettings;
use crate::fortunnels::dataplane::transport::BoxedStream;

pub const NONCE_LEN: usize = 24;
const HEADER_LEN: usize = 4 + NONCE_LEN;

/// Upper bound for a single encrypted record on read. Writers never produce
/// records beyond one multiplexer message plus the tag.
const MAX_RECORD_BYTES: usize = 1024 * 1024 + 16;

/// Derive the stream key: SHA-256(PSK bytes || tunnel id bytes). Mirrors the
/// server-side derivation.
pub fn derive_key(psk: &[u8], tunnel_id: &str) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(psk);
    h.update(tunnel_id.as_bytes());
    h.finalize().into()
}

/// Wrap a stream with per-message AEAD when encryption is enabled and a PSK
/// is present; otherwise return the stream unchanged.
pub fn wrap_client_stream(
    stream: BoxedStream,
    tunnel_id: &str,
    enc: &EncryptionSettings,
) -> BoxedStream {
    if !enc.enabled || enc.psk.is_empty() {
        return stream;
    }
    let key = derive_key(enc.psk.as_bytes(), tunnel_id);
    Box::new(AeadStream::new(stream, &key))
}

enum ReadState {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Body { nonce: [u8; NONCE_LEN], buf: Vec<u8>, filled: usize },
}

/// Byte stream with XChaCha20-Poly1305 applied per write.
///
/// Wire format, repeated: `u32be ciphertext length` + `24-byte nonce` +
/// `ciphertext`. The nonce is 16 zero bytes followed by a u64be counter
/// starting at 0, incremented once per write; it is never reused for the
/// same key. Plaintext that does not fit the caller's read buffer is kept in
/// a holdover buffer and served by subsequent reads.
pub struct AeadStream<S> {
    inner: S,
    cipher: XChaCha20Poly1305,
    write_ctr: u64,
    pending: Vec<u8>,
    pending_pos: usize,
    read_state: ReadState,
    holdover: Vec<u8>,
    holdover_pos: usize,
}

impl<S> AeadStream<S> {
    pub fn new(inner: S, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: XChaCha20Poly1305::new(key.into()),
            write_ctr: 0,
            pending: Vec::new(),
            pending_pos: 0,
            read_state: ReadState::Header {
                buf: [0; HEADER_LEN],
                filled: 0,
            },
            holdover: Vec::new(),
            holdover_pos: 0,
        }
    }
}

impl<S> AeadStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "aead: underlying stream refused write",
                    )))
                }
                Poll::Ready(Ok(n)) => self.pending_pos += n,
            }
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for AeadStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if this.holdover_pos < this.holdover.len() {
                let n = out.remaining().min(this.holdover.len() - this.holdover_pos);
                out.put_slice(&this.holdover[this.holdover_pos..this.holdover_pos + n]);
                this.holdover_pos += n;
                if this.holdover_pos == this.holdover.len() {
                    this.holdover.clear();
                    this.holdover_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::Header { buf, filled } => {
                    while *filled < HEADER_LEN {
                        let mut rb = ReadBuf::new(&mut buf[*filled..]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Ready(Ok(())) => {}
                        }
                        let n = rb.filled().len();
                        if n == 0 {
                            if *filled == 0 {
                                // Clean end of stream between records.
                                return Poll::Ready(Ok(()));
                            }
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "aead: stream ended inside record header",
                            )));
                        }
                        *filled += n;
                    }
                    let mut len_bytes = [0u8; 4];
                    len_bytes.copy_from_slice(&buf[..4]);
                    let len = u32::from_be_bytes(len_bytes) as usize;
                    if len > MAX_RECORD_BYTES {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "aead: oversized record",
                        )));
                    }
                    let mut nonce = [0u8; NONCE_LEN];
                    nonce.copy_from_slice(&buf[4..]);
                    this.read_state = ReadState::Body {
                        nonce,
                        buf: vec![0; len],
                        filled: 0,
                    };
                }
                ReadState::Body { nonce, buf, filled } => {
                    while *filled < buf.len() {
                        let mut rb = ReadBuf::new(&mut buf[*filled..]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Ready(Ok(())) => {}
                        }
                        let n = rb.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "aead: stream ended inside record body",
                            )));
                        }
                        *filled += n;
                    }
                    let plaintext = this
                        .cipher
                        .decrypt(XNonce::from_slice(&nonce[..]), buf.as_slice())
                        .map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidData, "aead: authentication failed")
                        });
                    let plaintext = match plaintext {
                        Ok(pt) => pt,
                        Err(e) => return Poll::Ready(Err(e)),
                    };
                    this.read_state = ReadState::Header {
                        buf: [0; HEADER_LEN],
                        filled: 0,
                    };
                    let n = out.remaining().min(plaintext.len());
                    out.put_slice(&plaintext[..n]);
                    if n < plaintext.len() {
                        this.holdover = plaintext[n..].to_vec();
                        this.holdover_pos = 0;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<S> AsyncWrite for AeadStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // A previously sealed record must go out whole before the next one.
        match this.poll_drain_pending(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce[16..].copy_from_slice(&this.write_ctr.to_be_bytes());
        this.write_ctr += 1;

        let ciphertext = match this.cipher.encrypt(XNonce::from_slice(&nonce), buf) {
            Ok(ct) => ct,
            Err(_) => {
                return Poll::Ready(Err(io::Error::other("aead: encryption failed")));
            }
        };
        let len = match u32::try_from(ciphertext.len()) {
            Ok(l) => l,
            Err(_) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "aead: record exceeds u32 range",
                )));
            }
        };

        this.pending.extend_from_slice(&len.to_be_bytes());
        this.pending.extend_from_slice(&nonce);
        this.pending.extend_from_slice(&ciphertext);

        // Push what we can now; the rest drains on the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain_pending(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain_pending(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain_pending(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
