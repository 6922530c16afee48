use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Bridge two connections with backpressure-aware buffers.
///
/// Returns as soon as either direction finishes. The remaining copy task is
/// not cancelled here: it still owns bytes read but not yet written, and it
/// unwinds on its own once the caller closes the underlying sockets. Normal
/// close conditions are suppressed so half-closed streams do not spam the
/// logs.
pub async fn pipe_streams<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(2);

    let tx = done_tx.clone();
    tokio::spawn(async move {
        if let Err(err) = copy_with_buffer(br, aw).await {
            if !is_benign_copy_error(&err) {
                tracing::warn!(dir = "b->a", err = %err, "bridge: copy error");
            }
        }
        let _ = tx.send(()).await;
    });
    tokio::spawn(async move {
        if let Err(err) = copy_with_buffer(ar, bw).await {
            if !is_benign_copy_error(&err) {
                tracing::warn!(dir = "a->b", err = %err, "bridge: copy error");
            }
        }
        let _ = done_tx.send(()).await;
    });

    let _ = done_rx.recv().await;
}

async fn copy_with_buffer<R, W>(mut r: R, mut w: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        total += n as u64;
    }
}

/// Normal connection-close conditions that should read as end-of-stream
/// rather than errors.
pub fn is_benign_copy_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    ) {
        return true;
    }
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("use of closed network connection")
        || msg.contains("broken pipe")
        || msg.contains("connection reset by peer")
        || msg.contains("stream closed")
        || msg.contains("closed pipe")
        || msg.contains("eof")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn bridges_bytes_both_ways() {
        let (a_near, mut a_far) = tokio::io::duplex(64 * 1024);
        let (b_near, mut b_far) = tokio::io::duplex(64 * 1024);

        let bridge = tokio::spawn(pipe_streams(a_near, b_near));

        a_far.write_all(b"to b").await.unwrap();
        let mut buf = [0u8; 16];
        let n = b_far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"to b");

        b_far.write_all(b"to a").await.unwrap();
        let n = a_far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"to a");

        // Closing one side ends the bridge.
        drop(a_far);
        tokio::time::timeout(std::time::Duration::from_secs(2), bridge)
            .await
            .expect("bridge must return after close")
            .unwrap();
    }

    #[test]
    fn benign_errors_are_recognized() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
        ] {
            assert!(is_benign_copy_error(&io::Error::from(kind)), "{kind:?}");
        }
        for msg in [
            "use of closed network connection",
            "stream closed",
            "closed pipe",
            "unexpected EOF",
        ] {
            assert!(is_benign_copy_error(&io::Error::other(msg)), "{msg}");
        }
        assert!(!is_benign_copy_error(&io::Error::other("tag mismatch")));
    }
}
