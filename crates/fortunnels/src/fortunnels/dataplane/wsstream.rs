use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Buf, Bytes};
use futures_util::{
    sink::Sink,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame, Message, WebSocketConfig},
        Error as WsError,
    },
    WebSocketStream,
};
use url::Url;

/// Maximum inbound WebSocket message size; guards against memory exhaustion.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
/// Maximum read-buffer size accepted by the adapter.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
/// Idle read deadline, refreshed on pong receipt.
pub const READ_TIMEOUT: Duration = Duration::from_secs(90);

type WsSink<T> = SplitSink<WebSocketStream<T>, Message>;

/// Build the data-plane WebSocket URL and the matching `Origin` value from
/// an `http(s)` server URL: scheme mapped to `ws(s)`, path `/ws`, query
/// `mode=data&tunnel_id=<id>`.
pub fn build_ws_url(server_url: &str, tunnel_id: &str) -> anyhow::Result<(String, String)> {
    let mut u = Url::parse(server_url)?;
    let (origin_scheme, ws_scheme) = match u.scheme() {
        "http" => ("http", "ws"),
        "https" => ("https", "wss"),
        other => anyhow::bail!("unsupported server scheme: {other}"),
    };
    let host = u
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("invalid server url"))?
        .to_string();
    let origin = match u.port() {
        Some(p) => format!("{origin_scheme}://{host}:{p}"),
        None => format!("{origin_scheme}://{host}"),
    };

    u.set_scheme(ws_scheme)
        .map_err(|_| anyhow::anyhow!("invalid server url"))?;
    u.set_path("/ws");
    u.query_pairs_mut()
        .clear()
        .append_pair("mode", "data")
        .append_pair("tunnel_id", tunnel_id);
    Ok((u.to_string(), origin))
}

pub fn websocket_config() -> WebSocketConfig {
    let mut cfg = WebSocketConfig::default();
    cfg.max_message_size = Some(MAX_MESSAGE_SIZE);
    cfg.max_frame_size = Some(MAX_MESSAGE_SIZE);
    cfg
}

/// Presents a reliable byte stream over a WebSocket connection carrying only
/// binary messages.
///
/// Reads serve bytes from the current binary message and advance to the next
/// one when exhausted; non-binary frames are discarded. Each write emits
/// exactly one binary message. The reader is owned by the adapter; the
/// writer is shared with [`PingHandle`] behind its own lock, so control
/// pings can go out while data flows.
pub struct WsStream<T> {
    sink: Arc<Mutex<WsSink<T>>>,
    stream: SplitStream<WebSocketStream<T>>,
    current: Bytes,
    deadline: Pin<Box<tokio::time::Sleep>>,
}

impl<T> WsStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(socket: WebSocketStream<T>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Arc::new(Mutex::new(sink)),
            stream,
            current: Bytes::new(),
            deadline: Box::pin(tokio::time::sleep(READ_TIMEOUT)),
        }
    }

    pub fn ping_handle(&self) -> PingHandle<T> {
        PingHandle {
            sink: self.sink.clone(),
        }
    }

    fn refresh_deadline(&mut self) {
        self.deadline
            .as_mut()
            .reset(tokio::time::Instant::now() + READ_TIMEOUT);
    }
}

impl<T> AsyncRead for WsStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() > MAX_FRAME_SIZE {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "requested buffer size exceeds maximum allowed",
            )));
        }

        loop {
            if !this.current.is_empty() {
                let n = buf.remaining().min(this.current.len());
                buf.put_slice(&this.current[..n]);
                this.current.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "websocket read deadline exceeded",
                )));
            }

            match this.stream.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(e))) => {
                    if is_conn_closed(&e) {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::other(e)));
                }
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Binary(data) => {
                        this.current = data.into();
                    }
                    Message::Pong(_) => {
                        this.refresh_deadline();
                    }
                    Message::Close(_) => return Poll::Ready(Ok(())),
                    // Text, Ping (auto-answered by tungstenite), raw frames:
                    // not part of the byte stream.
                    _ => {}
                },
            }
        }
    }
}

impl<T> AsyncWrite for WsStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.len() > MAX_MESSAGE_SIZE {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "message size exceeds maximum allowed",
            )));
        }
        let this = self.get_mut();
        let mut sink = this.sink.lock().expect("ws sink lock");
        match Pin::new(&mut *sink).poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(map_ws_err(e))),
            Poll::Ready(Ok(())) => {}
        }
        if let Err(e) = Pin::new(&mut *sink).start_send(Message::Binary(buf.to_vec())) {
            return Poll::Ready(Err(map_ws_err(e)));
        }
        // Best-effort push; a Pending flush completes on the next wakeup.
        if let Poll::Ready(Err(e)) = Pin::new(&mut *sink).poll_flush(cx) {
            return Poll::Ready(Err(map_ws_err(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut sink = this.sink.lock().expect("ws sink lock");
        Pin::new(&mut *sink).poll_flush(cx).map_err(map_ws_err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut sink = this.sink.lock().expect("ws sink lock");
        match Pin::new(&mut *sink).poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) if !is_close_sent(&e) => return Poll::Ready(Err(map_ws_err(e))),
            Poll::Ready(_) => {}
        }
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));
        if let Err(e) = Pin::new(&mut *sink).start_send(close) {
            if !is_close_sent(&e) {
                return Poll::Ready(Err(map_ws_err(e)));
            }
        }
        match Pin::new(&mut *sink).poll_close(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) if !is_close_sent(&e) => Poll::Ready(Err(map_ws_err(e))),
            Poll::Ready(_) => Poll::Ready(Ok(())),
        }
    }
}

/// Shared handle for writing WebSocket ping control frames alongside data.
pub struct PingHandle<T> {
    sink: Arc<Mutex<WsSink<T>>>,
}

impl<T> Clone for PingHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
        }
    }
}

impl<T> PingHandle<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Write one ping control frame, bounded by the given write deadline.
    pub async fn ping(&self, deadline: Duration) -> io::Result<()> {
        let sink = self.sink.clone();
        let mut sent = false;
        let send = futures_util::future::poll_fn(move |cx| {
            let mut guard = sink.lock().expect("ws sink lock");
            let mut pinned = Pin::new(&mut *guard);
            if !sent {
                match pinned.as_mut().poll_ready(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(map_ws_err(e))),
                    Poll::Ready(Ok(())) => {}
                }
                if let Err(e) = pinned.as_mut().start_send(Message::Ping(Vec::new())) {
                    return Poll::Ready(Err(map_ws_err(e)));
                }
                sent = true;
            }
            pinned.poll_flush(cx).map_err(map_ws_err)
        });
        match tokio::time::timeout(deadline, send).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "websocket ping write deadline exceeded",
            )),
        }
    }
}

fn is_close_sent(err: &WsError) -> bool {
    matches!(err, WsError::AlreadyClosed | WsError::ConnectionClosed)
}

fn is_conn_closed(err: &WsError) -> bool {
    if matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed) {
        return true;
    }
    let msg = err.to_string();
    msg.contains("websocket: close")
        || msg.contains("connection closed")
        || msg.contains("use of closed network connection")
        || msg.contains("connection reset by peer")
        || msg.contains("broken pipe")
}

fn map_ws_err(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::NotConnected, "connection closed")
        }
        other => io::Error::other(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WsStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(4 * 1024 * 1024);
        let client =
            WebSocketStream::from_raw_socket(a, Role::Client, Some(websocket_config())).await;
        let server =
            WebSocketStream::from_raw_socket(b, Role::Server, Some(websocket_config())).await;
        (WsStream::new(client), server)
    }

    #[test]
    fn build_ws_url_http() {
        let (ws, origin) = build_ws_url("http://127.0.0.1:8080", "tun-1").unwrap();
        assert_eq!(ws, "ws://127.0.0.1:8080/ws?mode=data&tunnel_id=tun-1");
        assert_eq!(origin, "http://127.0.0.1:8080");
    }

    #[test]
    fn build_ws_url_https() {
        let (ws, origin) = build_ws_url("https://relay.example.com", "t").unwrap();
        assert_eq!(ws, "wss://relay.example.com/ws?mode=data&tunnel_id=t");
        assert_eq!(origin, "https://relay.example.com");
    }

    #[test]
    fn build_ws_url_rejects_other_schemes() {
        assert!(build_ws_url("ftp://relay.example.com", "t").is_err());
    }

    #[tokio::test]
    async fn oversized_read_buffer_is_rejected() {
        let (mut ws, _server) = ws_pair().await;
        let mut buf = vec![0u8; MAX_FRAME_SIZE + 1];
        let err = ws.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn oversized_write_is_rejected() {
        let (mut ws, _server) = ws_pair().await;
        let buf = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let err = ws.write(&buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn binary_messages_flow_both_ways() {
        use futures_util::SinkExt;
        let (mut ws, mut server) = ws_pair().await;

        ws.write_all(b"from client").await.unwrap();
        ws.flush().await.unwrap();
        match server.next().await.unwrap().unwrap() {
            Message::Binary(b) => assert_eq!(b, b"from client"),
            other => panic!("unexpected message: {other:?}"),
        }

        server
            .send(Message::Binary(b"from server".to_vec()))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = ws.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from server");
    }

    #[tokio::test]
    async fn non_binary_frames_are_skipped() {
        use futures_util::SinkExt;
        let (mut ws, mut server) = ws_pair().await;

        server.send(Message::Text("ignore me".into())).await.unwrap();
        server.send(Message::Binary(b"data".to_vec())).await.unwrap();

        let mut buf = [0u8; 64];
        let n = ws.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");
    }

    #[tokio::test]
    async fn large_message_is_served_across_reads() {
        use futures_util::SinkExt;
        let (mut ws, mut server) = ws_pair().await;

        let payload = vec![0x5Au8; 100 * 1024];
        server.send(Message::Binary(payload.clone())).await.unwrap();

        let mut got = Vec::new();
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        while got.len() < payload.len() {
            let n = ws.read(&mut buf).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn server_close_reads_as_eof() {
        use futures_util::SinkExt;
        let (mut ws, mut server) = ws_pair().await;
        server.send(Message::Close(None)).await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(ws.read(&mut buf).await.unwrap(), 0);
    }
}
