use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{mpsc, watch},
};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::header, http::HeaderValue},
};
use tokio_yamux::{Config as YamuxConfig, Control, Session, StreamHandle};

use crate::fortunnels::config::RuntimeSettings;
use crate::fortunnels::dataplane::transport::{
    BoxedStream, DialOptions, Transport, TransportSession,
};
use crate::fortunnels::dataplane::wsstream::{
    build_ws_url, websocket_config, PingHandle, WsStream, MAX_FRAME_SIZE,
};

/// WebSocket data plane: a yamux client multiplexer over the binary-message
/// byte-stream adapter, kept alive by WS pings and yamux keepalive.
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "ws"
    }

    async fn dial(
        &self,
        server_url: &str,
        opts: &DialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let (ws_url, origin) = build_ws_url(server_url, &opts.tunnel_id)?;

        let mut request = ws_url.into_client_request()?;
        request
            .headers_mut()
            .insert(header::ORIGIN, HeaderValue::from_str(&origin)?);

        let (socket, _response) =
            connect_async_with_config(request, Some(websocket_config()), false).await?;
        let ws = WsStream::new(socket);
        let ping = ws.ping_handle();

        let mut sess = MuxSession::client(CappedIo::new(ws), mux_config(&opts.settings));
        start_ping_loop(&mut sess, ping, &opts.settings);
        Ok(Arc::new(sess))
    }
}

pub fn mux_config(settings: &RuntimeSettings) -> YamuxConfig {
    let mut cfg = YamuxConfig::default();
    cfg.enable_keepalive = true;
    cfg.keepalive_interval = settings.mux_keepalive_interval;
    cfg.connection_write_timeout = settings.mux_keepalive_timeout;
    cfg
}

/// Background ping loop: one WS ping control frame per interval, each with
/// the configured write deadline. Exits when the session dies or the stop
/// flag is raised.
fn start_ping_loop<T>(sess: &mut MuxSession, ping: PingHandle<T>, settings: &RuntimeSettings)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let closed = sess.closed.clone();
    let interval = settings.ping_interval;
    let timeout = settings.ping_timeout;
    let task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut tick = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(err) = ping.ping(timeout).await {
                        tracing::debug!(err=%err, "session: ping loop ending");
                        break;
                    }
                }
            }
        }
    });
    sess.ping_task = Some(task);
    sess.stop_ping = Some(stop_tx);
}

/// A yamux session over any reliable byte stream, exposing the transport
/// capability surface.
pub struct MuxSession {
    control: tokio::sync::Mutex<Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<StreamHandle>>,
    closed: Arc<AtomicBool>,
    pump: tokio::task::JoinHandle<()>,
    ping_task: Option<tokio::task::JoinHandle<()>>,
    stop_ping: Option<watch::Sender<bool>>,
}

impl MuxSession {
    pub fn client<T>(io: T, cfg: YamuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_session(Session::new_client(io, cfg))
    }

    pub fn server<T>(io: T, cfg: YamuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_session(Session::new_server(io, cfg))
    }

    fn from_session<T>(mut session: Session<T>) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let control = session.control();
        let closed = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel::<StreamHandle>(64);
        let closed_pump = closed.clone();
        let pump = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            closed_pump.store(true, Ordering::SeqCst);
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            closed,
            pump,
            ping_task: None,
            stop_ping: None,
        }
    }
}

#[async_trait]
impl TransportSession for MuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("session closed"))?;
        Ok(Box::new(st))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if let Some(stop) = &self.stop_ping {
            let _ = stop.send(true);
        }
        if let Some(task) = &self.ping_task {
            task.abort();
        }
        self.pump.abort();
        let mut ctrl = self.control.lock().await;
        let _ = ctrl.close().await;
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Limits each read handed to the inner stream to the adapter's frame cap,
/// so the multiplexer can never trip the oversized-buffer guard.
pub struct CappedIo<T> {
    inner: T,
    scratch: Vec<u8>,
}

impl<T> CappedIo<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            scratch: vec![0u8; MAX_FRAME_SIZE],
        }
    }
}

impl<T> AsyncRead for CappedIo<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() <= MAX_FRAME_SIZE {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        let mut tmp = ReadBuf::new(&mut this.scratch);
        match Pin::new(&mut this.inner).poll_read(cx, &mut tmp) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                buf.put_slice(tmp.filled());
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl<T> AsyncWrite for CappedIo<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::fortunnels::dataplane::session::Manager;

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            mux_keepalive_interval: Duration::from_secs(25),
            mux_keepalive_timeout: Duration::from_secs(60),
            watch_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn manager_reconnects_after_server_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            // First connection: complete the handshake, then drop it.
            let (s1, _) = listener.accept().await.unwrap();
            let ws1 = tokio_tungstenite::accept_async(s1).await.unwrap();
            drop(ws1);

            // Second connection: keep a live mux server until the test ends.
            let (s2, _) = listener.accept().await.unwrap();
            let ws2 = tokio_tungstenite::accept_async(s2).await.unwrap();
            let sess = MuxSession::server(CappedIo::new(WsStream::new(ws2)), YamuxConfig::default());
            let _ = sess.accept_stream().await;
        });

        let mgr = Manager::new(
            Arc::new(WsTransport::new()),
            &format!("http://127.0.0.1:{port}"),
            "tun-1",
            Duration::from_millis(50),
            Duration::from_secs(1),
            settings(),
        );

        let first = mgr.ensure().await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !first.is_closed() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "session never observed the server close"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let second = mgr.ensure().await.unwrap();
        assert!(!second.is_closed());

        mgr.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn mux_sessions_exchange_streams_over_duplex() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = MuxSession::client(a, YamuxConfig::default());
        let server = MuxSession::server(b, YamuxConfig::default());

        let mut out = client.open_stream().await.unwrap();
        let echo = tokio::spawn(async move {
            let mut st = server.accept_stream().await.unwrap();
            let mut buf = [0u8; 32];
            let n = st.read(&mut buf).await.unwrap();
            st.write_all(&buf[..n]).await.unwrap();
            st.flush().await.unwrap();
        });

        out.write_all(b"over the mux").await.unwrap();
        out.flush().await.unwrap();
        let mut buf = [0u8; 32];
        let n = out.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"over the mux");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn capped_io_limits_inner_read_size() {
        struct AssertingReader;
        impl AsyncRead for AssertingReader {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                assert!(buf.remaining() <= MAX_FRAME_SIZE);
                buf.put_slice(&[0x7F; 16]);
                Poll::Ready(Ok(()))
            }
        }
        impl AsyncWrite for AssertingReader {
            fn poll_write(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                Poll::Ready(Ok(buf.len()))
            }
            fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
            fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let mut capped = CappedIo::new(AssertingReader);
        let mut buf = vec![0u8; MAX_FRAME_SIZE * 2];
        let n = capped.read(&mut buf).await.unwrap();
        assert_eq!(n, 16);
    }
}
