use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use pin_project_lite::pin_project;
use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use tokio::sync::mpsc;
use url::Url;

use crate::fortunnels::dataplane::transport::{
    BoxedStream, DialOptions, Transport, TransportSession,
};

pub const QUIC_PORT: u16 = 4433;
pub const QUIC_ALPN: &[u8] = b"fortunnels-quic";

/// QUIC data plane: bidirectional streams for TCP traffic and, when
/// enabled, unreliable datagrams for UDP flows.
pub struct QuicTransport {
    enable_datagrams: bool,
}

impl QuicTransport {
    pub fn new(enable_datagrams: bool) -> Self {
        Self { enable_datagrams }
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn dial(
        &self,
        server_url: &str,
        _opts: &DialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let u = Url::parse(server_url)?;
        let host = u
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("invalid server url"))?
            .to_string();

        let mut transport_cfg = TransportConfig::default();
        transport_cfg.max_idle_timeout(Some(Duration::from_secs(60).try_into()?));
        transport_cfg.keep_alive_interval(Some(Duration::from_secs(20)));
        if !self.enable_datagrams {
            transport_cfg.datagram_receive_buffer_size(None);
        }

        let client_crypto = quic_tls::client_crypto_config(vec![QUIC_ALPN.to_vec()])?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_cfg.transport_config(Arc::new(transport_cfg));

        let bind: SocketAddr = "0.0.0.0:0".parse().expect("literal addr");
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        let remote = resolve_socket_addr(&host, QUIC_PORT).await?;
        let connecting = endpoint.connect(remote, &host)?;
        let conn = connecting.await?;
        Ok(Arc::new(QuicSession::new(conn)))
    }
}

async fn resolve_socket_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addr = format!("{host}:{port}");
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr.as_str()).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve {addr:?}"))
}

struct QuicSession {
    conn: Connection,
    incoming: tokio::sync::Mutex<mpsc::Receiver<(quinn::SendStream, quinn::RecvStream)>>,
    task: tokio::task::JoinHandle<()>,
}

impl QuicSession {
    fn new(conn: Connection) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let c = conn.clone();
        let task = tokio::spawn(async move {
            loop {
                match c.accept_bi().await {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        Self {
            conn,
            incoming: tokio::sync::Mutex::new(rx),
            task,
        }
    }
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let (send, recv) = self.conn.open_bi().await?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let (send, recv) = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("session closed"))?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn send_datagram(&self, payload: Bytes) -> anyhow::Result<()> {
        self.conn.send_datagram(payload)?;
        Ok(())
    }

    async fn recv_datagram(&self) -> anyhow::Result<Bytes> {
        Ok(self.conn.read_datagram().await?)
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    async fn close(&self) {
        self.task.abort();
        self.conn.close(0u32.into(), b"");
    }
}

pin_project! {
    struct QuicBiStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl tokio::io::AsyncRead for QuicBiStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().recv.poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicBiStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        use std::task::Poll;
        match self.project().send.poll_write(cx, data) {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::task::Poll;
        match self.project().send.poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::task::Poll;
        match self.project().send.poll_shutdown(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

mod quic_tls {
    use crate::fortunnels::dataplane::transport::web_root_store;

    /// TLS client configuration for the relay's QUIC endpoint: public web
    /// roots, certificate verification on.
    pub fn client_crypto_config(next_protos: Vec<Vec<u8>>) -> anyhow::Result<rustls::ClientConfig> {
        let mut cfg = rustls::ClientConfig::builder()
            .with_root_certificates(web_root_store())
            .with_no_client_auth();
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }
}
